//! Cache Events
//!
//! Events broadcast by the coordinator and sync handler for monitoring.
//! Fingerprints are carried in canonical string form so events serialize
//! cleanly for log shipping.

use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};

/// Events emitted by the cache and index subsystems
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheEvent {
    /// Body stored via the write path
    Put {
        fp: String,
        tiers: Vec<String>,
        size_bytes: u64,
    },

    /// Read served
    Hit { fp: String, tier: String },

    /// No tier could serve the read
    Miss { fp: String },

    /// Entry evicted from a tier
    Evict {
        fp: String,
        tier: String,
    },

    /// Body promoted into a faster tier after a read
    Promote {
        fp: String,
        from_tier: String,
        to_tier: String,
        size_bytes: u64,
    },

    /// Pin state changed
    PinChanged {
        fp: String,
        scope: String,
        pinned: bool,
    },

    /// Entry removed explicitly
    Removed { fp: String },

    /// Write buffer flushed into a partition
    PartitionFlushed {
        partition_id: u64,
        row_count: usize,
    },

    /// Remote partition validated and installed
    PartitionInstalled {
        partition_id: u64,
        peer: String,
    },

    /// Remote partition failed validation and was discarded
    PartitionRejected {
        partition_id: u64,
        reason: String,
    },

    /// Tier marked faulted after consecutive health failures
    TierFaulted { tier: String },

    /// Faulted tier passed a health probe again
    TierRecovered { tier: String },
}

impl CacheEvent {
    pub fn put(fp: &Fingerprint, tiers: Vec<String>, size_bytes: u64) -> Self {
        CacheEvent::Put {
            fp: fp.to_canonical_string(),
            tiers,
            size_bytes,
        }
    }

    pub fn hit(fp: &Fingerprint, tier: &str) -> Self {
        CacheEvent::Hit {
            fp: fp.to_canonical_string(),
            tier: tier.to_string(),
        }
    }

    pub fn miss(fp: &Fingerprint) -> Self {
        CacheEvent::Miss {
            fp: fp.to_canonical_string(),
        }
    }

    pub fn evict(fp: &Fingerprint, tier: &str) -> Self {
        CacheEvent::Evict {
            fp: fp.to_canonical_string(),
            tier: tier.to_string(),
        }
    }

    pub fn promote(fp: &Fingerprint, from_tier: &str, to_tier: &str, size_bytes: u64) -> Self {
        CacheEvent::Promote {
            fp: fp.to_canonical_string(),
            from_tier: from_tier.to_string(),
            to_tier: to_tier.to_string(),
            size_bytes,
        }
    }

    pub fn pin_changed(fp: &Fingerprint, scope: &str, pinned: bool) -> Self {
        CacheEvent::PinChanged {
            fp: fp.to_canonical_string(),
            scope: scope.to_string(),
            pinned,
        }
    }

    /// Whether this event indicates trouble
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CacheEvent::PartitionRejected { .. } | CacheEvent::TierFaulted { .. }
        )
    }
}
