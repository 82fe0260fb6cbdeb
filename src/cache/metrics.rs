//! Cache Metrics
//!
//! Cache-line aligned per-tier counters for concurrent access without false
//! sharing. Tiers are keyed by name so remote backends registered at runtime
//! get the same treatment as the built-in memory and disk tiers.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

/// Well-known tier name for the in-memory tier
pub const MEMORY_TIER: &str = "memory";
/// Well-known tier name for the disk tier
pub const DISK_TIER: &str = "disk";

// =============================================================================
// Per-Tier Metrics (Cache-Line Aligned)
// =============================================================================

/// Counters for a single tier, aligned to prevent false sharing
#[repr(C, align(64))]
#[derive(Debug)]
pub struct TierMetrics {
    /// Reads served by this tier
    pub hits: AtomicU64,
    /// Reads this tier could not serve
    pub misses: AtomicU64,
    /// Bodies written to this tier
    pub puts: AtomicU64,
    /// Entries evicted from this tier
    pub evictions: AtomicU64,
    /// Bodies promoted into this tier from a slower one
    pub promotions: AtomicU64,
    /// Errors attributed to this tier
    pub errors: AtomicU64,
    /// Last update timestamp (unix millis)
    pub last_update_ms: AtomicU64,
    _padding: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<TierMetrics>() <= CACHE_LINE_SIZE);

impl TierMetrics {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_update_ms: AtomicU64::new(0),
            _padding: [0; 8],
        }
    }

    #[inline]
    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_eviction(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }

    pub fn snapshot(&self) -> TierMetricsSnapshot {
        TierMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for TierMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Point-in-time copy of one tier's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub errors: u64,
}

impl TierMetricsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

/// Snapshot across all tiers
#[derive(Debug, Clone, Default)]
pub struct CacheStatsSnapshot {
    /// Per-tier snapshots, keyed by tier name
    pub tiers: Vec<(String, TierMetricsSnapshot)>,
}

impl CacheStatsSnapshot {
    pub fn tier(&self, name: &str) -> Option<&TierMetricsSnapshot> {
        self.tiers.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Hit ratio across every tier
    pub fn overall_hit_ratio(&self) -> f64 {
        let (hits, misses) = self
            .tiers
            .iter()
            .fold((0u64, 0u64), |(h, m), (_, s)| (h + s.hits, m + s.misses));
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Metrics registry keyed by tier name
pub struct CacheMetrics {
    tiers: DashMap<String, Arc<TierMetrics>>,
}

impl CacheMetrics {
    pub fn new() -> Self {
        let tiers = DashMap::new();
        tiers.insert(MEMORY_TIER.to_string(), Arc::new(TierMetrics::new()));
        tiers.insert(DISK_TIER.to_string(), Arc::new(TierMetrics::new()));
        Self { tiers }
    }

    /// Counters for a tier, created on first touch
    pub fn tier(&self, name: &str) -> Arc<TierMetrics> {
        self.tiers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TierMetrics::new()))
            .clone()
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let mut tiers: Vec<(String, TierMetricsSnapshot)> = self
            .tiers
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect();
        tiers.sort_by(|a, b| a.0.cmp(&b.0));
        CacheStatsSnapshot { tiers }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}
