//! Node Configuration
//!
//! Every option has a default; a host program constructs the struct and
//! overrides what it needs. There is no file or environment loading here.

use crate::cache::compression::CompressionConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Node Role
// =============================================================================

/// Role a node plays in index synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Maintains the full index and publishes partitions
    Coordinator,
    /// Maintains the full index, consumes publications, may republish
    Worker,
    /// Materializes only touched fingerprints; never publishes
    #[default]
    Edge,
}

impl NodeRole {
    /// Whether this role keeps the full index and serves partitions
    pub fn maintains_full_index(&self) -> bool {
        matches!(self, NodeRole::Coordinator | NodeRole::Worker)
    }

    /// Whether this role periodically announces its manifest
    pub fn announces(&self) -> bool {
        matches!(self, NodeRole::Coordinator)
    }

    /// Whether this role subscribes to announcements
    pub fn consumes_announcements(&self) -> bool {
        matches!(self, NodeRole::Coordinator | NodeRole::Worker)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Coordinator => write!(f, "coordinator"),
            NodeRole::Worker => write!(f, "worker"),
            NodeRole::Edge => write!(f, "edge"),
        }
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Configuration for the memory and disk cache tiers
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total resident byte budget for the in-memory tier
    pub memory_budget_bytes: u64,
    /// Byte budget for the disk tier
    pub disk_budget_bytes: u64,
    /// Items larger than this go only to disk
    pub max_memory_item_size: u64,
    /// Disk eviction target as a fraction of the budget
    pub low_watermark: f64,
    /// Body compression for the disk tier
    pub compression: CompressionConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 128 * 1024 * 1024, // 128 MiB
            disk_budget_bytes: 4 * 1024 * 1024 * 1024, // 4 GiB
            max_memory_item_size: 16 * 1024 * 1024, // 16 MiB
            low_watermark: 0.9,
            compression: CompressionConfig::default(),
        }
    }
}

// =============================================================================
// Index Configuration
// =============================================================================

/// Configuration for the metadata index
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Buffer row count that triggers a partition flush
    pub partition_row_limit: usize,
    /// Buffer row count at which upserts block (bounded wait)
    pub buffer_high_watermark: usize,
    /// Longest an upsert will wait for the flusher to drain
    pub backpressure_wait: Duration,
    /// How long a tombstone stays discoverable before compaction may drop it
    pub tombstone_retention: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            partition_row_limit: 1_000_000,
            buffer_high_watermark: 2_000_000,
            backpressure_wait: Duration::from_secs(10),
            tombstone_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

// =============================================================================
// Sync Configuration
// =============================================================================

/// Configuration for peer-to-peer index synchronization
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Cluster identifier embedded in topic names
    pub cluster_id: String,
    /// This node's identity in announcements
    pub node_id: String,
    /// How often a coordinator announces its manifest
    pub announce_interval: Duration,
    /// How long to wait for a requested partition body
    pub fetch_timeout: Duration,
    /// Inbound announcements buffered before dropping
    pub announce_queue_budget: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cluster_id: "default".to_string(),
            node_id: uuid::Uuid::new_v4().to_string(),
            announce_interval: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(30),
            announce_queue_budget: 128,
        }
    }
}

// =============================================================================
// Placement Configuration
// =============================================================================

/// Configuration for the placement engine
#[derive(Debug, Clone)]
pub struct PlacementConfig {
    /// Concurrent `has` probes on a cold miss
    pub max_probe_fanout: usize,
    /// Retries per tier on transient failure before falling back
    pub max_retries_per_tier: usize,
    /// Tier classes a put must reach synchronously
    pub durable_minimum: Vec<crate::backend::TierClass>,
    /// Minimum durability rank that satisfies `durability=archival`
    pub archival_threshold: u32,
    /// Health probe interval; a faulted tier stays excluded for one full interval
    pub health_probe_interval: Duration,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            max_probe_fanout: 3,
            max_retries_per_tier: 1,
            durable_minimum: vec![
                crate::backend::TierClass::Disk,
                crate::backend::TierClass::ContentStore,
            ],
            archival_threshold: 80,
            health_probe_interval: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Heat Configuration
// =============================================================================

/// Configuration for heat tracking
#[derive(Debug, Clone)]
pub struct HeatConfig {
    /// How often the in-memory heat records are snapshotted to disk
    pub snapshot_interval: Duration,
}

impl Default for HeatConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Node Configuration
// =============================================================================

/// Top-level configuration for one cache node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Role this node plays in index sync
    pub role: NodeRole,
    /// Base directory for all persisted state
    pub base_dir: PathBuf,
    /// Cache tier configuration
    pub cache: CacheConfig,
    /// Metadata index configuration
    pub index: IndexConfig,
    /// Sync configuration
    pub sync: SyncConfig,
    /// Placement configuration
    pub placement: PlacementConfig,
    /// Heat tracking configuration
    pub heat: HeatConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::default(),
            base_dir: PathBuf::from("/var/lib/tierstore"),
            cache: CacheConfig::default(),
            index: IndexConfig::default(),
            sync: SyncConfig::default(),
            placement: PlacementConfig::default(),
            heat: HeatConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Config rooted at a specific base directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Directory holding disk cache bodies and sidecars
    pub fn disk_cache_dir(&self) -> PathBuf {
        self.base_dir.join("disk_cache")
    }

    /// Directory holding the index manifest, partitions, and WAL
    pub fn index_dir(&self) -> PathBuf {
        self.base_dir.join("index")
    }

    /// Directory holding the heat snapshot
    pub fn heat_dir(&self) -> PathBuf {
        self.base_dir.join("heat")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.role, NodeRole::Edge);
        assert_eq!(cfg.cache.memory_budget_bytes, 128 * 1024 * 1024);
        assert_eq!(cfg.cache.disk_budget_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(cfg.cache.max_memory_item_size, 16 * 1024 * 1024);
        assert!((cfg.cache.low_watermark - 0.9).abs() < f64::EPSILON);
        assert_eq!(cfg.index.partition_row_limit, 1_000_000);
        assert_eq!(cfg.index.buffer_high_watermark, 2_000_000);
        assert_eq!(cfg.sync.announce_interval, Duration::from_secs(300));
        assert_eq!(cfg.sync.fetch_timeout, Duration::from_secs(30));
        assert_eq!(cfg.sync.announce_queue_budget, 128);
        assert_eq!(cfg.placement.max_probe_fanout, 3);
        assert_eq!(cfg.placement.max_retries_per_tier, 1);
        assert_eq!(cfg.heat.snapshot_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_role_behavior() {
        assert!(NodeRole::Coordinator.maintains_full_index());
        assert!(NodeRole::Coordinator.announces());
        assert!(NodeRole::Worker.maintains_full_index());
        assert!(!NodeRole::Worker.announces());
        assert!(NodeRole::Worker.consumes_announcements());
        assert!(!NodeRole::Edge.maintains_full_index());
        assert!(!NodeRole::Edge.consumes_announcements());
    }

    #[test]
    fn test_state_layout() {
        let cfg = NodeConfig::with_base_dir("/tmp/ts");
        assert_eq!(cfg.disk_cache_dir(), PathBuf::from("/tmp/ts/disk_cache"));
        assert_eq!(cfg.index_dir(), PathBuf::from("/tmp/ts/index"));
        assert_eq!(cfg.heat_dir(), PathBuf::from("/tmp/ts/heat"));
    }
}
