//! Tiered Content Cache
//!
//! The two local tiers in front of the remote backends:
//! - **Memory**: an Adaptive Replacement Cache ([`arc::AdaptiveCache`]) that
//!   self-tunes its recency/frequency split under a byte budget.
//! - **Disk**: a content-addressed file store ([`disk::DiskCache`]) with
//!   atomic-rename durability and heat-weighted eviction.
//!
//! [`heat::HeatTracker`] feeds both promotion and eviction decisions;
//! [`metrics::CacheMetrics`] and [`events::CacheEvent`] cover observability.

pub mod arc;
pub mod compression;
pub mod disk;
pub mod events;
pub mod heat;
pub mod metrics;

pub use arc::{AdaptiveCache, ArcSnapshot};
pub use compression::{CompressionAlgorithm, CompressionConfig, Compressor};
pub use disk::{DiskCache, DiskEntryMeta};
pub use events::CacheEvent;
pub use heat::{HeatRecord, HeatTracker};
pub use metrics::{CacheMetrics, CacheStatsSnapshot, TierMetrics, TierMetricsSnapshot};
