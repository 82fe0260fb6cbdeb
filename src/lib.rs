//! tierstore - Tiered Content Cache & Metadata Index
//!
//! A multi-tier caching layer in front of a content-addressed store and a
//! set of remote storage backends, combined with a distributed columnar
//! metadata index that lets any node answer "where does identifier X live,
//! and what is its cheapest next hop?".
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Coordinator                                   │
//! │              get · put · pin · unpin · lookup · query                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────────────────┐  │
//! │  │   Memory     │  │    Disk      │  │        Remote Tiers           │  │
//! │  │   (ARC)      │  │  (fp.bin +   │  │  content-store · cluster ·    │  │
//! │  │  T1/T2/B1/B2 │  │   sidecars)  │  │  object-store · archival ·    │  │
//! │  │  self-tuning │  │  heat-based  │  │  gateway (BackendAdapter)     │  │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────────┬────────────────┘  │
//! │         │                 │                         │                    │
//! │         └────────┬────────┴────────┬────────────────┘                    │
//! │                  │                 │                                     │
//! │          ┌───────┴──────┐  ┌───────┴────────┐                            │
//! │          │ Heat Tracker │  │ Placement      │                            │
//! │          │ (64-sharded) │  │ Engine         │                            │
//! │          └──────────────┘  └────────────────┘                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │   Metadata Index (write buffer + WAL + columnar partitions + manifest)   │
//! │   Sync Handler   (announce / request / response over the topic bus)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`coordinator`]: the public surface; one [`coordinator::CacheCoordinator`] per node
//! - [`cache`]: memory (ARC) and disk tiers, heat tracking, metrics, events
//! - [`index`]: columnar metadata index, partitions, WAL, manifest
//! - [`sync`]: peer-to-peer partition exchange over the topic bus
//! - [`backend`]: the uniform adapter port and built-in adapters
//! - [`placement`]: tier selection, retries, health fencing
//! - [`fingerprint`]: self-describing content identifiers
//! - [`config`]: enumerated options with defaults
//! - [`error`]: the unified error taxonomy

pub mod backend;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod placement;
pub mod sync;

// Re-export commonly used types
pub use backend::{
    BackendAdapter, BackendRef, BackendStats, Capabilities, Capability, ContentStore,
    ContentStoreBackend, GatewayBackend, GatewayConfig, HealthStatus, InMemoryContentStore,
    MemoryBackend, TierClass, TierDescriptor, TierRegistry,
};

pub use cache::{
    AdaptiveCache, ArcSnapshot, CacheEvent, CacheMetrics, CacheStatsSnapshot,
    CompressionAlgorithm, CompressionConfig, DiskCache, HeatRecord, HeatTracker,
};

pub use config::{
    CacheConfig, HeatConfig, IndexConfig, NodeConfig, NodeRole, PlacementConfig, SyncConfig,
};

pub use coordinator::{
    CacheCoordinator, Durability, OpContext, PinScope, PutOptions, CONTENT_STORE_TIER,
};

pub use error::{Error, ErrorKind, Result, TierFailure};

pub use fingerprint::{Codec, Fingerprint, HashAlgorithm};

pub use index::{
    CompareOp, FieldValue, IndexRecord, LocationEntry, Manifest, ManifestEntry, MetadataIndex,
    Predicate,
};

pub use placement::{FetchOutcome, PlacementEngine};

pub use sync::{InMemoryBus, SyncHandler, TopicBus, TopicBusRef};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
