//! Storage Backend Adapters
//!
//! Every tier behind the coordinator (memory, disk, the content-addressed
//! store, cluster peers, object stores, archival networks, retrieval-only
//! gateways) is reached through the same [`BackendAdapter`] port. Adapters
//! are registered at startup with a [`TierDescriptor`]; the placement engine
//! treats unknown adapters uniformly, so adding a backend never touches the
//! coordinator.

pub mod content_store;
pub mod gateway;
pub mod memory;

pub use content_store::{ContentStore, ContentStoreBackend, InMemoryContentStore};
pub use gateway::{GatewayBackend, GatewayConfig};
pub use memory::MemoryBackend;

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Tier Class
// =============================================================================

/// Tier classes forming the latency/durability hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierClass {
    Memory,
    Disk,
    ContentStore,
    Cluster,
    ObjectStore,
    Archival,
    RetrievalOnly,
}

impl TierClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierClass::Memory => "memory",
            TierClass::Disk => "disk",
            TierClass::ContentStore => "content-store",
            TierClass::Cluster => "cluster",
            TierClass::ObjectStore => "object-store",
            TierClass::Archival => "archival",
            TierClass::RetrievalOnly => "retrieval-only",
        }
    }
}

impl fmt::Display for TierClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// A single backend capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Put,
    Get,
    Has,
    Remove,
    Stat,
    Health,
}

/// Capability set declared by an adapter at registration time.
///
/// The placement engine queries this instead of probing for missing methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    /// Everything: put, get, has, remove, stat, health
    pub fn full() -> Self {
        Self(BTreeSet::from([
            Capability::Put,
            Capability::Get,
            Capability::Has,
            Capability::Remove,
            Capability::Stat,
            Capability::Health,
        ]))
    }

    /// Read side only: get, has, stat, health
    pub fn read_only() -> Self {
        Self(BTreeSet::from([
            Capability::Get,
            Capability::Has,
            Capability::Stat,
            Capability::Health,
        ]))
    }

    /// Append-only archives: everything except remove
    pub fn no_remove() -> Self {
        let mut caps = Self::full();
        caps.0.remove(&Capability::Remove);
        caps
    }

    pub fn supports(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }
}

// =============================================================================
// Tier Descriptor
// =============================================================================

/// Static description of a tier, attached to each adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierDescriptor {
    /// Unique tier name, used in location sets and heat histograms
    pub name: String,
    /// Hierarchy class
    pub class: TierClass,
    /// Smaller = faster; defines read probe order
    pub latency_rank: u32,
    /// Larger = more durable; defines write durability classes
    pub durability_rank: u32,
    /// Whether the placement engine may write here
    pub writable: bool,
    /// Declared capability set
    pub capabilities: Capabilities,
}

impl TierDescriptor {
    pub fn new(name: impl Into<String>, class: TierClass) -> Self {
        let (latency_rank, durability_rank, writable, capabilities) = match class {
            TierClass::Memory => (0, 0, true, Capabilities::full()),
            TierClass::Disk => (10, 20, true, Capabilities::full()),
            TierClass::ContentStore => (20, 40, true, Capabilities::full()),
            TierClass::Cluster => (30, 60, true, Capabilities::full()),
            TierClass::ObjectStore => (40, 70, true, Capabilities::full()),
            TierClass::Archival => (50, 90, true, Capabilities::no_remove()),
            TierClass::RetrievalOnly => (40, 0, false, Capabilities::read_only()),
        };
        Self {
            name: name.into(),
            class,
            latency_rank,
            durability_rank,
            writable,
            capabilities,
        }
    }

    pub fn with_latency_rank(mut self, rank: u32) -> Self {
        self.latency_rank = rank;
        self
    }

    pub fn with_durability_rank(mut self, rank: u32) -> Self {
        self.durability_rank = rank;
        self
    }
}

// =============================================================================
// Health and Stats
// =============================================================================

/// Non-blocking health probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn is_down(&self) -> bool {
        matches!(self, HealthStatus::Down)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Ok => write!(f, "ok"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Down => write!(f, "down"),
        }
    }
}

/// Usage report for quota enforcement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStats {
    /// Bytes currently used
    pub used_bytes: u64,
    /// Quota, if the backend enforces one
    pub quota_bytes: Option<u64>,
    /// Health at stat time
    pub health: HealthStatus,
}

impl BackendStats {
    /// Whether a write of `size` bytes would exceed the quota
    pub fn would_exceed_quota(&self, size: u64) -> bool {
        match self.quota_bytes {
            Some(quota) => self.used_bytes + size > quota,
            None => false,
        }
    }
}

// =============================================================================
// BackendAdapter Trait (Port)
// =============================================================================

/// Uniform port over every tier's storage.
///
/// `has` may be approximate: false negatives are permitted (and must converge
/// on retry), false positives are not. Adapters refuse capabilities they do
/// not declare with [`Error::Unsupported`].
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Static descriptor for this tier
    fn descriptor(&self) -> &TierDescriptor;

    /// Store bytes addressable by `fp`
    async fn put(&self, fp: &Fingerprint, body: Bytes) -> Result<()>;

    /// Return the full body
    async fn get(&self, fp: &Fingerprint) -> Result<Bytes>;

    /// Cheap existence check
    async fn has(&self, fp: &Fingerprint) -> Result<bool>;

    /// Delete the local copy; idempotent
    async fn remove(&self, fp: &Fingerprint) -> Result<()>;

    /// Usage and quota report
    async fn stat(&self) -> Result<BackendStats>;

    /// Non-blocking health probe
    async fn health(&self) -> HealthStatus;
}

/// Shared adapter handle
pub type BackendRef = Arc<dyn BackendAdapter>;

// =============================================================================
// Tier Registry
// =============================================================================

/// Ordered set of registered backend adapters, fastest first.
///
/// Registration normally happens once at startup; reads take a cheap
/// snapshot so probe loops never hold the lock across I/O.
pub struct TierRegistry {
    adapters: RwLock<Vec<BackendRef>>,
}

impl TierRegistry {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(Vec::new()),
        }
    }

    /// Register an adapter, keeping the set ordered by ascending latency rank.
    ///
    /// Fails if a tier with the same name is already registered.
    pub fn register(&self, adapter: BackendRef) -> Result<()> {
        let mut adapters = self.adapters.write();
        if adapters
            .iter()
            .any(|a| a.descriptor().name == adapter.descriptor().name)
        {
            return Err(Error::Configuration(format!(
                "tier {} already registered",
                adapter.descriptor().name
            )));
        }
        adapters.push(adapter);
        adapters.sort_by_key(|a| a.descriptor().latency_rank);
        Ok(())
    }

    /// Look up an adapter by tier name
    pub fn get(&self, name: &str) -> Option<BackendRef> {
        self.adapters
            .read()
            .iter()
            .find(|a| a.descriptor().name == name)
            .cloned()
    }

    /// Snapshot of all adapters, ascending latency rank
    pub fn snapshot(&self) -> Vec<BackendRef> {
        self.adapters.read().clone()
    }

    /// Adapters of a given class, ascending latency rank
    pub fn by_class(&self, class: TierClass) -> Vec<BackendRef> {
        self.adapters
            .read()
            .iter()
            .filter(|a| a.descriptor().class == class)
            .cloned()
            .collect()
    }

    /// Writable adapters whose durability rank meets `min_rank`, most
    /// latency-favorable first
    pub fn durable_at_least(&self, min_rank: u32) -> Vec<BackendRef> {
        self.adapters
            .read()
            .iter()
            .filter(|a| a.descriptor().writable && a.descriptor().durability_rank >= min_rank)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }
}

impl Default for TierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults() {
        let d = TierDescriptor::new("s3", TierClass::ObjectStore);
        assert!(d.writable);
        assert!(d.capabilities.supports(Capability::Remove));

        let g = TierDescriptor::new("gw", TierClass::RetrievalOnly);
        assert!(!g.writable);
        assert!(g.capabilities.supports(Capability::Get));
        assert!(!g.capabilities.supports(Capability::Put));

        let a = TierDescriptor::new("glacier", TierClass::Archival);
        assert!(!a.capabilities.supports(Capability::Remove));
        assert!(a.capabilities.supports(Capability::Put));
    }

    #[test]
    fn test_registry_ordering_and_dedup() {
        let registry = TierRegistry::new();
        registry
            .register(Arc::new(MemoryBackend::new(
                TierDescriptor::new("slow", TierClass::ObjectStore).with_latency_rank(40),
            )))
            .unwrap();
        registry
            .register(Arc::new(MemoryBackend::new(
                TierDescriptor::new("fast", TierClass::ContentStore).with_latency_rank(20),
            )))
            .unwrap();

        let names: Vec<String> = registry
            .snapshot()
            .iter()
            .map(|a| a.descriptor().name.clone())
            .collect();
        assert_eq!(names, vec!["fast", "slow"]);

        // Duplicate names are rejected
        let dup = registry.register(Arc::new(MemoryBackend::new(TierDescriptor::new(
            "fast",
            TierClass::Memory,
        ))));
        assert!(dup.is_err());
    }

    #[test]
    fn test_durable_filter() {
        let registry = TierRegistry::new();
        registry
            .register(Arc::new(MemoryBackend::new(TierDescriptor::new(
                "mem",
                TierClass::Memory,
            ))))
            .unwrap();
        registry
            .register(Arc::new(MemoryBackend::new(TierDescriptor::new(
                "archive",
                TierClass::Archival,
            ))))
            .unwrap();

        let durable = registry.durable_at_least(80);
        assert_eq!(durable.len(), 1);
        assert_eq!(durable[0].descriptor().name, "archive");
    }

    #[test]
    fn test_stats_quota() {
        let stats = BackendStats {
            used_bytes: 90,
            quota_bytes: Some(100),
            health: HealthStatus::Ok,
        };
        assert!(!stats.would_exceed_quota(10));
        assert!(stats.would_exceed_quota(11));

        let unlimited = BackendStats {
            used_bytes: u64::MAX / 2,
            quota_bytes: None,
            health: HealthStatus::Ok,
        };
        assert!(!unlimited.would_exceed_quota(u64::MAX / 4));
    }
}
