//! Content-Addressed Store Backend
//!
//! The content-addressed store is an external daemon exposing add/get/pin by
//! identifier; [`ContentStore`] is its client port. The daemon computes the
//! fingerprint for added bytes, so the content-store tier is the hashing
//! authority on the write path. [`InMemoryContentStore`] serves tests and
//! single-process deployments; the sync handler also moves index partitions
//! through whichever implementation is installed.

use crate::backend::{BackendAdapter, BackendStats, Capabilities, HealthStatus, TierClass, TierDescriptor};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// ContentStore Client Port
// =============================================================================

/// Client port for the external content-addressed store daemon
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store bytes; the daemon computes and returns the fingerprint
    async fn add(&self, body: Bytes) -> Result<Fingerprint>;

    /// Fetch the full body for a fingerprint
    async fn get(&self, fp: &Fingerprint) -> Result<Bytes>;

    /// Existence check
    async fn has(&self, fp: &Fingerprint) -> Result<bool>;

    /// Protect a fingerprint from garbage collection; idempotent
    async fn pin(&self, fp: &Fingerprint) -> Result<()>;

    /// Reverse of `pin`; idempotent
    async fn unpin(&self, fp: &Fingerprint) -> Result<()>;

    /// Whether the fingerprint is currently pinned
    async fn is_pinned(&self, fp: &Fingerprint) -> Result<bool>;

    /// Bytes currently stored
    async fn used_bytes(&self) -> Result<u64>;
}

/// Shared content-store handle
pub type ContentStoreRef = Arc<dyn ContentStore>;

// =============================================================================
// In-Memory Content Store
// =============================================================================

/// Process-local content store for tests and single-node deployments
pub struct InMemoryContentStore {
    blocks: DashMap<Fingerprint, Bytes>,
    pins: DashSet<Fingerprint>,
    used_bytes: AtomicU64,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self {
            blocks: DashMap::new(),
            pins: DashSet::new(),
            used_bytes: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Drop unpinned blocks, returning bytes reclaimed
    pub fn collect_garbage(&self) -> u64 {
        let mut reclaimed = 0u64;
        let victims: Vec<Fingerprint> = self
            .blocks
            .iter()
            .filter(|e| !self.pins.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for fp in victims {
            if let Some((_, body)) = self.blocks.remove(&fp) {
                reclaimed += body.len() as u64;
                self.used_bytes.fetch_sub(body.len() as u64, Ordering::Relaxed);
            }
        }
        reclaimed
    }
}

impl Default for InMemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn add(&self, body: Bytes) -> Result<Fingerprint> {
        let fp = Fingerprint::of(&body);
        if self.blocks.insert(fp.clone(), body.clone()).is_none() {
            self.used_bytes.fetch_add(body.len() as u64, Ordering::Relaxed);
        }
        Ok(fp)
    }

    async fn get(&self, fp: &Fingerprint) -> Result<Bytes> {
        self.blocks
            .get(fp)
            .map(|r| r.value().clone())
            .ok_or(Error::NotFound)
    }

    async fn has(&self, fp: &Fingerprint) -> Result<bool> {
        Ok(self.blocks.contains_key(fp))
    }

    async fn pin(&self, fp: &Fingerprint) -> Result<()> {
        if !self.blocks.contains_key(fp) {
            return Err(Error::NotFound);
        }
        self.pins.insert(fp.clone());
        Ok(())
    }

    async fn unpin(&self, fp: &Fingerprint) -> Result<()> {
        self.pins.remove(fp);
        Ok(())
    }

    async fn is_pinned(&self, fp: &Fingerprint) -> Result<bool> {
        Ok(self.pins.contains(fp))
    }

    async fn used_bytes(&self) -> Result<u64> {
        Ok(self.used_bytes.load(Ordering::Relaxed))
    }
}

// =============================================================================
// Content Store Backend Adapter
// =============================================================================

/// Adapter presenting a [`ContentStore`] as a tier.
///
/// `remove` is refused: the daemon reclaims unpinned blocks through its own
/// garbage collection, not through direct deletes.
pub struct ContentStoreBackend {
    descriptor: TierDescriptor,
    store: ContentStoreRef,
}

impl ContentStoreBackend {
    pub fn new(name: impl Into<String>, store: ContentStoreRef) -> Self {
        let mut descriptor = TierDescriptor::new(name, TierClass::ContentStore);
        descriptor.capabilities = Capabilities::no_remove();
        Self { descriptor, store }
    }

    pub fn store(&self) -> &ContentStoreRef {
        &self.store
    }
}

#[async_trait]
impl BackendAdapter for ContentStoreBackend {
    fn descriptor(&self) -> &TierDescriptor {
        &self.descriptor
    }

    async fn put(&self, fp: &Fingerprint, body: Bytes) -> Result<()> {
        let stored = self.store.add(body).await?;
        // The daemon is the hashing authority; a disagreement means the
        // caller's fingerprint does not describe these bytes.
        if &stored != fp {
            return Err(Error::Corruption(format!(
                "content store hashed body to {} but caller supplied {}",
                stored, fp
            )));
        }
        Ok(())
    }

    async fn get(&self, fp: &Fingerprint) -> Result<Bytes> {
        self.store.get(fp).await
    }

    async fn has(&self, fp: &Fingerprint) -> Result<bool> {
        self.store.has(fp).await
    }

    async fn remove(&self, _fp: &Fingerprint) -> Result<()> {
        Err(Error::Unsupported(
            "content store reclaims blocks via garbage collection".into(),
        ))
    }

    async fn stat(&self) -> Result<BackendStats> {
        Ok(BackendStats {
            used_bytes: self.store.used_bytes().await?,
            quota_bytes: None,
            health: self.health().await,
        })
    }

    async fn health(&self) -> HealthStatus {
        match self.store.has(&Fingerprint::of(b"")).await {
            Ok(_) => HealthStatus::Ok,
            Err(_) => HealthStatus::Down,
        }
    }
}
