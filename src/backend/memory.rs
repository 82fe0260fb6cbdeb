//! In-Memory Backend
//!
//! DashMap-backed adapter for memory-class tiers. Because the descriptor is
//! supplied at construction it also stands in for any remote tier class in
//! single-process deployments and tests.

use crate::backend::{BackendAdapter, BackendStats, HealthStatus, TierDescriptor};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Adapter holding bodies in process memory
pub struct MemoryBackend {
    descriptor: TierDescriptor,
    entries: DashMap<Fingerprint, Bytes>,
    used_bytes: AtomicU64,
    quota_bytes: Option<u64>,
    health: RwLock<HealthStatus>,
}

impl MemoryBackend {
    /// Unbounded backend with the given descriptor
    pub fn new(descriptor: TierDescriptor) -> Self {
        Self {
            descriptor,
            entries: DashMap::new(),
            used_bytes: AtomicU64::new(0),
            quota_bytes: None,
            health: RwLock::new(HealthStatus::Ok),
        }
    }

    /// Backend that refuses writes beyond `quota_bytes`
    pub fn with_quota(descriptor: TierDescriptor, quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new(descriptor)
        }
    }

    /// Override the reported health (operator fencing, tests)
    pub fn set_health(&self, health: HealthStatus) {
        *self.health.write() = health;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl BackendAdapter for MemoryBackend {
    fn descriptor(&self) -> &TierDescriptor {
        &self.descriptor
    }

    async fn put(&self, fp: &Fingerprint, body: Bytes) -> Result<()> {
        if !self.descriptor.writable {
            return Err(Error::Unsupported(format!(
                "tier {} is not writable",
                self.descriptor.name
            )));
        }
        let size = body.len() as u64;
        if let Some(quota) = self.quota_bytes {
            if self.used_bytes.load(Ordering::Relaxed) + size > quota {
                return Err(Error::Capacity(format!(
                    "tier {} quota {} exceeded",
                    self.descriptor.name, quota
                )));
            }
        }
        let old = self.entries.insert(fp.clone(), body);
        if let Some(old) = old {
            self.used_bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
        }
        self.used_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, fp: &Fingerprint) -> Result<Bytes> {
        self.entries
            .get(fp)
            .map(|r| r.value().clone())
            .ok_or(Error::NotFound)
    }

    async fn has(&self, fp: &Fingerprint) -> Result<bool> {
        Ok(self.entries.contains_key(fp))
    }

    async fn remove(&self, fp: &Fingerprint) -> Result<()> {
        if let Some((_, body)) = self.entries.remove(fp) {
            self.used_bytes.fetch_sub(body.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn stat(&self) -> Result<BackendStats> {
        Ok(BackendStats {
            used_bytes: self.used_bytes.load(Ordering::Relaxed),
            quota_bytes: self.quota_bytes,
            health: *self.health.read(),
        })
    }

    async fn health(&self) -> HealthStatus {
        *self.health.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TierClass;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(TierDescriptor::new("mem", TierClass::Memory))
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let b = backend();
        let body = Bytes::from_static(b"hello");
        let fp = Fingerprint::of(&body);

        b.put(&fp, body.clone()).await.unwrap();
        assert_eq!(b.get(&fp).await.unwrap(), body);
        assert!(b.has(&fp).await.unwrap());

        b.remove(&fp).await.unwrap();
        assert!(matches!(b.get(&fp).await, Err(Error::NotFound)));

        // remove is idempotent
        b.remove(&fp).await.unwrap();
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        let b = MemoryBackend::with_quota(TierDescriptor::new("mem", TierClass::Memory), 8);
        let small = Bytes::from_static(b"1234");
        let fp1 = Fingerprint::of(&small);
        b.put(&fp1, small).await.unwrap();

        let big = Bytes::from_static(b"123456");
        let fp2 = Fingerprint::of(&big);
        assert!(matches!(b.put(&fp2, big).await, Err(Error::Capacity(_))));
    }

    #[tokio::test]
    async fn test_size_accounting_on_overwrite() {
        let b = backend();
        let fp = Fingerprint::of(b"k");
        b.put(&fp, Bytes::from_static(b"aaaa")).await.unwrap();
        b.put(&fp, Bytes::from_static(b"bb")).await.unwrap();
        let stats = b.stat().await.unwrap();
        assert_eq!(stats.used_bytes, 2);
    }

    #[tokio::test]
    async fn test_retrieval_only_refuses_put() {
        let b = MemoryBackend::new(TierDescriptor::new("gw", TierClass::RetrievalOnly));
        let body = Bytes::from_static(b"x");
        let fp = Fingerprint::of(&body);
        assert!(matches!(b.put(&fp, body).await, Err(Error::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_health_override() {
        let b = backend();
        assert_eq!(b.health().await, HealthStatus::Ok);
        b.set_health(HealthStatus::Down);
        assert_eq!(b.health().await, HealthStatus::Down);
    }
}
