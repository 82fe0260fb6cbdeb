//! Disk Cache
//!
//! Content-addressed file store under `<base>/disk_cache`: each entry is a
//! `<fingerprint>.bin` body plus a `<fingerprint>.meta` JSON sidecar. Writes
//! are staged to a temp file and atomically renamed, so a crash mid-write
//! can never leave a half-file under the canonical name; partials found at
//! startup are swept. Overflow evicts coldest-first by heat score down to
//! `budget × low_watermark`. Pinned entries never evict.

use crate::cache::compression::{CompressionAlgorithm, CompressionConfig, Compressor};
use crate::cache::heat::{now_ms, HeatTracker};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Sidecar Metadata
// =============================================================================

/// Sidecar record persisted next to each body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEntryMeta {
    /// Owning fingerprint (canonical string in the sidecar)
    pub fingerprint: Fingerprint,
    /// Original body size
    pub size_bytes: u64,
    /// Bytes on disk (differs when compressed)
    pub stored_bytes: u64,
    /// Compression applied to the body file
    pub compression: CompressionAlgorithm,
    /// Insertion time (unix millis)
    pub inserted_ms: u64,
    /// Last access (unix millis; persisted on write paths only)
    pub last_access_ms: u64,
    /// Pinned entries survive eviction
    pub pinned: bool,
}

// =============================================================================
// Disk Cache
// =============================================================================

/// The on-disk cache tier
pub struct DiskCache {
    root: PathBuf,
    budget_bytes: u64,
    low_watermark: f64,
    compressor: Compressor,
    entries: DashMap<Fingerprint, DiskEntryMeta>,
    used_bytes: AtomicU64,
    /// At-most-one concurrent writer per fingerprint
    write_locks: DashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>,
}

impl DiskCache {
    /// Open (or create) the cache directory and rebuild the in-memory index.
    ///
    /// Startup sweeps temp files and bodies missing their sidecar; both are
    /// artifacts of interrupted writes.
    pub async fn open(
        root: impl Into<PathBuf>,
        budget_bytes: u64,
        low_watermark: f64,
        compression: CompressionConfig,
    ) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let cache = Self {
            root,
            budget_bytes,
            low_watermark,
            compressor: Compressor::new(compression),
            entries: DashMap::new(),
            used_bytes: AtomicU64::new(0),
            write_locks: DashMap::new(),
        };
        cache.rebuild_index().await?;
        Ok(cache)
    }

    async fn rebuild_index(&self) -> Result<()> {
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        let mut bodies: Vec<PathBuf> = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            match ext {
                Some("tmp") => {
                    warn!(path = %path.display(), "removing partial write");
                    let _ = tokio::fs::remove_file(&path).await;
                }
                Some("meta") => match self.load_sidecar(&path).await {
                    Ok(meta) => {
                        let body_path = path.with_extension("bin");
                        if tokio::fs::try_exists(&body_path).await.unwrap_or(false) {
                            self.used_bytes.fetch_add(meta.stored_bytes, Ordering::Relaxed);
                            self.entries.insert(meta.fingerprint.clone(), meta);
                        } else {
                            warn!(path = %path.display(), "sidecar without body, removing");
                            let _ = tokio::fs::remove_file(&path).await;
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unreadable sidecar, removing");
                        let _ = tokio::fs::remove_file(&path).await;
                        let _ = tokio::fs::remove_file(path.with_extension("bin")).await;
                    }
                },
                Some("bin") => bodies.push(path),
                _ => {}
            }
        }

        // Bodies whose sidecar never landed are partial writes too
        for body in bodies {
            let meta_path = body.with_extension("meta");
            if !tokio::fs::try_exists(&meta_path).await.unwrap_or(false) {
                warn!(path = %body.display(), "body without sidecar, removing");
                let _ = tokio::fs::remove_file(&body).await;
            }
        }

        debug!(
            entries = self.entries.len(),
            used = self.used_bytes.load(Ordering::Relaxed),
            "disk cache index rebuilt"
        );
        Ok(())
    }

    async fn load_sidecar(&self, path: &Path) -> Result<DiskEntryMeta> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }

    fn body_path(&self, fp: &Fingerprint) -> PathBuf {
        self.root.join(format!("{}.bin", fp.to_canonical_string()))
    }

    fn meta_path(&self, fp: &Fingerprint) -> PathBuf {
        self.root.join(format!("{}.meta", fp.to_canonical_string()))
    }

    fn writer_lock(&self, fp: &Fingerprint) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .entry(fp.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Stage bytes to `<path>.tmp` then atomically rename into place
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("dat")
        ));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn persist_sidecar(&self, meta: &DiskEntryMeta) -> Result<()> {
        let json = serde_json::to_vec_pretty(meta)?;
        self.write_atomic(&self.meta_path(&meta.fingerprint), &json).await
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Fetch a body, verifying it still hashes to its fingerprint.
    ///
    /// A corrupt body is deleted on the spot and surfaced as `Corruption` so
    /// the placement engine can retry with this tier excluded.
    pub async fn lookup(&self, fp: &Fingerprint) -> Result<Option<Bytes>> {
        let meta = match self.entries.get(fp) {
            Some(m) => m.value().clone(),
            None => return Ok(None),
        };

        let stored = match tokio::fs::read(self.body_path(fp)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Index and directory diverged (external interference)
                self.drop_entry(fp).await;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let body = match self.compressor.decompress(&stored, meta.compression) {
            Ok(body) => body,
            Err(e) => {
                warn!(fp = %fp, error = %e, "corrupt body on disk, deleting");
                self.drop_entry(fp).await;
                return Err(Error::Corruption(format!("disk body for {}", fp)));
            }
        };

        let expected = Fingerprint::of_with(&body, fp.codec(), fp.hash_algorithm());
        if &expected != fp {
            warn!(fp = %fp, "body hash mismatch on disk, deleting");
            self.drop_entry(fp).await;
            return Err(Error::Corruption(format!("disk body for {}", fp)));
        }

        if let Some(mut entry) = self.entries.get_mut(fp) {
            entry.last_access_ms = now_ms();
        }
        Ok(Some(body))
    }

    /// Store a body. Returns fingerprints evicted to stay within budget.
    pub async fn admit(
        &self,
        fp: &Fingerprint,
        body: &Bytes,
        heat: &HeatTracker,
    ) -> Result<Vec<Fingerprint>> {
        let lock = self.writer_lock(fp);
        let _guard = lock.lock().await;

        if self.entries.contains_key(fp) {
            return Ok(Vec::new()); // content-addressed: identical bytes
        }

        let (stored, compression) = self.compressor.compress(body);
        let now = now_ms();
        let meta = DiskEntryMeta {
            fingerprint: fp.clone(),
            size_bytes: body.len() as u64,
            stored_bytes: stored.len() as u64,
            compression,
            inserted_ms: now,
            last_access_ms: now,
            pinned: false,
        };

        // Body first, sidecar second: a crash in between leaves a body
        // without sidecar, which the startup sweep removes.
        self.write_atomic(&self.body_path(fp), &stored).await?;
        self.persist_sidecar(&meta).await?;

        self.used_bytes.fetch_add(meta.stored_bytes, Ordering::Relaxed);
        self.entries.insert(fp.clone(), meta);

        self.evict_if_needed(heat).await
    }

    /// Remove an entry; `Ok(false)` when absent, `Unsupported` when pinned
    pub async fn remove(&self, fp: &Fingerprint) -> Result<bool> {
        eprintln!("DEBUG remove: start");
        let lock = self.writer_lock(fp);
        eprintln!("DEBUG remove: got lock handle");
        let _guard = lock.lock().await;
        eprintln!("DEBUG remove: acquired lock");

        let r = match self.entries.get(fp) {
            None => Ok(false),
            Some(entry) if entry.pinned => Err(Error::Unsupported(format!(
                "{} is pinned on the disk tier; unpin before removing",
                fp
            ))),
            Some(_) => {
                self.drop_entry(fp).await;
                Ok(true)
            }
        };
        eprintln!("DEBUG remove: done");
        r
    }

    /// Set or clear the pin flag; idempotent, `NotFound` when absent
    pub async fn set_pinned(&self, fp: &Fingerprint, pinned: bool) -> Result<()> {
        let meta = {
            let mut entry = self.entries.get_mut(fp).ok_or(Error::NotFound)?;
            if entry.pinned == pinned {
                return Ok(());
            }
            entry.pinned = pinned;
            entry.clone()
        };
        self.persist_sidecar(&meta).await
    }

    pub fn is_pinned(&self, fp: &Fingerprint) -> bool {
        self.entries.get(fp).map(|e| e.pinned).unwrap_or(false)
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.entries.contains_key(fp)
    }

    /// Sidecar metadata for a resident entry
    pub fn meta(&self, fp: &Fingerprint) -> Option<DiskEntryMeta> {
        self.entries.get(fp).map(|e| e.value().clone())
    }

    /// All resident fingerprints
    pub fn iter(&self) -> Vec<Fingerprint> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Evict coldest-first until within `budget × low_watermark`.
    ///
    /// Runs only when strictly over budget; exactly-at-budget is left alone.
    async fn evict_if_needed(&self, heat: &HeatTracker) -> Result<Vec<Fingerprint>> {
        if self.used_bytes() <= self.budget_bytes {
            return Ok(Vec::new());
        }
        let target = (self.budget_bytes as f64 * self.low_watermark) as u64;

        let mut candidates: Vec<(Fingerprint, u64, f64)> = self
            .entries
            .iter()
            .filter(|e| !e.value().pinned)
            .map(|e| (e.key().clone(), e.value().stored_bytes, heat.score(e.key())))
            .collect();
        candidates.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut evicted = Vec::new();
        for (fp, stored, score) in candidates {
            if self.used_bytes() <= target {
                break;
            }
            self.drop_entry(&fp).await;
            debug!(fp = %fp, stored, score, "disk cache evicted");
            evicted.push(fp);
        }
        Ok(evicted)
    }

    async fn drop_entry(&self, fp: &Fingerprint) {
        eprintln!("DEBUG drop_entry: start");
        if let Some((_, meta)) = self.entries.remove(fp) {
            self.used_bytes.fetch_sub(meta.stored_bytes, Ordering::Relaxed);
        }
        eprintln!("DEBUG drop_entry: removed from index");
        let _ = tokio::fs::remove_file(self.body_path(fp)).await;
        eprintln!("DEBUG drop_entry: removed body file");
        let _ = tokio::fs::remove_file(self.meta_path(fp)).await;
        eprintln!("DEBUG drop_entry: removed meta file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_cache(dir: &TempDir, budget: u64) -> DiskCache {
        DiskCache::open(
            dir.path().join("disk_cache"),
            budget,
            0.9,
            CompressionConfig::disabled(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_admit_lookup_remove() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 10_000).await;
        let heat = HeatTracker::new();

        let body = Bytes::from_static(b"disk bytes");
        let fp = Fingerprint::of(&body);

        cache.admit(&fp, &body, &heat).await.unwrap();
        assert!(cache.contains(&fp));
        assert_eq!(cache.used_bytes(), body.len() as u64);
        assert_eq!(cache.lookup(&fp).await.unwrap().unwrap(), body);

        assert!(cache.remove(&fp).await.unwrap());
        assert!(!cache.contains(&fp));
        assert_eq!(cache.used_bytes(), 0);
        assert!(cache.lookup(&fp).await.unwrap().is_none());
        // Absent remove reports false, not an error
        assert!(!cache.remove(&fp).await.unwrap());
    }

    #[tokio::test]
    async fn test_restart_rebuilds_index() {
        let dir = TempDir::new().unwrap();
        let heat = HeatTracker::new();
        let body = Bytes::from_static(b"survives restart");
        let fp = Fingerprint::of(&body);

        {
            let cache = open_cache(&dir, 10_000).await;
            cache.admit(&fp, &body, &heat).await.unwrap();
        }

        let reopened = open_cache(&dir, 10_000).await;
        assert!(reopened.contains(&fp));
        assert_eq!(reopened.lookup(&fp).await.unwrap().unwrap(), body);
        assert_eq!(reopened.used_bytes(), body.len() as u64);
    }

    #[tokio::test]
    async fn test_startup_sweeps_partials() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("disk_cache");
        tokio::fs::create_dir_all(&root).await.unwrap();

        // A temp file and a body without sidecar: both interrupted writes
        tokio::fs::write(root.join("abc.bin.tmp"), b"partial").await.unwrap();
        tokio::fs::write(root.join("orphan.bin"), b"no sidecar").await.unwrap();

        let cache = DiskCache::open(&root, 10_000, 0.9, CompressionConfig::disabled())
            .await
            .unwrap();
        assert_eq!(cache.entry_count(), 0);
        assert!(!tokio::fs::try_exists(root.join("abc.bin.tmp")).await.unwrap());
        assert!(!tokio::fs::try_exists(root.join("orphan.bin")).await.unwrap());
    }

    #[tokio::test]
    async fn test_budget_boundary() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 100).await;
        let heat = HeatTracker::new();

        // Exactly at budget: no eviction
        let a = Bytes::from(vec![1u8; 60]);
        let b = Bytes::from(vec![2u8; 40]);
        let fa = Fingerprint::of(&a);
        let fb = Fingerprint::of(&b);
        assert!(cache.admit(&fa, &a, &heat).await.unwrap().is_empty());
        assert!(cache.admit(&fb, &b, &heat).await.unwrap().is_empty());
        assert_eq!(cache.used_bytes(), 100);

        // One byte over: evict down to low-water (90)
        let c = Bytes::from(vec![3u8; 1]);
        let fc = Fingerprint::of(&c);
        // Make `a` the hottest so it survives
        heat.record_access(&fa, "disk");
        heat.record_access(&fa, "disk");
        let evicted = cache.admit(&fc, &c, &heat).await.unwrap();
        assert!(!evicted.is_empty());
        assert!(cache.used_bytes() <= 90);
        assert!(cache.contains(&fa), "hot entry should survive eviction");
    }

    #[tokio::test]
    async fn test_pinned_survives_eviction_and_blocks_remove() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 100).await;
        let heat = HeatTracker::new();

        let pinned = Bytes::from(vec![7u8; 80]);
        let fp_pinned = Fingerprint::of(&pinned);
        cache.admit(&fp_pinned, &pinned, &heat).await.unwrap();
        cache.set_pinned(&fp_pinned, true).await.unwrap();
        // Idempotent
        cache.set_pinned(&fp_pinned, true).await.unwrap();

        let filler = Bytes::from(vec![8u8; 60]);
        let fp_filler = Fingerprint::of(&filler);
        cache.admit(&fp_filler, &filler, &heat).await.unwrap();

        assert!(cache.contains(&fp_pinned), "pinned entry must not evict");
        assert!(matches!(
            cache.remove(&fp_pinned).await,
            Err(Error::Unsupported(_))
        ));

        cache.set_pinned(&fp_pinned, false).await.unwrap();
        assert!(cache.remove(&fp_pinned).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_body_detected_and_deleted() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 10_000).await;
        let heat = HeatTracker::new();

        let body = Bytes::from_static(b"pristine content");
        let fp = Fingerprint::of(&body);
        cache.admit(&fp, &body, &heat).await.unwrap();

        // Flip bytes under the canonical name
        tokio::fs::write(cache.body_path(&fp), b"tampered content")
            .await
            .unwrap();

        assert!(matches!(
            cache.lookup(&fp).await,
            Err(Error::Corruption(_))
        ));
        assert!(!cache.contains(&fp), "corrupt entry must be dropped");
    }

    #[tokio::test]
    async fn test_compression_round_trips() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::open(
            dir.path().join("disk_cache"),
            1_000_000,
            0.9,
            CompressionConfig::default(),
        )
        .await
        .unwrap();
        let heat = HeatTracker::new();

        let body = Bytes::from(b"compress me ".repeat(1024));
        let fp = Fingerprint::of(&body);
        cache.admit(&fp, &body, &heat).await.unwrap();

        let meta = cache.meta(&fp).unwrap();
        assert!(meta.stored_bytes < meta.size_bytes, "repetitive body should shrink");
        assert_eq!(cache.lookup(&fp).await.unwrap().unwrap(), body);
    }
}
