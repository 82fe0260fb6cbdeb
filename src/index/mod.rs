//! Metadata Index
//!
//! A columnar, partitioned table keyed by fingerprint: which backends hold
//! the content, how big it is, how hot it is, and when it changed. Writes
//! land in a WAL-guarded in-memory buffer that flushes to an immutable
//! partition at a row threshold; reads resolve the newest row per
//! fingerprint across the buffer and every installed partition, honoring
//! tombstones. The manifest of installed partitions is rewritten atomically
//! and is what peers exchange during sync.

pub mod partition;
pub mod record;
pub mod wal;

pub use partition::{content_hash, Manifest, ManifestEntry, PartitionFile};
pub use record::{CompareOp, FieldValue, IndexRecord, LocationEntry, Predicate};

use crate::cache::compression::Compressor;
use crate::cache::heat::now_ms;
use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

fn partition_file_name(partition_id: u64) -> String {
    format!("part-{:06}.col", partition_id)
}

// =============================================================================
// Metadata Index
// =============================================================================

/// The node-local metadata index
pub struct MetadataIndex {
    cfg: IndexConfig,
    dir: PathBuf,
    partitions_dir: PathBuf,
    manifest_path: PathBuf,

    /// Unflushed rows; writers append under the lock, flush swaps the Vec
    /// out and writes it without holding the lock
    buffer: RwLock<Vec<IndexRecord>>,
    wal: wal::IndexWal,
    manifest: RwLock<Manifest>,
    partitions: RwLock<BTreeMap<u64, Arc<PartitionFile>>>,

    /// Serializes flush and compaction
    flush_lock: tokio::sync::Mutex<()>,
    /// Wakes upserts blocked on backpressure
    drained: tokio::sync::Notify,

    next_partition_id: AtomicU64,
    /// Monotonic `updated_at` stamps (never reissues or goes backward)
    clock_ms: AtomicU64,
    compressor: Compressor,
}

impl MetadataIndex {
    /// Open the index under `dir`, replaying the WAL and verifying installed
    /// partitions against the manifest.
    pub async fn open(dir: impl Into<PathBuf>, cfg: IndexConfig) -> Result<Self> {
        let dir = dir.into();
        let partitions_dir = dir.join("partitions");
        let manifest_path = dir.join("manifest.json");
        tokio::fs::create_dir_all(&partitions_dir).await?;

        let mut manifest = Manifest::load(&manifest_path).await?;
        let mut partitions = BTreeMap::new();
        let mut dropped = Vec::new();

        for (id, entry) in manifest.partitions.iter() {
            let path = partitions_dir.join(&entry.file_name);
            let opened = match PartitionFile::open(&path).await {
                Ok(p) => match p.verify_content_hash(&entry.content_hash).await {
                    Ok(()) => Some(p),
                    Err(e) => {
                        warn!(partition_id = id, error = %e, "partition failed integrity check, dropping");
                        None
                    }
                },
                Err(e) => {
                    warn!(partition_id = id, error = %e, "partition unreadable, dropping");
                    None
                }
            };
            match opened {
                Some(p) => {
                    partitions.insert(*id, Arc::new(p));
                }
                None => {
                    let _ = tokio::fs::remove_file(&path).await;
                    dropped.push(*id);
                }
            }
        }
        for id in &dropped {
            manifest.partitions.remove(id);
        }
        if !dropped.is_empty() {
            manifest.save(&manifest_path).await?;
        }

        let wal = wal::IndexWal::open(dir.join("buffer.wal"))?;
        let replayed = wal.replay()?;
        if !replayed.is_empty() {
            info!(rows = replayed.len(), "replayed unflushed index rows from log");
        }

        let next_id = manifest.highest_partition_id() + 1;
        let clock = replayed
            .iter()
            .map(|r| r.updated_at_ms)
            .max()
            .unwrap_or(0)
            .max(now_ms());

        Ok(Self {
            cfg,
            dir,
            partitions_dir,
            manifest_path,
            buffer: RwLock::new(replayed),
            wal,
            manifest: RwLock::new(manifest),
            partitions: RwLock::new(partitions),
            flush_lock: tokio::sync::Mutex::new(()),
            drained: tokio::sync::Notify::new(),
            next_partition_id: AtomicU64::new(next_id),
            clock_ms: AtomicU64::new(clock),
            compressor: Compressor::default(),
        })
    }

    /// Strictly increasing `updated_at` stamp
    fn stamp(&self) -> u64 {
        let now = now_ms();
        loop {
            let prev = self.clock_ms.load(Ordering::Relaxed);
            let next = now.max(prev + 1);
            if self
                .clock_ms
                .compare_exchange(prev, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return next;
            }
        }
    }

    async fn wait_for_capacity(&self) -> Result<()> {
        if self.buffer.read().len() < self.cfg.buffer_high_watermark {
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + self.cfg.backpressure_wait;
        loop {
            if self.buffer.read().len() < self.cfg.buffer_high_watermark {
                return Ok(());
            }
            let notified = self.drained.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Capacity(
                    "index write buffer at high watermark".into(),
                ));
            }
        }
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Append a row. The record's `updated_at` is restamped monotonically;
    /// duplicates across partitions are expected and resolved at read time.
    pub async fn upsert(&self, mut record: IndexRecord) -> Result<()> {
        self.wait_for_capacity().await?;

        record.updated_at_ms = self.stamp();

        // Log and buffer move together under the buffer lock, so a crash
        // can never observe a buffered row the log does not cover
        let should_flush = {
            let mut buffer = self.buffer.write();
            self.wal.append(&record)?;
            buffer.push(record);
            buffer.len() >= self.cfg.partition_row_limit
        };

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Read-modify-write helper: loads the current row (or starts a fresh
    /// one of `default_size`) and upserts the mutated result.
    pub async fn upsert_with<F>(&self, fp: &Fingerprint, default_size: u64, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut IndexRecord),
    {
        let mut record = self
            .get(fp)
            .await?
            .unwrap_or_else(|| IndexRecord::new(fp.clone(), default_size));
        mutate(&mut record);
        self.upsert(record).await
    }

    /// Emit a tombstone; the record stays discoverable for the retention
    /// window so peers learn of the deletion.
    pub async fn delete(&self, fp: &Fingerprint) -> Result<()> {
        self.upsert(IndexRecord::tombstone(fp.clone())).await
    }

    /// Flush the buffer into a new immutable partition.
    ///
    /// Returns the manifest entry, or `None` when the buffer was empty. The
    /// WAL is truncated only after the manifest records the new partition.
    pub async fn flush(&self) -> Result<Option<ManifestEntry>> {
        let _guard = self.flush_lock.lock().await;

        // Take the rows and rotate the log in one critical section: the
        // rotated segment covers exactly what this flush owns
        let rows = {
            let mut buffer = self.buffer.write();
            if buffer.is_empty() {
                return Ok(None);
            }
            self.wal.rotate()?;
            std::mem::take(&mut *buffer)
        };

        let partition_id = self.next_partition_id.fetch_add(1, Ordering::Relaxed);
        let file_name = partition_file_name(partition_id);

        let entry = match partition::write_partition(
            &self.partitions_dir,
            &file_name,
            partition_id,
            &rows,
            &self.compressor,
        )
        .await
        {
            Ok(entry) => entry,
            Err(e) => {
                // Put the rows back; the rotated log segment still covers
                // them until some later flush succeeds
                let mut buffer = self.buffer.write();
                let mut restored = rows;
                restored.extend(buffer.drain(..));
                *buffer = restored;
                return Err(e);
            }
        };

        let opened = PartitionFile::open(self.partitions_dir.join(&file_name)).await?;
        self.partitions
            .write()
            .insert(partition_id, Arc::new(opened));

        {
            let manifest = {
                let mut m = self.manifest.write();
                m.partitions.insert(partition_id, entry.clone());
                m.clone()
            };
            manifest.save(&self.manifest_path).await?;
        }

        self.wal.clear_flushed()?;
        self.drained.notify_waiters();

        info!(partition_id, rows = entry.row_count, "index buffer flushed");
        Ok(Some(entry))
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    fn partitions_snapshot(&self) -> Vec<Arc<PartitionFile>> {
        // Newest first; resolution is by updated_at, order is just a
        // likely-hit heuristic
        self.partitions.read().values().rev().cloned().collect()
    }

    /// Point lookup: the newest row wins; tombstones read as absent
    pub async fn get(&self, fp: &Fingerprint) -> Result<Option<IndexRecord>> {
        let mut best: Option<IndexRecord> = None;
        let mut consider = |candidate: IndexRecord| {
            if best
                .as_ref()
                .map(|b| candidate.updated_at_ms > b.updated_at_ms)
                .unwrap_or(true)
            {
                best = Some(candidate);
            }
        };

        {
            let buffer = self.buffer.read();
            for row in buffer.iter().filter(|r| &r.fingerprint == fp) {
                consider(row.clone());
            }
        }

        let key_predicate = [Predicate::new(
            "fingerprint",
            CompareOp::Eq,
            fp.to_canonical_string().as_str(),
        )];
        for part in self.partitions_snapshot() {
            for row in part.scan(&key_predicate).await? {
                consider(row);
            }
        }

        Ok(best.filter(|r| !r.is_tombstone()))
    }

    /// Predicate scan across the buffer and all partitions.
    ///
    /// Results are reduced to the newest row per fingerprint, tombstones
    /// dropped, ordered by fingerprint for determinism, then limited.
    pub async fn query(
        &self,
        predicates: &[Predicate],
        columns: Option<&[&str]>,
        limit: Option<usize>,
    ) -> Result<Vec<IndexRecord>> {
        for predicate in predicates {
            predicate.validate()?;
        }
        let projection: Option<BTreeSet<String>> =
            columns.map(|cols| cols.iter().map(|c| c.to_string()).collect());

        let mut newest: HashMap<Fingerprint, IndexRecord> = HashMap::new();
        let mut consider = |row: IndexRecord| match newest.entry(row.fingerprint.clone()) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                if row.updated_at_ms > slot.get().updated_at_ms {
                    slot.insert(row);
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(row);
            }
        };

        {
            let buffer = self.buffer.read();
            for row in buffer.iter() {
                // Tombstones must participate in resolution even though they
                // never match user predicates
                if row.is_tombstone() || row.matches_all(predicates) {
                    consider(row.clone());
                }
            }
        }

        for part in self.partitions_snapshot() {
            for row in part.scan_projected(predicates, projection.as_ref()).await? {
                consider(row);
            }
            // Tombstones never match predicates but still veto older rows
            for tombstone in part.tombstones().await? {
                consider(tombstone);
            }
        }

        let mut results: Vec<IndexRecord> = newest
            .into_values()
            .filter(|r| !r.is_tombstone())
            .filter(|r| r.matches_all(predicates))
            .collect();
        results.sort_by_key(|r| r.fingerprint.to_canonical_string());
        if let Some(limit) = limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    // =========================================================================
    // Partition Exchange (sync support)
    // =========================================================================

    /// Manifest entries for announcements
    pub fn manifest_entries(&self) -> Vec<ManifestEntry> {
        self.manifest.read().partitions.values().cloned().collect()
    }

    /// Whether a partition with this id and hash is installed
    pub fn has_partition(&self, partition_id: u64, hash: &str) -> bool {
        self.manifest
            .read()
            .partitions
            .get(&partition_id)
            .map(|e| e.content_hash == hash)
            .unwrap_or(false)
    }

    /// Raw bytes of an installed partition, for serving to peers
    pub async fn partition_bytes(&self, partition_id: u64) -> Result<Bytes> {
        let file_name = self
            .manifest
            .read()
            .partitions
            .get(&partition_id)
            .map(|e| e.file_name.clone())
            .ok_or(Error::NotFound)?;
        Ok(Bytes::from(
            tokio::fs::read(self.partitions_dir.join(file_name)).await?,
        ))
    }

    /// Validate and atomically install a partition fetched from a peer.
    ///
    /// The bytes must hash to the announced `content_hash`; a mismatch is
    /// `Corruption` and nothing is installed.
    pub async fn install_partition(&self, entry: &ManifestEntry, bytes: Bytes) -> Result<()> {
        let actual = content_hash(&bytes);
        if actual != entry.content_hash {
            return Err(Error::Corruption(format!(
                "partition {} hashes to {}, announced {}",
                entry.partition_id, actual, entry.content_hash
            )));
        }

        // A same-id partition with a different hash may already be installed
        // (convergence window); suffix the file so neither clobbers the other
        let existing = self.manifest.read().partitions.get(&entry.partition_id).cloned();
        let file_name = match &existing {
            Some(e) if e.content_hash == entry.content_hash => return Ok(()),
            Some(_) => format!(
                "part-{:06}-{}.col",
                entry.partition_id,
                &entry.content_hash[..8]
            ),
            None => partition_file_name(entry.partition_id),
        };

        let path = self.partitions_dir.join(&file_name);
        let tmp = self.partitions_dir.join(format!("{}.tmp", file_name));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let opened = PartitionFile::open(&path).await?;
        if opened.partition_id() != entry.partition_id {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(Error::Corruption(format!(
                "partition file declares id {}, announced {}",
                opened.partition_id(),
                entry.partition_id
            )));
        }

        self.partitions
            .write()
            .insert(entry.partition_id, Arc::new(opened));
        {
            let manifest = {
                let mut m = self.manifest.write();
                m.partitions.insert(
                    entry.partition_id,
                    ManifestEntry {
                        file_name,
                        ..entry.clone()
                    },
                );
                m.clone()
            };
            manifest.save(&self.manifest_path).await?;
        }

        // Keep locally minted ids ahead of anything installed
        let mut next = self.next_partition_id.load(Ordering::Relaxed);
        while next <= entry.partition_id {
            match self.next_partition_id.compare_exchange(
                next,
                entry.partition_id + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => next = actual,
            }
        }

        debug!(partition_id = entry.partition_id, rows = entry.row_count, "partition installed");
        Ok(())
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Merge all partitions into one, dropping superseded duplicates and
    /// tombstones older than the retention window.
    pub async fn compact(&self) -> Result<Option<ManifestEntry>> {
        self.flush().await?;
        let _guard = self.flush_lock.lock().await;

        let old: Vec<Arc<PartitionFile>> = self.partitions.read().values().cloned().collect();
        if old.is_empty() {
            return Ok(None);
        }

        let mut newest: HashMap<Fingerprint, IndexRecord> = HashMap::new();
        for part in &old {
            for row in part.scan(&[]).await? {
                match newest.entry(row.fingerprint.clone()) {
                    std::collections::hash_map::Entry::Occupied(mut slot) => {
                        if row.updated_at_ms > slot.get().updated_at_ms {
                            slot.insert(row);
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(row);
                    }
                }
            }
        }

        let retention_ms = self.cfg.tombstone_retention.as_millis() as u64;
        let now = now_ms();
        let mut rows: Vec<IndexRecord> = newest
            .into_values()
            .filter(|r| match r.deleted_at_ms {
                Some(deleted) => now.saturating_sub(deleted) < retention_ms,
                None => true,
            })
            .collect();
        rows.sort_by_key(|r| r.fingerprint.to_canonical_string());

        let partition_id = self.next_partition_id.fetch_add(1, Ordering::Relaxed);
        let file_name = partition_file_name(partition_id);
        let entry = partition::write_partition(
            &self.partitions_dir,
            &file_name,
            partition_id,
            &rows,
            &self.compressor,
        )
        .await?;

        let opened = Arc::new(PartitionFile::open(self.partitions_dir.join(&file_name)).await?);
        let old_paths: Vec<PathBuf> = old.iter().map(|p| p.path().to_path_buf()).collect();

        {
            let mut partitions = self.partitions.write();
            partitions.clear();
            partitions.insert(partition_id, opened);
        }
        {
            let manifest = {
                let mut m = self.manifest.write();
                m.partitions.clear();
                m.partitions.insert(partition_id, entry.clone());
                m.clone()
            };
            manifest.save(&self.manifest_path).await?;
        }
        for path in old_paths {
            let _ = tokio::fs::remove_file(path).await;
        }

        info!(partition_id, rows = entry.row_count, merged = old.len(), "index compacted");
        Ok(Some(entry))
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn buffer_len(&self) -> usize {
        self.buffer.read().len()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn small_config(row_limit: usize) -> IndexConfig {
        IndexConfig {
            partition_row_limit: row_limit,
            buffer_high_watermark: row_limit * 2,
            backpressure_wait: Duration::from_millis(100),
            tombstone_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }

    fn record(label: &str, size: u64) -> IndexRecord {
        IndexRecord::new(Fingerprint::of(label.as_bytes()), size)
    }

    #[tokio::test]
    async fn test_upsert_get_newest_wins() {
        let tmp = TempDir::new().unwrap();
        let index = MetadataIndex::open(tmp.path().join("index"), small_config(100))
            .await
            .unwrap();

        let fp = Fingerprint::of(b"versioned");
        let mut first = IndexRecord::new(fp.clone(), 10);
        first.mark_present("object-store");
        index.upsert(first).await.unwrap();

        let mut second = IndexRecord::new(fp.clone(), 10);
        second.mark_present("object-store");
        second.mark_present("disk");
        index.upsert(second).await.unwrap();

        let got = index.get(&fp).await.unwrap().unwrap();
        assert_eq!(got.present_on(), vec!["disk", "object-store"]);
    }

    #[tokio::test]
    async fn test_updated_at_monotonic() {
        let tmp = TempDir::new().unwrap();
        let index = MetadataIndex::open(tmp.path().join("index"), small_config(100))
            .await
            .unwrap();

        let fp = Fingerprint::of(b"monotonic");
        let mut last = 0;
        for i in 0..5 {
            index.upsert(record("monotonic", i)).await.unwrap();
            let got = index.get(&fp).await.unwrap().unwrap();
            assert!(got.updated_at_ms > last, "updated_at must strictly advance");
            last = got.updated_at_ms;
        }
    }

    #[tokio::test]
    async fn test_flush_at_exact_row_limit() {
        let tmp = TempDir::new().unwrap();
        let index = MetadataIndex::open(tmp.path().join("index"), small_config(3))
            .await
            .unwrap();

        index.upsert(record("a", 1)).await.unwrap();
        index.upsert(record("b", 2)).await.unwrap();
        assert_eq!(index.buffer_len(), 2, "limit - 1 must not flush");
        assert_eq!(index.partition_count(), 0);

        index.upsert(record("c", 3)).await.unwrap();
        assert_eq!(index.buffer_len(), 0, "exact limit flushes");
        assert_eq!(index.partition_count(), 1);

        // Rows remain visible from the partition
        let got = index.get(&Fingerprint::of(b"a")).await.unwrap().unwrap();
        assert_eq!(got.size_bytes, 1);
    }

    #[tokio::test]
    async fn test_crash_recovery_after_flush() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("index");

        {
            let index = MetadataIndex::open(&dir, small_config(3)).await.unwrap();
            index.upsert(record("r1", 1)).await.unwrap();
            index.upsert(record("r2", 2)).await.unwrap();
            index.upsert(record("r3", 3)).await.unwrap();
            // Flushed at the limit; drop without shutdown = crash
        }

        let reopened = MetadataIndex::open(&dir, small_config(3)).await.unwrap();
        assert_eq!(reopened.partition_count(), 1);
        assert_eq!(reopened.buffer_len(), 0, "buffer empty after clean flush");
        let entries = reopened.manifest_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].row_count, 3);
        for label in ["r1", "r2", "r3"] {
            assert!(
                reopened.get(&Fingerprint::of(label.as_bytes())).await.unwrap().is_some(),
                "{} must survive restart",
                label
            );
        }
    }

    #[tokio::test]
    async fn test_crash_recovery_unflushed_rows_replay() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("index");

        {
            let index = MetadataIndex::open(&dir, small_config(100)).await.unwrap();
            index.upsert(record("unflushed", 9)).await.unwrap();
        }

        let reopened = MetadataIndex::open(&dir, small_config(100)).await.unwrap();
        assert_eq!(reopened.buffer_len(), 1, "WAL must replay into the buffer");
        let got = reopened
            .get(&Fingerprint::of(b"unflushed"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.size_bytes, 9);
    }

    #[tokio::test]
    async fn test_tombstone_hides_record() {
        let tmp = TempDir::new().unwrap();
        let index = MetadataIndex::open(tmp.path().join("index"), small_config(100))
            .await
            .unwrap();

        let fp = Fingerprint::of(b"doomed");
        index.upsert(IndexRecord::new(fp.clone(), 5)).await.unwrap();
        assert!(index.get(&fp).await.unwrap().is_some());

        index.delete(&fp).await.unwrap();
        assert!(index.get(&fp).await.unwrap().is_none());

        // Tombstone beats an older flushed row too
        index.flush().await.unwrap();
        assert!(index.get(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_across_buffer_and_partitions() {
        let tmp = TempDir::new().unwrap();
        let index = MetadataIndex::open(tmp.path().join("index"), small_config(100))
            .await
            .unwrap();

        for i in 0..4u64 {
            let mut r = record(&format!("q-{}", i), i * 100);
            r.tags.insert(if i % 2 == 0 { "even" } else { "odd" }.to_string());
            index.upsert(r).await.unwrap();
        }
        index.flush().await.unwrap();
        // Two more rows stay in the buffer
        for i in 4..6u64 {
            let mut r = record(&format!("q-{}", i), i * 100);
            r.tags.insert("even".to_string());
            index.upsert(r).await.unwrap();
        }

        let big = index
            .query(&[Predicate::new("size_bytes", CompareOp::Ge, 300u64)], None, None)
            .await
            .unwrap();
        assert_eq!(big.len(), 3);

        let limited = index
            .query(&[Predicate::new("size_bytes", CompareOp::Ge, 0u64)], None, Some(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);

        let evens = index
            .query(&[Predicate::new("tags", CompareOp::Eq, "even")], None, None)
            .await
            .unwrap();
        assert_eq!(evens.len(), 4);
    }

    #[tokio::test]
    async fn test_query_rejects_unknown_column() {
        let tmp = TempDir::new().unwrap();
        let index = MetadataIndex::open(tmp.path().join("index"), small_config(100))
            .await
            .unwrap();
        let err = index
            .query(&[Predicate::new("bogus", CompareOp::Eq, 1u64)], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_duplicate_rows_resolve_newest_across_partitions() {
        let tmp = TempDir::new().unwrap();
        let index = MetadataIndex::open(tmp.path().join("index"), small_config(100))
            .await
            .unwrap();

        let fp = Fingerprint::of(b"dup");
        index.upsert(IndexRecord::new(fp.clone(), 1)).await.unwrap();
        index.flush().await.unwrap();
        index.upsert(IndexRecord::new(fp.clone(), 2)).await.unwrap();
        index.flush().await.unwrap();

        assert_eq!(index.partition_count(), 2);
        let got = index.get(&fp).await.unwrap().unwrap();
        assert_eq!(got.size_bytes, 2, "newest row wins across partitions");
    }

    #[tokio::test]
    async fn test_install_partition_validates_hash() {
        let tmp1 = TempDir::new().unwrap();
        let tmp2 = TempDir::new().unwrap();

        let producer = MetadataIndex::open(tmp1.path().join("index"), small_config(100))
            .await
            .unwrap();
        producer.upsert(record("shared", 77)).await.unwrap();
        let entry = producer.flush().await.unwrap().unwrap();
        let bytes = producer.partition_bytes(entry.partition_id).await.unwrap();

        let consumer = MetadataIndex::open(tmp2.path().join("index"), small_config(100))
            .await
            .unwrap();

        // Tampered body: rejected, manifest untouched
        let mut tampered = bytes.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;
        let err = consumer
            .install_partition(&entry, Bytes::from(tampered))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
        assert_eq!(consumer.partition_count(), 0);

        // Pristine body: installed and queryable
        consumer.install_partition(&entry, bytes).await.unwrap();
        assert!(consumer.has_partition(entry.partition_id, &entry.content_hash));
        let got = consumer
            .get(&Fingerprint::of(b"shared"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.size_bytes, 77);
    }

    #[tokio::test]
    async fn test_compact_merges_and_drops_superseded() {
        let tmp = TempDir::new().unwrap();
        let index = MetadataIndex::open(tmp.path().join("index"), small_config(100))
            .await
            .unwrap();

        let fp = Fingerprint::of(b"compacted");
        index.upsert(IndexRecord::new(fp.clone(), 1)).await.unwrap();
        index.flush().await.unwrap();
        index.upsert(IndexRecord::new(fp.clone(), 2)).await.unwrap();
        index.upsert(record("other", 3)).await.unwrap();
        index.flush().await.unwrap();
        assert_eq!(index.partition_count(), 2);

        let entry = index.compact().await.unwrap().unwrap();
        assert_eq!(index.partition_count(), 1);
        assert_eq!(entry.row_count, 2, "superseded duplicate dropped");
        assert_eq!(index.get(&fp).await.unwrap().unwrap().size_bytes, 2);
    }

    #[tokio::test]
    async fn test_compact_drops_expired_tombstones() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = small_config(100);
        cfg.tombstone_retention = Duration::from_millis(0);
        let index = MetadataIndex::open(tmp.path().join("index"), cfg).await.unwrap();

        index.upsert(record("keep", 1)).await.unwrap();
        index.delete(&Fingerprint::of(b"drop-me")).await.unwrap();
        index.flush().await.unwrap();

        let entry = index.compact().await.unwrap().unwrap();
        assert_eq!(entry.row_count, 1, "expired tombstone must compact away");
    }

    #[tokio::test]
    async fn test_backpressure_errors_after_bounded_wait() {
        let tmp = TempDir::new().unwrap();
        let cfg = IndexConfig {
            partition_row_limit: 1000, // never auto-flush in this test
            buffer_high_watermark: 2,
            backpressure_wait: Duration::from_millis(50),
            tombstone_retention: Duration::from_secs(60),
        };
        let index = MetadataIndex::open(tmp.path().join("index"), cfg).await.unwrap();

        index.upsert(record("bp-1", 1)).await.unwrap();
        index.upsert(record("bp-2", 2)).await.unwrap();
        let err = index.upsert(record("bp-3", 3)).await.unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));

        // Draining unblocks writers again
        index.flush().await.unwrap();
        index.upsert(record("bp-3", 3)).await.unwrap();
    }
}
