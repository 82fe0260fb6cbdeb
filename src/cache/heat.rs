//! Heat Tracking
//!
//! Per-fingerprint access statistics behind a 64-way sharded map. The heat
//! score feeds disk eviction ordering and index heat snapshots: it rewards
//! frequent and recent access, with a mild age bonus so long-lived content
//! beats one-shot spikes.

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Number of shards (64 for good distribution)
pub const HEAT_SHARD_COUNT: usize = 64;

const MS_PER_HOUR: f64 = 3_600_000.0;
const MS_PER_DAY: f64 = 86_400_000.0;

/// Current wall clock in unix milliseconds
pub(crate) fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

// =============================================================================
// Heat Record
// =============================================================================

/// Access statistics for one fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatRecord {
    /// Total accesses observed
    pub access_count: u64,
    /// First access (unix millis)
    pub first_access_ms: u64,
    /// Most recent access (unix millis)
    pub last_access_ms: u64,
    /// Hits per serving tier name
    pub tier_hits: BTreeMap<String, u64>,
    /// Score as of the last access
    pub heat_score: f64,
}

impl HeatRecord {
    fn new(now: u64) -> Self {
        Self {
            access_count: 0,
            first_access_ms: now,
            last_access_ms: now,
            tier_hits: BTreeMap::new(),
            heat_score: 0.0,
        }
    }

    /// Score as a pure function of the record's other fields.
    ///
    /// `score = count × recency × (1 + ln(1 + age_days))` where recency
    /// decays hourly: `1 / (1 + hours_since_last_access)`.
    pub fn compute_score(&self, now: u64) -> f64 {
        let age_days = now.saturating_sub(self.first_access_ms) as f64 / MS_PER_DAY;
        let idle_hours = now.saturating_sub(self.last_access_ms) as f64 / MS_PER_HOUR;
        let recency = 1.0 / (1.0 + idle_hours);
        self.access_count as f64 * recency * (1.0 + (1.0 + age_days).ln())
    }

    fn record(&mut self, tier: &str, now: u64) {
        self.access_count += 1;
        self.last_access_ms = now;
        *self.tier_hits.entry(tier.to_string()).or_insert(0) += 1;
        self.heat_score = self.compute_score(now);
    }
}

// =============================================================================
// Heat Tracker
// =============================================================================

type HeatShard = HashMap<Fingerprint, HeatRecord>;

/// Sharded tracker for every fingerprint ever observed
pub struct HeatTracker {
    shards: Box<[RwLock<HeatShard>; HEAT_SHARD_COUNT]>,
}

impl HeatTracker {
    pub fn new() -> Self {
        let shards: Vec<RwLock<HeatShard>> = (0..HEAT_SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        let shards: Box<[RwLock<HeatShard>; HEAT_SHARD_COUNT]> = shards
            .into_boxed_slice()
            .try_into()
            .unwrap_or_else(|_| unreachable!("shard count is fixed"));
        Self { shards }
    }

    #[inline]
    fn shard_for(&self, fp: &Fingerprint) -> &RwLock<HeatShard> {
        &self.shards[fp.shard_index(HEAT_SHARD_COUNT)]
    }

    /// Record an access served by `tier`, returning the refreshed score
    pub fn record_access(&self, fp: &Fingerprint, tier: &str) -> f64 {
        let now = now_ms();
        let mut shard = self.shard_for(fp).write();
        let record = shard
            .entry(fp.clone())
            .or_insert_with(|| HeatRecord::new(now));
        record.record(tier, now);
        record.heat_score
    }

    /// Current record for a fingerprint, if observed
    pub fn get(&self, fp: &Fingerprint) -> Option<HeatRecord> {
        self.shard_for(fp).read().get(fp).cloned()
    }

    /// Current score; unknown fingerprints are coldest
    pub fn score(&self, fp: &Fingerprint) -> f64 {
        let now = now_ms();
        self.shard_for(fp)
            .read()
            .get(fp)
            .map(|r| r.compute_score(now))
            .unwrap_or(0.0)
    }

    /// Drop a fingerprint's statistics (explicit removal path)
    pub fn forget(&self, fp: &Fingerprint) {
        self.shard_for(fp).write().remove(fp);
    }

    /// Total fingerprints tracked
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Snapshot Persistence
    // =========================================================================

    /// Persist a compact snapshot; staged to a temp file and renamed
    pub async fn snapshot_to(&self, path: &Path) -> Result<()> {
        let mut records: Vec<(Fingerprint, HeatRecord)> = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let shard = shard.read();
            records.extend(shard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let encoded = bincode::serialize(&records)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &encoded).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!(records = records.len(), path = %path.display(), "heat snapshot written");
        Ok(())
    }

    /// Reload a snapshot written by `snapshot_to`; missing file is a no-op
    pub async fn load_from(&self, path: &Path) -> Result<usize> {
        let encoded = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let records: Vec<(Fingerprint, HeatRecord)> = bincode::deserialize(&encoded)?;
        let count = records.len();
        for (fp, record) in records {
            self.shard_for(&fp).write().insert(fp, record);
        }
        tracing::info!(records = count, path = %path.display(), "heat snapshot loaded");
        Ok(count)
    }
}

impl Default for HeatTracker {
    fn default() -> Self {
        Self::new()
    }
}
