//! Placement Engine
//!
//! Decides which tier to consult next on reads, which tiers a write must
//! reach, and which tiers are currently trustworthy. Reads walk candidate
//! tiers by ascending latency rank (location set first, caller hints
//! second, bounded concurrent `has` probes last), retrying transient
//! failures once per tier before falling back. Writes reach every
//! durable-minimum tier synchronously and archival tiers asynchronously.
//! A tier failing two consecutive health probes is Faulted and skipped for
//! one full probe interval.

use crate::backend::{BackendAdapter, BackendRef, HealthStatus, TierRegistry};
use crate::cache::events::CacheEvent;
use crate::cache::heat::now_ms;
use crate::config::PlacementConfig;
use crate::error::{Error, ErrorKind, Result, TierFailure};
use crate::fingerprint::Fingerprint;
use crate::index::IndexRecord;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

// =============================================================================
// Tier Health
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct TierHealthState {
    consecutive_failures: u32,
    /// When non-zero, the tier is Faulted and skipped until this time
    faulted_until_ms: u64,
}

// =============================================================================
// Fetch Outcome
// =============================================================================

/// Successful remote fetch: the body, who served it, and what failed on the
/// way there (the coordinator uses the failures to correct the location set)
#[derive(Debug)]
pub struct FetchOutcome {
    pub body: Bytes,
    pub tier: String,
    pub failures: Vec<TierFailure>,
}

// =============================================================================
// Placement Engine
// =============================================================================

/// Tier-selection policy over the registry
pub struct PlacementEngine {
    cfg: PlacementConfig,
    registry: Arc<TierRegistry>,
    health: DashMap<String, TierHealthState>,
    events: Option<broadcast::Sender<CacheEvent>>,
}

impl PlacementEngine {
    pub fn new(
        cfg: PlacementConfig,
        registry: Arc<TierRegistry>,
        events: Option<broadcast::Sender<CacheEvent>>,
    ) -> Self {
        Self {
            cfg,
            registry,
            health: DashMap::new(),
            events,
        }
    }

    pub fn registry(&self) -> &Arc<TierRegistry> {
        &self.registry
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    // =========================================================================
    // Health State Machine
    // =========================================================================

    /// Probe a tier, honoring the Faulted exclusion window
    async fn tier_usable(&self, adapter: &BackendRef) -> bool {
        let name = adapter.descriptor().name.clone();
        let now = now_ms();

        if let Some(state) = self.health.get(&name) {
            if state.faulted_until_ms > now {
                return false; // still serving its exclusion window
            }
        }

        match adapter.health().await {
            HealthStatus::Ok | HealthStatus::Degraded => {
                let was_faulted = self
                    .health
                    .get(&name)
                    .map(|s| s.faulted_until_ms > 0)
                    .unwrap_or(false);
                self.health.insert(name.clone(), TierHealthState::default());
                if was_faulted {
                    debug!(tier = %name, "tier recovered");
                    self.emit(CacheEvent::TierRecovered { tier: name });
                }
                true
            }
            HealthStatus::Down => {
                self.record_health_failure(&name);
                false
            }
        }
    }

    fn record_health_failure(&self, tier: &str) {
        let mut state = self.health.entry(tier.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= 2 && state.faulted_until_ms == 0 {
            state.faulted_until_ms =
                now_ms() + self.cfg.health_probe_interval.as_millis() as u64;
            warn!(tier, "tier faulted after consecutive health failures");
            self.emit(CacheEvent::TierFaulted {
                tier: tier.to_string(),
            });
        } else if state.consecutive_failures >= 2 {
            state.faulted_until_ms =
                now_ms() + self.cfg.health_probe_interval.as_millis() as u64;
        }
    }

    /// Whether the engine currently skips this tier
    pub fn is_faulted(&self, tier: &str) -> bool {
        self.health
            .get(tier)
            .map(|s| s.faulted_until_ms > now_ms())
            .unwrap_or(false)
    }

    // =========================================================================
    // Read Side
    // =========================================================================

    /// Candidate adapters for a read, ascending latency rank.
    ///
    /// Preference order: index location set, caller hints, then bounded
    /// concurrent existence probes across every registered tier.
    async fn read_candidates(
        &self,
        fp: &Fingerprint,
        record: Option<&IndexRecord>,
        hints: Option<&[String]>,
        exclude: &[String],
        failures: &mut Vec<TierFailure>,
    ) -> Vec<BackendRef> {
        let all = self.registry.snapshot();
        let not_excluded =
            |a: &BackendRef| !exclude.contains(&a.descriptor().name);

        if let Some(record) = record {
            let present = record.present_on();
            let candidates: Vec<BackendRef> = all
                .iter()
                .filter(|a| present.contains(&a.descriptor().name.as_str()))
                .filter(|a| not_excluded(a))
                .cloned()
                .collect();
            if !candidates.is_empty() {
                return candidates;
            }
        }

        if let Some(hints) = hints {
            let candidates: Vec<BackendRef> = all
                .iter()
                .filter(|a| hints.contains(&a.descriptor().name))
                .filter(|a| not_excluded(a))
                .cloned()
                .collect();
            if !candidates.is_empty() {
                return candidates;
            }
        }

        // Cold path: probe everything, bounded fanout, latency order
        let probes: Vec<(BackendRef, Result<bool>)> = stream::iter(
            all.into_iter()
                .filter(|a| not_excluded(a))
                .map(|a| async move {
                    let found = a.has(fp).await;
                    (a, found)
                }),
        )
        .buffered(self.cfg.max_probe_fanout.max(1))
        .collect()
        .await;

        let mut candidates = Vec::new();
        for (adapter, outcome) in probes {
            match outcome {
                Ok(true) => candidates.push(adapter),
                Ok(false) => failures.push(TierFailure::new(
                    adapter.descriptor().name.clone(),
                    ErrorKind::NotFound,
                    "existence probe negative",
                )),
                Err(e) => failures.push(TierFailure::new(
                    adapter.descriptor().name.clone(),
                    e.kind(),
                    e.to_string(),
                )),
            }
        }
        candidates
    }

    /// Fetch a body from the cheapest tier that has it.
    ///
    /// Transient failures retry up to `max_retries_per_tier` on the same
    /// tier, then fall through to the next one. The final error is
    /// `NotFound` only when every tier said `NotFound`.
    pub async fn fetch(
        &self,
        fp: &Fingerprint,
        record: Option<&IndexRecord>,
        hints: Option<&[String]>,
        exclude: &[String],
    ) -> Result<FetchOutcome> {
        let mut failures = Vec::new();
        let candidates = self
            .read_candidates(fp, record, hints, exclude, &mut failures)
            .await;

        if candidates.is_empty() {
            return Err(Error::aggregate(failures));
        }

        for adapter in candidates {
            let name = adapter.descriptor().name.clone();
            if !self.tier_usable(&adapter).await {
                failures.push(TierFailure::new(
                    name,
                    ErrorKind::Unavailable,
                    "tier health is down",
                ));
                continue;
            }

            let mut attempts = 0usize;
            loop {
                match adapter.get(fp).await {
                    Ok(body) => {
                        // Content-addressed: the body must hash back to fp
                        let check =
                            Fingerprint::of_with(&body, fp.codec(), fp.hash_algorithm());
                        if &check != fp {
                            warn!(tier = %name, fp = %fp, "remote body failed hash check");
                            let _ = adapter.remove(fp).await;
                            failures.push(TierFailure::new(
                                name.clone(),
                                ErrorKind::Corruption,
                                "body hash mismatch",
                            ));
                            break;
                        }
                        debug!(tier = %name, fp = %fp, size = body.len(), "fetched from tier");
                        return Ok(FetchOutcome {
                            body,
                            tier: name,
                            failures,
                        });
                    }
                    Err(e) if e.is_retryable() && attempts < self.cfg.max_retries_per_tier => {
                        attempts += 1;
                        debug!(tier = %name, attempt = attempts, "transient failure, retrying tier");
                    }
                    Err(e) if e.is_terminal() => return Err(e),
                    Err(e) => {
                        failures.push(TierFailure::new(name.clone(), e.kind(), e.to_string()));
                        break;
                    }
                }
            }
        }

        Err(Error::aggregate(failures))
    }

    // =========================================================================
    // Write Side
    // =========================================================================

    /// Registry tiers belonging to the durable-minimum set
    pub fn durable_minimum_tiers(&self) -> Vec<BackendRef> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|a| {
                a.descriptor().writable && self.cfg.durable_minimum.contains(&a.descriptor().class)
            })
            .collect()
    }

    /// Write through to every durable-minimum tier in the registry,
    /// short-circuiting on the first failure. Returns the tiers written.
    pub async fn write_durable(&self, fp: &Fingerprint, body: &Bytes) -> Result<Vec<String>> {
        let mut written = Vec::new();
        for adapter in self.durable_minimum_tiers() {
            let name = adapter.descriptor().name.clone();
            adapter.put(fp, body.clone()).await?;
            debug!(tier = %name, fp = %fp, "durable write");
            written.push(name);
        }
        Ok(written)
    }

    /// First writable tier durable enough for an archival request
    pub fn archival_tier(&self) -> Option<BackendRef> {
        self.registry
            .durable_at_least(self.cfg.archival_threshold)
            .into_iter()
            .next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendAdapter, BackendStats, MemoryBackend, TierClass, TierDescriptor,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Adapter that fails a configurable number of gets before succeeding
    struct FlakyBackend {
        inner: MemoryBackend,
        failures_left: AtomicU32,
    }

    impl FlakyBackend {
        fn new(descriptor: TierDescriptor, failures: u32) -> Self {
            Self {
                inner: MemoryBackend::new(descriptor),
                failures_left: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl BackendAdapter for FlakyBackend {
        fn descriptor(&self) -> &TierDescriptor {
            self.inner.descriptor()
        }
        async fn put(&self, fp: &Fingerprint, body: Bytes) -> Result<()> {
            self.inner.put(fp, body).await
        }
        async fn get(&self, fp: &Fingerprint) -> Result<Bytes> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Transient("injected network failure".into()));
            }
            self.inner.get(fp).await
        }
        async fn has(&self, fp: &Fingerprint) -> Result<bool> {
            self.inner.has(fp).await
        }
        async fn remove(&self, fp: &Fingerprint) -> Result<()> {
            self.inner.remove(fp).await
        }
        async fn stat(&self) -> Result<BackendStats> {
            self.inner.stat().await
        }
        async fn health(&self) -> HealthStatus {
            self.inner.health().await
        }
    }

    fn config() -> PlacementConfig {
        PlacementConfig {
            health_probe_interval: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn engine_with(adapters: Vec<BackendRef>) -> PlacementEngine {
        let registry = Arc::new(TierRegistry::new());
        for adapter in adapters {
            registry.register(adapter).unwrap();
        }
        PlacementEngine::new(config(), registry, None)
    }

    async fn seeded_backend(name: &str, class: TierClass, body: &Bytes) -> (Arc<MemoryBackend>, Fingerprint) {
        let backend = Arc::new(MemoryBackend::new(TierDescriptor::new(name, class)));
        let fp = Fingerprint::of(body);
        backend.put(&fp, body.clone()).await.unwrap();
        (backend, fp)
    }

    #[tokio::test]
    async fn test_fetch_via_probe_prefers_fastest() {
        let body = Bytes::from_static(b"placed content");
        let (slow, fp) = seeded_backend("archive", TierClass::Archival, &body).await;
        let (fast, _) = seeded_backend("kubo", TierClass::ContentStore, &body).await;

        let engine = engine_with(vec![slow, fast]);
        let outcome = engine.fetch(&fp, None, None, &[]).await.unwrap();
        assert_eq!(outcome.tier, "kubo", "lower latency rank must win");
        assert_eq!(outcome.body, body);
    }

    #[tokio::test]
    async fn test_fetch_follows_location_set() {
        let body = Bytes::from_static(b"located content");
        let (holder, fp) = seeded_backend("object-store", TierClass::ObjectStore, &body).await;
        let empty = Arc::new(MemoryBackend::new(TierDescriptor::new(
            "kubo",
            TierClass::ContentStore,
        )));

        let engine = engine_with(vec![holder, empty]);
        let mut record = IndexRecord::new(fp.clone(), body.len() as u64);
        record.mark_present("object-store");

        let outcome = engine.fetch(&fp, Some(&record), None, &[]).await.unwrap();
        assert_eq!(outcome.tier, "object-store");
    }

    #[tokio::test]
    async fn test_not_found_only_when_every_tier_missing() {
        let a = Arc::new(MemoryBackend::new(TierDescriptor::new("kubo", TierClass::ContentStore)));
        let b = Arc::new(MemoryBackend::new(TierDescriptor::new("s3", TierClass::ObjectStore)));
        let engine = engine_with(vec![a, b]);

        let fp = Fingerprint::of(b"nowhere");
        assert!(matches!(
            engine.fetch(&fp, None, None, &[]).await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let body = Bytes::from_static(b"flaky content");
        let fp = Fingerprint::of(&body);
        let flaky = Arc::new(FlakyBackend::new(
            TierDescriptor::new("wobbly", TierClass::ObjectStore),
            1, // one failure, then fine: within max_retries_per_tier
        ));
        flaky.inner.put(&fp, body.clone()).await.unwrap();

        let engine = engine_with(vec![flaky]);
        let outcome = engine.fetch(&fp, None, None, &[]).await.unwrap();
        assert_eq!(outcome.body, body);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_falls_back_to_next_tier() {
        let body = Bytes::from_static(b"fallback content");
        let fp = Fingerprint::of(&body);

        let broken = Arc::new(FlakyBackend::new(
            TierDescriptor::new("dying", TierClass::ContentStore),
            10, // more failures than retries allow
        ));
        broken.inner.put(&fp, body.clone()).await.unwrap();
        let (healthy, _) = seeded_backend("s3", TierClass::ObjectStore, &body).await;

        let engine = engine_with(vec![broken, healthy]);
        let outcome = engine.fetch(&fp, None, None, &[]).await.unwrap();
        assert_eq!(outcome.tier, "s3");
        assert!(
            outcome.failures.iter().any(|f| f.tier == "dying"),
            "failed tier must be attributed"
        );
    }

    #[tokio::test]
    async fn test_corrupt_remote_body_excluded() {
        let body = Bytes::from_static(b"true bytes");
        let fp = Fingerprint::of(&body);

        // A backend serving the wrong bytes under fp
        let liar = Arc::new(MemoryBackend::new(TierDescriptor::new(
            "liar",
            TierClass::ContentStore,
        )));
        liar.put(&fp, Bytes::from_static(b"wrong bytes")).await.unwrap();
        let (honest, _) = seeded_backend("s3", TierClass::ObjectStore, &body).await;

        let engine = engine_with(vec![liar.clone(), honest]);
        let outcome = engine.fetch(&fp, None, None, &[]).await.unwrap();
        assert_eq!(outcome.tier, "s3");
        assert!(outcome
            .failures
            .iter()
            .any(|f| f.tier == "liar" && f.kind == ErrorKind::Corruption));
        // The corrupt copy was deleted from the serving tier
        assert!(!liar.has(&fp).await.unwrap());
    }

    #[tokio::test]
    async fn test_faulted_tier_skipped_then_recovers() {
        let body = Bytes::from_static(b"haunted content");
        let (backend, fp) = seeded_backend("kubo", TierClass::ContentStore, &body).await;
        let engine = engine_with(vec![backend.clone()]);

        backend.set_health(HealthStatus::Down);
        // Two consecutive failed probes fault the tier
        assert!(engine.fetch(&fp, None, None, &[]).await.is_err());
        assert!(engine.fetch(&fp, None, None, &[]).await.is_err());
        assert!(engine.is_faulted("kubo"));

        // Recovery alone is not enough until the exclusion window passes
        backend.set_health(HealthStatus::Ok);
        assert!(engine.fetch(&fp, None, None, &[]).await.is_err());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let outcome = engine.fetch(&fp, None, None, &[]).await.unwrap();
        assert_eq!(outcome.tier, "kubo");
        assert!(!engine.is_faulted("kubo"));
    }

    #[tokio::test]
    async fn test_write_durable_short_circuits() {
        let body = Bytes::from_static(b"durable content");
        let fp = Fingerprint::of(&body);

        let store = Arc::new(MemoryBackend::new(TierDescriptor::new(
            "kubo",
            TierClass::ContentStore,
        )));
        let full = Arc::new(MemoryBackend::with_quota(
            TierDescriptor::new("tiny-disk", TierClass::Disk),
            4, // too small for the body
        ));

        let engine = engine_with(vec![full, store.clone()]);
        let err = engine.write_durable(&fp, &body).await.unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));

        // The failing tier came first (disk outranks content-store), so the
        // content store was never reached
        assert!(!store.has(&fp).await.unwrap());
    }

    #[tokio::test]
    async fn test_archival_tier_selection() {
        let archive = Arc::new(MemoryBackend::new(TierDescriptor::new(
            "glacier",
            TierClass::Archival,
        )));
        let hot = Arc::new(MemoryBackend::new(TierDescriptor::new(
            "kubo",
            TierClass::ContentStore,
        )));
        let engine = engine_with(vec![archive, hot]);

        let chosen = engine.archival_tier().unwrap();
        assert_eq!(chosen.descriptor().name, "glacier");
    }

    #[tokio::test]
    async fn test_excluded_tier_not_consulted() {
        let body = Bytes::from_static(b"excluded content");
        let (only, fp) = seeded_backend("kubo", TierClass::ContentStore, &body).await;
        let engine = engine_with(vec![only]);

        let err = engine
            .fetch(&fp, None, None, &["kubo".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. } | Error::NotFound));
    }
}
