//! Cache Coordinator
//!
//! The single public surface: `get`, `put`, `pin`, `unpin`, `lookup`,
//! `query` (plus `remove`, `prefetch`, and lifecycle helpers), orchestrating
//! the memory and disk tiers, the heat tracker, the metadata index, the
//! placement engine, and the sync handler. One coordinator per configured
//! node; there is no process-global state.
//!
//! Every operation takes an [`OpContext`] carrying a deadline and a
//! cancellation token. A cancelled `put` that has already reached a tier
//! does not roll that tier back: it records the location set and returns
//! `Cancelled`, the one deliberate side effect on the cancellation path.

use crate::backend::content_store::{ContentStore, ContentStoreBackend, ContentStoreRef};
use crate::backend::{BackendAdapter, BackendRef, TierClass, TierRegistry};
use crate::cache::events::CacheEvent;
use crate::cache::metrics::{CacheMetrics, CacheStatsSnapshot, DISK_TIER, MEMORY_TIER};
use crate::cache::{AdaptiveCache, ArcSnapshot, DiskCache, HeatTracker};
use crate::config::NodeConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::fingerprint::Fingerprint;
use crate::index::{IndexRecord, MetadataIndex, Predicate};
use crate::placement::PlacementEngine;
use crate::sync::{SyncHandler, TopicBusRef};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tier name under which the content-addressed store registers
pub const CONTENT_STORE_TIER: &str = "content-store";

// =============================================================================
// Operation Context
// =============================================================================

/// Deadline and cancellation scope for one public operation
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<tokio::time::Instant>,
    cancel: CancellationToken,
}

impl OpContext {
    /// Unbounded context
    pub fn none() -> Self {
        Self::default()
    }

    /// Context that expires after `timeout`
    pub fn with_deadline(timeout: std::time::Duration) -> Self {
        Self {
            deadline: Some(tokio::time::Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Context driven by an external cancellation token
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail fast if already cancelled or past the deadline
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Deadline);
            }
        }
        Ok(())
    }

    /// Drive a fallible future under this context's deadline and token
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = async {
                match self.deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Deadline),
                    },
                    None => fut.await,
                }
            } => result,
        }
    }
}

// =============================================================================
// Put Options
// =============================================================================

/// Durability requested by a `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Durable minimum only (disk + content store)
    #[default]
    Standard,
    /// Additionally schedule a write to an archival-grade tier
    Archival,
}

/// Descriptive metadata and durability for a `put`
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub mime_type: Option<String>,
    pub name: Option<String>,
    pub tags: BTreeSet<String>,
    pub properties: BTreeMap<String, String>,
    pub durability: Durability,
}

// =============================================================================
// Pin Scope
// =============================================================================

/// How far a pin reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinScope {
    /// This node: disk tier and the local content store
    Local,
    /// A cluster-class tier holds and pins a copy
    Cluster,
    /// An archival-grade tier holds and pins a copy
    Archival,
}

impl PinScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinScope::Local => "local",
            PinScope::Cluster => "cluster",
            PinScope::Archival => "archival",
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// One node's tiered cache and metadata index
pub struct CacheCoordinator {
    config: NodeConfig,
    memory: AdaptiveCache,
    disk: DiskCache,
    heat: Arc<HeatTracker>,
    index: Arc<MetadataIndex>,
    registry: Arc<TierRegistry>,
    placement: PlacementEngine,
    store: ContentStoreRef,
    sync: Option<Arc<SyncHandler>>,
    metrics: CacheMetrics,
    event_tx: broadcast::Sender<CacheEvent>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown_token: CancellationToken,
}

impl CacheCoordinator {
    /// Build a coordinator for one node.
    ///
    /// The content-addressed store is registered as the `content-store` tier;
    /// further backends are added with [`register_backend`](Self::register_backend).
    /// When a bus is supplied the sync handler starts in the configured role.
    pub async fn new(
        config: NodeConfig,
        store: ContentStoreRef,
        bus: Option<TopicBusRef>,
    ) -> Result<Arc<Self>> {
        let (event_tx, _) = broadcast::channel(1024);

        let disk = DiskCache::open(
            config.disk_cache_dir(),
            config.cache.disk_budget_bytes,
            config.cache.low_watermark,
            config.cache.compression.clone(),
        )
        .await?;

        let heat = Arc::new(HeatTracker::new());
        let heat_snapshot_path = config.heat_dir().join("snapshot.bin");
        heat.load_from(&heat_snapshot_path).await?;

        let index = Arc::new(MetadataIndex::open(config.index_dir(), config.index.clone()).await?);

        let registry = Arc::new(TierRegistry::new());
        registry.register(Arc::new(ContentStoreBackend::new(
            CONTENT_STORE_TIER,
            Arc::clone(&store),
        )))?;

        let placement = PlacementEngine::new(
            config.placement.clone(),
            Arc::clone(&registry),
            Some(event_tx.clone()),
        );

        let sync = match bus {
            Some(bus) => {
                let handler = SyncHandler::new(
                    config.sync.clone(),
                    config.role,
                    bus,
                    Arc::clone(&store),
                    &index,
                    Some(event_tx.clone()),
                );
                Arc::clone(&handler).start().await?;
                Some(handler)
            }
            None => None,
        };

        let coordinator = Arc::new(Self {
            memory: AdaptiveCache::new(config.cache.memory_budget_bytes),
            disk,
            heat: Arc::clone(&heat),
            index,
            registry,
            placement,
            store,
            sync,
            metrics: CacheMetrics::new(),
            event_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            config,
        });

        // Periodic heat snapshot
        let snapshot_interval = coordinator.config.heat.snapshot_interval;
        let snapshot_heat = heat;
        let snapshot_cancel = coordinator.shutdown_token.clone();
        coordinator.tasks.lock().push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(snapshot_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = snapshot_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = snapshot_heat.snapshot_to(&heat_snapshot_path).await {
                            warn!(error = %e, "heat snapshot failed");
                        }
                    }
                }
            }
        }));

        info!(role = %coordinator.config.role, base = %coordinator.config.base_dir.display(), "cache node ready");
        Ok(coordinator)
    }

    /// Register a remote backend tier
    pub fn register_backend(&self, adapter: BackendRef) -> Result<()> {
        self.registry.register(adapter)
    }

    /// Subscribe to cache events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.metrics.snapshot()
    }

    /// Memory-tier state, for diagnostics
    pub fn memory_snapshot(&self) -> ArcSnapshot {
        self.memory.snapshot()
    }

    pub fn heat(&self) -> &HeatTracker {
        &self.heat
    }

    pub fn index(&self) -> &Arc<MetadataIndex> {
        &self.index
    }

    // =========================================================================
    // get
    // =========================================================================

    /// Fetch the full body for a fingerprint
    pub async fn get(&self, fp: &Fingerprint, ctx: &OpContext) -> Result<Bytes> {
        self.get_with_hints(fp, None, ctx).await
    }

    /// Fetch with caller-supplied tier hints for the cold-miss path
    pub async fn get_with_hints(
        &self,
        fp: &Fingerprint,
        hints: Option<&[String]>,
        ctx: &OpContext,
    ) -> Result<Bytes> {
        ctx.check()?;

        // Memory tier
        if let Some(body) = self.memory.lookup(fp) {
            self.metrics.tier(MEMORY_TIER).record_hit();
            self.heat.record_access(fp, MEMORY_TIER);
            self.emit(CacheEvent::hit(fp, MEMORY_TIER));
            return Ok(body);
        }
        self.metrics.tier(MEMORY_TIER).record_miss();

        // Disk tier
        match ctx.run(self.disk.lookup(fp)).await {
            Ok(Some(body)) => {
                self.metrics.tier(DISK_TIER).record_hit();
                self.heat.record_access(fp, DISK_TIER);
                self.admit_to_memory(fp, &body);
                self.emit(CacheEvent::hit(fp, DISK_TIER));
                return Ok(body);
            }
            Ok(None) => {
                self.metrics.tier(DISK_TIER).record_miss();
            }
            Err(Error::Corruption(reason)) => {
                // Body deleted by the disk cache already; correct the index
                // and keep going to the remote tiers
                warn!(fp = %fp, %reason, "disk body corrupt, refetching from remote tiers");
                self.metrics.tier(DISK_TIER).record_error();
                let _ = self
                    .index
                    .upsert_with(fp, 0, |r| r.mark_absent(DISK_TIER))
                    .await;
            }
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => {
                warn!(fp = %fp, error = %e, "disk lookup failed");
                self.metrics.tier(DISK_TIER).record_error();
            }
        }

        // Remote tiers via the placement engine
        let record = self.index.get(fp).await.ok().flatten();
        let outcome = match ctx
            .run(self.placement.fetch(fp, record.as_ref(), hints, &[]))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, Error::NotFound) {
                    self.emit(CacheEvent::miss(fp));
                }
                return Err(e);
            }
        };

        let body = outcome.body;
        let source = outcome.tier;
        self.metrics.tier(&source).record_hit();
        self.heat.record_access(fp, &source);
        self.emit(CacheEvent::hit(fp, &source));

        // Promote: disk always, memory when small enough
        let evicted = self.disk.admit(fp, &body, &self.heat).await?;
        self.metrics.tier(DISK_TIER).record_promotion();
        self.emit(CacheEvent::promote(fp, &source, DISK_TIER, body.len() as u64));
        for victim in &evicted {
            self.metrics.tier(DISK_TIER).record_eviction(1);
            let _ = self
                .index
                .upsert_with(victim, 0, |r| r.mark_absent(DISK_TIER))
                .await;
            self.emit(CacheEvent::evict(victim, DISK_TIER));
        }
        self.admit_to_memory(fp, &body);

        // Correct the location set: the serving tier is confirmed, failed
        // tiers that claimed presence are not
        let heat_record = self.heat.get(fp);
        let failures = outcome.failures;
        let source_for_index = source;
        let size = body.len() as u64;
        self.index
            .upsert_with(fp, size, move |r| {
                r.size_bytes = size;
                r.mark_present(&source_for_index);
                r.mark_present(DISK_TIER);
                for failure in failures
                    .iter()
                    .filter(|f| matches!(f.kind, ErrorKind::NotFound | ErrorKind::Corruption))
                {
                    r.mark_absent(&failure.tier);
                }
                if let Some(heat_record) = &heat_record {
                    r.refresh_heat(heat_record);
                }
            })
            .await?;

        Ok(body)
    }

    fn admit_to_memory(&self, fp: &Fingerprint, body: &Bytes) {
        if body.len() as u64 <= self.config.cache.max_memory_item_size {
            let evicted = self.memory.admit(fp, body.clone());
            self.metrics.tier(MEMORY_TIER).record_put();
            for victim in evicted {
                self.metrics.tier(MEMORY_TIER).record_eviction(1);
                self.emit(CacheEvent::evict(&victim, MEMORY_TIER));
            }
        }
    }

    // =========================================================================
    // put
    // =========================================================================

    /// Store bytes, returning their fingerprint.
    ///
    /// The durable minimum (content store + disk) is written synchronously;
    /// `Durability::Archival` schedules an additional asynchronous copy.
    pub async fn put(&self, body: Bytes, opts: PutOptions, ctx: &OpContext) -> Result<Fingerprint> {
        ctx.check()?;
        let size = body.len() as u64;

        // Resolve the archival target up front so an impossible request
        // fails before any tier is touched
        let archival_target = match opts.durability {
            Durability::Archival => Some(self.placement.archival_tier().ok_or_else(|| {
                Error::Unsupported("no archival-grade tier is registered".into())
            })?),
            Durability::Standard => None,
        };

        // The content store is the hashing authority
        let fp = ctx.run(self.store.add(body.clone())).await?;

        // From here on the write has a side effect; cancellation records
        // what happened instead of rolling back
        let mut written = vec![CONTENT_STORE_TIER.to_string()];
        let cancelled = ctx.check().err();

        if cancelled.is_none() {
            let evicted = self.disk.admit(&fp, &body, &self.heat).await?;
            written.push(DISK_TIER.to_string());
            self.metrics.tier(DISK_TIER).record_put();
            for victim in evicted {
                self.metrics.tier(DISK_TIER).record_eviction(1);
                let _ = self
                    .index
                    .upsert_with(&victim, 0, |r| r.mark_absent(DISK_TIER))
                    .await;
                self.emit(CacheEvent::evict(&victim, DISK_TIER));
            }

            // Any further durable-minimum tiers in the registry (the content
            // store is already written); first failure short-circuits
            for adapter in self.placement.durable_minimum_tiers() {
                let name = adapter.descriptor().name.clone();
                if name == CONTENT_STORE_TIER {
                    continue;
                }
                ctx.run(adapter.put(&fp, body.clone())).await?;
                self.metrics.tier(&name).record_put();
                written.push(name);
            }
        }

        let written_for_index = written.clone();
        let opts_for_index = opts.clone();
        self.index
            .upsert_with(&fp, size, move |r| {
                r.size_bytes = size;
                for tier in &written_for_index {
                    r.mark_present(tier);
                }
                if opts_for_index.mime_type.is_some() {
                    r.mime_type = opts_for_index.mime_type.clone();
                }
                if opts_for_index.name.is_some() {
                    r.name = opts_for_index.name.clone();
                }
                r.tags.extend(opts_for_index.tags.iter().cloned());
                r.properties.extend(
                    opts_for_index
                        .properties
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
            })
            .await?;

        self.metrics.tier(CONTENT_STORE_TIER).record_put();
        self.emit(CacheEvent::put(&fp, written, size));

        if let Some(cancelled) = cancelled {
            return Err(cancelled);
        }

        // Asynchronous archival copy; the synchronous put has already
        // satisfied the durable minimum
        if let Some(adapter) = archival_target {
            let index = Arc::clone(&self.index);
            let archive_fp = fp.clone();
            tokio::spawn(async move {
                let tier = adapter.descriptor().name.clone();
                match adapter.put(&archive_fp, body).await {
                    Ok(()) => {
                        let _ = index
                            .upsert_with(&archive_fp, size, |r| r.mark_present(&tier))
                            .await;
                        debug!(fp = %archive_fp, tier = %tier, "archival copy written");
                    }
                    Err(e) => {
                        warn!(fp = %archive_fp, tier = %tier, error = %e, "archival copy failed")
                    }
                }
            });
        }

        debug!(fp = %fp, size, "put complete");
        Ok(fp)
    }

    // =========================================================================
    // pin / unpin
    // =========================================================================

    /// Keep content beyond ordinary eviction on the tiers implied by
    /// `scope`. Idempotent.
    pub async fn pin(&self, fp: &Fingerprint, scope: PinScope, ctx: &OpContext) -> Result<()> {
        ctx.check()?;
        match scope {
            PinScope::Local => {
                // Presence first: pinning promises retention
                if !self.disk.contains(fp) {
                    let body = ctx.run(self.fetch_for_pin(fp)).await?;
                    self.disk.admit(fp, &body, &self.heat).await?;
                }
                self.disk.set_pinned(fp, true).await?;
                let in_store = self.store.has(fp).await?;
                if in_store {
                    self.store.pin(fp).await?;
                }
                self.index
                    .upsert_with(fp, 0, move |r| {
                        r.mark_present(DISK_TIER);
                        r.set_pinned(DISK_TIER, true);
                        if in_store {
                            r.set_pinned(CONTENT_STORE_TIER, true);
                        }
                    })
                    .await?;
            }
            PinScope::Cluster | PinScope::Archival => {
                let class = if scope == PinScope::Cluster {
                    TierClass::Cluster
                } else {
                    TierClass::Archival
                };
                let adapter = self
                    .registry
                    .by_class(class)
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        Error::Unsupported(format!("no {} tier is registered", class))
                    })?;
                let tier = adapter.descriptor().name.clone();
                if !ctx.run(adapter.has(fp)).await? {
                    let body = ctx.run(self.fetch_for_pin(fp)).await?;
                    ctx.run(adapter.put(fp, body)).await?;
                }
                self.index
                    .upsert_with(fp, 0, |r| {
                        r.mark_present(&tier);
                        r.set_pinned(&tier, true);
                    })
                    .await?;
            }
        }
        self.emit(CacheEvent::pin_changed(fp, scope.as_str(), true));
        Ok(())
    }

    /// Reverse of [`pin`](Self::pin); idempotent
    pub async fn unpin(&self, fp: &Fingerprint, scope: PinScope, ctx: &OpContext) -> Result<()> {
        ctx.check()?;
        match scope {
            PinScope::Local => {
                if self.disk.contains(fp) {
                    self.disk.set_pinned(fp, false).await?;
                }
                self.store.unpin(fp).await?;
                self.index
                    .upsert_with(fp, 0, |r| {
                        r.set_pinned(DISK_TIER, false);
                        r.set_pinned(CONTENT_STORE_TIER, false);
                    })
                    .await?;
            }
            PinScope::Cluster | PinScope::Archival => {
                let class = if scope == PinScope::Cluster {
                    TierClass::Cluster
                } else {
                    TierClass::Archival
                };
                for adapter in self.registry.by_class(class) {
                    let tier = adapter.descriptor().name.clone();
                    self.index
                        .upsert_with(fp, 0, |r| r.set_pinned(&tier, false))
                        .await?;
                }
            }
        }
        self.emit(CacheEvent::pin_changed(fp, scope.as_str(), false));
        Ok(())
    }

    /// Body for a pin that must materialize a copy: local tiers first,
    /// remote tiers second
    async fn fetch_for_pin(&self, fp: &Fingerprint) -> Result<Bytes> {
        if let Some(body) = self.memory.lookup(fp) {
            return Ok(body);
        }
        if let Some(body) = self.disk.lookup(fp).await? {
            return Ok(body);
        }
        let record = self.index.get(fp).await.ok().flatten();
        let outcome = self.placement.fetch(fp, record.as_ref(), None, &[]).await?;
        Ok(outcome.body)
    }

    // =========================================================================
    // lookup / query
    // =========================================================================

    /// Point query against the index; never fetches bodies
    pub async fn lookup(&self, fp: &Fingerprint, ctx: &OpContext) -> Result<Option<IndexRecord>> {
        ctx.check()?;
        ctx.run(self.index.get(fp)).await
    }

    /// Table query against the index
    pub async fn query(
        &self,
        predicates: &[Predicate],
        columns: Option<&[&str]>,
        limit: Option<usize>,
        ctx: &OpContext,
    ) -> Result<Vec<IndexRecord>> {
        ctx.check()?;
        ctx.run(self.index.query(predicates, columns, limit)).await
    }

    // =========================================================================
    // remove / prefetch
    // =========================================================================

    /// Remove local copies and tombstone the index entry.
    ///
    /// Refuses (`Unsupported`) while the fingerprint is pinned locally;
    /// silent unpinning would break the retention promise a pin made.
    pub async fn remove(&self, fp: &Fingerprint, ctx: &OpContext) -> Result<()> {
        ctx.check()?;
        if self.disk.is_pinned(fp) || self.store.is_pinned(fp).await? {
            return Err(Error::Unsupported(format!(
                "{} is pinned; unpin before removing",
                fp
            )));
        }

        self.memory.remove(fp);
        self.disk.remove(fp).await?;
        self.heat.forget(fp);
        self.index.delete(fp).await?;
        self.emit(CacheEvent::Removed {
            fp: fp.to_canonical_string(),
        });
        Ok(())
    }

    /// Warm the local tiers for anticipated access, a bounded number of
    /// fetches at a time. Individual failures are ignored; returns how many
    /// bodies were loaded. Callers wanting fire-and-forget spawn this.
    pub async fn prefetch(&self, fps: Vec<Fingerprint>, ctx: &OpContext) -> Result<usize> {
        ctx.check()?;
        let requested = fps.len();
        let results = stream::iter(fps.iter().map(|fp| async move {
            self.get(fp, ctx).await.is_ok()
        }))
        .buffer_unordered(4)
        .collect::<Vec<bool>>()
        .await;
        let loaded = results.iter().filter(|ok| **ok).count();
        debug!(loaded, requested, "prefetch complete");
        Ok(loaded)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Flush what should survive and stop background work
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_token.cancel();
        if let Some(sync) = &self.sync {
            sync.shutdown();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.heat
            .snapshot_to(&self.config.heat_dir().join("snapshot.bin"))
            .await?;
        self.index.flush().await?;
        info!("cache node shut down");
        Ok(())
    }
}
