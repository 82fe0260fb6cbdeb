//! Index Synchronization
//!
//! Peers converge their metadata indexes by exchanging partitions over
//! three topics: coordinators periodically *announce* their manifest,
//! consumers *request* partitions they are missing, and producers *respond*
//! after pushing the partition body into the content-addressed store. The
//! bus carries only small JSON records; bodies always travel through the
//! store and are validated against the announced content hash before
//! installation.
//!
//! Role behavior: coordinators announce and serve; workers consume, may
//! re-serve, but never announce; edge nodes subscribe to nothing and fetch
//! individual partitions on demand from configured peers.

pub mod bus;
pub mod messages;

pub use bus::{InMemoryBus, Subscription, SubscriptionHandle, TopicBus, TopicBusRef};
pub use messages::{
    AnnouncedPartition, PartitionAnnouncement, PartitionRequest, PartitionResponse,
};

use crate::backend::content_store::{ContentStore, ContentStoreRef};
use crate::cache::events::CacheEvent;
use crate::cache::heat::now_ms;
use crate::config::{NodeRole, SyncConfig};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::index::MetadataIndex;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Sync Handler
// =============================================================================

/// Participant in the partition-exchange protocol
pub struct SyncHandler {
    cfg: SyncConfig,
    role: NodeRole,
    bus: TopicBusRef,
    store: ContentStoreRef,
    /// Weak back-reference: the coordinator owns the index, not the handler
    index: Weak<MetadataIndex>,

    /// Announced partitions we have asked for, by id
    wanted: DashMap<u64, AnnouncedPartition>,
    /// Request start times, for dedupe and give-up
    inflight: DashMap<u64, u64>,
    /// Partition fingerprints that failed validation; never fetched again
    rejected: DashMap<String, u64>,

    events: Option<broadcast::Sender<CacheEvent>>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl SyncHandler {
    pub fn new(
        cfg: SyncConfig,
        role: NodeRole,
        bus: TopicBusRef,
        store: ContentStoreRef,
        index: &Arc<MetadataIndex>,
        events: Option<broadcast::Sender<CacheEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            role,
            bus,
            store,
            index: Arc::downgrade(index),
            wanted: DashMap::new(),
            inflight: DashMap::new(),
            rejected: DashMap::new(),
            events,
            tasks: parking_lot::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    fn topic(&self, kind: &str) -> String {
        format!("/{}/index/{}", self.cfg.cluster_id, kind)
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Spawn the role-appropriate background loops
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let mut tasks = Vec::new();

        if self.role.announces() {
            let handler = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(handler.cfg.announce_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = handler.cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = handler.announce_once().await {
                                warn!(error = %e, "manifest announcement failed");
                            }
                        }
                    }
                }
            }));
        }

        if self.role.maintains_full_index() {
            let sub = self
                .bus
                .subscribe(&self.topic("request"), self.cfg.announce_queue_budget)
                .await?;
            tasks.push(Self::spawn_inbound(&self, sub, |handler, payload| async move {
                match messages::decode::<PartitionRequest>(&payload) {
                    Ok(request) => handler.handle_request(request).await,
                    Err(e) => debug!(error = %e, "undecodable partition request ignored"),
                }
            }));
        }

        if self.role.consumes_announcements() {
            let sub = self
                .bus
                .subscribe(&self.topic("announce"), self.cfg.announce_queue_budget)
                .await?;
            tasks.push(Self::spawn_inbound(&self, sub, |handler, payload| async move {
                match messages::decode::<PartitionAnnouncement>(&payload) {
                    Ok(ann) => handler.handle_announcement(ann).await,
                    Err(e) => debug!(error = %e, "undecodable announcement ignored"),
                }
            }));
        }

        // Every role listens for responses: edges request on demand
        let sub = self
            .bus
            .subscribe(&self.topic("response"), self.cfg.announce_queue_budget)
            .await?;
        tasks.push(Self::spawn_inbound(&self, sub, |handler, payload| async move {
            match messages::decode::<PartitionResponse>(&payload) {
                Ok(response) => handler.handle_response(response).await,
                Err(e) => debug!(error = %e, "undecodable partition response ignored"),
            }
        }));

        self.tasks.lock().extend(tasks);
        info!(role = %self.role, node_id = %self.cfg.node_id, "sync handler started");
        Ok(())
    }

    fn spawn_inbound<F, Fut>(
        this: &Arc<Self>,
        mut sub: Subscription,
        handle: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Arc<Self>, bytes::Bytes) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::clone(this);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = handler.cancel.cancelled() => break,
                    message = sub.receiver.recv() => match message {
                        Some(payload) => handle(Arc::clone(&handler), payload).await,
                        None => break,
                    }
                }
            }
        })
    }

    /// Publish this node's manifest on the announce topic
    pub async fn announce_once(&self) -> Result<()> {
        let index = match self.index.upgrade() {
            Some(index) => index,
            None => return Ok(()), // coordinator shutting down
        };
        let announcement = PartitionAnnouncement {
            node_id: self.cfg.node_id.clone(),
            partitions: index
                .manifest_entries()
                .iter()
                .map(AnnouncedPartition::from)
                .collect(),
        };
        self.bus
            .publish(&self.topic("announce"), messages::encode(&announcement)?)
            .await
    }

    async fn handle_announcement(&self, announcement: PartitionAnnouncement) {
        if announcement.node_id == self.cfg.node_id {
            return; // our own broadcast
        }
        let index = match self.index.upgrade() {
            Some(index) => index,
            None => return,
        };

        for partition in announcement.partitions {
            if index.has_partition(partition.partition_id, &partition.content_hash) {
                continue;
            }
            if let Err(e) = self.request_partition(partition).await {
                warn!(error = %e, "partition request failed");
            }
        }
    }

    /// Ask peers for one partition. Deduplicates by id while a request is
    /// in flight; a stalled request is retried after `fetch_timeout`.
    pub async fn request_partition(&self, partition: AnnouncedPartition) -> Result<()> {
        let now = now_ms();
        let timeout_ms = self.cfg.fetch_timeout.as_millis() as u64;
        if let Some(started) = self.inflight.get(&partition.partition_id) {
            if now.saturating_sub(*started) < timeout_ms {
                return Ok(()); // already being fetched
            }
        }

        self.inflight.insert(partition.partition_id, now);
        let partition_id = partition.partition_id;
        self.wanted.insert(partition_id, partition);

        let request = PartitionRequest {
            requester: self.cfg.node_id.clone(),
            partition_id,
        };
        debug!(partition_id, "requesting partition from peers");
        self.bus
            .publish(&self.topic("request"), messages::encode(&request)?)
            .await
    }

    async fn handle_request(&self, request: PartitionRequest) {
        if request.requester == self.cfg.node_id {
            return;
        }
        let index = match self.index.upgrade() {
            Some(index) => index,
            None => return,
        };

        let bytes = match index.partition_bytes(request.partition_id).await {
            Ok(bytes) => bytes,
            Err(Error::NotFound) => return, // someone else may hold it
            Err(e) => {
                warn!(partition_id = request.partition_id, error = %e, "cannot serve partition");
                return;
            }
        };

        // Push the body into the content store; only the fingerprint rides
        // the bus
        let fp = match self.store.add(bytes).await {
            Ok(fp) => fp,
            Err(e) => {
                warn!(partition_id = request.partition_id, error = %e, "content store rejected partition body");
                return;
            }
        };

        let response = PartitionResponse {
            partition_id: request.partition_id,
            partition_fingerprint: fp.to_canonical_string(),
        };
        debug!(partition_id = request.partition_id, requester = %request.requester, "serving partition");
        if let Ok(payload) = messages::encode(&response) {
            if let Err(e) = self.bus.publish(&self.topic("response"), payload).await {
                warn!(error = %e, "partition response publish failed");
            }
        }
    }

    async fn handle_response(&self, response: PartitionResponse) {
        let announced = match self.wanted.get(&response.partition_id) {
            Some(entry) => entry.value().clone(),
            None => return, // not ours, or already satisfied
        };
        if self.rejected.contains_key(&response.partition_fingerprint) {
            debug!(
                partition_fingerprint = %response.partition_fingerprint,
                "ignoring previously rejected partition body"
            );
            return;
        }
        let index = match self.index.upgrade() {
            Some(index) => index,
            None => return,
        };

        let fp: Fingerprint = match response.partition_fingerprint.parse() {
            Ok(fp) => fp,
            Err(e) => {
                warn!(error = %e, "response carried unparsable fingerprint");
                return;
            }
        };

        let bytes = match tokio::time::timeout(self.cfg.fetch_timeout, self.store.get(&fp)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!(partition_id = response.partition_id, error = %e, "partition fetch failed");
                self.inflight.remove(&response.partition_id);
                return;
            }
            Err(_) => {
                warn!(partition_id = response.partition_id, "partition fetch timed out, giving up");
                self.inflight.remove(&response.partition_id);
                return;
            }
        };

        let entry = announced.to_manifest_entry();
        match index.install_partition(&entry, bytes).await {
            Ok(()) => {
                self.wanted.remove(&response.partition_id);
                self.inflight.remove(&response.partition_id);
                info!(partition_id = response.partition_id, "partition installed from peer");
                self.emit(CacheEvent::PartitionInstalled {
                    partition_id: response.partition_id,
                    peer: response.partition_fingerprint,
                });
            }
            Err(Error::Corruption(reason)) => {
                // Never refetch this body; a future announcement will carry a
                // different fingerprint if the producer fixes it
                warn!(partition_id = response.partition_id, %reason, "partition failed validation, discarded");
                self.rejected
                    .insert(response.partition_fingerprint, now_ms());
                self.inflight.remove(&response.partition_id);
                self.emit(CacheEvent::PartitionRejected {
                    partition_id: response.partition_id,
                    reason,
                });
            }
            Err(e) => {
                warn!(partition_id = response.partition_id, error = %e, "partition install failed");
                self.inflight.remove(&response.partition_id);
            }
        }
    }

    /// Stop all loops; safe to call more than once
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::content_store::{ContentStore, InMemoryContentStore};
    use crate::config::IndexConfig;
    use crate::index::{content_hash, IndexRecord};
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;

    fn sync_config(node_id: &str) -> SyncConfig {
        SyncConfig {
            cluster_id: "test".into(),
            node_id: node_id.into(),
            announce_interval: Duration::from_millis(25),
            fetch_timeout: Duration::from_millis(500),
            announce_queue_budget: 32,
        }
    }

    async fn index_with_partition(dir: &TempDir, label: &str) -> Arc<MetadataIndex> {
        let index = Arc::new(
            MetadataIndex::open(dir.path().join("index"), IndexConfig::default())
                .await
                .unwrap(),
        );
        index
            .upsert(IndexRecord::new(Fingerprint::of(label.as_bytes()), 11))
            .await
            .unwrap();
        index.flush().await.unwrap();
        index
    }

    async fn empty_index(dir: &TempDir) -> Arc<MetadataIndex> {
        Arc::new(
            MetadataIndex::open(dir.path().join("index"), IndexConfig::default())
                .await
                .unwrap(),
        )
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
        let start = tokio::time::Instant::now();
        while !check() {
            if start.elapsed() > deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_coordinator_to_worker_convergence() {
        let bus: TopicBusRef = Arc::new(InMemoryBus::new());
        let store: ContentStoreRef = Arc::new(InMemoryContentStore::new());

        let dir1 = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        let producer = index_with_partition(&dir1, "shared-row").await;
        let consumer = empty_index(&dir2).await;
        let expected = producer.manifest_entries();

        let h1 = SyncHandler::new(
            sync_config("n1"),
            NodeRole::Coordinator,
            Arc::clone(&bus),
            Arc::clone(&store),
            &producer,
            None,
        );
        let h2 = SyncHandler::new(
            sync_config("n2"),
            NodeRole::Worker,
            Arc::clone(&bus),
            Arc::clone(&store),
            &consumer,
            None,
        );
        Arc::clone(&h1).start().await.unwrap();
        Arc::clone(&h2).start().await.unwrap();

        let entry = &expected[0];
        wait_for("worker to install the partition", Duration::from_secs(5), || {
            consumer.has_partition(entry.partition_id, &entry.content_hash)
        })
        .await;

        // Lookup parity across the two nodes
        let fp = Fingerprint::of(b"shared-row");
        let on_producer = producer.get(&fp).await.unwrap().unwrap();
        let on_consumer = consumer.get(&fp).await.unwrap().unwrap();
        assert_eq!(on_producer.updated_at_ms, on_consumer.updated_at_ms);
        assert_eq!(on_producer.size_bytes, on_consumer.size_bytes);

        h1.shutdown();
        h2.shutdown();
    }

    #[tokio::test]
    async fn test_corrupt_partition_rejected_then_valid_accepted() {
        let bus: TopicBusRef = Arc::new(InMemoryBus::new());
        let store: ContentStoreRef = Arc::new(InMemoryContentStore::new());

        let dir1 = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        let producer = index_with_partition(&dir1, "poisoned-row").await;
        let consumer = empty_index(&dir2).await;
        let entry = producer.manifest_entries().pop().unwrap();
        let good_bytes = producer.partition_bytes(entry.partition_id).await.unwrap();

        let handler = SyncHandler::new(
            sync_config("victim"),
            NodeRole::Worker,
            Arc::clone(&bus),
            Arc::clone(&store),
            &consumer,
            None,
        );
        Arc::clone(&handler).start().await.unwrap();

        // A body whose hash does not match the announcement
        let mut tampered = good_bytes.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;
        let bad_fp = store.add(Bytes::from(tampered)).await.unwrap();

        handler
            .request_partition(AnnouncedPartition::from(&entry))
            .await
            .unwrap();
        bus.publish(
            "/test/index/response",
            messages::encode(&PartitionResponse {
                partition_id: entry.partition_id,
                partition_fingerprint: bad_fp.to_canonical_string(),
            })
            .unwrap(),
        )
        .await
        .unwrap();

        wait_for("rejection to be recorded", Duration::from_secs(5), || {
            handler.rejected.contains_key(&bad_fp.to_canonical_string())
        })
        .await;
        assert_eq!(consumer.partition_count(), 0, "manifest must stay untouched");

        // A replayed response with the same rejected fingerprint is ignored
        bus.publish(
            "/test/index/response",
            messages::encode(&PartitionResponse {
                partition_id: entry.partition_id,
                partition_fingerprint: bad_fp.to_canonical_string(),
            })
            .unwrap(),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(consumer.partition_count(), 0);

        // The pristine body under a different fingerprint succeeds
        let good_fp = store.add(good_bytes.clone()).await.unwrap();
        assert_eq!(content_hash(&good_bytes), entry.content_hash);
        bus.publish(
            "/test/index/response",
            messages::encode(&PartitionResponse {
                partition_id: entry.partition_id,
                partition_fingerprint: good_fp.to_canonical_string(),
            })
            .unwrap(),
        )
        .await
        .unwrap();

        wait_for("valid partition to install", Duration::from_secs(5), || {
            consumer.has_partition(entry.partition_id, &entry.content_hash)
        })
        .await;

        handler.shutdown();
    }

    #[tokio::test]
    async fn test_edge_ignores_announcements_but_can_request() {
        let bus: TopicBusRef = Arc::new(InMemoryBus::new());
        let store: ContentStoreRef = Arc::new(InMemoryContentStore::new());

        let dir1 = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        let producer = index_with_partition(&dir1, "edge-row").await;
        let edge_index = empty_index(&dir2).await;
        let entry = producer.manifest_entries().pop().unwrap();

        let coordinator = SyncHandler::new(
            sync_config("hub"),
            NodeRole::Coordinator,
            Arc::clone(&bus),
            Arc::clone(&store),
            &producer,
            None,
        );
        let edge = SyncHandler::new(
            sync_config("leaf"),
            NodeRole::Edge,
            Arc::clone(&bus),
            Arc::clone(&store),
            &edge_index,
            None,
        );
        Arc::clone(&coordinator).start().await.unwrap();
        Arc::clone(&edge).start().await.unwrap();

        // Announcements flow, but the edge never reacts to them
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(edge_index.partition_count(), 0);

        // An explicit request (placement needed a row) does fetch
        edge.request_partition(AnnouncedPartition::from(&entry))
            .await
            .unwrap();
        wait_for("edge to install on demand", Duration::from_secs(5), || {
            edge_index.has_partition(entry.partition_id, &entry.content_hash)
        })
        .await;

        coordinator.shutdown();
        edge.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_requests_are_deduped() {
        let bus: TopicBusRef = Arc::new(InMemoryBus::new());
        let store: ContentStoreRef = Arc::new(InMemoryContentStore::new());
        let dir = TempDir::new().unwrap();
        let index = empty_index(&dir).await;

        let handler = SyncHandler::new(
            sync_config("dedupe"),
            NodeRole::Worker,
            Arc::clone(&bus),
            Arc::clone(&store),
            &index,
            None,
        );

        let mut request_watch = bus.subscribe("/test/index/request", 32).await.unwrap();

        let announced = AnnouncedPartition {
            partition_id: 9,
            content_hash: "aa".repeat(32),
            row_count: 1,
            created_at_ms: 1,
        };
        handler.request_partition(announced.clone()).await.unwrap();
        handler.request_partition(announced).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut seen = 0;
        while request_watch.receiver.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 1, "second request while in flight must be suppressed");
    }
}
