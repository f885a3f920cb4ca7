use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::merge::{apply_edge_change, apply_node_change, MergeOutcome};
use crate::config::StateConfig;
use crate::db::DocumentStore;
use crate::error::{CollabError, CollabResult, StoreError};
use crate::models::{AuthUser, DocumentSnapshot, FlowData, GraphMutation};

type SnapshotHandle = Arc<tokio::sync::Mutex<DocumentSnapshot>>;

struct FlushLoop {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Bookkeeping of the flush protocol. A document selected for a flush moves from
/// `dirty` to `saving` and only goes back to `dirty` once its save attempt failed.
#[derive(Default)]
struct FlushSets {
    dirty: HashSet<String>,
    saving: HashSet<String>,
    evict_after_flush: HashSet<String>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlushReport {
    pub saved: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocStateStats {
    pub snapshots: usize,
    pub dirty: usize,
    pub saving: usize,
}

/// Authoritative in-memory snapshots plus the background persistence loop.
///
/// Mutations on one document serialize on that document's own async mutex;
/// unrelated documents never contend.
pub struct DocStateService {
    store: Arc<dyn DocumentStore>,
    config: StateConfig,
    snapshots: Mutex<HashMap<String, SnapshotHandle>>,
    sets: Mutex<FlushSets>,
    flush_loop: Mutex<Option<FlushLoop>>,
}

impl DocStateService {
    pub fn new(store: Arc<dyn DocumentStore>, config: StateConfig) -> Self {
        Self {
            store,
            config,
            snapshots: Mutex::new(HashMap::new()),
            sets: Mutex::new(FlushSets::default()),
            flush_loop: Mutex::new(None),
        }
    }

    fn snapshots(&self) -> MutexGuard<'_, HashMap<String, SnapshotHandle>> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sets(&self) -> MutexGuard<'_, FlushSets> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn snapshot_handle(&self, document_id: &str) -> CollabResult<SnapshotHandle> {
        // A join or edit means the document is in use again
        self.sets().evict_after_flush.remove(document_id);

        if let Some(handle) = self.snapshots().get(document_id) {
            return Ok(handle.clone());
        }

        let stored = self
            .store
            .load_document(document_id)
            .await?
            .ok_or_else(|| CollabError::DocumentNotFound(document_id.to_string()))?;
        let snapshot = DocumentSnapshot::from_stored(&stored, Utc::now().timestamp_millis())?;
        info!(
            "Loaded snapshot for document {} ({} nodes, {} edges)",
            document_id,
            snapshot.nodes.len(),
            snapshot.edges.len()
        );

        // Another task may have loaded it while we were waiting on the store
        let handle = self
            .snapshots()
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(snapshot)))
            .clone();
        Ok(handle)
    }

    /// Current snapshot, loading it from the store on first use
    pub async fn get_latest_snapshot(&self, document_id: &str) -> CollabResult<DocumentSnapshot> {
        let handle = self.snapshot_handle(document_id).await?;
        let snapshot = handle.lock().await;
        Ok(snapshot.clone())
    }

    /// Nodes, edges and viewport only; the per-entity clocks stay internal
    pub async fn get_flow_data(&self, document_id: &str) -> CollabResult<FlowData> {
        let handle = self.snapshot_handle(document_id).await?;
        let snapshot = handle.lock().await;
        Ok(snapshot.flow_data())
    }

    /// Merge one mutation into the document's snapshot.
    ///
    /// A stale mutation is not an error, it returns `MergeOutcome::Stale` and leaves
    /// the document clean.
    pub async fn apply_event(&self, mutation: &GraphMutation, actor: &AuthUser) -> CollabResult<MergeOutcome> {
        let document_id = mutation.document_id();
        let handle = self.snapshot_handle(document_id).await?;
        let event_ts = mutation
            .header()
            .timestamp
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        let outcome = {
            let mut snapshot = handle.lock().await;
            let outcome = match mutation {
                GraphMutation::Node(e) => apply_node_change(&mut snapshot, e.change_type, &e.node, event_ts),
                GraphMutation::Edge(e) => apply_edge_change(&mut snapshot, e.change_type, &e.edge, event_ts),
            };
            if outcome.is_applied() {
                snapshot.updated_at = Utc::now();
                snapshot.last_editor = Some(actor.clone());
            }
            outcome
        };

        match outcome {
            MergeOutcome::Applied => {
                let mut sets = self.sets();
                sets.dirty.insert(document_id.to_string());
                // Keep the edited snapshot resident even if it was evicted meanwhile
                self.snapshots()
                    .entry(document_id.to_string())
                    .or_insert_with(|| handle.clone());
            }
            MergeOutcome::Stale => {
                debug!(
                    "Discarded stale change to {} in document {} (ts {})",
                    mutation.entity_id(),
                    document_id,
                    event_ts
                );
            }
        }
        Ok(outcome)
    }

    /// Move every dirty document that is not already being saved into the saving set
    pub fn select_for_flush(&self) -> Vec<String> {
        let mut sets = self.sets();
        let selected: Vec<String> = sets
            .dirty
            .iter()
            .filter(|id| !sets.saving.contains(*id))
            .cloned()
            .collect();
        for id in &selected {
            sets.dirty.remove(id);
            sets.saving.insert(id.clone());
        }
        selected
    }

    /// One flush cycle: persist every selected document, re-queue failures
    pub async fn flush_dirty(&self) -> FlushReport {
        let mut report = FlushReport::default();

        for document_id in self.select_for_flush() {
            let handle = self.snapshots().get(&document_id).cloned();
            let Some(handle) = handle else {
                self.sets().saving.remove(&document_id);
                report.skipped.push(document_id);
                continue;
            };

            let (data, actor) = {
                let snapshot = handle.lock().await;
                (snapshot.flow_data(), snapshot.last_editor.clone())
            };

            match self.persist(&document_id, &data, actor).await {
                Ok(()) => {
                    self.finish_saved(&document_id);
                    report.saved.push(document_id);
                }
                Err(e) => {
                    error!("Failed to save document {}: {}. Retrying on next flush", document_id, e);
                    let mut sets = self.sets();
                    sets.saving.remove(&document_id);
                    sets.dirty.insert(document_id.clone());
                    report.failed.push(document_id);
                }
            }
        }

        if !report.saved.is_empty() || !report.failed.is_empty() {
            debug!(
                "Flush cycle: {} saved, {} failed, {} skipped",
                report.saved.len(),
                report.failed.len(),
                report.skipped.len()
            );
        }
        report
    }

    async fn persist(&self, document_id: &str, data: &FlowData, actor: Option<AuthUser>) -> Result<(), StoreError> {
        let actor = actor.ok_or_else(|| {
            StoreError::Unavailable(format!("no editor to attribute the save of {} to", document_id))
        })?;
        let stored = self
            .store
            .load_document(document_id)
            .await?
            .ok_or_else(|| StoreError::Unavailable(format!("document {} no longer exists", document_id)))?;
        let merged = stored.merge_flow_data(data)?;
        self.store.save_document(&merged, &actor).await
    }

    fn finish_saved(&self, document_id: &str) {
        let mut sets = self.sets();
        sets.saving.remove(document_id);
        if sets.evict_after_flush.contains(document_id) && !sets.dirty.contains(document_id) {
            sets.evict_after_flush.remove(document_id);
            self.snapshots().remove(document_id);
            info!("Evicted snapshot for document {} after final save", document_id);
        }
    }

    /// Drop the in-memory snapshot. With unsaved changes the eviction waits for the
    /// next successful save. Returns true when the snapshot was dropped right away.
    pub fn remove_snapshot(&self, document_id: &str) -> bool {
        let mut sets = self.sets();
        if sets.dirty.contains(document_id) || sets.saving.contains(document_id) {
            sets.evict_after_flush.insert(document_id.to_string());
            debug!("Deferring eviction of document {} until it is saved", document_id);
            return false;
        }
        let removed = self.snapshots().remove(document_id).is_some();
        if removed {
            info!("Evicted snapshot for document {}", document_id);
        }
        removed
    }

    pub fn has_snapshot(&self, document_id: &str) -> bool {
        self.snapshots().contains_key(document_id)
    }

    pub fn is_dirty(&self, document_id: &str) -> bool {
        self.sets().dirty.contains(document_id)
    }

    pub fn is_saving(&self, document_id: &str) -> bool {
        self.sets().saving.contains(document_id)
    }

    pub fn stats(&self) -> DocStateStats {
        let snapshots = self.snapshots().len();
        let sets = self.sets();
        DocStateStats {
            snapshots,
            dirty: sets.dirty.len(),
            saving: sets.saving.len(),
        }
    }

    pub fn spawn_flush_loop(self: &Arc<Self>) {
        let service = Arc::downgrade(self);
        let period = self.config.save_interval;
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                // The stop signal is only seen between cycles, never during a save
                tokio::select! {
                    biased;
                    _ = stopped.changed() => return,
                    _ = interval.tick() => {}
                }
                let Some(service) = service.upgrade() else { return };
                service.flush_dirty().await;
            }
        });
        let previous = self
            .flush_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(FlushLoop { stop, task });
        if let Some(previous) = previous {
            let _ = previous.stop.send(true);
        }
        info!("Snapshot flush loop started (every {:?})", period);
    }

    /// Stop the flush timer, waiting for a cycle already in progress to finish.
    /// Callers wanting a last save run `flush_dirty` afterwards.
    pub async fn shutdown(&self) {
        let flush_loop = self.flush_loop.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(FlushLoop { stop, task }) = flush_loop {
            let _ = stop.send(true);
            if let Err(e) = task.await {
                warn!("Flush loop ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryStore;
    use crate::models::{
        EdgeChangeType, EdgeUpdatedEvent, EventHeader, FlowEdge, FlowNode, NodeChangeType, NodeUpdatedEvent,
        StoredDocument,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    const DOC: &str = "11111111-1111-1111-1111-111111111111";

    fn setup() -> (Arc<InMemoryStore>, DocStateService) {
        let store = Arc::new(InMemoryStore::new());
        store.insert(StoredDocument {
            id: DOC.to_string(),
            scope_id: "ws-1".to_string(),
            flow_data: json!({"nodes": [], "edges": [], "viewport": {"x": 0, "y": 0, "zoom": 1}, "apiConfig": {"k": 1}})
                .to_string(),
        });
        let service = DocStateService::new(store.clone(), StateConfig::default());
        (store, service)
    }

    /// Store whose saves take a while, to catch a shutdown mid-save
    struct SlowStore {
        inner: Arc<InMemoryStore>,
        delay: Duration,
    }

    #[async_trait]
    impl DocumentStore for SlowStore {
        async fn load_document(&self, document_id: &str) -> Result<Option<StoredDocument>, StoreError> {
            self.inner.load_document(document_id).await
        }

        async fn save_document(&self, document: &StoredDocument, actor: &AuthUser) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.save_document(document, actor).await
        }
    }

    fn node_event(change: NodeChangeType, id: &str, label: &str, ts: i64) -> GraphMutation {
        GraphMutation::Node(NodeUpdatedEvent {
            header: EventHeader {
                document_id: DOC.to_string(),
                session_id: Some("s1".to_string()),
                timestamp: Some(ts),
            },
            change_type: change,
            node: FlowNode::new(id).with_field("data", json!({ "label": label })),
        })
    }

    fn alice() -> AuthUser {
        AuthUser::new("u1", "Alice").with_workspace("ws-1")
    }

    #[tokio::test]
    async fn missing_document_fails_the_load() {
        let (_store, service) = setup();
        let err = service.get_latest_snapshot("22222222-2222-2222-2222-222222222222").await;
        assert!(matches!(err, Err(CollabError::DocumentNotFound(_))));
    }

    #[tokio::test]
    async fn later_timestamp_wins_regardless_of_arrival() {
        let (_store, service) = setup();
        let far_future = Utc::now().timestamp_millis() + 10_000;
        service
            .apply_event(&node_event(NodeChangeType::Add, "n1", "base", far_future), &alice())
            .await
            .unwrap();

        let b = service
            .apply_event(&node_event(NodeChangeType::Update, "n1", "B", far_future + 1500), &alice())
            .await
            .unwrap();
        let a = service
            .apply_event(&node_event(NodeChangeType::Update, "n1", "A", far_future + 2000), &alice())
            .await
            .unwrap();
        assert_eq!((b, a), (MergeOutcome::Applied, MergeOutcome::Applied));

        let late_b = service
            .apply_event(&node_event(NodeChangeType::Update, "n1", "B-late", far_future + 1500), &alice())
            .await
            .unwrap();
        assert_eq!(late_b, MergeOutcome::Stale);

        let snapshot = service.get_latest_snapshot(DOC).await.unwrap();
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.node("n1").unwrap().extra["data"]["label"], "A");
    }

    #[tokio::test]
    async fn stale_events_leave_the_document_clean() {
        let (_store, service) = setup();
        let ts = Utc::now().timestamp_millis();
        service
            .apply_event(&node_event(NodeChangeType::Add, "n1", "x", ts), &alice())
            .await
            .unwrap();
        service.flush_dirty().await;
        assert!(!service.is_dirty(DOC));

        let outcome = service
            .apply_event(&node_event(NodeChangeType::Update, "n1", "old", ts - 1), &alice())
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Stale);
        assert!(!service.is_dirty(DOC));
    }

    #[tokio::test]
    async fn flush_persists_and_keeps_unrelated_keys() {
        let (store, service) = setup();
        let ts = Utc::now().timestamp_millis();
        service
            .apply_event(&node_event(NodeChangeType::Add, "n1", "x", ts), &alice())
            .await
            .unwrap();
        service
            .apply_event(
                &GraphMutation::Edge(EdgeUpdatedEvent {
                    header: EventHeader::new(DOC, "s1"),
                    change_type: EdgeChangeType::Add,
                    edge: FlowEdge::new("e1"),
                }),
                &alice(),
            )
            .await
            .unwrap();

        let report = service.flush_dirty().await;
        assert_eq!(report.saved, vec![DOC.to_string()]);
        assert!(!service.is_dirty(DOC) && !service.is_saving(DOC));

        let saved: Value = serde_json::from_str(&store.get(DOC).unwrap().flow_data).unwrap();
        assert_eq!(saved["nodes"][0]["id"], "n1");
        assert_eq!(saved["edges"][0]["id"], "e1");
        assert_eq!(saved["apiConfig"]["k"], 1);
        assert_eq!(store.saved_by(DOC).as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn failed_save_is_retried_on_next_cycle() {
        let (store, service) = setup();
        service
            .apply_event(&node_event(NodeChangeType::Add, "n1", "x", Utc::now().timestamp_millis()), &alice())
            .await
            .unwrap();

        store.fail_saves(true);
        let report = service.flush_dirty().await;
        assert_eq!(report.failed, vec![DOC.to_string()]);
        assert!(service.is_dirty(DOC));
        assert!(!service.is_saving(DOC));

        store.fail_saves(false);
        let report = service.flush_dirty().await;
        assert_eq!(report.saved, vec![DOC.to_string()]);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn vanished_document_is_requeued() {
        let (store, service) = setup();
        service
            .apply_event(&node_event(NodeChangeType::Add, "n1", "x", Utc::now().timestamp_millis()), &alice())
            .await
            .unwrap();
        store.delete(DOC);

        let report = service.flush_dirty().await;
        assert_eq!(report.failed, vec![DOC.to_string()]);
        assert!(service.is_dirty(DOC));
    }

    #[tokio::test]
    async fn selection_never_overlaps_an_inflight_save() {
        let (_store, service) = setup();
        let ts = Utc::now().timestamp_millis();
        service
            .apply_event(&node_event(NodeChangeType::Add, "n1", "x", ts), &alice())
            .await
            .unwrap();

        let first = service.select_for_flush();
        assert_eq!(first, vec![DOC.to_string()]);
        assert!(service.is_saving(DOC) && !service.is_dirty(DOC));

        // Edited again while the first save is in flight
        service
            .apply_event(&node_event(NodeChangeType::Position, "n1", "y", ts + 1), &alice())
            .await
            .unwrap();
        assert!(service.select_for_flush().is_empty());
        assert!(service.is_dirty(DOC));
    }

    #[tokio::test]
    async fn eviction_waits_for_pending_save() {
        let (store, service) = setup();
        service
            .apply_event(&node_event(NodeChangeType::Add, "n1", "x", Utc::now().timestamp_millis()), &alice())
            .await
            .unwrap();

        assert!(!service.remove_snapshot(DOC));
        assert!(service.has_snapshot(DOC));

        service.flush_dirty().await;
        assert!(!service.has_snapshot(DOC));
        assert_eq!(store.save_count(), 1);

        // Clean documents go right away
        service.get_latest_snapshot(DOC).await.unwrap();
        assert!(service.remove_snapshot(DOC));
        assert_eq!(service.stats().snapshots, 0);
    }

    #[tokio::test]
    async fn rejoin_cancels_deferred_eviction() {
        let (_store, service) = setup();
        service
            .apply_event(&node_event(NodeChangeType::Add, "n1", "x", Utc::now().timestamp_millis()), &alice())
            .await
            .unwrap();
        service.remove_snapshot(DOC);
        service.get_latest_snapshot(DOC).await.unwrap();

        service.flush_dirty().await;
        assert!(service.has_snapshot(DOC));
    }

    #[tokio::test]
    async fn shutdown_waits_for_an_inflight_save() {
        let (store, _) = setup();
        let slow = Arc::new(SlowStore {
            inner: store.clone(),
            delay: Duration::from_millis(300),
        });
        let service = Arc::new(DocStateService::new(
            slow,
            StateConfig {
                save_interval: Duration::from_millis(50),
            },
        ));
        service.spawn_flush_loop();

        let ts = Utc::now().timestamp_millis();
        service
            .apply_event(&node_event(NodeChangeType::Add, "n1", "x", ts), &alice())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(service.is_saving(DOC));

        // Edited again while the loop's save is still running
        service
            .apply_event(&node_event(NodeChangeType::Position, "n1", "y", ts + 1), &alice())
            .await
            .unwrap();

        service.shutdown().await;
        assert!(!service.is_saving(DOC));
        assert_eq!(store.save_count(), 1);

        let report = service.flush_dirty().await;
        assert_eq!(report.saved, vec![DOC.to_string()]);
        assert_eq!(store.save_count(), 2);
        assert!(!service.is_dirty(DOC));
    }
}
