use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::model::{
    FailureReason, LocalId, OperationError, OperationKind, OperationState, QueuedOperation,
    RemoteId, UnixTimeMs,
};
use crate::storage::{KeyValueStore, StorageKey, StoreError};

const MAX_ID_MAP_ENTRIES: usize = 4_096;

/// An entry that no longer parses, kept in storage until someone reviews it.
#[derive(Debug, Clone, PartialEq)]
pub struct QuarantinedEntry {
    pub key: StorageKey,
    pub raw: Value,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full ({0} entries)")]
    Full(usize),

    #[error("duplicate operation: {0}")]
    DuplicateOpId(Uuid),

    #[error("duplicate local entity id: {0}")]
    DuplicateLocalId(LocalId),

    #[error("operation not found: {0}")]
    NotFound(Uuid),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Snapshot behind the "pending items, sync may be incomplete" indicator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub failed: usize,
    pub oldest_pending_at: Option<UnixTimeMs>,
    /// Stored entries that no longer parse. They stay in storage until cleared.
    pub quarantined: usize,
    /// A storage read or write failed; the queue may be missing writes.
    pub degraded: bool,
}

impl QueueStatus {
    pub fn needs_attention(&self) -> bool {
        self.failed > 0 || self.degraded || self.quarantined > 0
    }
}

struct QueueState {
    completed_local_ids: LruCache<LocalId, UnixTimeMs>,
    quarantined: HashMap<StorageKey, Vec<QuarantinedEntry>>,
    degraded: bool,
}

/// Durable FIFO of writes waiting for connectivity.
///
/// Every mutation is a read-modify-write of a whole collection; the internal
/// lock serialises them so concurrent enqueues from different screens cannot
/// lose each other's writes.
pub struct ActionQueue<S: KeyValueStore> {
    store: S,
    config: SyncConfig,
    state: Mutex<QueueState>,
}

impl<S: KeyValueStore> ActionQueue<S> {
    pub fn new(store: S, config: SyncConfig) -> Self {
        let cache_size = NonZeroUsize::new(config.completed_cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            store,
            config,
            state: Mutex::new(QueueState {
                completed_local_ids: LruCache::new(cache_size),
                quarantined: HashMap::new(),
                degraded: false,
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    async fn load(
        &self,
        state: &mut QueueState,
        key: StorageKey,
    ) -> Result<Vec<QueuedOperation>, StoreError> {
        let Some(raw) = self.store.get(key).await? else {
            state.quarantined.remove(&key);
            return Ok(Vec::new());
        };

        let values: Vec<Value> = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", key.raw())))?;

        let mut ops = Vec::with_capacity(values.len());
        let mut quarantined = Vec::new();
        for value in values {
            match serde_json::from_value::<QueuedOperation>(value.clone()) {
                Ok(op) => ops.push(op),
                Err(e) => {
                    warn!(key = key.raw(), error = %e, "quarantining corrupted queue entry");
                    quarantined.push(QuarantinedEntry {
                        key,
                        raw: value,
                        error: e.to_string(),
                    });
                }
            }
        }
        if quarantined.is_empty() {
            state.quarantined.remove(&key);
        } else {
            state.quarantined.insert(key, quarantined);
        }

        Ok(ops)
    }

    /// Writes `ops` back, followed by the quarantined entries the last read found.
    async fn save(
        &self,
        state: &QueueState,
        key: StorageKey,
        ops: &[QueuedOperation],
    ) -> Result<(), QueueError> {
        let quarantined = state.quarantined.get(&key).map_or(&[][..], Vec::as_slice);
        if ops.is_empty() && quarantined.is_empty() {
            self.store.remove(key).await?;
            return Ok(());
        }

        let mut values = Vec::with_capacity(ops.len() + quarantined.len());
        for op in ops {
            values.push(
                serde_json::to_value(op).map_err(|e| QueueError::Serialization(e.to_string()))?,
            );
        }
        values.extend(quarantined.iter().map(|q| q.raw.clone()));

        let raw =
            serde_json::to_string(&values).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.store.set(key, raw).await?;
        Ok(())
    }

    /// Loads a collection for mutation. A failed read is never followed by a write.
    async fn load_for_write(
        &self,
        state: &mut QueueState,
        key: StorageKey,
    ) -> Result<Vec<QueuedOperation>, QueueError> {
        match self.load(state, key).await {
            Ok(ops) => Ok(ops),
            Err(e) => {
                state.degraded = true;
                error!(key = key.raw(), error = %e, "queue read failed");
                Err(e.into())
            }
        }
    }

    async fn save_tracked(
        &self,
        state: &mut QueueState,
        key: StorageKey,
        ops: &[QueuedOperation],
    ) -> Result<(), QueueError> {
        let result = self.save(state, key, ops).await;
        if let Err(e) = &result {
            state.degraded = true;
            error!(key = key.raw(), error = %e, "queue write failed");
        }
        result
    }

    #[instrument(skip(self, op), fields(op_id = %op.id, kind = %op.entity_kind, local_id = %op.local_entity_id))]
    pub async fn enqueue(&self, op: QueuedOperation) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;

        if state.completed_local_ids.contains(&op.local_entity_id) {
            return Err(QueueError::DuplicateLocalId(op.local_entity_id));
        }

        let target_key = op.entity_kind.storage_key();
        let mut total = 0;
        let mut target = Vec::new();
        for key in StorageKey::QUEUES {
            let ops = self.load_for_write(&mut state, key).await?;
            if let Some(existing) = ops
                .iter()
                .find(|o| o.id == op.id || o.local_entity_id == op.local_entity_id)
            {
                return Err(if existing.id == op.id {
                    QueueError::DuplicateOpId(op.id)
                } else {
                    QueueError::DuplicateLocalId(op.local_entity_id)
                });
            }
            total += ops.len();
            if key == target_key {
                target = ops;
            }
        }

        if total >= self.config.max_entries {
            return Err(QueueError::Full(self.config.max_entries));
        }

        // FIFO by creation time; equal timestamps keep insertion order.
        let position = target
            .iter()
            .rposition(|o| o.created_at <= op.created_at)
            .map_or(0, |i| i + 1);
        target.insert(position, op);

        self.save_tracked(&mut state, target_key, &target).await?;
        info!(queued = total + 1, "operation enqueued");
        Ok(())
    }

    async fn collect(&self, state: &mut QueueState, keys: &[StorageKey]) -> Vec<QueuedOperation> {
        let mut all = Vec::new();
        let mut clean = true;
        for &key in keys {
            match self.load(state, key).await {
                Ok(ops) => all.extend(ops),
                Err(e) => {
                    clean = false;
                    error!(key = key.raw(), error = %e, "queue read failed, assuming empty");
                }
            }
        }
        if clean {
            if keys.len() == StorageKey::QUEUES.len() {
                state.degraded = false;
            }
        } else {
            state.degraded = true;
        }
        all.sort_by_key(|o| o.created_at);
        all
    }

    /// Pending operations across every queue in FIFO order. Nothing is removed.
    pub async fn dequeue_all(&self) -> Vec<QueuedOperation> {
        let mut state = self.state.lock().await;
        self.collect(&mut state, &StorageKey::QUEUES)
            .await
            .into_iter()
            .filter(|o| !o.is_failed())
            .collect()
    }

    pub async fn dequeue_for(&self, key: StorageKey) -> Vec<QueuedOperation> {
        let mut state = self.state.lock().await;
        self.collect(&mut state, &[key])
            .await
            .into_iter()
            .filter(|o| !o.is_failed())
            .collect()
    }

    /// Operations parked for manual resolution.
    pub async fn failed(&self) -> Vec<QueuedOperation> {
        let mut state = self.state.lock().await;
        self.collect(&mut state, &StorageKey::QUEUES)
            .await
            .into_iter()
            .filter(QueuedOperation::is_failed)
            .collect()
    }

    /// The queued op that creates `local`, parked or not. Read failures are errors here.
    pub async fn find_by_local(&self, local: &LocalId) -> Result<Option<QueuedOperation>, QueueError> {
        let mut state = self.state.lock().await;
        for key in StorageKey::QUEUES {
            let ops = self.load_for_write(&mut state, key).await?;
            if let Some(op) = ops.into_iter().find(|o| &o.local_entity_id == local) {
                return Ok(Some(op));
            }
        }
        Ok(None)
    }

    /// Pending ops, oldest first, that write to or wait on a record `op` touches.
    pub async fn pending_on_same_record(
        &self,
        op: &QueuedOperation,
    ) -> Result<Vec<QueuedOperation>, QueueError> {
        let mut state = self.state.lock().await;
        let mut related = Vec::new();
        for key in StorageKey::QUEUES {
            let ops = self.load_for_write(&mut state, key).await?;
            related.extend(
                ops.into_iter()
                    .filter(|o| o.id != op.id && !o.is_failed() && o.shares_record_with(op)),
            );
        }
        related.sort_by_key(|o| o.created_at);
        Ok(related)
    }

    pub async fn get(&self, id: Uuid) -> Option<QueuedOperation> {
        let mut state = self.state.lock().await;
        self.collect(&mut state, &StorageKey::QUEUES)
            .await
            .into_iter()
            .find(|o| o.id == id)
    }

    /// Applies `f` to the operation with `id` and persists its collection.
    async fn modify<F>(&self, id: Uuid, f: F) -> Result<QueuedOperation, QueueError>
    where
        F: FnOnce(&mut QueuedOperation),
    {
        let mut state = self.state.lock().await;
        for key in StorageKey::QUEUES {
            let mut ops = self.load_for_write(&mut state, key).await?;
            if let Some(op) = ops.iter_mut().find(|o| o.id == id) {
                f(op);
                let updated = op.clone();
                self.save_tracked(&mut state, key, &ops).await?;
                return Ok(updated);
            }
        }
        Err(QueueError::NotFound(id))
    }

    async fn take(&self, id: Uuid, completed: bool) -> Result<QueuedOperation, QueueError> {
        let mut state = self.state.lock().await;
        for key in StorageKey::QUEUES {
            let mut ops = self.load_for_write(&mut state, key).await?;
            if let Some(index) = ops.iter().position(|o| o.id == id) {
                let op = ops.remove(index);
                self.save_tracked(&mut state, key, &ops).await?;
                if completed && op.operation_kind == OperationKind::Create {
                    state
                        .completed_local_ids
                        .put(op.local_entity_id.clone(), UnixTimeMs::now());
                }
                return Ok(op);
            }
        }
        Err(QueueError::NotFound(id))
    }

    /// Removes an operation after its remote write was confirmed.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: Uuid) -> Result<QueuedOperation, QueueError> {
        let op = self.take(id, true).await?;
        debug!(local_id = %op.local_entity_id, "operation removed after sync");
        Ok(op)
    }

    /// Drops an operation the user gave up on.
    #[instrument(skip(self))]
    pub async fn discard(&self, id: Uuid) -> Result<QueuedOperation, QueueError> {
        let op = self.take(id, false).await?;
        info!(local_id = %op.local_entity_id, "operation discarded");
        Ok(op)
    }

    /// Records a failed drain attempt; parks the operation once attempts are exhausted.
    #[instrument(skip(self, error))]
    pub async fn mark_attempt(
        &self,
        id: Uuid,
        error: Option<OperationError>,
    ) -> Result<QueuedOperation, QueueError> {
        let max_attempts = self.config.max_attempts;
        let op = self
            .modify(id, |op| {
                op.attempt_count = op.attempt_count.saturating_add(1);
                if error.is_some() {
                    op.last_error = error;
                }
                if op.attempt_count >= max_attempts {
                    op.state = OperationState::Failed {
                        reason: FailureReason::MaxAttemptsExceeded,
                    };
                }
            })
            .await?;

        if op.is_failed() {
            warn!(attempts = op.attempt_count, "operation exhausted its attempts");
        }
        Ok(op)
    }

    /// Parks an operation right away; it is not retried automatically.
    #[instrument(skip(self, error))]
    pub async fn mark_failed(
        &self,
        id: Uuid,
        reason: FailureReason,
        error: OperationError,
    ) -> Result<QueuedOperation, QueueError> {
        self.modify(id, |op| {
            op.attempt_count = op.attempt_count.saturating_add(1);
            op.last_error = Some(error);
            op.state = OperationState::Failed { reason };
        })
        .await
    }

    /// Manual retry: returns a parked operation to the pending state.
    #[instrument(skip(self))]
    pub async fn reset(&self, id: Uuid) -> Result<QueuedOperation, QueueError> {
        self.modify(id, |op| {
            op.attempt_count = 0;
            op.last_error = None;
            op.state = OperationState::Pending;
        })
        .await
    }

    pub async fn status(&self) -> QueueStatus {
        let mut state = self.state.lock().await;
        let all = self.collect(&mut state, &StorageKey::QUEUES).await;

        let mut status = QueueStatus {
            quarantined: state.quarantined.values().map(Vec::len).sum(),
            degraded: state.degraded,
            ..Default::default()
        };
        for op in &all {
            if op.is_failed() {
                status.failed += 1;
            } else {
                status.pending += 1;
                status.oldest_pending_at = Some(
                    status
                        .oldest_pending_at
                        .map_or(op.created_at, |t| t.min(op.created_at)),
                );
            }
        }
        status
    }

    /// Stored entries that no longer parse, for manual review.
    pub async fn quarantined(&self) -> Vec<QuarantinedEntry> {
        let mut state = self.state.lock().await;
        self.collect(&mut state, &StorageKey::QUEUES).await;
        StorageKey::QUEUES
            .iter()
            .filter_map(|key| state.quarantined.get(key))
            .flatten()
            .cloned()
            .collect()
    }

    /// Deletes the quarantined entries once they were reviewed. Returns how many went.
    #[instrument(skip(self))]
    pub async fn clear_quarantined(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let mut cleared = 0;
        for key in StorageKey::QUEUES {
            let ops = self.load_for_write(&mut state, key).await?;
            let Some(entries) = state.quarantined.remove(&key) else {
                continue;
            };
            cleared += entries.len();
            if let Err(e) = self.save_tracked(&mut state, key, &ops).await {
                state.quarantined.insert(key, entries);
                return Err(e);
            }
        }
        if cleared > 0 {
            warn!(cleared, "quarantined queue entries deleted");
        }
        Ok(cleared)
    }

    pub async fn is_empty(&self) -> bool {
        self.dequeue_all().await.is_empty()
    }

    /// Whether the last storage access failed, without touching storage again.
    pub async fn is_degraded(&self) -> bool {
        self.state.lock().await.degraded
    }

    // ------------------------------------------------------------------------
    // Local -> remote id map
    // ------------------------------------------------------------------------

    async fn load_id_map(&self) -> Result<Vec<(LocalId, RemoteId)>, QueueError> {
        match self.store.get(StorageKey::IdMap).await? {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| QueueError::Serialization(e.to_string()))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Persists the server id a record created offline was assigned. Only creates
    /// belong here; dependents resolve their parent through it.
    #[instrument(skip(self))]
    pub async fn record_remote_id(&self, local: LocalId, remote: RemoteId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let mut map = match self.load_id_map().await {
            Ok(map) => map,
            Err(e) => {
                state.degraded = true;
                return Err(e);
            }
        };

        map.retain(|(l, _)| l != &local);
        map.push((local, remote));
        if map.len() > MAX_ID_MAP_ENTRIES {
            let excess = map.len() - MAX_ID_MAP_ENTRIES;
            map.drain(..excess);
        }

        let raw =
            serde_json::to_string(&map).map_err(|e| QueueError::Serialization(e.to_string()))?;
        if let Err(e) = self.store.set(StorageKey::IdMap, raw).await {
            state.degraded = true;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn resolve(&self, local: &LocalId) -> Result<Option<RemoteId>, QueueError> {
        let _state = self.state.lock().await;
        Ok(self
            .load_id_map()
            .await?
            .into_iter()
            .find(|(l, _)| l == local)
            .map(|(_, r)| r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;
    use crate::storage::MemoryStore;
    use crate::ErrorKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn make_now() -> UnixTimeMs {
        UnixTimeMs(1_700_000_000_000)
    }

    fn hive_op(code: &str, at: u64) -> QueuedOperation {
        QueuedOperation::create(EntityKind::Hive, json!({ "code": code }))
            .created_at(UnixTimeMs(at))
    }

    fn network_error() -> OperationError {
        OperationError::new(ErrorKind::Network, "connection reset", make_now())
    }

    // Failure-injectable storage wrapper
    struct FailableStore {
        inner: MemoryStore,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl FailableStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl KeyValueStore for FailableStore {
        async fn get(&self, key: StorageKey) -> Result<Option<String>, StoreError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("Injected read failure".into()));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: StorageKey, value: String) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("Injected write failure".into()));
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: StorageKey) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("Injected write failure".into()));
            }
            self.inner.remove(key).await
        }
    }

    #[tokio::test]
    async fn dequeue_all_is_fifo_by_creation_time() {
        let queue = ActionQueue::new(MemoryStore::new(), SyncConfig::default());
        queue.enqueue(hive_op("b", 20)).await.unwrap();
        queue.enqueue(hive_op("a", 10)).await.unwrap();
        queue.enqueue(hive_op("c", 30)).await.unwrap();

        let codes: Vec<_> = queue
            .dequeue_all()
            .await
            .iter()
            .map(|o| o.payload["code"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(codes, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn dequeue_all_does_not_remove() {
        let queue = ActionQueue::new(MemoryStore::new(), SyncConfig::default());
        queue.enqueue(hive_op("a", 1)).await.unwrap();

        assert_eq!(queue.dequeue_all().await.len(), 1);
        assert_eq!(queue.dequeue_all().await.len(), 1);
    }

    #[tokio::test]
    async fn kinds_land_under_their_storage_keys() {
        let store = Arc::new(MemoryStore::new());
        let queue = ActionQueue::new(store.clone(), SyncConfig::default());
        queue.enqueue(hive_op("a", 1)).await.unwrap();
        queue
            .enqueue(QueuedOperation::create(EntityKind::ImageUpload, json!({})))
            .await
            .unwrap();

        assert!(store.get(StorageKey::OfflineQueue).await.unwrap().is_some());
        assert!(store
            .get(StorageKey::OfflineImageUploads)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get(StorageKey::OfflineProfileUpdates)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            queue.dequeue_for(StorageKey::OfflineImageUploads).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn duplicate_ids_rejected() {
        let queue = ActionQueue::new(MemoryStore::new(), SyncConfig::default());
        let op = hive_op("a", 1);
        queue.enqueue(op.clone()).await.unwrap();

        let result = queue.enqueue(op.clone()).await;
        assert!(matches!(result, Err(QueueError::DuplicateOpId(_))));

        let mut same_local = hive_op("b", 2);
        same_local.local_entity_id = op.local_entity_id.clone();
        let result = queue.enqueue(same_local).await;
        assert!(matches!(result, Err(QueueError::DuplicateLocalId(_))));
    }

    #[tokio::test]
    async fn synced_local_id_is_never_reused() {
        let queue = ActionQueue::new(MemoryStore::new(), SyncConfig::default());
        let op = hive_op("a", 1);
        queue.enqueue(op.clone()).await.unwrap();
        queue.remove(op.id).await.unwrap();

        let mut replay = hive_op("a", 2);
        replay.local_entity_id = op.local_entity_id;
        let result = queue.enqueue(replay).await;
        assert!(matches!(result, Err(QueueError::DuplicateLocalId(_))));
    }

    #[tokio::test]
    async fn full_queue_rejected() {
        let config = SyncConfig {
            max_entries: 2,
            ..Default::default()
        };
        let queue = ActionQueue::new(MemoryStore::new(), config);
        queue.enqueue(hive_op("a", 1)).await.unwrap();
        queue.enqueue(hive_op("b", 2)).await.unwrap();

        let result = queue.enqueue(hive_op("c", 3)).await;
        assert!(matches!(result, Err(QueueError::Full(2))));
    }

    #[tokio::test]
    async fn mark_attempt_parks_after_max_attempts() {
        let config = SyncConfig {
            max_attempts: 2,
            ..Default::default()
        };
        let queue = ActionQueue::new(MemoryStore::new(), config);
        let op = hive_op("a", 1);
        queue.enqueue(op.clone()).await.unwrap();

        let first = queue.mark_attempt(op.id, Some(network_error())).await.unwrap();
        assert_eq!(first.attempt_count, 1);
        assert_eq!(first.state, OperationState::Pending);
        assert_eq!(first.last_error.as_ref().unwrap().kind, ErrorKind::Network);

        let second = queue.mark_attempt(op.id, Some(network_error())).await.unwrap();
        assert_eq!(
            second.state,
            OperationState::Failed {
                reason: FailureReason::MaxAttemptsExceeded
            }
        );

        assert!(queue.dequeue_all().await.is_empty());
        assert_eq!(queue.failed().await.len(), 1);

        let reset = queue.reset(op.id).await.unwrap();
        assert_eq!(reset.attempt_count, 0);
        assert!(reset.last_error.is_none());
        assert_eq!(queue.dequeue_all().await.len(), 1);
    }

    #[tokio::test]
    async fn mark_failed_parks_immediately() {
        let queue = ActionQueue::new(MemoryStore::new(), SyncConfig::default());
        let op = hive_op("a", 1);
        queue.enqueue(op.clone()).await.unwrap();

        let error = OperationError::new(ErrorKind::RemoteRejection, "invalid code", make_now());
        let failed = queue
            .mark_failed(op.id, FailureReason::Rejected, error)
            .await
            .unwrap();
        assert_eq!(
            failed.state,
            OperationState::Failed {
                reason: FailureReason::Rejected
            }
        );

        let status = queue.status().await;
        assert_eq!(status.failed, 1);
        assert_eq!(status.pending, 0);
        assert!(status.needs_attention());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let queue = ActionQueue::new(MemoryStore::new(), SyncConfig::default());
        let id = Uuid::new_v4();
        assert!(matches!(queue.remove(id).await, Err(QueueError::NotFound(_))));
        assert!(matches!(
            queue.mark_attempt(id, None).await,
            Err(QueueError::NotFound(_))
        ));
        assert!(matches!(queue.reset(id).await, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn status_reports_oldest_pending() {
        let queue = ActionQueue::new(MemoryStore::new(), SyncConfig::default());
        queue.enqueue(hive_op("a", 50)).await.unwrap();
        queue
            .enqueue(
                QueuedOperation::create(EntityKind::Profile, json!({})).created_at(UnixTimeMs(40)),
            )
            .await
            .unwrap();

        let status = queue.status().await;
        assert_eq!(status.pending, 2);
        assert_eq!(status.oldest_pending_at, Some(UnixTimeMs(40)));
        assert!(!status.needs_attention());
    }

    #[tokio::test]
    async fn read_failure_degrades_to_empty() {
        let store = Arc::new(FailableStore::new());
        let queue = ActionQueue::new(store.clone(), SyncConfig::default());
        queue.enqueue(hive_op("a", 1)).await.unwrap();

        store.fail_reads.store(true, Ordering::SeqCst);
        assert!(queue.dequeue_all().await.is_empty());
        assert!(matches!(
            queue.enqueue(hive_op("b", 2)).await,
            Err(QueueError::Storage(_))
        ));

        store.fail_reads.store(false, Ordering::SeqCst);
        let status = queue.status().await;
        assert!(!status.degraded, "a clean full read clears the flag");
        assert_eq!(status.pending, 1);
    }

    #[tokio::test]
    async fn write_failure_leaves_queue_unchanged() {
        let store = Arc::new(FailableStore::new());
        let queue = ActionQueue::new(store.clone(), SyncConfig::default());
        let op = hive_op("a", 1);
        queue.enqueue(op.clone()).await.unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        assert!(queue.remove(op.id).await.is_err());
        store.fail_writes.store(false, Ordering::SeqCst);

        assert_eq!(queue.dequeue_all().await.len(), 1);
    }

    #[tokio::test]
    async fn corrupted_entries_are_quarantined() {
        let store = Arc::new(MemoryStore::new());
        let queue = ActionQueue::new(store.clone(), SyncConfig::default());
        let op = hive_op("a", 1);
        let raw = serde_json::to_string(&vec![
            serde_json::to_value(&op).unwrap(),
            json!({ "garbage": true }),
        ])
        .unwrap();
        store.set(StorageKey::OfflineQueue, raw).await.unwrap();

        let pending = queue.dequeue_all().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(queue.status().await.quarantined, 1);
    }

    #[tokio::test]
    async fn quarantined_entries_survive_writes_until_cleared() {
        let store = Arc::new(MemoryStore::new());
        let queue = ActionQueue::new(store.clone(), SyncConfig::default());
        let op = hive_op("a", 1);
        let raw = serde_json::to_string(&vec![
            serde_json::to_value(&op).unwrap(),
            json!({ "garbage": true }),
        ])
        .unwrap();
        store.set(StorageKey::OfflineQueue, raw).await.unwrap();

        // 1. Removing the only good entry keeps the bad one on disk
        queue.remove(op.id).await.unwrap();
        queue.enqueue(hive_op("b", 2)).await.unwrap();

        let status = queue.status().await;
        assert_eq!(status.quarantined, 1);
        assert!(status.needs_attention());
        let stored = store.get(StorageKey::OfflineQueue).await.unwrap().unwrap();
        assert!(stored.contains("garbage"));

        let entries = queue.quarantined().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, StorageKey::OfflineQueue);
        assert_eq!(entries[0].raw, json!({ "garbage": true }));

        // 2. Clearing after review drops only the bad entry
        assert_eq!(queue.clear_quarantined().await.unwrap(), 1);
        assert_eq!(queue.status().await.quarantined, 0);
        assert_eq!(queue.dequeue_all().await.len(), 1);
    }

    #[tokio::test]
    async fn pending_on_same_record_skips_parked_and_unrelated_ops() {
        let queue = ActionQueue::new(MemoryStore::new(), SyncConfig::default());
        let target = crate::model::EntityRef::Remote(RemoteId::new("5").unwrap());
        let first = QueuedOperation::update(EntityKind::Hive, target.clone(), json!({ "name": "x" }))
            .created_at(UnixTimeMs(1));
        let parked = QueuedOperation::update(EntityKind::Hive, target.clone(), json!({ "name": "y" }))
            .created_at(UnixTimeMs(2));
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(parked.clone()).await.unwrap();
        queue.enqueue(hive_op("other", 3)).await.unwrap();
        queue
            .mark_failed(parked.id, FailureReason::Rejected, network_error())
            .await
            .unwrap();

        let next = QueuedOperation::update(EntityKind::Hive, target, json!({ "name": "z" }));
        let related = queue.pending_on_same_record(&next).await.unwrap();

        assert_eq!(related.len(), 1);
        assert_eq!(related[0].id, first.id);
        assert_eq!(
            queue.find_by_local(&parked.local_entity_id).await.unwrap().map(|o| o.id),
            Some(parked.id)
        );
        assert!(queue.find_by_local(&LocalId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_enqueues_are_all_kept() {
        let queue = Arc::new(ActionQueue::new(MemoryStore::new(), SyncConfig::default()));
        let mut handles = Vec::new();
        for i in 0..20 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.enqueue(hive_op(&format!("h{i}"), i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(queue.dequeue_all().await.len(), 20);
    }

    #[tokio::test]
    async fn id_map_roundtrip() {
        let queue = ActionQueue::new(MemoryStore::new(), SyncConfig::default());
        let local = LocalId::generate();
        assert!(queue.resolve(&local).await.unwrap().is_none());

        queue
            .record_remote_id(local.clone(), RemoteId::new("101").unwrap())
            .await
            .unwrap();
        queue
            .record_remote_id(local.clone(), RemoteId::new("102").unwrap())
            .await
            .unwrap();

        assert_eq!(
            queue.resolve(&local).await.unwrap(),
            Some(RemoteId::new("102").unwrap())
        );
    }
}
