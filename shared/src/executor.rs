//! Drains the action queue against the backend.
//!
//! A pass groups pending operations by [`EntityKind::stage`] and runs the
//! stages in order, so parents created offline are written before anything
//! that points at them. Kinds inside a stage drain concurrently. Inside a kind
//! operations go in creation order: a transient failure ends that kind's pass,
//! while a parked or blocked op only holds back later ops on the same record.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::events::{ListenerId, Subscription, SyncEventBus};
use crate::model::{
    EntityKind, EntityRef, FailureReason, LocalId, OperationError, OperationKind,
    OperationState, QueuedOperation, RemoteId, UnixTimeMs,
};
use crate::network::{Connectivity, NetworkMonitor};
use crate::queue::{ActionQueue, QueueError, QueueStatus};
use crate::remote::{RemoteService, RemoteWrite};
use crate::storage::KeyValueStore;
use crate::{ErrorKind, SyncError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncedEntity {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    pub kind: EntityKind,
}

/// Outcome of one drain pass, published to sync-complete listeners.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: Vec<SyncedEntity>,
    /// Failed with a transient error and stay queued.
    pub retried: usize,
    /// Parked for manual resolution during this pass.
    pub failed: usize,
    /// Held back behind a parent or an earlier op on the same record.
    pub blocked: usize,
    /// Storage misbehaved; the queue may not reflect every outcome.
    pub degraded: bool,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.retried == 0 && self.failed == 0 && self.blocked == 0 && !self.degraded
    }

    pub fn contains(&self, local: &LocalId) -> bool {
        self.synced.iter().any(|s| &s.local_id == local)
    }

    fn absorb(&mut self, other: SyncReport) {
        self.synced.extend(other.synced);
        self.retried += other.retried;
        self.failed += other.failed;
        self.blocked += other.blocked;
        self.degraded |= other.degraded;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submitted {
    /// The backend accepted the write right away.
    Written(RemoteId),
    /// Stored for the next drain; the UI should show it as pending.
    Queued(LocalId),
}

enum Prepared {
    Ready(Box<RemoteWrite>),
    /// A referenced record is still queued and may sync on a later pass.
    Waiting,
    /// A referenced record was parked or discarded before it got a server id.
    Orphaned(LocalId),
}

enum Outcome {
    Synced(SyncedEntity),
    Blocked,
    Retried,
    Failed,
    StorageFailed,
}

struct Inner<S: KeyValueStore, R: RemoteService> {
    queue: ActionQueue<S>,
    remote: R,
    bus: SyncEventBus<SyncReport>,
    /// Held for the whole of a pass.
    pass: Mutex<()>,
    connectivity: StdMutex<Option<watch::Receiver<Connectivity>>>,
    monitor: StdMutex<Option<NetworkMonitor>>,
}

/// The offline sync service. Construct one per signed-in session and share it
/// by cloning; there is no global instance.
pub struct SyncService<S: KeyValueStore, R: RemoteService> {
    inner: Arc<Inner<S, R>>,
}

impl<S: KeyValueStore, R: RemoteService> Clone for SyncService<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, R> SyncService<S, R>
where
    S: KeyValueStore + 'static,
    R: RemoteService + 'static,
{
    pub fn new(store: S, remote: R, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: ActionQueue::new(store, config),
                remote,
                bus: SyncEventBus::new(),
                pass: Mutex::new(()),
                connectivity: StdMutex::new(None),
                monitor: StdMutex::new(None),
            }),
        }
    }

    pub fn queue(&self) -> &ActionQueue<S> {
        &self.inner.queue
    }

    pub fn events(&self) -> &SyncEventBus<SyncReport> {
        &self.inner.bus
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .connectivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|rx| rx.borrow().is_connected())
    }

    /// Starts watching connectivity. Drains right away when the link is already
    /// up and work is waiting, which covers a cold start with a full queue.
    #[instrument(skip(self, connectivity))]
    pub async fn initialize(
        &self,
        connectivity: watch::Receiver<Connectivity>,
    ) -> Option<SyncReport> {
        {
            let mut monitor = self
                .inner
                .monitor
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if monitor.is_some() {
                warn!("sync service already initialized");
                return None;
            }

            let weak = Arc::downgrade(&self.inner);
            *monitor = Some(NetworkMonitor::spawn(
                connectivity.clone(),
                self.inner.queue.config().debounce(),
                move || {
                    if let Some(inner) = weak.upgrade() {
                        let service = SyncService { inner };
                        tokio::spawn(async move {
                            service.drain().await;
                        });
                    }
                },
            ));
        }
        *self
            .inner
            .connectivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(connectivity);

        if self.is_connected() && !self.inner.queue.is_empty().await {
            info!("connected at startup with queued work");
            return Some(self.drain().await);
        }
        None
    }

    /// Stops reacting to connectivity changes. Queued work stays queued.
    pub fn unsubscribe(&self) {
        let monitor = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            monitor.stop();
            debug!("connectivity monitor stopped");
        }
    }

    pub fn on_sync_complete<F>(&self, listener: F) -> Subscription<SyncReport>
    where
        F: Fn(&SyncReport) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(listener)
    }

    pub fn remove_sync_complete_listener(&self, id: ListenerId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    /// Runs one pass over the queue. A call made while a pass is running waits
    /// for it and then runs its own, which finds only what is left.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> SyncReport {
        let report = {
            let _pass = self.inner.pass.lock().await;
            let mut report = SyncReport::default();

            let mut stages: BTreeMap<u8, BTreeMap<EntityKind, Vec<QueuedOperation>>> =
                BTreeMap::new();
            for op in self.inner.queue.dequeue_all().await {
                stages
                    .entry(op.entity_kind.stage())
                    .or_default()
                    .entry(op.entity_kind)
                    .or_default()
                    .push(op);
            }

            for (stage, kinds) in stages {
                debug!(stage, kinds = kinds.len(), "draining stage");
                let passes = kinds
                    .into_iter()
                    .map(|(kind, ops)| self.drain_kind(kind, ops));
                for kind_report in join_all(passes).await {
                    report.absorb(kind_report);
                }
            }

            report.degraded |= self.inner.queue.is_degraded().await;
            report
        };

        info!(
            synced = report.synced.len(),
            retried = report.retried,
            failed = report.failed,
            blocked = report.blocked,
            degraded = report.degraded,
            "drain pass finished"
        );
        self.inner.bus.publish(&report);
        report
    }

    async fn drain_kind(&self, kind: EntityKind, ops: Vec<QueuedOperation>) -> SyncReport {
        let mut report = SyncReport::default();
        // Ops that did not get written this pass; later ops on their records wait.
        let mut held: Vec<QueuedOperation> = Vec::new();
        for op in ops {
            if held.iter().any(|h| h.shares_record_with(&op)) {
                debug!(%kind, op_id = %op.id, "held behind an earlier op on the same record");
                report.blocked += 1;
                continue;
            }
            match self.sync_one(&op).await {
                Outcome::Synced(entity) => report.synced.push(entity),
                Outcome::Blocked => {
                    debug!(%kind, op_id = %op.id, "waiting on unsynced parent");
                    report.blocked += 1;
                    held.push(op);
                }
                Outcome::Failed => {
                    report.failed += 1;
                    held.push(op);
                }
                Outcome::Retried => {
                    report.retried += 1;
                    break;
                }
                Outcome::StorageFailed => {
                    report.degraded = true;
                    break;
                }
            }
        }
        report
    }

    async fn resolve_local(&self, local: &LocalId) -> Result<Option<RemoteId>, QueueError> {
        self.inner.queue.resolve(local).await
    }

    /// Server ids for the records `op` points at.
    async fn prepare(&self, op: &QueuedOperation) -> Result<Prepared, QueueError> {
        let parent = match &op.depends_on {
            Some(local) => match self.resolve_local(local).await? {
                Some(remote) => Some(remote),
                None => return self.unresolved(local).await,
            },
            None => None,
        };
        let target = match &op.target {
            Some(EntityRef::Local(local)) if op.depends_on.as_ref() == Some(local) => {
                parent.clone()
            }
            Some(EntityRef::Local(local)) => match self.resolve_local(local).await? {
                Some(remote) => Some(remote),
                None => return self.unresolved(local).await,
            },
            Some(EntityRef::Remote(remote)) => Some(remote.clone()),
            None => None,
        };

        Ok(Prepared::Ready(Box::new(RemoteWrite {
            operation: op.clone(),
            parent,
            target,
        })))
    }

    async fn unresolved(&self, local: &LocalId) -> Result<Prepared, QueueError> {
        match self.inner.queue.find_by_local(local).await? {
            Some(parent) if !parent.is_failed() => Ok(Prepared::Waiting),
            Some(_) => Ok(Prepared::Orphaned(local.clone())),
            // Synced between the two lookups.
            None if self.resolve_local(local).await?.is_some() => Ok(Prepared::Waiting),
            None => Ok(Prepared::Orphaned(local.clone())),
        }
    }

    #[instrument(skip(self, op), fields(op_id = %op.id, kind = %op.entity_kind, local_id = %op.local_entity_id))]
    async fn sync_one(&self, op: &QueuedOperation) -> Outcome {
        let queue = &self.inner.queue;

        let is_create = op.operation_kind == OperationKind::Create;

        // A previous pass got the server id but could not drop the entry.
        if is_create {
            match self.resolve_local(&op.local_entity_id).await {
                Ok(Some(remote_id)) => {
                    info!(%remote_id, "already applied, removing from queue");
                    return self.finish(op, remote_id).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "id map unreadable");
                    return Outcome::StorageFailed;
                }
            }
        }

        let write = match self.prepare(op).await {
            Ok(Prepared::Ready(write)) => write,
            Ok(Prepared::Waiting) => return Outcome::Blocked,
            Ok(Prepared::Orphaned(parent)) => return self.park_orphan(op, &parent).await,
            Err(e) => {
                error!(error = %e, "could not resolve dependencies");
                return Outcome::StorageFailed;
            }
        };

        match self.inner.remote.apply(&write).await {
            Ok(ack) => {
                if ack.replayed {
                    info!(remote_id = %ack.remote_id, "backend recognised replayed write");
                }
                if is_create {
                    if let Err(e) = queue
                        .record_remote_id(op.local_entity_id.clone(), ack.remote_id.clone())
                        .await
                    {
                        error!(error = %e, "could not record server id, write will be replayed");
                        return Outcome::StorageFailed;
                    }
                }
                self.finish(op, ack.remote_id).await
            }
            Err(e) => {
                let error = OperationError::new(e.kind(), e.to_string(), UnixTimeMs::now());
                let result = if e.is_retryable() {
                    warn!(error = %e, attempt = op.attempt_count + 1, "remote write failed");
                    queue.mark_attempt(op.id, Some(error)).await
                } else {
                    warn!(error = %e, "remote write rejected");
                    queue.mark_failed(op.id, FailureReason::Rejected, error).await
                };
                match result {
                    Ok(updated) if updated.is_failed() => Outcome::Failed,
                    Ok(_) => Outcome::Retried,
                    Err(e) => {
                        error!(error = %e, "could not record failed attempt");
                        Outcome::StorageFailed
                    }
                }
            }
        }
    }

    /// Parks an op whose parent will not sync on its own, so it shows up in `failed()`.
    async fn park_orphan(&self, op: &QueuedOperation, parent: &LocalId) -> Outcome {
        warn!(%parent, "referenced record was parked or discarded, parking dependent");
        let error = OperationError::new(
            ErrorKind::InvalidState,
            format!("{parent} was parked or discarded before it synced"),
            UnixTimeMs::now(),
        );
        match self
            .inner
            .queue
            .mark_failed(op.id, FailureReason::ParentFailed, error)
            .await
        {
            Ok(_) => Outcome::Failed,
            Err(e) => {
                error!(error = %e, "could not park dependent");
                Outcome::StorageFailed
            }
        }
    }

    async fn finish(&self, op: &QueuedOperation, remote_id: RemoteId) -> Outcome {
        match self.inner.queue.remove(op.id).await {
            Ok(_) | Err(QueueError::NotFound(_)) => Outcome::Synced(SyncedEntity {
                local_id: op.local_entity_id.clone(),
                remote_id,
                kind: op.entity_kind,
            }),
            Err(e) => {
                error!(error = %e, "synced operation could not be removed");
                Outcome::StorageFailed
            }
        }
    }

    /// User-initiated write. Online, the backend answers directly and its
    /// errors reach the caller; offline, the write is queued.
    ///
    /// Queued writes to the same record go first: they are drained before the
    /// direct write, and if any is still queued afterwards the new write is
    /// queued behind it.
    #[instrument(skip(self, op), fields(kind = %op.entity_kind, local_id = %op.local_entity_id))]
    pub async fn submit(&self, op: QueuedOperation) -> Result<Submitted, SyncError> {
        if self.is_connected() {
            let mut earlier = self.inner.queue.pending_on_same_record(&op).await?;
            if !earlier.is_empty() {
                debug!(earlier = earlier.len(), "draining earlier writes to the same record");
                self.drain().await;
                earlier = self.inner.queue.pending_on_same_record(&op).await?;
            }

            if earlier.is_empty() {
                match self.prepare(&op).await? {
                    Prepared::Ready(write) => {
                        let ack = self.inner.remote.apply(&write).await?;
                        debug!(remote_id = %ack.remote_id, "written directly");
                        return Ok(Submitted::Written(ack.remote_id));
                    }
                    Prepared::Waiting => debug!("parent still pending, queueing behind it"),
                    Prepared::Orphaned(parent) => {
                        return Err(SyncError::InvalidState(format!(
                            "{parent} was parked or discarded before it synced"
                        )));
                    }
                }
            } else {
                debug!("earlier writes to the same record still queued, queueing behind them");
            }
        }

        let local = op.local_entity_id.clone();
        self.inner.queue.enqueue(op).await?;
        Ok(Submitted::Queued(local))
    }

    /// Returns a parked operation to the queue and drains if the link is up.
    /// Dependents parked because of it come back with it.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: Uuid) -> Result<Option<SyncReport>, SyncError> {
        let op = self.inner.queue.reset(id).await?;
        let parent = op.local_entity_id.as_str();
        for dependent in self.inner.queue.failed().await {
            let orphaned = dependent.state
                == OperationState::Failed {
                    reason: FailureReason::ParentFailed,
                };
            if orphaned && dependent.record_keys().any(|key| key == parent) {
                debug!(op_id = %dependent.id, "returning dependent with its parent");
                self.inner.queue.reset(dependent.id).await?;
            }
        }

        if self.is_connected() {
            return Ok(Some(self.drain().await));
        }
        Ok(None)
    }

    pub async fn discard(&self, id: Uuid) -> Result<QueuedOperation, SyncError> {
        Ok(self.inner.queue.discard(id).await?)
    }

    pub async fn status(&self) -> QueueStatus {
        self.inner.queue.status().await
    }

    pub async fn failed(&self) -> Vec<QueuedOperation> {
        self.inner.queue.failed().await
    }
}
