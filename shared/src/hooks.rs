//! State behind the hive list screen.
//!
//! The hook keeps the last server fetch and a [`PendingOverlay`] of hives
//! created offline; [`HiveListHook::items`] merges the two on every read.
//! Sync completion and realtime pushes both mark the list for a re-fetch. A
//! pending hive leaves the overlay only once a fetch returns its server copy,
//! so it never drops out of the list in between.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::events::{Subscription, SyncEventBus};
use crate::executor::SyncReport;
use crate::model::{EntityKind, EntityRef, HiveListItem, HiveStatus, LocalId, QueuedOperation, RemoteId};
use crate::reconcile::PendingOverlay;
use crate::remote::RemoteError;

#[async_trait::async_trait]
pub trait HiveSource: Send + Sync {
    async fn fetch_hives(&self, owner: &str) -> Result<Vec<HiveListItem>, RemoteError>;
}

#[async_trait::async_trait]
impl<T: HiveSource + ?Sized> HiveSource for Arc<T> {
    async fn fetch_hives(&self, owner: &str) -> Result<Vec<HiveListItem>, RemoteError> {
        (**self).fetch_hives(owner).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    Insert,
    Update,
    Delete,
}

/// A change notification pushed by the backend's realtime channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RealtimeChange {
    pub table: String,
    pub event: ChangeEvent,
    #[serde(default)]
    pub owner: Option<String>,
    /// New row for inserts and updates, old row for deletes.
    #[serde(default)]
    pub record: Option<Value>,
}

/// Reads a backend row into a list item.
pub fn hive_from_row(row: &Value) -> Option<HiveListItem> {
    let id = match row.get("id")? {
        Value::String(s) => RemoteId::new(s.clone()).ok()?,
        Value::Number(n) => RemoteId::new(n.to_string()).ok()?,
        _ => return None,
    };
    let text = |field: &str| row.get(field).and_then(Value::as_str).map(str::to_owned);

    Some(HiveListItem {
        id: EntityRef::Remote(id),
        client_token: text("client_token").and_then(|t| LocalId::new(t).ok()),
        code: text("code")?,
        name: text("name"),
        status: row
            .get("status")
            .and_then(|s| serde_json::from_value::<HiveStatus>(s.clone()).ok())
            .unwrap_or(HiveStatus::Active),
        action_count: row
            .get("action_count")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        last_action_date: text("last_action_date"),
        is_pending: false,
    })
}

#[derive(Default)]
struct ListState {
    overlay: PendingOverlay<HiveListItem>,
    server: Vec<HiveListItem>,
    stale: bool,
}

pub struct HiveListHook<H: HiveSource> {
    source: H,
    owner: String,
    state: Arc<Mutex<ListState>>,
    _sync: Subscription<SyncReport>,
}

fn lock(state: &Mutex<ListState>) -> std::sync::MutexGuard<'_, ListState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<H: HiveSource> HiveListHook<H> {
    pub fn new(source: H, owner: impl Into<String>, events: &SyncEventBus<SyncReport>) -> Self {
        let state = Arc::new(Mutex::new(ListState {
            stale: true,
            ..Default::default()
        }));

        let listener_state = Arc::clone(&state);
        let sync = events.subscribe(move |report: &SyncReport| {
            if !report.synced.is_empty() {
                lock(&listener_state).stale = true;
            }
        });

        Self {
            source,
            owner: owner.into(),
            state,
            _sync: sync,
        }
    }

    /// Shows a hive created offline until the server copy arrives.
    pub fn add_pending_hive(&self, op: &QueuedOperation) -> bool {
        match HiveListItem::pending_from(op) {
            Some(item) => {
                lock(&self.state).overlay.add_pending_item(item);
                true
            }
            None => false,
        }
    }

    pub fn discard_pending(&self, local: &LocalId) -> bool {
        lock(&self.state).overlay.remove(local).is_some()
    }

    /// Re-fetches server data. A failed fetch keeps the previous list.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn refresh(&self) -> Result<(), RemoteError> {
        match self.source.fetch_hives(&self.owner).await {
            Ok(hives) => {
                let mut guard = lock(&self.state);
                let state = &mut *guard;
                let confirmed = state.overlay.drop_confirmed(&hives);
                debug!(
                    count = hives.len(),
                    confirmed,
                    pending = state.overlay.len(),
                    "hives fetched"
                );
                state.server = hives;
                state.stale = false;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "hive fetch failed, keeping previous list");
                Err(e)
            }
        }
    }

    pub async fn refresh_if_needed(&self) -> Result<bool, RemoteError> {
        if !self.needs_refresh() {
            return Ok(false);
        }
        self.refresh().await.map(|()| true)
    }

    /// Applies a pushed row right away, then re-fetches.
    #[instrument(skip(self, change), fields(table = %change.table, event = ?change.event))]
    pub async fn on_realtime_change(&self, change: &RealtimeChange) -> Result<(), RemoteError> {
        if change.table != EntityKind::Hive.table() {
            return Ok(());
        }
        if matches!(&change.owner, Some(owner) if owner != &self.owner) {
            return Ok(());
        }

        if let Some(item) = change.record.as_ref().and_then(hive_from_row) {
            let mut state = lock(&self.state);
            state.server.retain(|h| h.id != item.id);
            if change.event != ChangeEvent::Delete {
                state.server.push(item);
            }
            state.stale = true;
        }

        self.refresh().await
    }

    /// Server hives followed by pending ones the server does not know yet.
    pub fn items(&self) -> Vec<HiveListItem> {
        let state = lock(&self.state);
        state.overlay.merged(&state.server)
    }

    pub fn needs_refresh(&self) -> bool {
        lock(&self.state).stale
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).overlay.len()
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod testing {
    use super::*;
    use crate::remote::testing::InMemoryRemote;

    #[async_trait::async_trait]
    impl HiveSource for InMemoryRemote {
        async fn fetch_hives(&self, _owner: &str) -> Result<Vec<HiveListItem>, RemoteError> {
            Ok(self
                .records_of(EntityKind::Hive)
                .into_iter()
                .filter_map(|record| {
                    let mut row = record.payload.clone();
                    if let Value::Object(map) = &mut row {
                        map.insert("id".into(), Value::String(record.id.to_string()));
                        map.insert(
                            "client_token".into(),
                            Value::String(record.client_token.to_string()),
                        );
                    }
                    hive_from_row(&row)
                })
                .collect())
        }
    }
}
