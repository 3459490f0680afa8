//! Overlaying optimistic pending items on server data.
//!
//! [`merge`] is evaluated on every read of a list, not only when a sync pass
//! completes: a realtime push can deliver the server copy of a record before
//! the sync-complete event does, and the list must not show it twice.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::model::{
    EntityKind, EntityRef, HiveDraft, HiveListItem, LocalId, OperationKind, QueuedOperation,
};
use crate::ErrorKind;

pub trait Reconcilable: Clone {
    fn entity_ref(&self) -> &EntityRef;

    /// Local id the item was created under. Server records surface it once synced.
    fn origin_local_id(&self) -> Option<&LocalId>;

    /// Business key that identifies the record independently of any id.
    fn natural_key(&self) -> Option<String>;

    /// Whether two items with the same natural key carry the same user-visible data.
    fn same_shape(&self, other: &Self) -> bool;
}

/// Server records first, in their order, followed by the pending items no
/// server record accounts for.
///
/// A pending item is dropped when a server record carries its local id or
/// its natural key. Server records always win.
pub fn merge<T: Reconcilable>(pending: &[T], authoritative: &[T]) -> Vec<T> {
    let synced_locals: HashSet<&LocalId> = authoritative
        .iter()
        .filter_map(Reconcilable::origin_local_id)
        .collect();
    let mut by_key: HashMap<String, &T> = HashMap::with_capacity(authoritative.len());
    for record in authoritative {
        if let Some(key) = record.natural_key() {
            by_key.entry(key).or_insert(record);
        }
    }

    let mut merged = authoritative.to_vec();
    let mut kept: HashSet<&LocalId> = HashSet::new();

    for item in pending {
        if let Some(local) = item.origin_local_id() {
            if synced_locals.contains(local) {
                continue;
            }
        }

        if let Some(key) = item.natural_key() {
            if let Some(record) = by_key.get(&key) {
                if !record.same_shape(item) {
                    warn!(
                        code = ErrorKind::ReconciliationConflict.code(),
                        key = %key,
                        pending = %item.entity_ref(),
                        server = %record.entity_ref(),
                        "pending item differs from server record, keeping server copy"
                    );
                }
                continue;
            }
        }

        if let Some(local) = item.origin_local_id() {
            if !kept.insert(local) {
                continue;
            }
        }
        merged.push(item.clone());
    }

    merged
}

/// Pending items a screen has shown optimistically, in insertion order.
#[derive(Clone, Debug)]
pub struct PendingOverlay<T> {
    items: Vec<T>,
}

impl<T> Default for PendingOverlay<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Reconcilable> PendingOverlay<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an item, replacing an earlier one with the same local id in place.
    pub fn add_pending_item(&mut self, item: T) {
        if let Some(local) = item.origin_local_id() {
            if let Some(existing) = self
                .items
                .iter_mut()
                .find(|i| i.origin_local_id() == Some(local))
            {
                *existing = item;
                return;
            }
        }
        self.items.push(item);
    }

    /// Drops the items whose server copy `authoritative` now carries, matched by
    /// local id. Returns how many were dropped.
    pub fn drop_confirmed(&mut self, authoritative: &[T]) -> usize {
        let confirmed: HashSet<&LocalId> = authoritative
            .iter()
            .filter_map(Reconcilable::origin_local_id)
            .collect();
        let before = self.items.len();
        self.items
            .retain(|i| i.origin_local_id().map_or(true, |l| !confirmed.contains(l)));
        let dropped = before - self.items.len();
        if dropped > 0 {
            debug!(dropped, "pending items confirmed by server");
        }
        dropped
    }

    pub fn remove(&mut self, local: &LocalId) -> Option<T> {
        let index = self
            .items
            .iter()
            .position(|i| i.origin_local_id() == Some(local))?;
        Some(self.items.remove(index))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn merged(&self, authoritative: &[T]) -> Vec<T> {
        merge(&self.items, authoritative)
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Reconcilable for HiveListItem {
    fn entity_ref(&self) -> &EntityRef {
        &self.id
    }

    fn origin_local_id(&self) -> Option<&LocalId> {
        self.client_token.as_ref().or_else(|| self.id.as_local())
    }

    fn natural_key(&self) -> Option<String> {
        let code = self.code.trim();
        (!code.is_empty()).then(|| code.to_lowercase())
    }

    fn same_shape(&self, other: &Self) -> bool {
        self.name == other.name && self.status == other.status
    }
}

impl HiveListItem {
    /// List row for a hive created offline. `None` for anything but a hive create.
    pub fn pending_from(op: &QueuedOperation) -> Option<Self> {
        if op.entity_kind != EntityKind::Hive || op.operation_kind != OperationKind::Create {
            return None;
        }
        let draft: HiveDraft = match serde_json::from_value(op.payload.clone()) {
            Ok(draft) => draft,
            Err(e) => {
                warn!(op_id = %op.id, error = %e, "queued hive payload does not parse");
                return None;
            }
        };

        Some(Self {
            id: EntityRef::Local(op.local_entity_id.clone()),
            client_token: Some(op.local_entity_id.clone()),
            code: draft.code,
            name: draft.name,
            status: draft.status,
            action_count: 0,
            last_action_date: None,
            is_pending: true,
        })
    }
}
