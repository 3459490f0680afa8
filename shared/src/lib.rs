//! Offline write queue and reconciliation core for the apiary app.
//!
//! Writes made while offline land in a durable [`queue::ActionQueue`]. A
//! [`executor::SyncService`] drains it against a [`remote::RemoteService`]
//! when [`network::NetworkMonitor`] reports a stable reconnect, and screens
//! overlay pending items on server data through [`reconcile`].

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod events;
pub mod executor;
pub mod hooks;
pub mod model;
pub mod network;
pub mod queue;
pub mod reconcile;
pub mod remote;
#[cfg(feature = "rest")]
pub mod rest;
pub mod storage;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use config::{ConfigError, SyncConfig};
pub use events::{ListenerId, Subscription, SyncEventBus};
pub use executor::{Submitted, SyncReport, SyncService, SyncedEntity};
pub use hooks::{HiveListHook, HiveSource, RealtimeChange};
pub use model::{EntityKind, EntityRef, LocalId, OperationKind, QueuedOperation, RemoteId};
pub use network::{Connectivity, ConnectivityHandle, NetworkMonitor};
pub use queue::{ActionQueue, QuarantinedEntry, QueueError, QueueStatus};
pub use reconcile::{merge, PendingOverlay, Reconcilable};
pub use remote::{RemoteAck, RemoteError, RemoteService, RemoteWrite};
pub use storage::{KeyValueStore, MemoryStore, StorageKey, StoreError};

pub const MAX_SYNC_ATTEMPTS: u32 = 5;
pub const MAX_QUEUE_ENTRIES: usize = 10_000;
pub const DEFAULT_DEBOUNCE_MS: u64 = 750;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Retrying later may succeed.
    Transient,
    /// Needs the user: edit, retry by hand, or discard.
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Storage,
    Network,
    RemoteRejection,
    ReconciliationConflict,
    Validation,
    InvalidState,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Storage => "STORAGE_ERROR",
            Self::Network => "NETWORK_ERROR",
            Self::RemoteRejection => "REMOTE_REJECTION",
            Self::ReconciliationConflict => "RECONCILIATION_CONFLICT",
            Self::Validation => "VALIDATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Storage | Self::Network | Self::ReconciliationConflict => {
                ErrorSeverity::Transient
            }
            Self::RemoteRejection | Self::Validation | Self::InvalidState => {
                ErrorSeverity::Permanent
            }
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self.default_severity(), ErrorSeverity::Transient)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("{0}")]
    InvalidState(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Queue(QueueError::Storage(_)) | Self::Storage(_) => ErrorKind::Storage,
            Self::Queue(QueueError::Serialization(_)) | Self::Payload(_) | Self::Config(_) => {
                ErrorKind::Validation
            }
            Self::Queue(_) | Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Remote(e) => e.kind(),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.kind().default_severity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_unique() {
        let kinds = [
            ErrorKind::Storage,
            ErrorKind::Network,
            ErrorKind::RemoteRejection,
            ErrorKind::ReconciliationConflict,
            ErrorKind::Validation,
            ErrorKind::InvalidState,
        ];
        let mut codes: Vec<_> = kinds.iter().map(|k| k.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn sync_error_classification() {
        let network = SyncError::from(RemoteError::Network("reset".into()));
        assert_eq!(network.kind(), ErrorKind::Network);
        assert_eq!(network.severity(), ErrorSeverity::Transient);

        let rejected = SyncError::from(RemoteError::Rejected {
            code: "23505".into(),
            message: "duplicate".into(),
        });
        assert_eq!(rejected.kind(), ErrorKind::RemoteRejection);
        assert!(!rejected.kind().is_retryable());

        let storage = SyncError::from(QueueError::Storage(StoreError::Backend("disk".into())));
        assert_eq!(storage.kind(), ErrorKind::Storage);

        let full = SyncError::from(QueueError::Full(10));
        assert_eq!(full.kind(), ErrorKind::InvalidState);
    }
}
