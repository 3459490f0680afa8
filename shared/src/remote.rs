use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{LocalId, QueuedOperation, RemoteId};
use crate::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Transient: the request may not have reached the backend.
    #[error("network error: {0}")]
    Network(String),

    /// The backend refused the write (validation, auth, constraint).
    #[error("rejected by server ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Rejected { .. } => ErrorKind::RemoteRejection,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Classifies an HTTP status the way the queue needs it.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status >= 500 || status == 408 || status == 429 {
            Self::Network(format!("HTTP {status}: {message}"))
        } else {
            Self::Rejected {
                code: format!("HTTP_{status}"),
                message,
            }
        }
    }
}

/// Error half of the backend's `{ data, error }` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

/// The `{ data, error }` shape every backend call answers with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse<T> {
    pub data: Option<T>,
    pub error: Option<ServiceError>,
}

impl<T> RemoteResponse<T> {
    pub fn into_result(self) -> Result<T, RemoteError> {
        match (self.data, self.error) {
            (_, Some(error)) => Err(RemoteError::Rejected {
                code: error.code.unwrap_or_else(|| "UNKNOWN".into()),
                message: error.message,
            }),
            (Some(data), None) => Ok(data),
            (None, None) => Err(RemoteError::Rejected {
                code: "EMPTY_RESPONSE".into(),
                message: "response carried neither data nor error".into(),
            }),
        }
    }
}

/// A queued operation ready to be written, with its dependencies resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteWrite {
    pub operation: QueuedOperation,
    /// Server id of the pending parent the operation depended on.
    pub parent: Option<RemoteId>,
    /// Server id of the record an update/delete targets, when it was created offline.
    pub target: Option<RemoteId>,
}

impl RemoteWrite {
    /// Replays of the same operation carry the same token; creates must upsert on it.
    pub fn idempotency_token(&self) -> &LocalId {
        &self.operation.local_entity_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAck {
    pub remote_id: RemoteId,
    /// The backend already held a record for this token and returned it instead of creating one.
    pub replayed: bool,
}

#[async_trait::async_trait]
pub trait RemoteService: Send + Sync {
    async fn apply(&self, write: &RemoteWrite) -> Result<RemoteAck, RemoteError>;
}

#[async_trait::async_trait]
impl<T: RemoteService + ?Sized> RemoteService for std::sync::Arc<T> {
    async fn apply(&self, write: &RemoteWrite) -> Result<RemoteAck, RemoteError> {
        (**self).apply(write).await
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    //! Backend fake keyed by idempotency token.

    use std::collections::{HashMap, VecDeque};
    use std::sync::{Mutex, PoisonError};

    use serde_json::Value;

    use super::*;
    use crate::model::{EntityKind, EntityRef, OperationKind};

    #[derive(Debug, Clone, PartialEq)]
    pub struct StoredRecord {
        pub id: RemoteId,
        pub kind: EntityKind,
        pub client_token: LocalId,
        pub parent: Option<RemoteId>,
        pub payload: Value,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct WriteLogEntry {
        pub token: LocalId,
        pub kind: EntityKind,
        pub operation: OperationKind,
        pub payload: Value,
    }

    #[derive(Default)]
    struct Inner {
        next_id: u64,
        records: Vec<StoredRecord>,
        by_token: HashMap<LocalId, RemoteId>,
        scripted: VecDeque<RemoteError>,
        fail_all: Option<RemoteError>,
        log: Vec<WriteLogEntry>,
    }

    /// Applies writes in memory, upserting creates on the idempotency token.
    #[derive(Default)]
    pub struct InMemoryRemote {
        inner: Mutex<Inner>,
    }

    impl InMemoryRemote {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Fails the next writes with the given errors, in order.
        pub fn fail_next(&self, errors: impl IntoIterator<Item = RemoteError>) {
            self.lock().scripted.extend(errors);
        }

        /// Fails every write until cleared with `None`.
        pub fn fail_always(&self, error: Option<RemoteError>) {
            self.lock().fail_all = error;
        }

        /// Successful writes in the order they reached the backend, replays included.
        pub fn log(&self) -> Vec<WriteLogEntry> {
            self.lock().log.clone()
        }

        pub fn records(&self) -> Vec<StoredRecord> {
            self.lock().records.clone()
        }

        pub fn records_of(&self, kind: EntityKind) -> Vec<StoredRecord> {
            self.lock()
                .records
                .iter()
                .filter(|r| r.kind == kind)
                .cloned()
                .collect()
        }

        /// Seeds a record created elsewhere, e.g. by a realtime peer.
        pub fn insert(&self, kind: EntityKind, payload: Value, client_token: LocalId) -> RemoteId {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = RemoteId::new(inner.next_id.to_string()).expect("numeric ids are valid");
            inner.by_token.insert(client_token.clone(), id.clone());
            inner.records.push(StoredRecord {
                id: id.clone(),
                kind,
                client_token,
                parent: None,
                payload,
            });
            id
        }
    }

    #[async_trait::async_trait]
    impl RemoteService for InMemoryRemote {
        async fn apply(&self, write: &RemoteWrite) -> Result<RemoteAck, RemoteError> {
            let mut inner = self.lock();
            if let Some(error) = inner.fail_all.clone() {
                return Err(error);
            }
            if let Some(error) = inner.scripted.pop_front() {
                return Err(error);
            }

            let op = &write.operation;
            let token = write.idempotency_token().clone();
            inner.log.push(WriteLogEntry {
                token: token.clone(),
                kind: op.entity_kind,
                operation: op.operation_kind,
                payload: op.payload.clone(),
            });

            if let Some(existing) = inner.by_token.get(&token).cloned() {
                return Ok(RemoteAck {
                    remote_id: existing,
                    replayed: true,
                });
            }

            let target = write.target.clone().or_else(|| match &op.target {
                Some(EntityRef::Remote(id)) => Some(id.clone()),
                _ => None,
            });

            let remote_id = match op.operation_kind {
                OperationKind::Create => {
                    inner.next_id += 1;
                    let id = RemoteId::new(inner.next_id.to_string())
                        .map_err(|e| RemoteError::Network(e.to_string()))?;
                    inner.records.push(StoredRecord {
                        id: id.clone(),
                        kind: op.entity_kind,
                        client_token: token.clone(),
                        parent: write.parent.clone(),
                        payload: op.payload.clone(),
                    });
                    id
                }
                OperationKind::Update => {
                    let target = target.ok_or_else(|| RemoteError::Rejected {
                        code: "MISSING_TARGET".into(),
                        message: "update without target".into(),
                    })?;
                    if let Some(record) = inner.records.iter_mut().find(|r| r.id == target) {
                        if let (Value::Object(existing), Value::Object(patch)) =
                            (&mut record.payload, &op.payload)
                        {
                            for (k, v) in patch {
                                existing.insert(k.clone(), v.clone());
                            }
                        }
                    }
                    target
                }
                OperationKind::Delete => {
                    let target = target.ok_or_else(|| RemoteError::Rejected {
                        code: "MISSING_TARGET".into(),
                        message: "delete without target".into(),
                    })?;
                    inner.records.retain(|r| r.id != target);
                    target
                }
            };

            inner.by_token.insert(token, remote_id.clone());
            Ok(RemoteAck {
                remote_id,
                replayed: false,
            })
        }
    }
}
