use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::storage::StorageKey;
use crate::ErrorKind;

/// Prefix carried by every identifier minted on the device before the server has seen the record.
pub const LOCAL_ID_PREFIX: &str = "offline_";

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("local id must start with `offline_`: {0}")]
    MissingPrefix(String),
    #[error("identifier cannot be empty")]
    Empty,
    #[error("identifier exceeds {0} characters")]
    TooLong(usize),
    #[error("identifier contains invalid characters: {0}")]
    InvalidCharacters(String),
}

/// Synthetic `offline_<random>` identifier assigned when a record is created without connectivity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LocalId(String);

impl LocalId {
    const MAX_LENGTH: usize = 128;

    pub fn generate() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4().simple()))
    }

    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into().trim().to_string();
        let Some(suffix) = id.strip_prefix(LOCAL_ID_PREFIX) else {
            return Err(IdError::MissingPrefix(id));
        };
        if suffix.is_empty() {
            return Err(IdError::Empty);
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(IdError::TooLong(Self::MAX_LENGTH));
        }
        if !suffix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(IdError::InvalidCharacters(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LocalId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LocalId> for String {
    fn from(id: LocalId) -> Self {
        id.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier assigned by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteId(String);

impl RemoteId {
    const MAX_LENGTH: usize = 256;

    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(IdError::TooLong(Self::MAX_LENGTH));
        }
        if id.chars().any(char::is_control) {
            return Err(IdError::InvalidCharacters(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RemoteId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RemoteId> for String {
    fn from(id: RemoteId) -> Self {
        id.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a record as seen by the UI: either still local or already known to the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "origin", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Local(LocalId),
    Remote(RemoteId),
}

impl EntityRef {
    /// Classifies a raw id by its prefix.
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        if raw.trim().starts_with(LOCAL_ID_PREFIX) {
            LocalId::new(raw).map(Self::Local)
        } else {
            RemoteId::new(raw).map(Self::Remote)
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn as_local(&self) -> Option<&LocalId> {
        match self {
            Self::Local(id) => Some(id),
            Self::Remote(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Local(id) => id.as_str(),
            Self::Remote(id) => id.as_str(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Hive,
    HiveAction,
    HiveTransaction,
    Profile,
    ImageUpload,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Hive,
        EntityKind::HiveAction,
        EntityKind::HiveTransaction,
        EntityKind::Profile,
        EntityKind::ImageUpload,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hive => "hive",
            Self::HiveAction => "hive_action",
            Self::HiveTransaction => "hive_transaction",
            Self::Profile => "profile",
            Self::ImageUpload => "image_upload",
        }
    }

    /// Backend table the kind is written to.
    pub const fn table(self) -> &'static str {
        match self {
            Self::Hive => "colmeias",
            Self::HiveAction => "acoes",
            Self::HiveTransaction => "transacoes",
            Self::Profile => "profiles",
            Self::ImageUpload => "imagens",
        }
    }

    pub const fn storage_key(self) -> StorageKey {
        match self {
            Self::Hive | Self::HiveAction | Self::HiveTransaction => StorageKey::OfflineQueue,
            Self::Profile => StorageKey::OfflineProfileUpdates,
            Self::ImageUpload => StorageKey::OfflineImageUploads,
        }
    }

    /// Drain stage: kinds in a lower stage may be parents of kinds in a higher one.
    pub const fn stage(self) -> u8 {
        match self {
            Self::Hive | Self::Profile => 0,
            Self::HiveAction | Self::HiveTransaction | Self::ImageUpload => 1,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: UnixTimeMs,
}

impl OperationError {
    const MAX_MESSAGE_LENGTH: usize = 512;

    pub fn new(kind: ErrorKind, message: impl Into<String>, at: UnixTimeMs) -> Self {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        Self { kind, message, at }
    }
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MaxAttemptsExceeded,
    Rejected,
    /// The pending record this op points at was parked or discarded.
    ParentFailed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OperationState {
    #[default]
    Pending,
    /// Terminal until the user retries or discards it.
    Failed { reason: FailureReason },
}

impl OperationState {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: Uuid,
    pub entity_kind: EntityKind,
    pub operation_kind: OperationKind,
    pub payload: Value,
    pub local_entity_id: LocalId,
    /// Record an update or delete applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<EntityRef>,
    /// Pending parent whose create must sync before this op can be written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<LocalId>,
    pub created_at: UnixTimeMs,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<OperationError>,
    #[serde(default)]
    pub state: OperationState,
}

impl QueuedOperation {
    fn new(
        entity_kind: EntityKind,
        operation_kind: OperationKind,
        payload: Value,
        target: Option<EntityRef>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_kind,
            operation_kind,
            payload,
            local_entity_id: LocalId::generate(),
            target,
            depends_on: None,
            created_at: UnixTimeMs::now(),
            attempt_count: 0,
            last_error: None,
            state: OperationState::Pending,
        }
    }

    pub fn create(entity_kind: EntityKind, payload: Value) -> Self {
        Self::new(entity_kind, OperationKind::Create, payload, None)
    }

    pub fn update(entity_kind: EntityKind, target: EntityRef, payload: Value) -> Self {
        let mut op = Self::new(entity_kind, OperationKind::Update, payload, Some(target));
        op.depends_on = op.target.as_ref().and_then(EntityRef::as_local).cloned();
        op
    }

    pub fn delete(entity_kind: EntityKind, target: EntityRef) -> Self {
        let mut op = Self::new(entity_kind, OperationKind::Delete, Value::Null, Some(target));
        op.depends_on = op.target.as_ref().and_then(EntityRef::as_local).cloned();
        op
    }

    #[must_use]
    pub fn depending_on(mut self, parent: LocalId) -> Self {
        self.depends_on = Some(parent);
        self
    }

    #[must_use]
    pub fn created_at(mut self, at: UnixTimeMs) -> Self {
        self.created_at = at;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.state.is_failed()
    }

    /// Ids of the records this op writes to or waits on.
    pub fn record_keys(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.local_entity_id.as_str())
            .chain(self.depends_on.as_ref().map(LocalId::as_str))
            .chain(self.target.as_ref().map(EntityRef::as_str))
    }

    /// Whether the two ops must reach the backend in queue order.
    pub fn shares_record_with(&self, other: &QueuedOperation) -> bool {
        self.record_keys()
            .any(|key| other.record_keys().any(|k| k == key))
    }
}

// ============================================================================
// Drafts submitted by the forms
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiveStatus {
    Active,
    Inactive,
    Sold,
    Lost,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiveDraft {
    pub code: String,
    pub name: Option<String>,
    pub apiary: Option<String>,
    pub hive_type: Option<String>,
    pub status: HiveStatus,
    pub location_note: Option<String>,
}

impl HiveDraft {
    pub fn into_operation(self) -> Result<QueuedOperation, serde_json::Error> {
        Ok(QueuedOperation::create(
            EntityKind::Hive,
            serde_json::to_value(self)?,
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiveActionType {
    Inspection,
    Feeding,
    Harvest,
    Maintenance,
    Transfer,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HiveActionDraft {
    pub hive: EntityRef,
    pub action_type: HiveActionType,
    pub date: String,
    pub notes: Option<String>,
}

impl HiveActionDraft {
    pub fn into_operation(self) -> Result<QueuedOperation, serde_json::Error> {
        let parent = self.hive.as_local().cloned();
        let op = QueuedOperation::create(EntityKind::HiveAction, serde_json::to_value(self)?);
        Ok(match parent {
            Some(parent) => op.depending_on(parent),
            None => op,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiveTransactionType {
    Sale,
    Donation,
    Loss,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HiveTransactionDraft {
    pub hive: EntityRef,
    pub transaction_type: HiveTransactionType,
    pub quantity: u32,
    pub value_cents: Option<i64>,
    pub date: String,
    pub notes: Option<String>,
}

impl HiveTransactionDraft {
    pub fn into_operation(self) -> Result<QueuedOperation, serde_json::Error> {
        let parent = self.hive.as_local().cloned();
        let op = QueuedOperation::create(EntityKind::HiveTransaction, serde_json::to_value(self)?);
        Ok(match parent {
            Some(parent) => op.depending_on(parent),
            None => op,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub phone: Option<String>,
}

impl ProfileUpdate {
    pub fn into_operation(
        self,
        profile: RemoteId,
    ) -> Result<QueuedOperation, serde_json::Error> {
        Ok(QueuedOperation::update(
            EntityKind::Profile,
            EntityRef::Remote(profile),
            serde_json::to_value(self)?,
        ))
    }
}

/// Don't queue image bytes. Queue a handle to the file the shell wrote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUploadDraft {
    pub entity: EntityRef,
    pub local_uri: String,
    pub content_type: String,
}

impl ImageUploadDraft {
    pub fn into_operation(self) -> Result<QueuedOperation, serde_json::Error> {
        let parent = self.entity.as_local().cloned();
        let op = QueuedOperation::create(EntityKind::ImageUpload, serde_json::to_value(self)?);
        Ok(match parent {
            Some(parent) => op.depending_on(parent),
            None => op,
        })
    }
}

// ============================================================================
// View models
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HiveListItem {
    pub id: EntityRef,
    /// Local id the record was created under, echoed back by the backend after sync.
    #[serde(default)]
    pub client_token: Option<LocalId>,
    pub code: String,
    pub name: Option<String>,
    pub status: HiveStatus,
    #[serde(default)]
    pub action_count: u32,
    #[serde(default)]
    pub last_action_date: Option<String>,
    #[serde(default)]
    pub is_pending: bool,
}
