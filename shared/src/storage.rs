//! Local durable storage.
//!
//! The queue only needs string-keyed get/set/remove of serialized collections, so
//! every backend implements [`KeyValueStore`]. Three backends ship with the crate:
//!
//! - [`MemoryStore`] for tests and for shells that persist elsewhere,
//! - [`FileStore`], one checksummed envelope file per key, written atomically,
//! - `SqliteStore` (feature `sqlite`), a single `kv` table.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_VALUE_BYTES: usize = 32 * 1024 * 1024;
const STORE_MAGIC: &[u8; 4] = b"APQS";

/// Keys the sync core persists under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKey {
    OfflineQueue,
    OfflineProfileUpdates,
    OfflineImageUploads,
    IdMap,
}

impl StorageKey {
    /// Keys holding queued operations, in drain order.
    pub const QUEUES: [StorageKey; 3] = [
        StorageKey::OfflineQueue,
        StorageKey::OfflineProfileUpdates,
        StorageKey::OfflineImageUploads,
    ];

    pub const fn raw(self) -> &'static str {
        match self {
            Self::OfflineQueue => "offline_queue",
            Self::OfflineProfileUpdates => "offline_profile_updates",
            Self::OfflineImageUploads => "offline_image_uploads",
            Self::IdMap => "offline_id_map",
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted store entry {key}: {reason}")]
    Corrupted { key: &'static str, reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("value too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: StorageKey) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: StorageKey, value: String) -> Result<(), StoreError>;
    async fn remove(&self, key: StorageKey) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    async fn get(&self, key: StorageKey) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: StorageKey, value: String) -> Result<(), StoreError> {
        (**self).set(key, value).await
    }

    async fn remove(&self, key: StorageKey) -> Result<(), StoreError> {
        (**self).remove(key).await
    }
}

fn check_size(value: &str) -> Result<(), StoreError> {
    if value.len() > MAX_VALUE_BYTES {
        return Err(StoreError::TooLarge {
            size: value.len(),
            max: MAX_VALUE_BYTES,
        });
    }
    Ok(())
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<StorageKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: StorageKey) -> Result<Option<String>, StoreError> {
        Ok(self.values.read().await.get(&key).cloned())
    }

    async fn set(&self, key: StorageKey, value: String) -> Result<(), StoreError> {
        check_size(&value)?;
        self.values.write().await.insert(key, value);
        Ok(())
    }

    async fn remove(&self, key: StorageKey) -> Result<(), StoreError> {
        self.values.write().await.remove(&key);
        Ok(())
    }
}

// ============================================================================
// File-backed
// ============================================================================

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: String,
}

/// One envelope file per key under a directory the shell owns.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: StorageKey) -> PathBuf {
        self.dir.join(format!("{}.bin", key.raw()))
    }

    fn encode(value: &str) -> Result<Vec<u8>, StoreError> {
        let checksum = blake3::hash(value.as_bytes());
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *checksum.as_bytes(),
            payload: value.to_owned(),
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes)?;
        Ok(bytes)
    }

    fn decode(key: StorageKey, bytes: &[u8]) -> Result<String, StoreError> {
        if bytes.is_empty() {
            return Err(StoreError::Corrupted {
                key: key.raw(),
                reason: "empty file",
            });
        }
        if bytes.len() > MAX_VALUE_BYTES * 2 {
            return Err(StoreError::TooLarge {
                size: bytes.len(),
                max: MAX_VALUE_BYTES * 2,
            });
        }

        let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

        if envelope.magic != *STORE_MAGIC {
            return Err(StoreError::Corrupted {
                key: key.raw(),
                reason: "invalid magic bytes",
            });
        }

        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }

        let actual = blake3::hash(envelope.payload.as_bytes());
        if actual.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual.as_bytes()),
            });
        }

        Ok(envelope.payload)
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp_path = path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: StorageKey) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::decode(key, &bytes).map(Some)
    }

    async fn set(&self, key: StorageKey, value: String) -> Result<(), StoreError> {
        check_size(&value)?;
        let bytes = Self::encode(&value)?;
        Self::write_atomic(&self.path_for(key), &bytes)?;
        debug!(key = key.raw(), bytes = bytes.len(), "store entry written");
        Ok(())
    }

    async fn remove(&self, key: StorageKey) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(key = key.raw(), error = %e, "failed to remove store entry");
                Err(e.into())
            }
        }
    }
}

// ============================================================================
// SQLite
// ============================================================================

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteStore;

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite {
    use std::path::Path;
    use std::sync::{Mutex, PoisonError};

    use rusqlite::{params, Connection, OptionalExtension};

    use super::{check_size, KeyValueStore, StorageKey, StoreError};

    pub struct SqliteStore {
        conn: Mutex<Connection>,
    }

    impl SqliteStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
            Self::init(Connection::open(path)?)
        }

        pub fn open_in_memory() -> Result<Self, StoreError> {
            Self::init(Connection::open_in_memory()?)
        }

        fn init(conn: Connection) -> Result<Self, StoreError> {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }
    }

    #[async_trait::async_trait]
    impl KeyValueStore for SqliteStore {
        async fn get(&self, key: StorageKey) -> Result<Option<String>, StoreError> {
            let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            let value = conn
                .query_row(
                    "SELECT value FROM kv WHERE key = ?1",
                    params![key.raw()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        }

        async fn set(&self, key: StorageKey, value: String) -> Result<(), StoreError> {
            check_size(&value)?;
            let now = crate::model::UnixTimeMs::now().0 as i64;
            let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            conn.execute(
                r#"
                INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![key.raw(), value, now],
            )?;
            Ok(())
        }

        async fn remove(&self, key: StorageKey) -> Result<(), StoreError> {
            let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key.raw()])?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get(StorageKey::OfflineQueue).await.unwrap().is_none());

        store
            .set(StorageKey::OfflineQueue, "[1,2]".into())
            .await
            .unwrap();
        assert_eq!(
            store.get(StorageKey::OfflineQueue).await.unwrap().as_deref(),
            Some("[1,2]")
        );
        assert!(store.get(StorageKey::IdMap).await.unwrap().is_none());

        store.remove(StorageKey::OfflineQueue).await.unwrap();
        assert!(store.get(StorageKey::OfflineQueue).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::new(dir.path()).unwrap();
            store
                .set(StorageKey::OfflineProfileUpdates, "{\"a\":1}".into())
                .await
                .unwrap();
        }

        let reopened = FileStore::new(dir.path()).unwrap();
        assert_eq!(
            reopened
                .get(StorageKey::OfflineProfileUpdates)
                .await
                .unwrap()
                .as_deref(),
            Some("{\"a\":1}")
        );
    }

    #[tokio::test]
    async fn file_store_leaves_no_tmp_on_success() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store
            .set(StorageKey::OfflineQueue, "[]".into())
            .await
            .unwrap();

        let path = store.path_for(StorageKey::OfflineQueue);
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn file_store_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        assert!(store.get(StorageKey::IdMap).await.unwrap().is_none());
        store.remove(StorageKey::IdMap).await.unwrap();
    }

    #[tokio::test]
    async fn file_store_detects_empty_file() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        std::fs::write(store.path_for(StorageKey::OfflineQueue), b"").unwrap();

        let result = store.get(StorageKey::OfflineQueue).await;
        assert!(matches!(result, Err(StoreError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn file_store_detects_tampered_payload() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *blake3::hash(b"[]").as_bytes(),
            payload: "[1]".into(),
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();
        std::fs::write(store.path_for(StorageKey::OfflineQueue), bytes).unwrap();

        let result = store.get(StorageKey::OfflineQueue).await;
        assert!(matches!(result, Err(StoreError::IntegrityCheckFailed { .. })));
    }

    #[tokio::test]
    async fn file_store_rejects_future_schema() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION + 1,
            checksum: *blake3::hash(b"[]").as_bytes(),
            payload: "[]".into(),
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();
        std::fs::write(store.path_for(StorageKey::OfflineQueue), bytes).unwrap();

        let result = store.get(StorageKey::OfflineQueue).await;
        assert!(matches!(result, Err(StoreError::FutureSchema { .. })));
    }

    #[tokio::test]
    async fn oversized_value_rejected() {
        let store = MemoryStore::new();
        let value = "x".repeat(MAX_VALUE_BYTES + 1);
        let result = store.set(StorageKey::OfflineQueue, value).await;
        assert!(matches!(result, Err(StoreError::TooLarge { .. })));
    }

    #[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
    #[tokio::test]
    async fn sqlite_store_roundtrip_and_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .set(StorageKey::OfflineImageUploads, "first".into())
                .await
                .unwrap();
            store
                .set(StorageKey::OfflineImageUploads, "second".into())
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store
                .get(StorageKey::OfflineImageUploads)
                .await
                .unwrap()
                .as_deref(),
            Some("second")
        );
        store.remove(StorageKey::OfflineImageUploads).await.unwrap();
        assert!(store
            .get(StorageKey::OfflineImageUploads)
            .await
            .unwrap()
            .is_none());
    }
}
