//! File-backed [`KvStore`]: one file per key, each wrapped in a checksummed CBOR envelope
//! and replaced atomically (write to a temp file, fsync, rename).

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::capabilities::{
    check_value_size, KvError, KvKey, KvStore, KvValue, StorageErrorCode, ABSENT_VERSION,
};
use crate::model::UnixTimeMs;

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 100 * 1024 * 1024;
const STORE_MAGIC: &[u8; 4] = b"EXKV";
const FILE_EXTENSION: &str = "kv";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("lock acquisition failed")]
    LockFailed,
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

impl From<StoreError> for KvError {
    fn from(e: StoreError) -> Self {
        let code = match &e {
            StoreError::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                StorageErrorCode::PermissionDenied
            }
            StoreError::Io(_) => StorageErrorCode::IoError,
            StoreError::LockFailed => StorageErrorCode::Locked,
            StoreError::Serialization(_)
            | StoreError::Corrupted { .. }
            | StoreError::IntegrityCheckFailed { .. }
            | StoreError::FutureSchema { .. }
            | StoreError::UnknownSchema(_)
            | StoreError::StoreTooLarge { .. } => StorageErrorCode::Corrupted,
        };
        KvError::storage(code, e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    version: u64,
    updated_at: u64,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

impl StoreEnvelope {
    fn seal(version: u64, updated_at: UnixTimeMs, payload: Vec<u8>) -> Self {
        Self {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            version,
            updated_at: updated_at.as_millis(),
            checksum: *blake3::hash(&payload).as_bytes(),
            payload,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)?;
        Ok(bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.is_empty() {
            return Err(StoreError::Corrupted {
                reason: "empty file",
            });
        }
        if bytes.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }

        let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

        if envelope.magic != *STORE_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "invalid magic bytes",
            });
        }
        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }
        if envelope.schema_version == 0 {
            return Err(StoreError::UnknownSchema(envelope.schema_version));
        }

        let actual = blake3::hash(&envelope.payload);
        if actual.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual.as_bytes()),
            });
        }

        Ok(envelope)
    }
}

/// Durable store rooted at a directory. Survives process restarts.
#[derive(Debug)]
pub struct FileKvStore {
    root: PathBuf,
    // Serialises read-compare-write so two writers in this process cannot both win a CAS.
    write_lock: Mutex<()>,
}

impl FileKvStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &KvKey) -> PathBuf {
        self.root
            .join(format!("{}.{}", hex::encode(key.raw()), FILE_EXTENSION))
    }

    fn read_envelope(path: &Path) -> Result<Option<StoreEnvelope>, StoreError> {
        match std::fs::read(path) {
            Ok(bytes) => StoreEnvelope::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
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
impl KvStore for FileKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<KvValue>, KvError> {
        let path = self.path_for(key);
        match Self::read_envelope(&path)? {
            Some(envelope) => Ok(Some(KvValue::new(
                envelope.payload,
                envelope.version,
                UnixTimeMs(envelope.updated_at),
            )?)),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &KvKey,
        expected_version: u64,
        data: Vec<u8>,
        now: UnixTimeMs,
    ) -> Result<u64, KvError> {
        check_value_size(&data)?;
        let _guard = self.write_lock.lock().map_err(|_| StoreError::LockFailed)?;

        let path = self.path_for(key);
        let found = match Self::read_envelope(&path) {
            Ok(existing) => existing.map_or(ABSENT_VERSION, |e| e.version),
            Err(e) => {
                warn!(key = %key.raw(), error = %e, "refusing to overwrite unreadable entry");
                return Err(e.into());
            }
        };
        if found != expected_version {
            return Err(KvError::VersionMismatch {
                expected: expected_version,
                found,
            });
        }

        let version = found.saturating_add(1);
        let bytes = StoreEnvelope::seal(version, now, data).to_bytes()?;
        Self::write_atomic(&path, &bytes)?;
        Ok(version)
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::LockFailed)?;
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::from(e).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::KeyNamespace;
    use tempfile::tempdir;

    fn queue_key() -> KvKey {
        KvKey::new(KeyNamespace::Outbox, "offline_api_queue").unwrap()
    }

    #[tokio::test]
    async fn value_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileKvStore::open(dir.path()).unwrap();
            let v = store
                .compare_and_swap(&queue_key(), ABSENT_VERSION, b"[1,2]".to_vec(), UnixTimeMs(7))
                .await
                .unwrap();
            assert_eq!(v, 1);
        }

        let reopened = FileKvStore::open(dir.path()).unwrap();
        let value = reopened.get(&queue_key()).await.unwrap().unwrap();
        assert_eq!(value.data(), b"[1,2]");
        assert_eq!(value.version(), 1);
        assert_eq!(value.updated_at(), UnixTimeMs(7));
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store
            .compare_and_swap(&queue_key(), ABSENT_VERSION, b"a".to_vec(), UnixTimeMs(1))
            .await
            .unwrap();

        let err = store
            .compare_and_swap(&queue_key(), ABSENT_VERSION, b"b".to_vec(), UnixTimeMs(2))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            KvError::VersionMismatch {
                expected: 0,
                found: 1
            }
        );
        let value = store.get(&queue_key()).await.unwrap().unwrap();
        assert_eq!(value.data(), b"a");
    }

    #[tokio::test]
    async fn tampered_payload_fails_integrity_check() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store
            .compare_and_swap(&queue_key(), ABSENT_VERSION, b"payload".to_vec(), UnixTimeMs(1))
            .await
            .unwrap();

        let path = store.path_for(&queue_key());
        let mut envelope = StoreEnvelope::from_bytes(&std::fs::read(&path).unwrap()).unwrap();
        envelope.payload = b"tampered".to_vec();
        std::fs::write(&path, envelope.to_bytes().unwrap()).unwrap();

        let err = store.get(&queue_key()).await.unwrap_err();
        assert!(matches!(
            err,
            KvError::Storage {
                code: StorageErrorCode::Corrupted,
                ..
            }
        ));
    }

    #[test]
    fn future_schema_is_rejected() {
        let mut envelope = StoreEnvelope::seal(1, UnixTimeMs(1), vec![1]);
        envelope.schema_version = CURRENT_SCHEMA_VERSION + 1;
        let bytes = envelope.to_bytes().unwrap();
        assert!(matches!(
            StoreEnvelope::from_bytes(&bytes),
            Err(StoreError::FutureSchema { .. })
        ));
    }

    #[test]
    fn empty_file_is_corrupted() {
        assert!(matches!(
            StoreEnvelope::from_bytes(&[]),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        assert!(!store.delete(&queue_key()).await.unwrap());
        store
            .compare_and_swap(&queue_key(), ABSENT_VERSION, b"x".to_vec(), UnixTimeMs(1))
            .await
            .unwrap();
        assert!(store.delete(&queue_key()).await.unwrap());
        assert!(store.get(&queue_key()).await.unwrap().is_none());
    }
}
