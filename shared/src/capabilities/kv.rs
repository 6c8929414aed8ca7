use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::model::UnixTimeMs;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

/// Version reported for a key that has never been written.
pub const ABSENT_VERSION: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.chars().any(|c| c.is_control()) {
            return Err(KvError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains invalid control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Outbox,
    Session,
    Cache,
    Settings,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Outbox => "outbox",
            KeyNamespace::Session => "session",
            KeyNamespace::Cache => "cache",
            KeyNamespace::Settings => "settings",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LENGTH {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: format!("custom namespace must be 1..={} bytes", MAX_PREFIX_LENGTH),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvValue {
    data: Vec<u8>,
    version: u64,
    updated_at: UnixTimeMs,
}

impl KvValue {
    pub fn new(data: Vec<u8>, version: u64, updated_at: UnixTimeMs) -> Result<Self, KvError> {
        check_value_size(&data)?;
        Ok(Self {
            data,
            version,
            updated_at,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn updated_at(&self) -> UnixTimeMs {
        self.updated_at
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, KvError> {
        serde_json::from_slice(&self.data).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: None,
        })
    }
}

pub(crate) fn check_value_size(data: &[u8]) -> Result<(), KvError> {
    if data.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: data.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u64, found: u64 },

    #[error("storage error: {message} (code: {code:?})")]
    Storage {
        code: StorageErrorCode,
        message: String,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { code, .. } => code.is_retryable(),
            KvError::VersionMismatch { .. } => true,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::Locked)
    }
}

/// Durable key-value port.
///
/// Every key carries a version; writes are compare-and-swap against the version
/// the writer last read ([`ABSENT_VERSION`] for a key that does not exist yet).
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<KvValue>, KvError>;

    /// Replace the whole value if the stored version still equals
    /// `expected_version`. Returns the new version.
    async fn compare_and_swap(
        &self,
        key: &KvKey,
        expected_version: u64,
        data: Vec<u8>,
        now: UnixTimeMs,
    ) -> Result<u64, KvError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &KvKey) -> Result<bool, KvError>;
}

/// Read and decode a JSON value together with the version it was read at.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &KvKey,
) -> Result<(Option<T>, u64), KvError> {
    match store.get(key).await? {
        Some(value) => {
            let decoded = value.deserialize().map_err(|e| match e {
                KvError::Serialization { message, .. } => KvError::Serialization {
                    message,
                    key: Some(key.raw()),
                },
                other => other,
            })?;
            Ok((Some(decoded), value.version()))
        }
        None => Ok((None, ABSENT_VERSION)),
    }
}

/// Encode `value` as JSON and compare-and-swap it in.
pub async fn store_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &KvKey,
    expected_version: u64,
    value: &T,
    now: UnixTimeMs,
) -> Result<u64, KvError> {
    let data = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
        message: e.to_string(),
        key: Some(key.raw()),
    })?;
    store.compare_and_swap(key, expected_version, data, now).await
}

/// Process-local store; survives nothing but is handy for tests and previews.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, KvValue>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, KvValue>>, KvError> {
        self.entries
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "memory store poisoned"))
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<KvValue>, KvError> {
        Ok(self.lock()?.get(&key.raw()).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &KvKey,
        expected_version: u64,
        data: Vec<u8>,
        now: UnixTimeMs,
    ) -> Result<u64, KvError> {
        check_value_size(&data)?;
        let mut entries = self.lock()?;
        let raw = key.raw();
        let found = entries.get(&raw).map_or(ABSENT_VERSION, KvValue::version);
        if found != expected_version {
            return Err(KvError::VersionMismatch {
                expected: expected_version,
                found,
            });
        }
        let version = found.saturating_add(1);
        entries.insert(raw, KvValue::new(data, version, now)?);
        Ok(version)
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        Ok(self.lock()?.remove(&key.raw()).is_some())
    }
}
