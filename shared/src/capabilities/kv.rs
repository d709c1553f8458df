use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

pub const APP_TAG: &str = "medalert";
pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_BATCH_KEYS: usize = 256;

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

    /// The key as written to the storage medium.
    pub fn raw(&self) -> String {
        match self.namespace.prefix() {
            Some(prefix) => format!("{}:{}", prefix, self.key),
            None => self.key.clone(),
        }
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

        if key.chars().any(|c| c.is_control()) {
            return Err(KvError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

/// Where a key lives in the shared storage medium.
///
/// `App` keys carry the application tag and a state-format version, so a
/// format change can bump the version and leave old values orphaned
/// instead of misreading them. `Plain` keys are shared with code that
/// predates namespacing (session tokens, cached user) and are stored as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    App { version: u32 },
    Plain,
}

impl KeyNamespace {
    pub const fn app(version: u32) -> Self {
        KeyNamespace::App { version }
    }

    pub fn prefix(&self) -> Option<String> {
        match self {
            KeyNamespace::App { version } => Some(format!("{}:v{}", APP_TAG, version)),
            KeyNamespace::Plain => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvOperation {
    Get { key: KvKey },
    Set { key: KvKey, value: Vec<u8> },
    Delete { key: KvKey },
    DeleteMulti { keys: Vec<KvKey> },
}

impl KvOperation {
    pub fn get(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        Ok(Self::Get {
            key: KvKey::new(namespace, key)?,
        })
    }

    pub fn set(
        namespace: KeyNamespace,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> Result<Self, KvError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(KvError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        Ok(Self::Set {
            key: KvKey::new(namespace, key)?,
            value,
        })
    }

    pub fn delete(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        Ok(Self::Delete {
            key: KvKey::new(namespace, key)?,
        })
    }

    pub fn delete_multi<I, K>(namespace: KeyNamespace, keys: I) -> Result<Self, KvError>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys = keys
            .into_iter()
            .map(|k| KvKey::new(namespace.clone(), k))
            .collect::<Result<Vec<_>, _>>()?;
        if keys.len() > MAX_BATCH_KEYS {
            return Err(KvError::BatchTooLarge {
                count: keys.len(),
                max: MAX_BATCH_KEYS,
            });
        }
        Ok(Self::DeleteMulti { keys })
    }

    pub fn name(&self) -> &'static str {
        match self {
            KvOperation::Get { .. } => "get",
            KvOperation::Set { .. } => "set",
            KvOperation::Delete { .. } => "delete",
            KvOperation::DeleteMulti { .. } => "delete_multi",
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, KvOperation::Get { .. })
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },

    #[error("too many keys in batch: {count} exceeds maximum of {max}")]
    BatchTooLarge { count: usize, max: usize },

    #[error("backend returned unexpected output for {operation}")]
    UnexpectedOutput { operation: &'static str },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
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

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvOutput {
    Value(Option<Vec<u8>>),
    Written,
    Deleted { existed: bool },
    DeletedMulti { deleted_count: usize },
}

pub type KvResult = Result<KvOutput, KvError>;

/// The device's local persistent store.
///
/// Implementations are free to fail any operation; callers above this
/// layer decide whether a failure is surfaced or treated as absence.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn execute(&self, operation: KvOperation) -> KvResult;
}

#[async_trait]
impl<B: KeyValueBackend + ?Sized> KeyValueBackend for std::sync::Arc<B> {
    async fn execute(&self, operation: KvOperation) -> KvResult {
        (**self).execute(operation).await
    }
}

/// Volatile backend for tests and shells without durable storage.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn raw_get(&self, raw_key: &str) -> Option<Vec<u8>> {
        self.entries.read().await.get(raw_key).cloned()
    }

    pub async fn raw_set(&self, raw_key: impl Into<String>, value: Vec<u8>) {
        self.entries.write().await.insert(raw_key.into(), value);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueBackend for MemoryKv {
    async fn execute(&self, operation: KvOperation) -> KvResult {
        match operation {
            KvOperation::Get { key } => {
                let entries = self.entries.read().await;
                Ok(KvOutput::Value(entries.get(&key.raw()).cloned()))
            }
            KvOperation::Set { key, value } => {
                self.entries.write().await.insert(key.raw(), value);
                Ok(KvOutput::Written)
            }
            KvOperation::Delete { key } => {
                let existed = self.entries.write().await.remove(&key.raw()).is_some();
                Ok(KvOutput::Deleted { existed })
            }
            KvOperation::DeleteMulti { keys } => {
                let mut entries = self.entries.write().await;
                let deleted_count = keys
                    .iter()
                    .filter(|k| entries.remove(&k.raw()).is_some())
                    .count();
                Ok(KvOutput::DeletedMulti { deleted_count })
            }
        }
    }
}
