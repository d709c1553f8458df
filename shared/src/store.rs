//! Namespaced JSON store over the device key-value medium.
//!
//! Every key is written under `medalert:v{STATE_VERSION}:`. Bumping the
//! version orphans values persisted in an older shape; nothing migrates
//! them.
//!
//! The medium is treated as unreliable. Reads that fail or do not parse
//! come back as the caller's fallback and writes that fail are logged and
//! dropped, so callers must not read `set`/`remove` as a durability
//! guarantee.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::capabilities::{KeyNamespace, KeyValueBackend, KvError, KvOperation, KvOutput};

pub const STATE_VERSION: u32 = 1;

pub struct PersistedStore<B> {
    backend: Arc<B>,
    namespace: KeyNamespace,
}

impl<B> Clone for PersistedStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            namespace: self.namespace.clone(),
        }
    }
}

impl<B: KeyValueBackend> PersistedStore<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_version(backend, STATE_VERSION)
    }

    pub fn with_version(backend: Arc<B>, version: u32) -> Self {
        Self::with_namespace(backend, KeyNamespace::app(version))
    }

    pub fn with_namespace(backend: Arc<B>, namespace: KeyNamespace) -> Self {
        Self { backend, namespace }
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Returns the stored value, or `fallback` if it is missing, unreadable
    /// or no longer parses as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, fallback: T) -> T {
        self.get_opt(key).await.unwrap_or(fallback)
    }

    pub async fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.try_get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "store read failed, treating as absent");
                None
            }
        }
    }

    /// Like [`get_opt`](Self::get_opt) but keeps "never stored" apart from
    /// "could not be read". Callers that write back what they read use this
    /// so a failed read never turns into an overwrite.
    pub async fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KvError> {
        let Some(bytes) = self.read(key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| KvError::Serialization {
                message: e.to_string(),
                key: Some(key.to_string()),
            })
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if let Err(e) = self.try_set(key, value).await {
            warn!(key, error = %e, "store write failed");
        }
    }

    pub async fn try_set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), KvError> {
        let data = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(key.to_string()),
        })?;
        let op = KvOperation::set(self.namespace.clone(), key, data)?;
        self.backend.execute(op).await.map(|_| ())
    }

    pub async fn remove(&self, key: &str) {
        let result = match KvOperation::delete(self.namespace.clone(), key) {
            Ok(op) => self.backend.execute(op).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(key, error = %e, "store remove failed");
        }
    }

    /// Removes a batch of keys in one backend call.
    pub async fn clear_all<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let result = match KvOperation::delete_multi(self.namespace.clone(), keys) {
            Ok(op) => self.backend.execute(op).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, "store batch remove failed");
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let op = KvOperation::get(self.namespace.clone(), key)?;
        match self.backend.execute(op).await? {
            KvOutput::Value(value) => Ok(value),
            _ => Err(KvError::UnexpectedOutput { operation: "get" }),
        }
    }
}
