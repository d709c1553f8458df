//! Session tokens and the cached user.
//!
//! Two views of the same session: [`SessionStore`] is the durable copy
//! under the legacy plain keys, [`SessionState`] is the in-process value
//! that is visible immediately after login, before the durable write lands.

use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::capabilities::{KeyNamespace, KeyValueBackend, KvError, KvOperation, KvOutput};
use crate::model::UserProfile;
use crate::store::PersistedStore;

pub const AUTH_TOKEN_KEY: &str = "authToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const USER_KEY: &str = "user";
pub const USER_DATA_KEY: &str = "userData";

/// Every key a session teardown removes.
pub const SESSION_KEYS: [&str; 4] = [AUTH_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY, USER_DATA_KEY];

/// Durable session data. Tokens are stored as bare strings and the user as
/// JSON, matching what shells written before this crate expect to find.
pub struct SessionStore<B> {
    backend: Arc<B>,
    users: PersistedStore<B>,
}

impl<B> Clone for SessionStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            users: self.users.clone(),
        }
    }
}

impl<B: KeyValueBackend> SessionStore<B> {
    pub fn new(backend: Arc<B>) -> Self {
        let users = PersistedStore::with_namespace(Arc::clone(&backend), KeyNamespace::Plain);
        Self { backend, users }
    }

    pub async fn access_token(&self) -> Option<SecretString> {
        self.read_token(AUTH_TOKEN_KEY).await
    }

    pub async fn refresh_token(&self) -> Option<SecretString> {
        self.read_token(REFRESH_TOKEN_KEY).await
    }

    /// Stores the access token and, when given, the refresh token. An absent
    /// refresh token leaves the stored one alone.
    pub async fn set_tokens(&self, access: &SecretString, refresh: Option<&SecretString>) {
        self.write_token(AUTH_TOKEN_KEY, access).await;
        if let Some(refresh) = refresh {
            self.write_token(REFRESH_TOKEN_KEY, refresh).await;
        }
    }

    pub async fn set_access_token(&self, access: &SecretString) {
        self.write_token(AUTH_TOKEN_KEY, access).await;
    }

    pub async fn cached_user(&self) -> Option<UserProfile> {
        match self.users.get_opt(USER_KEY).await {
            Some(user) => Some(user),
            None => self.users.get_opt(USER_DATA_KEY).await,
        }
    }

    /// Writes the user under both legacy keys so either reader finds it.
    pub async fn set_cached_user(&self, user: &UserProfile) {
        self.users.set(USER_KEY, user).await;
        self.users.set(USER_DATA_KEY, user).await;
    }

    pub async fn clear(&self) {
        debug!("clearing persisted session");
        self.users.clear_all(SESSION_KEYS).await;
    }

    async fn read_token(&self, key: &str) -> Option<SecretString> {
        let result = match KvOperation::get(KeyNamespace::Plain, key) {
            Ok(op) => self.backend.execute(op).await,
            Err(e) => Err(e),
        };
        let bytes = match result {
            Ok(KvOutput::Value(Some(bytes))) => bytes,
            Ok(KvOutput::Value(None)) => return None,
            Ok(_) => {
                warn!(key, error = %KvError::UnexpectedOutput { operation: "get" }, "token read failed");
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "token read failed, treating as absent");
                return None;
            }
        };

        match String::from_utf8(bytes) {
            Ok(token) if !token.trim().is_empty() => Some(SecretString::new(token)),
            Ok(_) => None,
            Err(_) => {
                warn!(key, "stored token is not UTF-8, treating as absent");
                None
            }
        }
    }

    async fn write_token(&self, key: &str, token: &SecretString) {
        let data = token.expose_secret().as_bytes().to_vec();
        let result = match KvOperation::set(KeyNamespace::Plain, key, data) {
            Ok(op) => self.backend.execute(op).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(key, error = %e, "token write failed");
        }
    }
}

/// In-process access token with one writer and any number of readers.
///
/// Readers either poll [`SessionState::current`] or hold a receiver from
/// [`SessionState::subscribe`] to react to login and logout.
#[derive(Debug)]
pub struct SessionState {
    token: watch::Sender<Option<SecretString>>,
}

impl SessionState {
    pub fn new() -> Self {
        let (token, _) = watch::channel(None);
        Self { token }
    }

    pub fn set_access_token(&self, token: Option<SecretString>) {
        self.token.send_replace(token);
    }

    pub fn current(&self) -> Option<SecretString> {
        self.token.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SecretString>> {
        self.token.subscribe()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
