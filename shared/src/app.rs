//! The core as a native shell sees it: one object that owns configuration,
//! storage, the session, the API client and the offline queue.

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::api::{ApiClient, ApiDispatcher, ApiError, AuthResult};
use crate::capabilities::{HttpTransport, KeyValueBackend};
use crate::config::{ConfigError, CoreConfig};
use crate::model::{MutationId, UserProfile};
use crate::outbox::{DeadLetter, FlushReport, NewMutation, QueuedMutation, SyncQueue};
use crate::session::SessionState;
use crate::store::PersistedStore;
use crate::AppResult;

#[derive(Debug)]
pub struct LoginOutcome {
    pub auth: AuthResult,
    /// Present when the login succeeded and the queue was flushed.
    pub flush: Option<FlushReport>,
}

pub struct MedAlertCore<T, B> {
    config: CoreConfig,
    store: PersistedStore<B>,
    queue: Arc<SyncQueue<B>>,
    state: Arc<SessionState>,
    client: Arc<ApiClient<T, B>>,
    dispatcher: ApiDispatcher<T, B>,
}

impl<T: HttpTransport, B: KeyValueBackend> MedAlertCore<T, B> {
    pub fn new(config: CoreConfig, transport: Arc<T>, backend: Arc<B>) -> AppResult<Self> {
        config.validate()?;
        if config.api.use_mock_auth {
            return Err(ConfigError::Unsupported(
                "mock authentication backend is not available in the shared core".into(),
            )
            .into());
        }

        let state = Arc::new(SessionState::new());
        let client = Arc::new(ApiClient::new(
            transport,
            Arc::clone(&backend),
            Arc::clone(&state),
            &config.api,
        )?);
        let store = PersistedStore::with_version(Arc::clone(&backend), config.queue.namespace_version);
        let queue = Arc::new(SyncQueue::new(backend, config.queue.clone()));
        let dispatcher = ApiDispatcher::new(Arc::clone(&client));

        info!(base_url = %client.base_url().as_str(), "core initialized");
        Ok(Self {
            config,
            store,
            queue,
            state,
            client,
            dispatcher,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &PersistedStore<B> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<SyncQueue<B>> {
        &self.queue
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn client(&self) -> &Arc<ApiClient<T, B>> {
        &self.client
    }

    /// Loads a persisted token into the in-process state at startup.
    /// Returns whether there was one.
    pub async fn restore_session(&self) -> bool {
        let Some(token) = self.client.session().access_token().await else {
            return false;
        };
        self.client.set_access_token(Some(token));
        info!("session restored");
        true
    }

    pub async fn cached_user(&self) -> Option<UserProfile> {
        self.client.session().cached_user().await
    }

    /// Signs in, then replays anything queued while signed out or offline.
    #[instrument(skip_all)]
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, ApiError> {
        let auth = self.client.login(email, password).await?;
        let flush = if auth.success && auth.access_token.is_some() {
            Some(self.flush_pending().await)
        } else {
            None
        };
        Ok(LoginOutcome { auth, flush })
    }

    /// Ends the session. Queued mutations stay queued for the next login.
    pub async fn logout(&self) -> AuthResult {
        self.client.logout().await
    }

    pub async fn enqueue(&self, kind: impl Into<String>, payload: Value) -> QueuedMutation {
        self.queue.enqueue(NewMutation::new(kind, payload)).await
    }

    pub async fn pending(&self) -> Vec<QueuedMutation> {
        self.queue.peek_all().await
    }

    pub async fn flush_pending(&self) -> FlushReport {
        if !self.state.is_authenticated() {
            warn!("flushing without a session; authenticated mutations stay queued");
        }
        self.queue.flush(&self.dispatcher).await
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.dead_letters().await
    }

    pub async fn requeue_dead_letter(&self, id: &MutationId) -> Option<QueuedMutation> {
        self.queue.requeue_dead_letter(id).await
    }
}

#[cfg(all(feature = "network", not(target_arch = "wasm32")))]
impl MedAlertCore<crate::capabilities::ReqwestTransport, crate::capabilities::SqliteKv> {
    /// Native build: SQLite file storage and the reqwest transport.
    pub fn open(config: CoreConfig, db_path: impl AsRef<std::path::Path>) -> AppResult<Self> {
        let backend = crate::capabilities::SqliteKv::open(db_path)?;
        Self::new(
            config,
            Arc::new(crate::capabilities::ReqwestTransport::new()),
            Arc::new(backend),
        )
    }
}
