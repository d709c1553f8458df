//! Authenticated client for the MedAlert REST API.
//!
//! Every request carries a bearer token resolved from, in order: the
//! persisted `authToken`, the in-process [`SessionState`], and finally the
//! default headers set through [`ApiClient::set_access_token`]. A 401 is
//! answered with at most one refresh and one retry of the original request.
//! When that does not recover the session, the persisted session is cleared
//! and the 401 is returned to the caller.

pub mod auth;
pub mod dispatch;
pub mod normalize;
pub mod reports;

use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpTransport, KeyValueBackend,
    ValidatedUrl,
};
use crate::config::{ApiConfig, ConfigError};
use crate::session::{SessionState, SessionStore};

pub use self::auth::AuthResult;
pub use self::dispatch::ApiDispatcher;

pub const REFRESH_PATH: &str = "/api/auth/refresh";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Http(#[from] HttpError),

    /// 401 that a refresh did not recover. The session has been cleared.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String, request_id: String },

    /// 401 with no refresh token to try. The session has been cleared.
    #[error("session expired: {message}")]
    SessionExpired { message: String, request_id: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http(e) => e.status(),
            ApiError::Unauthorized { .. } | ApiError::SessionExpired { .. } => Some(401),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Serialization(e.to_string())
    }
}

enum Auth {
    /// Persisted token, then session state, then default headers.
    Resolve,
    /// A token just obtained by refresh.
    Bearer(SecretString),
    /// No `Authorization` header at all.
    Anonymous,
}

pub struct ApiClient<T, B> {
    transport: Arc<T>,
    base_url: ValidatedUrl,
    timeout_ms: u64,
    session: SessionStore<B>,
    state: Arc<SessionState>,
    default_headers: RwLock<HttpHeaders>,
}

impl<T: HttpTransport, B: KeyValueBackend> ApiClient<T, B> {
    pub fn new(
        transport: Arc<T>,
        backend: Arc<B>,
        state: Arc<SessionState>,
        config: &ApiConfig,
    ) -> Result<Self, ApiError> {
        config.validate()?;
        let mut default_headers = HttpHeaders::new();
        default_headers.insert("Accept", "application/json")?;

        Ok(Self {
            transport,
            base_url: config.base_url()?,
            timeout_ms: config.timeout_ms,
            session: SessionStore::new(backend),
            state,
            default_headers: RwLock::new(default_headers),
        })
    }

    pub fn base_url(&self) -> &ValidatedUrl {
        &self.base_url
    }

    pub fn session(&self) -> &SessionStore<B> {
        &self.session
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Publishes a token to the session state and the default headers,
    /// ahead of (or instead of) its durable write.
    pub fn set_access_token(&self, token: Option<SecretString>) {
        {
            let mut headers = match self.default_headers.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match &token {
                Some(token) => {
                    if let Err(e) = headers.insert("Authorization", bearer(token)) {
                        warn!(error = %e, "token rejected as header value");
                    }
                }
                None => {
                    headers.remove("Authorization");
                }
            }
        }
        self.state.set_access_token(token);
    }

    /// Authenticated request with 401 recovery. Non-2xx statuses come back
    /// as [`ApiError::Http`].
    #[instrument(skip(self, body), fields(method = method.as_str()))]
    pub async fn send(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
    ) -> Result<HttpResponse, ApiError> {
        let response = self.execute(method, path, body, Auth::Resolve).await?;
        if response.status() != 401 {
            return check_status(response);
        }

        let (message, request_id) = error_details(&response);
        let Some(refresh_token) = self.session.refresh_token().await else {
            warn!(path, "401 with no refresh token, ending session");
            self.end_session().await;
            return Err(ApiError::SessionExpired {
                message,
                request_id,
            });
        };

        let access = match self.refresh(&refresh_token).await {
            Ok(access) => access,
            Err(e) => {
                error!(path, error = %e, "token refresh failed, ending session");
                self.end_session().await;
                return Err(ApiError::Unauthorized {
                    message,
                    request_id,
                });
            }
        };

        let retried = self.execute(method, path, body, Auth::Bearer(access)).await?;
        if retried.status() == 401 {
            let (message, request_id) = error_details(&retried);
            error!(path, "401 after refresh, ending session");
            self.end_session().await;
            return Err(ApiError::Unauthorized {
                message,
                request_id,
            });
        }
        check_status(retried)
    }

    /// Request without a bearer token and without 401 recovery, for
    /// endpoints that establish a session.
    #[instrument(skip(self, body), fields(method = method.as_str()))]
    pub async fn send_anonymous(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
    ) -> Result<HttpResponse, ApiError> {
        let response = self.execute(method, path, body, Auth::Anonymous).await?;
        check_status(response)
    }

    /// [`ApiClient::send`] with the body parsed as JSON.
    pub async fn request_json(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let response = self.send(method, path, body).await?;
        Ok(response.json()?)
    }

    /// Clears the persisted session keys and the in-process token.
    pub async fn end_session(&self) {
        self.session.clear().await;
        self.set_access_token(None);
    }

    async fn refresh(&self, refresh_token: &SecretString) -> Result<SecretString, ApiError> {
        let body = json!({ "refreshToken": refresh_token.expose_secret() });
        let response = self
            .execute(HttpMethod::Post, REFRESH_PATH, Some(&body), Auth::Anonymous)
            .await?;
        let response = check_status(response)?;
        let value: Value = response.json()?;

        let tokens = normalize::tokens(&value);
        let access = tokens
            .access
            .ok_or_else(|| ApiError::InvalidResponse("refresh response has no access token".into()))?;

        self.session.set_tokens(&access, tokens.refresh.as_ref()).await;
        self.set_access_token(Some(access.clone()));
        info!("access token refreshed");
        Ok(access)
    }

    async fn execute(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
        auth: Auth,
    ) -> Result<HttpResponse, ApiError> {
        let url = self.base_url.join_path(path)?;
        let mut request = HttpRequest::new(method, url).with_timeout_ms(self.timeout_ms)?;
        if let Some(body) = body {
            request = request.with_json(body)?;
        }

        let anonymous = matches!(auth, Auth::Anonymous);
        match auth {
            Auth::Resolve => {
                let token = match self.session.access_token().await {
                    Some(token) => Some(token),
                    None => self.state.current(),
                };
                if let Some(token) = token {
                    request = request.with_header("Authorization", bearer(&token))?;
                }
            }
            Auth::Bearer(token) => {
                request = request.with_header("Authorization", bearer(&token))?;
            }
            Auth::Anonymous => {}
        }

        {
            let defaults = match self.default_headers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            request.headers_mut().fill_from(&defaults);
        }
        if anonymous {
            request.headers_mut().remove("Authorization");
        }

        debug!(
            request_id = request.request_id(),
            path,
            authenticated = request.headers().contains("Authorization"),
            "sending request"
        );
        Ok(self.transport.execute(request).await?)
    }
}

fn bearer(token: &SecretString) -> String {
    format!("Bearer {}", token.expose_secret())
}

fn error_details(response: &HttpResponse) -> (String, String) {
    let message = response
        .json::<Value>()
        .ok()
        .and_then(|body| normalize::message(&body))
        .unwrap_or_else(|| format!("HTTP {}", response.status()));
    (message, response.request_id().to_string())
}

fn check_status(response: HttpResponse) -> Result<HttpResponse, ApiError> {
    if response.is_success() {
        return Ok(response);
    }
    let (message, request_id) = error_details(&response);
    Err(HttpError::from_status(response.status(), message, request_id).into())
}
