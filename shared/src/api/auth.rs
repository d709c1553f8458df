use secrecy::SecretString;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use super::{normalize, ApiClient, ApiError};
use crate::capabilities::{HttpMethod, HttpResponse, HttpTransport, KeyValueBackend};
use crate::model::{ProfileUpdate, RegisterRequest, UserProfile};

pub const LOGIN_PATH: &str = "/api/auth/login";
pub const REGISTER_PATH: &str = "/api/auth/register";
pub const LOGOUT_PATH: &str = "/api/auth/logout";
pub const PROFILE_PATH: &str = "/api/auth/me";
pub const UPDATE_PROFILE_PATH: &str = "/api/auth/update-profile";
pub const CHANGE_PASSWORD_PATH: &str = "/api/auth/change-password";
pub const DELETE_ACCOUNT_PATH: &str = "/api/auth/delete-account";

/// Normalized result of an auth endpoint, whatever shape the server used.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub success: bool,
    pub message: Option<String>,
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub user: Option<UserProfile>,
    pub raw: Value,
}

impl AuthResult {
    pub fn from_body(body: Value, status_ok: bool) -> Self {
        let tokens = normalize::tokens(&body);
        Self {
            success: normalize::success(&body, status_ok),
            message: normalize::message(&body),
            access_token: tokens.access,
            refresh_token: tokens.refresh,
            user: normalize::user(&body),
            raw: body,
        }
    }

    fn from_response(response: &HttpResponse) -> Result<Self, ApiError> {
        Ok(Self::from_body(response.json()?, response.is_success()))
    }
}

impl<T: HttpTransport, B: KeyValueBackend> ApiClient<T, B> {
    #[instrument(skip_all)]
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResult, ApiError> {
        let body = json!({ "email": email, "password": password });
        let response = self
            .send_anonymous(HttpMethod::Post, LOGIN_PATH, Some(&body))
            .await?;
        let result = AuthResult::from_response(&response)?;
        self.establish_session(&result).await;
        Ok(result)
    }

    #[instrument(skip_all)]
    pub async fn register(&self, request: &RegisterRequest) -> Result<AuthResult, ApiError> {
        let body = serde_json::to_value(request)?;
        let response = self
            .send_anonymous(HttpMethod::Post, REGISTER_PATH, Some(&body))
            .await?;
        let result = AuthResult::from_response(&response)?;
        // Some deployments require email verification first and return no token.
        self.establish_session(&result).await;
        Ok(result)
    }

    #[instrument(skip_all)]
    pub async fn get_profile(&self) -> Result<AuthResult, ApiError> {
        let response = self.send(HttpMethod::Get, PROFILE_PATH, None).await?;
        let result = AuthResult::from_response(&response)?;
        if let Some(user) = &result.user {
            self.session().set_cached_user(user).await;
        }
        Ok(result)
    }

    #[instrument(skip_all)]
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<AuthResult, ApiError> {
        let body = serde_json::to_value(update)?;
        let response = self
            .send(HttpMethod::Put, UPDATE_PROFILE_PATH, Some(&body))
            .await?;
        let result = AuthResult::from_response(&response)?;
        if let Some(user) = &result.user {
            self.session().set_cached_user(user).await;
        }
        Ok(result)
    }

    #[instrument(skip_all)]
    pub async fn change_password(
        &self,
        current_password: &str,
        new_password: &str,
    ) -> Result<AuthResult, ApiError> {
        let body = json!({
            "currentPassword": current_password,
            "newPassword": new_password,
        });
        let response = self
            .send(HttpMethod::Put, CHANGE_PASSWORD_PATH, Some(&body))
            .await?;
        AuthResult::from_response(&response)
    }

    #[instrument(skip_all)]
    pub async fn delete_account(&self) -> Result<AuthResult, ApiError> {
        let response = self.send(HttpMethod::Delete, DELETE_ACCOUNT_PATH, None).await?;
        let result = AuthResult::from_response(&response)?;
        if result.success {
            info!("account deleted, ending session");
            self.end_session().await;
        }
        Ok(result)
    }

    /// Tells the server, then ends the local session whatever it said.
    /// The sync queue is left alone.
    #[instrument(skip_all)]
    pub async fn logout(&self) -> AuthResult {
        let server = self.send(HttpMethod::Post, LOGOUT_PATH, None).await;
        self.end_session().await;

        match server {
            Ok(response) => {
                let body = response.json().unwrap_or(Value::Null);
                let mut result = AuthResult::from_body(body, true);
                result.success = true;
                result
            }
            Err(e) => {
                warn!(error = %e, "server logout failed, local session cleared anyway");
                AuthResult {
                    success: true,
                    message: None,
                    access_token: None,
                    refresh_token: None,
                    user: None,
                    raw: Value::Null,
                }
            }
        }
    }

    async fn establish_session(&self, result: &AuthResult) {
        if !result.success {
            return;
        }
        let Some(access) = &result.access_token else {
            return;
        };
        // In-process first so requests issued before the write lands are
        // already authenticated.
        self.set_access_token(Some(access.clone()));
        self.session()
            .set_tokens(access, result.refresh_token.as_ref())
            .await;
        if let Some(user) = &result.user {
            self.session().set_cached_user(user).await;
        }
        info!(user_id = ?result.user.as_ref().and_then(|u| u.id.as_ref()), "session established");
    }
}
