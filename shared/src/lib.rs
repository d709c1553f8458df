//! Shared core of the MedAlert mobile app.
//!
//! The native shells own presentation. This crate owns what must behave the
//! same on every platform: the persisted key-value store, the offline
//! mutation queue and its flusher, and the authenticated API client with
//! token refresh.
//!
//! The crate does not install a tracing subscriber; the embedding shell does.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod app;
pub mod capabilities;
pub mod config;
pub mod model;
pub mod outbox;
pub mod session;
pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::api::ApiError;
use crate::capabilities::{HttpError, KvError};
use crate::config::ConfigError;
use crate::outbox::DispatchError;

pub use api::{ApiClient, ApiDispatcher, AuthResult};
pub use app::{LoginOutcome, MedAlertCore};
pub use config::{ApiConfig, CoreConfig, QueueConfig};
pub use model::{MutationId, ProfileUpdate, RegisterRequest, Report, ReportId, UserId, UserProfile};
pub use outbox::{
    flush_queue, DeadLetter, DeadLetterReason, Dispatcher, FlushReport, FnDispatcher, NewMutation,
    QueuedMutation, SyncQueue,
};
pub use session::{SessionState, SessionStore};
pub use store::{PersistedStore, STATE_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    Storage,
    Serialization,
    Deserialization,
    Configuration,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::Configuration => "CONFIG_ERROR",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::Conflict | Self::RateLimited | Self::Storage => {
                ErrorSeverity::Transient
            }

            Self::Serialization | Self::Deserialization | Self::Configuration | Self::Internal => {
                ErrorSeverity::Fatal
            }

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Storage | Self::Conflict
        )
    }

    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::Validation,
            401 => Self::Authentication,
            403 => Self::Authorization,
            404 => Self::NotFound,
            408 => Self::Timeout,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            500..=599 => Self::Internal,
            _ => Self::Unknown,
        }
    }
}

/// Error as the shell presents it: a kind to branch on and a message that
/// is safe to show in a toast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => "Your session has expired. Please sign in again.".into(),
            ErrorKind::Authorization => "You don't have permission to perform this action.".into(),
            // Server validation messages are written for end users.
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Conflict => {
                "This action conflicts with a recent change. Please refresh and try again.".into()
            }
            ErrorKind::RateLimited => "Too many requests. Please wait a moment and try again.".into(),
            ErrorKind::Storage => {
                "Unable to save data on this device. Please free up some storage space.".into()
            }
            ErrorKind::Serialization | ErrorKind::Deserialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::Configuration => {
                "The app is misconfigured. Please reinstall or contact support.".into()
            }
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::from_status(status), message)
            .with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<HttpError> for AppError {
    fn from(e: HttpError) -> Self {
        match &e {
            HttpError::HttpStatus {
                status,
                message,
                request_id,
                ..
            } => AppError::from_http_status(*status, message.clone())
                .with_context("request_id", request_id.clone()),
            HttpError::Timeout { request_id, .. } => AppError::new(ErrorKind::Timeout, e.to_string())
                .with_context("request_id", request_id.clone()),
            HttpError::ConnectionError { .. } => AppError::new(ErrorKind::Network, e.to_string()),
            HttpError::InvalidResponse { .. } => {
                AppError::new(ErrorKind::Deserialization, e.to_string())
            }
            HttpError::SerializationError { .. } => {
                AppError::new(ErrorKind::Serialization, e.to_string())
            }
            HttpError::InvalidUrl { .. } | HttpError::PrivateNetworkBlocked { .. } => {
                AppError::new(ErrorKind::Configuration, e.to_string())
            }
            HttpError::InvalidHeader { .. }
            | HttpError::TooManyHeaders { .. }
            | HttpError::BodyTooLarge { .. }
            | HttpError::InvalidRequest { .. } => {
                AppError::new(ErrorKind::Validation, e.to_string())
            }
        }
    }
}

impl From<ApiError> for AppError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Http(e) => e.into(),
            ApiError::Unauthorized { message, request_id }
            | ApiError::SessionExpired { message, request_id } => {
                AppError::new(ErrorKind::Authentication, message)
                    .with_context("request_id", request_id)
            }
            ApiError::InvalidResponse(message) => {
                AppError::new(ErrorKind::Deserialization, message)
            }
            ApiError::Serialization(message) => AppError::new(ErrorKind::Serialization, message),
            ApiError::Config(e) => e.into(),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Configuration, e.to_string())
    }
}

impl From<KvError> for AppError {
    fn from(e: KvError) -> Self {
        let kind = match &e {
            KvError::Serialization { .. } => ErrorKind::Serialization,
            KvError::InvalidKey { .. }
            | KvError::ValueTooLarge { .. }
            | KvError::BatchTooLarge { .. } => ErrorKind::Validation,
            KvError::Storage { .. } | KvError::UnexpectedOutput { .. } => ErrorKind::Storage,
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<DispatchError> for AppError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Http(e) => e.into(),
            DispatchError::Unauthenticated => {
                AppError::new(ErrorKind::Authentication, "not signed in")
            }
            DispatchError::UnknownType(_) | DispatchError::InvalidPayload { .. } => {
                AppError::new(ErrorKind::Validation, e.to_string())
            }
            DispatchError::Other { message, retryable } => {
                let kind = if retryable {
                    ErrorKind::Network
                } else {
                    ErrorKind::Unknown
                };
                AppError::new(kind, message)
            }
        }
    }
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
