//! Unified application error model and mapping helpers.
//! This module provides a common error enum used by the HTTP and WebSocket
//! frontends, along with the domain errors raised by the auth core and the
//! table repositories.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Domain errors raised by the auth core (provider + profile coordination).
///
/// Every provider/repository failure is classified into one of these before
/// it crosses the module boundary; raw transport errors never leak to
/// callers. No variant triggers an automatic retry — each failure is
/// terminal for the invocation that produced it.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Credentials were valid but the profile row has `is_approved=false`.
    /// The session has already been signed back out when this is returned.
    #[error("account is awaiting administrator approval")]
    PendingApproval,
    #[error("email is already registered")]
    EmailTaken,
    /// A same-id profile row already existed during signup. Recoverable:
    /// `sign_up` reconciles it through the repository upsert and callers
    /// never see it, but it is kept distinct for logging.
    #[error("profile row conflict for user {0}")]
    ProfileConflict(uuid::Uuid),
    /// Identity provider or repository transport failure; fatal for the
    /// current operation only.
    #[error("identity provider unavailable: {0}")]
    Provider(String),
    /// Profile fetch failed while a valid session exists. Non-fatal during
    /// session restore: role degrades to non-admin instead of blocking.
    #[error("profile fetch failed: {0}")]
    ProfileFetch(String),
    #[error("{0}")]
    InvalidInput(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    UserInput { code: String, message: String },
    NotFound { code: String, message: String },
    Conflict { code: String, message: String },
    Auth { code: String, message: String },
    Forbidden { code: String, message: String },
    Csrf { code: String, message: String },
    Io { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::UserInput { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Conflict { code, .. }
            | AppError::Auth { code, .. }
            | AppError::Forbidden { code, .. }
            | AppError::Csrf { code, .. }
            | AppError::Io { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::UserInput { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Conflict { message, .. }
            | AppError::Auth { message, .. }
            | AppError::Forbidden { message, .. }
            | AppError::Csrf { message, .. }
            | AppError::Io { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn user<S: Into<String>>(code: S, msg: S) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn conflict<S: Into<String>>(code: S, msg: S) -> Self { AppError::Conflict { code: code.into(), message: msg.into() } }
    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn forbidden<S: Into<String>>(code: S, msg: S) -> Self { AppError::Forbidden { code: code.into(), message: msg.into() } }
    pub fn csrf<S: Into<String>>(code: S, msg: S) -> Self { AppError::Csrf { code: code.into(), message: msg.into() } }
    pub fn io<S: Into<String>>(code: S, msg: S) -> Self { AppError::Io { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::UserInput { .. } => 400,
            AppError::NotFound { .. } => 404,
            AppError::Conflict { .. } => 409,
            AppError::Auth { .. } => 401,
            AppError::Forbidden { .. } => 403,
            AppError::Csrf { .. } => 403,
            AppError::Io { .. } => 503,
            AppError::Internal { .. } => 500,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        let message = err.to_string();
        match err {
            AuthError::InvalidCredentials => AppError::auth("invalid_credentials".to_string(), message),
            AuthError::PendingApproval => AppError::forbidden("pending_approval".to_string(), message),
            AuthError::EmailTaken => AppError::conflict("email_taken".to_string(), message),
            AuthError::ProfileConflict(_) => AppError::conflict("profile_conflict".to_string(), message),
            AuthError::Provider(_) => AppError::io("provider_unavailable".to_string(), message),
            AuthError::ProfileFetch(_) => AppError::internal("profile_fetch".to_string(), message),
            AuthError::InvalidInput(_) => AppError::user("invalid_input".to_string(), message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal { code: "internal".into(), message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(AppError::user("bad_input", "oops").http_status(), 400);
        assert_eq!(AppError::not_found("not_found", "missing").http_status(), 404);
        assert_eq!(AppError::conflict("conflict", "dup").http_status(), 409);
        assert_eq!(AppError::auth("auth", "no").http_status(), 401);
        assert_eq!(AppError::forbidden("forbidden", "denied").http_status(), 403);
        assert_eq!(AppError::csrf("csrf", "blocked").http_status(), 403);
        assert_eq!(AppError::io("io", "io").http_status(), 503);
        assert_eq!(AppError::internal("internal", "panic").http_status(), 500);
    }

    #[test]
    fn auth_error_mapping() {
        assert_eq!(AppError::from(AuthError::InvalidCredentials).http_status(), 401);
        assert_eq!(AppError::from(AuthError::PendingApproval).http_status(), 403);
        assert_eq!(AppError::from(AuthError::EmailTaken).http_status(), 409);
        assert_eq!(AppError::from(AuthError::Provider("down".into())).http_status(), 503);
        assert_eq!(AppError::from(AuthError::InvalidInput("short".into())).http_status(), 400);

        let e = AppError::from(AuthError::PendingApproval);
        assert_eq!(e.code_str(), "pending_approval");
    }
}
