//! Client for a hosted identity service exposing the usual
//! signup / password-grant / logout / recover / user endpoints.
//! Password reset goes through the privileged service-role key when one is
//! configured, so the public anon key never triggers reset mail directly.

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AuthError;
use super::principal::{AuthUser, UserMetadata};
use super::provider::IdentityProvider;
use super::session::Session;

#[derive(Debug, Clone)]
pub struct RemoteIdentityConfig {
    /// Base URL of the identity API, e.g. `https://acme.example.com/auth/v1`.
    pub base_url: String,
    /// Public (anonymous) API key sent on every request.
    pub anon_key: String,
    /// Privileged key for the trusted password-reset path. When unset, reset
    /// falls back to the anon key.
    pub service_key: Option<String>,
}

pub struct HttpIdentityProvider {
    cfg: RemoteIdentityConfig,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: Uuid,
    email: String,
    #[serde(default)]
    user_metadata: UserMetadata,
}

#[derive(Debug, Deserialize)]
struct WireSession {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    user: Option<WireUser>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(alias = "msg", alias = "message", alias = "error_description")]
    error: Option<String>,
}

impl From<WireUser> for AuthUser {
    fn from(w: WireUser) -> Self {
        AuthUser { id: w.id, email: w.email, metadata: w.user_metadata }
    }
}

impl HttpIdentityProvider {
    pub fn new(cfg: RemoteIdentityConfig) -> Self {
        Self { cfg, http: reqwest::Client::new() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    /// Classify a non-success response body into a domain error.
    async fn classify(resp: reqwest::Response) -> AuthError {
        let status = resp.status();
        let msg = match resp.json::<WireError>().await {
            Ok(body) => body.error.unwrap_or_else(|| status.to_string()),
            Err(_) => status.to_string(),
        };
        let lowered = msg.to_lowercase();
        if lowered.contains("already registered") || lowered.contains("already exists") {
            return AuthError::EmailTaken;
        }
        if status == reqwest::StatusCode::UNAUTHORIZED
            || lowered.contains("invalid login credentials")
            || lowered.contains("invalid_grant")
        {
            return AuthError::InvalidCredentials;
        }
        AuthError::Provider(format!("{}: {}", status, msg))
    }

    async fn session_from(resp: reqwest::Response) -> Result<Session, AuthError> {
        if !resp.status().is_success() {
            return Err(Self::classify(resp).await);
        }
        let wire: WireSession = resp.json().await
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        let (Some(token), Some(user)) = (wire.access_token, wire.user) else {
            // e.g. signup with mandatory email confirmation: no usable session
            return Err(AuthError::Provider("identity provider returned no session".into()));
        };
        let now = chrono::Utc::now().timestamp_millis();
        Ok(Session {
            token,
            user: user.into(),
            issued_at: now,
            expires_at: now + wire.expires_in.unwrap_or(3600) * 1000,
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn sign_up(&self, email: &str, password: &str, metadata: UserMetadata) -> Result<Session, AuthError> {
        let resp = self.http.post(self.url("signup"))
            .header("apikey", &self.cfg.anon_key)
            .json(&serde_json::json!({
                "email": email,
                "password": password,
                "data": { "name": metadata.name },
            }))
            .send().await
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        Self::session_from(resp).await
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let resp = self.http.post(self.url("token?grant_type=password"))
            .header("apikey", &self.cfg.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send().await
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        Self::session_from(resp).await
    }

    async fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        let resp = self.http.post(self.url("logout"))
            .header("apikey", &self.cfg.anon_key)
            .bearer_auth(token)
            .send().await
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        if resp.status().is_success() { Ok(()) } else { Err(Self::classify(resp).await) }
    }

    async fn get_user(&self, token: &str) -> Result<AuthUser, AuthError> {
        let resp = self.http.get(self.url("user"))
            .header("apikey", &self.cfg.anon_key)
            .bearer_auth(token)
            .send().await
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify(resp).await);
        }
        let wire: WireUser = resp.json().await
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        Ok(wire.into())
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), AuthError> {
        // Secure default: the privileged key acts as the trusted intermediary.
        let key = self.cfg.service_key.as_deref().unwrap_or(&self.cfg.anon_key);
        let mut req = self.http.post(self.url("recover"))
            .header("apikey", key)
            .json(&serde_json::json!({ "email": email }));
        if let Some(service) = self.cfg.service_key.as_deref() {
            req = req.bearer_auth(service);
        }
        let resp = req.send().await
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        if resp.status().is_success() { Ok(()) } else { Err(Self::classify(resp).await) }
    }

    async fn update_password(&self, token: &str, new_password: &str) -> Result<(), AuthError> {
        let resp = self.http.put(self.url("user"))
            .header("apikey", &self.cfg.anon_key)
            .bearer_auth(token)
            .json(&serde_json::json!({ "password": new_password }))
            .send().await
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        if resp.status().is_success() { Ok(()) } else { Err(Self::classify(resp).await) }
    }
}
