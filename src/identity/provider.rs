use anyhow::{Result, anyhow};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use password_hash::{SaltString, PasswordHash};
use polars::prelude::*;
use tracing::info;
use uuid::Uuid;

use crate::error::AuthError;
use crate::storage::{SharedStore, find_row, mask_not_equal, str_at};
use super::principal::{AuthUser, UserMetadata};
use super::session::{Session, SessionManager};

/// Contract with the external identity provider: sign up / sign in /
/// sign out / password reset / session-scoped user lookup. The orchestrator
/// and auth service depend only on this trait; the concrete provider is
/// selected at startup.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Create an auth record and issue a session for it.
    async fn sign_up(&self, email: &str, password: &str, metadata: UserMetadata) -> Result<Session, AuthError>;
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, AuthError>;
    /// Revoke the session. Errors are the caller's to log; the session must
    /// be treated as cleared client-side regardless.
    async fn sign_out(&self, token: &str) -> Result<(), AuthError>;
    /// Resolve the user behind a live session token.
    async fn get_user(&self, token: &str) -> Result<AuthUser, AuthError>;
    /// Trigger the provider's password-reset delivery. Must not reveal
    /// whether the email exists.
    async fn reset_password_for_email(&self, email: &str) -> Result<(), AuthError>;
    /// Replace the password of the session's user.
    async fn update_password(&self, token: &str, new_password: &str) -> Result<(), AuthError>;
}

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2.hash_password(password.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
    Ok(phc)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        let argon2 = Argon2::default();
        argon2.verify_password(password.as_bytes(), &parsed).is_ok()
    } else { false }
}

const AUTH_TABLE: &str = "auth_users";

fn mk_schema_df() -> DataFrame {
    DataFrame::new(vec![
        Series::new("id".into(), Vec::<String>::new()).into(),
        Series::new("email".into(), Vec::<String>::new()).into(),
        Series::new("name".into(), Vec::<String>::new()).into(),
        Series::new("password_hash".into(), Vec::<String>::new()).into(),
    ]).unwrap()
}

fn row_df(user: &AuthUser, hash: &str) -> Result<DataFrame> {
    Ok(DataFrame::new(vec![
        Series::new("id".into(), vec![user.id.to_string()]).into(),
        Series::new("email".into(), vec![user.email.clone()]).into(),
        Series::new("name".into(), vec![user.metadata.name.clone().unwrap_or_default()]).into(),
        Series::new("password_hash".into(), vec![hash.to_string()]).into(),
    ])?)
}

fn user_at(df: &DataFrame, i: usize) -> Option<AuthUser> {
    let id = str_at(df, "id", i)?.parse::<Uuid>().ok()?;
    let email = str_at(df, "email", i)?;
    let name = str_at(df, "name", i).filter(|n| !n.is_empty());
    Some(AuthUser { id, email, metadata: UserMetadata { name } })
}

/// Self-hosted identity provider: an argon2 PHC credential table next to the
/// application data, plus an instance-owned token map. Used when no hosted
/// identity service is configured, and by every test.
pub struct LocalIdentityProvider {
    store: SharedStore,
    sessions: SessionManager,
}

impl LocalIdentityProvider {
    pub fn new(store: SharedStore, sessions: SessionManager) -> Self { Self { store, sessions } }

    fn lookup(&self, email: &str) -> Result<Option<(AuthUser, String)>, AuthError> {
        let needle = email.trim().to_lowercase();
        let guard = self.store.0.lock();
        let df = guard.read_table(AUTH_TABLE, mk_schema_df)
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        let Some(i) = find_row(&df, "email", &needle) else { return Ok(None); };
        let user = user_at(&df, i).ok_or_else(|| AuthError::Provider("corrupt auth record".into()))?;
        let hash = str_at(&df, "password_hash", i).unwrap_or_default();
        Ok(Some((user, hash)))
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn sign_up(&self, email: &str, password: &str, metadata: UserMetadata) -> Result<Session, AuthError> {
        let normalized = email.trim().to_lowercase();
        if self.lookup(&normalized)?.is_some() {
            return Err(AuthError::EmailTaken);
        }
        let user = AuthUser { id: Uuid::new_v4(), email: normalized, metadata };
        let hash = hash_password(password).map_err(|e| AuthError::Provider(e.to_string()))?;
        {
            let guard = self.store.0.lock();
            let rows = row_df(&user, &hash).map_err(|e| AuthError::Provider(e.to_string()))?;
            guard.append_rows(AUTH_TABLE, mk_schema_df, rows)
                .map_err(|e| AuthError::Provider(e.to_string()))?;
        }
        Ok(self.sessions.issue(user))
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let Some((user, hash)) = self.lookup(email)? else {
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_password(&hash, password) {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(self.sessions.issue(user))
    }

    async fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        self.sessions.logout(token);
        Ok(())
    }

    async fn get_user(&self, token: &str) -> Result<AuthUser, AuthError> {
        match self.sessions.validate(token) {
            Some(sess) => Ok(sess.user),
            None => Err(AuthError::InvalidCredentials),
        }
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), AuthError> {
        // Email delivery is delegated (non-goal). Log the request without
        // disclosing whether the account exists.
        info!(target: "pitchdesk::identity", "password reset requested for '{}'", email.trim().to_lowercase());
        Ok(())
    }

    async fn update_password(&self, token: &str, new_password: &str) -> Result<(), AuthError> {
        let user = self.get_user(token).await?;
        let hash = hash_password(new_password).map_err(|e| AuthError::Provider(e.to_string()))?;
        let guard = self.store.0.lock();
        let df = guard.read_table(AUTH_TABLE, mk_schema_df)
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        let id = user.id.to_string();
        if find_row(&df, "id", &id).is_none() {
            return Err(AuthError::Provider(format!("auth record missing for {}", id)));
        }
        let mask = mask_not_equal(&df, "id", &id).map_err(|e| AuthError::Provider(e.to_string()))?;
        let kept = df.filter(&mask).map_err(|e| AuthError::Provider(e.to_string()))?;
        let updated = row_df(&user, &hash).map_err(|e| AuthError::Provider(e.to_string()))?;
        let stacked = if kept.height() == 0 { updated } else {
            kept.vstack(&updated).map_err(|e| AuthError::Provider(e.to_string()))?
        };
        guard.write_table(AUTH_TABLE, stacked).map_err(|e| AuthError::Provider(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> (tempfile::TempDir, LocalIdentityProvider) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SharedStore::new(tmp.path()).unwrap();
        (tmp, LocalIdentityProvider::new(store, SessionManager::default()))
    }

    #[tokio::test]
    async fn sign_up_then_sign_in() {
        let (_tmp, p) = provider();
        let meta = UserMetadata { name: Some("Alice".into()) };
        let sess = p.sign_up("Alice@X.com", "pw123456", meta).await.unwrap();
        assert_eq!(sess.user.email, "alice@x.com");

        let again = p.sign_in_with_password("alice@x.com", "pw123456").await.unwrap();
        assert_eq!(again.user.id, sess.user.id);
        assert_eq!(p.get_user(&again.token).await.unwrap().display_name(), "Alice");

        let bad = p.sign_in_with_password("alice@x.com", "nope").await;
        assert!(matches!(bad, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let (_tmp, p) = provider();
        p.sign_up("a@x.com", "pw123456", Default::default()).await.unwrap();
        let dup = p.sign_up("a@x.com", "other123", Default::default()).await;
        assert!(matches!(dup, Err(AuthError::EmailTaken)));
    }

    #[tokio::test]
    async fn sign_out_invalidates_token() {
        let (_tmp, p) = provider();
        let sess = p.sign_up("a@x.com", "pw123456", Default::default()).await.unwrap();
        p.sign_out(&sess.token).await.unwrap();
        assert!(p.get_user(&sess.token).await.is_err());
    }

    #[tokio::test]
    async fn update_password_rotates_credentials() {
        let (_tmp, p) = provider();
        let sess = p.sign_up("a@x.com", "pw123456", Default::default()).await.unwrap();
        p.update_password(&sess.token, "fresh-secret").await.unwrap();
        assert!(p.sign_in_with_password("a@x.com", "pw123456").await.is_err());
        assert!(p.sign_in_with_password("a@x.com", "fresh-secret").await.is_ok());
    }
}
