//! Signup bootstrap integration tests: the first profile ever created is an
//! approved admin with a live session; every later signup is an unapproved
//! user whose session is revoked before signup returns; a same-id profile
//! row created concurrently is reconciled instead of failing the signup.

use std::sync::Arc;
use anyhow::Result;
use tempfile::tempdir;
use uuid::Uuid;

use pitchdesk::error::AuthError;
use pitchdesk::identity::{AuthService, AuthUser, IdentityProvider, LocalIdentityProvider,
                          Session, SessionManager, SignUpOutcome, UserMetadata};
use pitchdesk::profiles::{new_profile, ParquetProfileRepository, ProfileRepository, Role};
use pitchdesk::storage::SharedStore;

fn fixture(root: &std::path::Path) -> (Arc<AuthService>, Arc<dyn IdentityProvider>, Arc<dyn ProfileRepository>) {
    let store = SharedStore::new(root).expect("store");
    let provider: Arc<dyn IdentityProvider> =
        Arc::new(LocalIdentityProvider::new(store.clone(), SessionManager::default()));
    let profiles: Arc<dyn ProfileRepository> = Arc::new(ParquetProfileRepository::new(store));
    let auth = Arc::new(AuthService::new(provider.clone(), profiles.clone()));
    (auth, provider, profiles)
}

#[tokio::test]
async fn first_signup_bootstraps_admin_with_active_session() -> Result<()> {
    let tmp = tempdir()?;
    let (auth, provider, profiles) = fixture(tmp.path());

    let outcome = auth.sign_up("a@x.com", "password", "Alice").await?;
    let session = match outcome {
        SignUpOutcome::Admin(session) => session,
        other => panic!("expected bootstrap admin, got {:?}", other),
    };

    // session is still live at the provider
    let user = provider.get_user(&session.token).await?;
    assert_eq!(user.email, "a@x.com");

    let profile = profiles.get_by_id(session.user.id).await?.expect("profile row");
    assert_eq!(profile.role, Role::Admin);
    assert!(profile.is_approved);
    assert_eq!(profile.name, "Alice");
    assert_eq!(profiles.count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn second_signup_awaits_approval_and_is_signed_out() -> Result<()> {
    let tmp = tempdir()?;
    let (auth, _provider, profiles) = fixture(tmp.path());

    auth.sign_up("a@x.com", "password", "Alice").await?;
    let outcome = auth.sign_up("b@x.com", "password", "Bob").await?;
    let user_id = match outcome {
        SignUpOutcome::AwaitingApproval { user_id } => user_id,
        other => panic!("expected pending signup, got {:?}", other),
    };

    let profile = profiles.get_by_id(user_id).await?.expect("profile row");
    assert_eq!(profile.role, Role::User);
    assert!(!profile.is_approved);

    // the pending account cannot produce a session
    let err = auth.sign_in("b@x.com", "password").await.unwrap_err();
    assert!(matches!(err, AuthError::PendingApproval));
    Ok(())
}

#[tokio::test]
async fn duplicate_email_fails_fast() -> Result<()> {
    let tmp = tempdir()?;
    let (auth, _provider, _profiles) = fixture(tmp.path());

    auth.sign_up("a@x.com", "password", "Alice").await?;
    let err = auth.sign_up("a@x.com", "other-password", "Imposter").await.unwrap_err();
    assert!(matches!(err, AuthError::EmailTaken));
    Ok(())
}

#[tokio::test]
async fn signup_input_validation() -> Result<()> {
    let tmp = tempdir()?;
    let (auth, _provider, _profiles) = fixture(tmp.path());

    let bad_email = auth.sign_up("not-an-email", "password", "X").await.unwrap_err();
    assert!(matches!(bad_email, AuthError::InvalidInput(_)));

    let short_pw = auth.sign_up("a@x.com", "12345", "X").await.unwrap_err();
    assert!(matches!(short_pw, AuthError::InvalidInput(_)));
    Ok(())
}

/// Provider stub that always hands out the same user id, standing in for a
/// provider-side trigger that inserts a profile row before the application
/// can.
struct FixedIdProvider {
    id: Uuid,
    sessions: SessionManager,
}

#[async_trait::async_trait]
impl IdentityProvider for FixedIdProvider {
    async fn sign_up(&self, email: &str, _password: &str, metadata: UserMetadata) -> Result<Session, AuthError> {
        let user = AuthUser { id: self.id, email: email.trim().to_lowercase(), metadata };
        Ok(self.sessions.issue(user))
    }

    async fn sign_in_with_password(&self, _email: &str, _password: &str) -> Result<Session, AuthError> {
        Err(AuthError::InvalidCredentials)
    }

    async fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        self.sessions.logout(token);
        Ok(())
    }

    async fn get_user(&self, token: &str) -> Result<AuthUser, AuthError> {
        self.sessions.validate(token).map(|s| s.user).ok_or(AuthError::InvalidCredentials)
    }

    async fn reset_password_for_email(&self, _email: &str) -> Result<(), AuthError> { Ok(()) }

    async fn update_password(&self, _token: &str, _new_password: &str) -> Result<(), AuthError> { Ok(()) }
}

#[tokio::test]
async fn conflicting_profile_row_is_reconciled_not_fatal() -> Result<()> {
    let tmp = tempdir()?;
    let store = SharedStore::new(tmp.path())?;
    let id = Uuid::new_v4();
    let provider: Arc<dyn IdentityProvider> =
        Arc::new(FixedIdProvider { id, sessions: SessionManager::default() });
    let profiles: Arc<dyn ProfileRepository> = Arc::new(ParquetProfileRepository::new(store));
    let auth = AuthService::new(provider, profiles.clone());

    // a same-id row already exists before signup runs (trigger-created, with
    // placeholder values), and the table is non-empty so bootstrap is off
    profiles.insert(new_profile(id, "trigger@x.com", "", Role::User, false)).await?;

    let outcome = auth.sign_up("bob@x.com", "password", "Bob").await?;
    let user_id = match outcome {
        SignUpOutcome::AwaitingApproval { user_id } => user_id,
        other => panic!("expected pending signup, got {:?}", other),
    };
    assert_eq!(user_id, id);

    // exactly one row, carrying the values signup would have inserted
    assert_eq!(profiles.count().await?, 1);
    let profile = profiles.get_by_id(id).await?.expect("profile row");
    assert_eq!(profile.email, "bob@x.com");
    assert_eq!(profile.name, "Bob");
    assert_eq!(profile.role, Role::User);
    assert!(!profile.is_approved);
    Ok(())
}

#[tokio::test]
async fn seed_admin_provisions_only_on_empty_table() -> Result<()> {
    let tmp = tempdir()?;
    let (auth, _provider, profiles) = fixture(tmp.path());

    assert!(auth.ensure_seed_admin("root@x.com", "password", "Root").await?);
    assert!(!auth.ensure_seed_admin("root@x.com", "password", "Root").await?);
    assert_eq!(profiles.count().await?, 1);

    // the seeded account signs in as an approved admin
    let signed = auth.sign_in("root@x.com", "password").await?;
    assert!(signed.is_admin());
    Ok(())
}
