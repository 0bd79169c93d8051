//! Coordination core for account bootstrap and role approval: the one place
//! where identity-provider calls and profile-row access are combined.
//! Every operation classifies provider/repository failures into domain
//! errors; raw transport errors never reach callers, and nothing here
//! retries on its own.

use std::sync::Arc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AuthError;
use crate::profiles::{new_profile, Profile, ProfileRepository, Role};
use super::principal::UserMetadata;
use super::provider::IdentityProvider;
use super::session::Session;

/// Result of a gated sign-in: the provider session plus the resolved role.
#[derive(Debug, Clone)]
pub struct SignedIn {
    pub session: Session,
    pub role: Role,
}

impl SignedIn {
    pub fn is_admin(&self) -> bool { self.role == Role::Admin }
}

/// Outcome of a completed signup.
#[derive(Debug, Clone)]
pub enum SignUpOutcome {
    /// First account in the system: bootstrapped as an approved admin and
    /// left signed in.
    Admin(Session),
    /// Any later account: profile created unapproved and the session signed
    /// back out before returning.
    AwaitingApproval { user_id: Uuid },
}

/// Role/approval snapshot for a user id. `is_approved` is `None` when the
/// profile could not be fetched; `is_admin` then fails closed to false.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RoleCheck {
    pub is_admin: bool,
    pub is_approved: Option<bool>,
}

impl RoleCheck {
    fn denied() -> Self { RoleCheck { is_admin: false, is_approved: None } }

    fn from_profile(p: &Profile) -> Self {
        RoleCheck { is_admin: p.role == Role::Admin, is_approved: Some(p.is_approved) }
    }
}

const MIN_PASSWORD_LEN: usize = 6;

fn validate_credentials(email: &str, password: &str) -> Result<(), AuthError> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(AuthError::InvalidInput("a valid email address is required".into()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::InvalidInput(format!(
            "password must be at least {} characters", MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// The auth service owns no session state of its own: operations take and
/// return tokens, so the single-user `AuthOrchestrator` and the multi-client
/// HTTP layer share one implementation of the flow rules.
pub struct AuthService {
    provider: Arc<dyn IdentityProvider>,
    profiles: Arc<dyn ProfileRepository>,
}

impl AuthService {
    pub fn new(provider: Arc<dyn IdentityProvider>, profiles: Arc<dyn ProfileRepository>) -> Self {
        Self { provider, profiles }
    }

    pub fn profiles(&self) -> &Arc<dyn ProfileRepository> { &self.profiles }

    /// Sign in, gated on approval: credentials may be valid at the provider,
    /// but an unapproved profile signs the session back out and reports
    /// `PendingApproval` so no unapproved session survives a reload.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignedIn, AuthError> {
        let session = self.provider.sign_in_with_password(email, password).await?;
        let profile = match self.profiles.get_by_id(session.user.id).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                self.sign_out(&session.token).await;
                return Err(AuthError::ProfileFetch(format!("no profile row for {}", session.user.id)));
            }
            Err(e) => {
                self.sign_out(&session.token).await;
                return Err(AuthError::ProfileFetch(e.to_string()));
            }
        };
        if !profile.is_approved {
            self.sign_out(&session.token).await;
            return Err(AuthError::PendingApproval);
        }
        info!(target: "pitchdesk::auth", "sign_in user={} role={}", profile.email, profile.role.as_str());
        Ok(SignedIn { session, role: profile.role })
    }

    /// Signup with count-based role bootstrap: the first profile row ever
    /// created is an approved admin; every later signup is an unapproved
    /// user whose session is revoked before this returns. The profile write
    /// is a single upsert with conflict target `id`, so a same-id row
    /// inserted concurrently (e.g. by a provider-side trigger) is reconciled
    /// instead of failing the signup.
    pub async fn sign_up(&self, email: &str, password: &str, name: &str) -> Result<SignUpOutcome, AuthError> {
        validate_credentials(email, password)?;

        // Fail fast before touching the provider when the email already has
        // a profile row.
        match self.profiles.get_by_email(email).await {
            Ok(Some(_)) => return Err(AuthError::EmailTaken),
            Ok(None) => {}
            Err(e) => return Err(AuthError::Provider(e.to_string())),
        }

        let metadata = UserMetadata { name: Some(name.to_string()) };
        let session = self.provider.sign_up(email, password, metadata).await?;

        let count = self.profiles.count().await
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        let bootstrap = count == 0;
        let role = if bootstrap { Role::Admin } else { Role::User };
        let profile = new_profile(session.user.id, &session.user.email, name, role, bootstrap);

        match self.profiles.upsert(profile).await {
            Ok(replaced) => {
                if replaced {
                    // A same-id row was already there; the upsert reconciled
                    // it with the values we would have inserted.
                    warn!(target: "pitchdesk::auth",
                          "profile conflict reconciled during signup: {}", session.user.id);
                }
            }
            Err(e) => return Err(AuthError::Provider(e.to_string())),
        }

        if bootstrap {
            info!(target: "pitchdesk::auth", "bootstrap admin created: {}", session.user.email);
            Ok(SignUpOutcome::Admin(session))
        } else {
            let user_id = session.user.id;
            self.sign_out(&session.token).await;
            info!(target: "pitchdesk::auth", "signup awaiting approval: {}", session.user.email);
            Ok(SignUpOutcome::AwaitingApproval { user_id })
        }
    }

    /// Always succeeds from the caller's perspective: provider errors are
    /// logged and the session is treated as cleared.
    pub async fn sign_out(&self, token: &str) {
        if let Err(e) = self.provider.sign_out(token).await {
            error!(target: "pitchdesk::auth", "sign_out error (session treated as cleared): {}", e);
        }
    }

    /// Delegates reset delivery to the provider. Returns plain success or
    /// failure and never discloses whether the email exists.
    pub async fn reset_password(&self, email: &str) -> bool {
        match self.provider.reset_password_for_email(email).await {
            Ok(()) => true,
            Err(e) => {
                error!(target: "pitchdesk::auth", "reset_password error: {}", e);
                false
            }
        }
    }

    /// Pure read of role/approval. Fetch errors and missing rows both fail
    /// closed to non-admin instead of propagating.
    pub async fn check_role(&self, user_id: Uuid) -> RoleCheck {
        match self.profiles.get_by_id(user_id).await {
            Ok(Some(p)) => RoleCheck::from_profile(&p),
            Ok(None) => RoleCheck::denied(),
            Err(e) => {
                error!(target: "pitchdesk::auth", "check_role fetch error for {}: {}", user_id, e);
                RoleCheck::denied()
            }
        }
    }

    /// Resolve a live token into its user plus role snapshot. The profile
    /// fetch degrades (non-admin) rather than invalidating the session.
    pub async fn resolve_session(&self, token: &str) -> Result<(super::principal::AuthUser, RoleCheck), AuthError> {
        let user = self.provider.get_user(token).await?;
        let check = self.check_role(user.id).await;
        Ok((user, check))
    }

    /// Re-verify the current password through a credentials check, then
    /// rotate it at the provider.
    pub async fn change_password(&self, token: &str, current: &str, new_password: &str) -> Result<(), AuthError> {
        if new_password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::InvalidInput(format!(
                "password must be at least {} characters", MIN_PASSWORD_LEN
            )));
        }
        let user = self.provider.get_user(token).await?;
        let probe = self.provider.sign_in_with_password(&user.email, current).await
            .map_err(|_| AuthError::InvalidCredentials)?;
        // Drop the probe session; only the caller's token stays live.
        self.sign_out(&probe.token).await;
        self.provider.update_password(token, new_password).await
    }

    /// Provisioning hook: when the profile table is empty, create one
    /// approved admin account out of band. Returns true when seeding ran.
    pub async fn ensure_seed_admin(&self, email: &str, password: &str, name: &str) -> Result<bool, AuthError> {
        let count = self.profiles.count().await
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        if count > 0 { return Ok(false); }
        match self.sign_up(email, password, name).await? {
            SignUpOutcome::Admin(session) => {
                self.sign_out(&session.token).await;
                info!(target: "pitchdesk::auth", "seed admin provisioned: {}", email);
                Ok(true)
            }
            // count==0 was checked above; a concurrent signup beat us to the
            // bootstrap slot, which is fine: an admin now exists.
            SignUpOutcome::AwaitingApproval { .. } => Ok(false),
        }
    }
}
