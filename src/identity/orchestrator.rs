//! Per-application-instance auth state machine. One orchestrator is
//! constructed at startup and handed to the UI layer by reference; it owns
//! the single cached session and publishes state transitions over a watch
//! channel. There are no process-global session singletons.

use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::error::AuthError;
use crate::profiles::Role;
use super::principal::AuthUser;
use super::service::{AuthService, RoleCheck, SignUpOutcome};
use super::session::Session;

/// Observable auth lifecycle. `Unknown` only exists between construction and
/// the first `restore_session` call.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    Unknown,
    Anonymous,
    /// A sign-in or sign-up call is in flight; the UI must not submit again.
    Authenticating,
    /// Valid session, profile exists, approval still pending. Every
    /// protected action is denied in this state.
    AuthenticatedPending { user: AuthUser },
    AuthenticatedApproved { user: AuthUser, role: Role },
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::AuthenticatedPending { .. } | AuthState::AuthenticatedApproved { .. })
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, AuthState::AuthenticatedApproved { role: Role::Admin, .. })
    }
}

pub struct AuthOrchestrator {
    service: Arc<AuthService>,
    session: RwLock<Option<Session>>,
    state_tx: watch::Sender<AuthState>,
}

impl AuthOrchestrator {
    pub fn new(service: Arc<AuthService>) -> Self {
        let (state_tx, _rx) = watch::channel(AuthState::Unknown);
        Self { service, session: RwLock::new(None), state_tx }
    }

    /// Subscribe to state transitions. The receiver immediately observes the
    /// current state.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> { self.state_tx.subscribe() }

    pub fn state(&self) -> AuthState { self.state_tx.borrow().clone() }

    pub async fn session(&self) -> Option<Session> { self.session.read().await.clone() }

    fn publish(&self, state: AuthState) { let _ = self.state_tx.send_replace(state); }

    fn state_for(user: AuthUser, check: RoleCheck) -> AuthState {
        // A failed profile fetch (is_approved unknown) keeps the session
        // valid with role degraded to non-admin; route-level gating still
        // applies downstream.
        if check.is_approved == Some(false) {
            AuthState::AuthenticatedPending { user }
        } else {
            let role = if check.is_admin { Role::Admin } else { Role::User };
            AuthState::AuthenticatedApproved { user, role }
        }
    }

    /// Called once at startup with whatever session the client persisted.
    /// An invalid or absent session resolves to `Anonymous`; a live one is
    /// re-validated against the provider and the profile row.
    pub async fn restore_session(&self, persisted: Option<Session>) {
        let Some(sess) = persisted else {
            self.publish(AuthState::Anonymous);
            return;
        };
        match self.service.resolve_session(&sess.token).await {
            Ok((user, check)) => {
                *self.session.write().await = Some(sess);
                self.publish(Self::state_for(user, check));
            }
            Err(e) => {
                tracing::info!(target: "pitchdesk::auth", "restore_session: stale session dropped: {}", e);
                *self.session.write().await = None;
                self.publish(AuthState::Anonymous);
            }
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Role, AuthError> {
        self.publish(AuthState::Authenticating);
        match self.service.sign_in(email, password).await {
            Ok(signed) => {
                let user = signed.session.user.clone();
                let role = signed.role;
                *self.session.write().await = Some(signed.session);
                self.publish(AuthState::AuthenticatedApproved { user, role });
                Ok(role)
            }
            Err(e) => {
                *self.session.write().await = None;
                self.publish(AuthState::Anonymous);
                Err(e)
            }
        }
    }

    pub async fn sign_up(&self, email: &str, password: &str, name: &str) -> Result<SignUpOutcome, AuthError> {
        self.publish(AuthState::Authenticating);
        match self.service.sign_up(email, password, name).await {
            Ok(SignUpOutcome::Admin(session)) => {
                let user = session.user.clone();
                *self.session.write().await = Some(session.clone());
                self.publish(AuthState::AuthenticatedApproved { user, role: Role::Admin });
                Ok(SignUpOutcome::Admin(session))
            }
            Ok(outcome @ SignUpOutcome::AwaitingApproval { .. }) => {
                *self.session.write().await = None;
                self.publish(AuthState::Anonymous);
                Ok(outcome)
            }
            Err(e) => {
                *self.session.write().await = None;
                self.publish(AuthState::Anonymous);
                Err(e)
            }
        }
    }

    /// Clears local state unconditionally; provider failures are logged by
    /// the service and do not surface here.
    pub async fn sign_out(&self) {
        let token = self.session.write().await.take().map(|s| s.token);
        if let Some(token) = token {
            self.service.sign_out(&token).await;
        }
        self.publish(AuthState::Anonymous);
    }

    pub async fn reset_password(&self, email: &str) -> bool {
        self.service.reset_password(email).await
    }

    pub async fn check_role(&self, user_id: Uuid) -> RoleCheck {
        self.service.check_role(user_id).await
    }

    pub async fn change_password(&self, current: &str, new_password: &str) -> Result<(), AuthError> {
        let token = self.session.read().await.as_ref().map(|s| s.token.clone());
        let Some(token) = token else { return Err(AuthError::InvalidCredentials); };
        self.service.change_password(&token, current, new_password).await
    }
}
