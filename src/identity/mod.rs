//! Account and session handling for PitchDesk: identity-provider contracts,
//! the coordination service that pairs provider calls with profile-row
//! access, and the per-application orchestrator state machine.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod provider;
mod remote;
mod service;
mod orchestrator;

pub use principal::{AuthUser, UserMetadata};
pub use session::{Session, SessionToken, SessionManager};
pub use provider::{IdentityProvider, LocalIdentityProvider, hash_password, verify_password};
pub use remote::{HttpIdentityProvider, RemoteIdentityConfig};
pub use service::{AuthService, SignedIn, SignUpOutcome, RoleCheck};
pub use orchestrator::{AuthOrchestrator, AuthState};
