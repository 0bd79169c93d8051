use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form attributes attached to an auth record at signup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserMetadata {
    #[serde(default)]
    pub name: Option<String>,
}

/// The identity record owned by the provider. Distinct from `profiles::Profile`,
/// which carries role/approval and lives in the application's own users table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub metadata: UserMetadata,
}

impl AuthUser {
    pub fn display_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or(&self.email)
    }
}
