mod login;
mod store;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use self::login::AuthClient;
pub use self::store::SessionStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Roles allowed to run the live camera monitor.
pub const MONITOR_ROLES: &[Role] = &[Role::Admin, Role::Teacher];

/// Profile persisted under `user_data` after a successful login.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
}

impl UserProfile {
    pub fn has_role(&self, roles: &[Role]) -> bool {
        roles.contains(&self.role)
    }
}

/// Supplies the bearer credential for outgoing requests.
///
/// Implementations are consulted on every request, so a rotated token takes
/// effect on the next call.
pub trait CredentialProvider: Send + Sync + 'static {
    fn bearer_token(&self) -> Option<String>;
}

/// A fixed credential, mostly useful for tests and one-off tooling.
#[derive(Clone, Debug, Default)]
pub struct StaticToken(pub Option<String>);

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}
