use serde::{Deserialize, Serialize};

use super::user::Role;

/// JWT payload used for authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,   // username
    pub role: Role,
    pub iat: i64,      // issued at (unix timestamp)
    pub exp: i64,      // expires at (unix timestamp)
    pub iss: String,
}

/// The `(username, role)` pair attached to an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub role: Role,
}

impl Identity {
    /// Identity used for every request while authentication is disabled.
    pub fn anonymous() -> Self {
        Self {
            username: "anonymous".into(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl From<Claims> for Identity {
    fn from(c: Claims) -> Self {
        Self {
            username: c.sub,
            role: c.role,
        }
    }
}
