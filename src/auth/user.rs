use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Access level of a panel account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    /// Strict parse; `None` for anything other than `admin` or `user`.
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "user" => Some(Role::User),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User record as persisted in `users.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String, // argon2 PHC string
    pub role: Role,
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(
        default,
        with = "time::serde::timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_login_at: Option<OffsetDateTime>,
}

impl UserRecord {
    pub fn new(username: &str, password_hash: String, role: Role) -> Self {
        Self {
            username: username.to_string(),
            password_hash,
            role,
            created_at: OffsetDateTime::now_utc(),
            last_login_at: None,
        }
    }

    pub fn public(&self) -> PublicUser {
        PublicUser {
            username: self.username.clone(),
            role: self.role,
            created_at: self.created_at,
            last_login_at: self.last_login_at,
        }
    }
}

/// User view returned to clients, without the password hash.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PublicUser {
    pub username: String,
    pub role: Role,
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(
        with = "time::serde::timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_login_at: Option<OffsetDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parse_is_strict() {
        assert_eq!(Role::parse("admin"), Some(Role::Admin));
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse("Admin"), None);
        assert_eq!(Role::parse(""), None);
    }

    #[test]
    fn public_view_has_no_hash() {
        let rec = UserRecord::new("alice", "$argon2id$secret".into(), Role::User);
        let json = serde_json::to_string(&rec.public()).unwrap();
        assert!(json.contains("\"username\":\"alice\""));
        assert!(json.contains("\"role\":\"user\""));
        assert!(!json.contains("argon2"));
        assert!(!json.contains("last_login_at"));
    }
}
