//! Users, sessions, invites, API keys
//!
//! Two credentials exist: the session cookie and bearer API keys. Roles are
//! owner > admin > user, with exactly zero or one owner enforced by a
//! partial unique index. Invites and OAuth states are single-use rows
//! consumed atomically.

mod api_keys;
mod invites;
mod oauth_state;
mod password;
mod sessions;
mod users;

pub use api_keys::{create_api_key, list_api_keys, revoke_api_key, verify_api_key, ApiKey};
pub use invites::{create_invite, redeem_invite, Invite};
pub use oauth_state::{create_state, validate_state};
pub use password::PasswordHasher;
pub use sessions::{create_session, delete_session, validate_session, Session, SESSION_TTL_SECS};
pub use users::{constant_work_login, count_users, create_user, get_user, get_user_by_username, list_users, promote, User};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User role, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Owner,
}

impl Role {
    /// Whether this role covers `required`.
    #[must_use]
    pub fn at_least(self, required: Role) -> bool {
        self >= required
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Admin => write!(f, "admin"),
            Self::Owner => write!(f, "owner"),
        }
    }
}

impl FromStr for Role {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            other => Err(crate::error::Error::Validation(format!("unknown role: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Owner.at_least(Role::Admin));
        assert!(Role::Admin.at_least(Role::User));
        assert!(!Role::User.at_least(Role::Admin));
        assert!(Role::Admin.at_least(Role::Admin));
    }

    #[test]
    fn test_role_round_trip() {
        for role in [Role::User, Role::Admin, Role::Owner] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
    }
}
