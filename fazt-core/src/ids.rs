//! Prefixed identifiers
//!
//! Every externally visible id carries a `fazt_<kind>_` prefix followed by
//! twelve base62 characters, e.g. `fazt_usr_8fK2mQxP01aZ`. The prefix makes
//! ids self-describing in logs and lets credential scanners match tokens.

use rand::Rng;
use std::fmt;

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of the random suffix.
pub const SUFFIX_LEN: usize = 12;

/// Kinds of prefixed ids minted by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    /// User: `fazt_usr_*`
    User,
    /// Session: `fazt_ses_*`
    Session,
    /// API key: `fazt_tok_*`
    ApiKey,
    /// Invite: `fazt_inv_*`
    Invite,
    /// App: `fazt_app_*`
    App,
}

impl IdKind {
    /// The full prefix including trailing underscore.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::User => "fazt_usr_",
            Self::Session => "fazt_ses_",
            Self::ApiKey => "fazt_tok_",
            Self::Invite => "fazt_inv_",
            Self::App => "fazt_app_",
        }
    }
}

/// Mint a new id of the given kind.
pub fn generate(kind: IdKind) -> String {
    let mut rng = rand::rng();
    let mut out = String::with_capacity(kind.prefix().len() + SUFFIX_LEN);
    out.push_str(kind.prefix());
    for _ in 0..SUFFIX_LEN {
        out.push(BASE62[rng.random_range(0..BASE62.len())] as char);
    }
    out
}

/// Mint a longer random secret (used for session tokens and API key
/// secrets, where 12 chars is not enough entropy).
pub fn generate_secret(kind: IdKind, len: usize) -> String {
    let mut rng = rand::rng();
    let mut out = String::with_capacity(kind.prefix().len() + len);
    out.push_str(kind.prefix());
    for _ in 0..len {
        out.push(BASE62[rng.random_range(0..BASE62.len())] as char);
    }
    out
}

/// Check that `id` is well-formed for `kind`.
pub fn validate(kind: IdKind, id: &str) -> bool {
    let Some(suffix) = id.strip_prefix(kind.prefix()) else {
        return false;
    };
    !suffix.is_empty() && suffix.bytes().all(|b| BASE62.contains(&b))
}

/// Error type for id parsing.
#[derive(Debug, thiserror::Error)]
#[error("invalid id: expected prefix '{expected}'")]
pub struct IdError {
    /// The expected prefix.
    pub expected: &'static str,
}

/// A validated user id (`fazt_usr_*`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Mint a fresh user id.
    #[must_use]
    pub fn new() -> Self {
        Self(generate(IdKind::User))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if validate(IdKind::User, s) {
            Ok(Self(s.to_string()))
        } else {
            Err(IdError { expected: IdKind::User.prefix() })
        }
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_generate_shape() {
        let id = generate(IdKind::User);
        assert!(id.starts_with("fazt_usr_"));
        assert_eq!(id.len(), "fazt_usr_".len() + SUFFIX_LEN);
    }

    #[test]
    fn test_generate_uniqueness() {
        let a = generate(IdKind::Session);
        let b = generate(IdKind::Session);
        assert_ne!(a, b);
    }

    #[test]
    fn test_validate() {
        let id = generate(IdKind::ApiKey);
        assert!(validate(IdKind::ApiKey, &id));
        assert!(!validate(IdKind::User, &id));
        assert!(!validate(IdKind::ApiKey, "fazt_tok_"));
        assert!(!validate(IdKind::ApiKey, "fazt_tok_has spaces!"));
    }

    #[test]
    fn test_user_id_round_trip() {
        let id = UserId::new();
        let parsed = UserId::from_str(id.as_str()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_user_id_rejects_wrong_prefix() {
        assert!(UserId::from_str("fazt_ses_8fK2mQxP01aZ").is_err());
    }

    #[test]
    fn test_secret_length() {
        let s = generate_secret(IdKind::Session, 32);
        assert_eq!(s.len(), "fazt_ses_".len() + 32);
    }
}
