//! Password hashing using Argon2id
//!
//! PHC string hashes; verification is constant-time via the argon2 crate.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher as Argon2Hasher, PasswordVerifier, SaltString},
    Argon2,
};

use crate::error::{Error, Result};

/// Minimum accepted password length.
const MIN_PASSWORD_LENGTH: usize = 8;

/// Password hasher using Argon2id with default parameters.
#[derive(Clone, Default)]
pub struct PasswordHasher;

impl PasswordHasher {
    /// Hash a password into a PHC string.
    ///
    /// # Errors
    ///
    /// Rejects passwords shorter than eight characters.
    pub fn hash(&self, password: &str) -> Result<String> {
        if password.len() < MIN_PASSWORD_LENGTH {
            return Err(Error::Validation(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters"
            )));
        }
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))?;
        Ok(hash.to_string())
    }

    /// Verify a password against a PHC hash.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| Error::Internal(format!("invalid password hash: {e}")))?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Internal(format!("password verification failed: {e}"))),
        }
    }
}
