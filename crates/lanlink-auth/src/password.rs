//! Stored secret verification
//!
//! A stored password is either plain text, compared for exact equality, or
//! an Argon2 PHC string (`$argon2...`) produced by [`hash_password`].

use crate::{AuthError, AuthResult};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use tracing::warn;

const PHC_PREFIX: &str = "$argon2";

/// Argon2id hash suitable for the credentials file
pub fn hash_password(password: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hashing(e.to_string()))
}

/// Whether `presented` matches the `stored` secret
pub fn verify_secret(stored: &str, presented: &str) -> bool {
    if !stored.starts_with(PHC_PREFIX) {
        return stored == presented;
    }
    match PasswordHash::new(stored) {
        Ok(hash) => Argon2::default()
            .verify_password(presented.as_bytes(), &hash)
            .is_ok(),
        Err(e) => {
            warn!("Unparseable stored password hash: {}", e);
            false
        }
    }
}
