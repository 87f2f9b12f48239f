//! Authentication for points joining a switch
//!
//! Login requests are normalized into an [`Identity`] and checked against
//! the [`CredentialStore`].

pub mod identity;
pub mod password;
pub mod store;

pub use identity::Identity;
pub use password::{hash_password, verify_secret};
pub use store::{Credential, CredentialStore, Role};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The text of this error is returned to the peer
    #[error("Auth failed for {0}")]
    BadCredential(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Malformed login: {0}")]
    Malformed(String),

    #[error("Invalid credentials line {line}: {reason}")]
    InvalidEntry { line: usize, reason: String },

    #[error("Failed to read credentials: {0}")]
    Io(String),

    #[error("Password hashing failed: {0}")]
    Hashing(String),
}

pub type AuthResult<T> = Result<T, AuthError>;
