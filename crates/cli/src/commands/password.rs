//! Password hashing for user directory provisioning.
//!
//! # Usage
//!
//! ```bash
//! td-cli hash-password --password 'correct-horse'
//! ```
//!
//! The hash is printed on stdout so it can be pasted into the
//! `password_hash` field of a directory entry.

use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use ticket_desk_engine::auth::{DirectoryError, hash_password};

/// Hash a password and print the PHC string.
///
/// # Errors
///
/// Returns `DirectoryError::WeakPassword` if the password is too short.
#[allow(clippy::print_stdout)]
pub fn hash(password: &SecretString) -> Result<(), DirectoryError> {
    let hash = hash_password(password.expose_secret())?;
    info!("Password hashed");
    println!("{hash}");
    Ok(())
}
