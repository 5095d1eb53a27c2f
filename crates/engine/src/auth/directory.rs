//! Provisioned user accounts.
//!
//! Accounts are created out-of-band. The directory maps each email to an
//! Argon2id password hash and a role record; a record whose role is absent
//! or unrecognised still authenticates its password but cannot log in.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use ticket_desk_core::{Email, EmailError, Role};

/// Minimum password length.
const MIN_PASSWORD_LENGTH: usize = 8;

/// Hash checked when no account matches, so a miss costs one Argon2 run.
static ABSENT_ACCOUNT_HASH: LazyLock<Option<String>> =
    LazyLock::new(|| hash_password("no-such-account-placeholder").ok());

/// Errors that can occur while building a directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The directory file could not be read.
    #[error("failed to read user directory: {0}")]
    Io(#[from] std::io::Error),

    /// The directory file is not valid YAML.
    #[error("failed to parse user directory: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An account email is malformed.
    #[error("invalid email {email:?}: {source}")]
    InvalidEmail {
        /// The offending entry.
        email: String,
        /// Why it was rejected.
        source: EmailError,
    },

    /// Two accounts share an email.
    #[error("duplicate user: {0}")]
    DuplicateUser(Email),

    /// Password too weak.
    #[error("password validation failed: {0}")]
    WeakPassword(String),

    /// A password hash could not be produced or parsed.
    #[error("password hashing error")]
    PasswordHash,
}

/// A provisioned account.
#[derive(Debug, Clone)]
pub struct UserRecord {
    /// Account identity.
    pub email: Email,
    /// Role record; `None` when missing or unrecognised.
    pub role: Option<Role>,
    password_hash: String,
}

/// On-disk shape of a directory file.
#[derive(Debug, Deserialize)]
struct DirectoryFile {
    users: Vec<DirectoryEntry>,
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    email: String,
    #[serde(default)]
    role: Option<String>,
    password_hash: String,
}

/// The set of accounts allowed to authenticate.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: HashMap<Email, UserRecord>,
}

impl UserDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a directory from YAML.
    ///
    /// ```yaml
    /// users:
    ///   - email: a@x.com
    ///     role: customer
    ///     password_hash: "$argon2id$v=19$..."
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `DirectoryError` if the YAML is malformed, an email is invalid,
    /// an email appears twice, or a hash is not a PHC string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, DirectoryError> {
        let file: DirectoryFile = serde_yaml::from_str(yaml)?;
        let mut directory = Self::new();

        for entry in file.users {
            let email = Email::parse(&entry.email).map_err(|source| {
                DirectoryError::InvalidEmail {
                    email: entry.email.clone(),
                    source,
                }
            })?;

            PasswordHash::new(&entry.password_hash).map_err(|_| DirectoryError::PasswordHash)?;

            let role = entry.role.as_deref().and_then(|raw| {
                raw.parse::<Role>()
                    .inspect_err(|_| warn!(%email, role = raw, "Unrecognised role in directory"))
                    .ok()
            });

            directory.insert(UserRecord {
                email,
                role,
                password_hash: entry.password_hash,
            })?;
        }

        Ok(directory)
    }

    /// Read and parse a YAML directory file.
    ///
    /// # Errors
    ///
    /// Returns `DirectoryError::Io` if the file cannot be read, otherwise as
    /// [`from_yaml_str`](Self::from_yaml_str).
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Provision an account from a plain-text password.
    ///
    /// # Errors
    ///
    /// Returns `DirectoryError` if the password is too weak, hashing fails,
    /// or the email is already provisioned.
    pub fn add_user(
        &mut self,
        email: Email,
        role: Option<Role>,
        password: &str,
    ) -> Result<(), DirectoryError> {
        let password_hash = hash_password(password)?;
        self.insert(UserRecord {
            email,
            role,
            password_hash,
        })
    }

    fn insert(&mut self, record: UserRecord) -> Result<(), DirectoryError> {
        if self.users.contains_key(&record.email) {
            return Err(DirectoryError::DuplicateUser(record.email));
        }
        self.users.insert(record.email.clone(), record);
        Ok(())
    }

    /// Look up an account.
    #[must_use]
    pub fn get(&self, email: &Email) -> Option<&UserRecord> {
        self.users.get(email)
    }

    /// Number of provisioned accounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no accounts are provisioned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Iterate over all accounts.
    pub fn iter(&self) -> impl Iterator<Item = &UserRecord> {
        self.users.values()
    }
}

impl UserRecord {
    /// Whether `password` matches this account's hash.
    #[must_use]
    pub fn verify_password(&self, password: &str) -> bool {
        verify_password(password, &self.password_hash)
    }
}

/// Validate password meets requirements.
///
/// # Errors
///
/// Returns `DirectoryError::WeakPassword` if the password is too short.
pub fn validate_password(password: &str) -> Result<(), DirectoryError> {
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err(DirectoryError::WeakPassword(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }

    Ok(())
}

/// Hash a password using Argon2id.
///
/// # Errors
///
/// Returns `DirectoryError` if the password is too weak or hashing fails.
pub fn hash_password(password: &str) -> Result<String, DirectoryError> {
    validate_password(password)?;

    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| DirectoryError::PasswordHash)
}

/// Run a full verification against a fixed hash and discard the result.
///
/// Used on the unknown-account path so it takes as long as a wrong password.
pub(super) fn verify_absent_account(password: &str) {
    if let Some(hash) = ABSENT_ACCOUNT_HASH.as_deref() {
        let _ = verify_password(password, hash);
    }
}

/// Verify a password against a hash.
fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}
