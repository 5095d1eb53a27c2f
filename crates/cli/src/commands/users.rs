//! User directory validation.
//!
//! # Usage
//!
//! ```bash
//! td-cli users check users.yaml
//! ```
//!
//! # File format
//!
//! ```yaml
//! users:
//!   - email: a@x.com
//!     role: customer
//!     password_hash: "$argon2id$v=19$m=19456,t=2,p=1$..."
//! ```

use std::path::Path;

use tracing::{info, warn};

use ticket_desk_core::Role;
use ticket_desk_engine::auth::{DirectoryError, UserDirectory};

/// Load a directory file and report what it provisions.
///
/// Accounts without a usable role are reported but do not fail the check;
/// they will be refused at login.
///
/// # Errors
///
/// Returns `DirectoryError` if the file cannot be read or any entry is invalid.
pub fn check(path: &Path) -> Result<(), DirectoryError> {
    info!(path = %path.display(), "Checking user directory");
    let directory = UserDirectory::load(path)?;

    let mut customers = 0;
    let mut support = 0;
    for record in directory.iter() {
        match record.role {
            Some(Role::Customer) => customers += 1,
            Some(Role::Support) => support += 1,
            None => warn!(email = %record.email, "Account has no recognised role and cannot log in"),
        }
    }

    info!(
        total = directory.len(),
        customers, support, "User directory is valid"
    );
    Ok(())
}
