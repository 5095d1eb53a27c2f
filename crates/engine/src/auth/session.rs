//! Session-related types for authentication.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use ticket_desk_core::{Email, Role};

/// Number of random bytes behind a session token.
const TOKEN_BYTES: usize = 32;

/// Opaque bearer token identifying a live session.
///
/// Implements `Debug` manually so tokens never end up in logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generate a fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; TOKEN_BYTES] = rand::random();
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Wrap a token presented by a caller.
    #[must_use]
    pub const fn from_presented(token: String) -> Self {
        Self(token)
    }

    /// Returns the token as a string slice, for handing back to the client.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

/// Login input.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Account email, parsed on authentication.
    pub email: String,
    /// Plain-text password.
    pub password: SecretString,
}

impl Credentials {
    /// Bundle an email and password.
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: SecretString::from(password.into()),
        }
    }
}

/// An authenticated session.
///
/// Owned by [`AuthSessionManager`](super::AuthSessionManager); other
/// components only ever hold copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Bearer token presented on every call.
    pub token: SessionToken,
    /// The authenticated user.
    pub identity: Email,
    /// Role resolved at login.
    pub role: Role,
    /// When the session was created.
    pub issued_at: DateTime<Utc>,
    /// When the session stops being valid.
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Whether the validity window has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Receives session lifecycle notifications.
///
/// Observers are called synchronously: when `logout` returns, every
/// observer has already seen `session_ended`.
pub trait SessionObserver: Send + Sync {
    /// A session was created.
    fn session_started(&self, _session: &Session) {}

    /// A session was logged out or expired.
    fn session_ended(&self, session: &Session);
}
