//! Authentication and session lifecycle.
//!
//! [`AuthSessionManager`] verifies credentials against a [`UserDirectory`],
//! resolves exactly one role, and owns every live [`Session`]. Other
//! components register as [`SessionObserver`]s to be told when a session
//! ends so they can tear down whatever they built on it.

mod directory;
mod session;

pub use directory::{DirectoryError, UserDirectory, UserRecord, hash_password, validate_password};
pub use session::{Credentials, Session, SessionObserver, SessionToken};

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use secrecy::ExposeSecret;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use ticket_desk_core::{Email, Role};

use crate::config::EngineConfig;
use crate::error::AuthError;
use crate::sync::{read, write};

/// Owns sessions and resolves roles.
pub struct AuthSessionManager {
    directory: UserDirectory,
    sessions: RwLock<HashMap<SessionToken, Session>>,
    observers: RwLock<Vec<Weak<dyn SessionObserver>>>,
    ttl: TimeDelta,
}

impl AuthSessionManager {
    /// Create a manager over a provisioned directory.
    #[must_use]
    pub fn new(directory: UserDirectory, config: &EngineConfig) -> Self {
        Self::with_ttl(directory, config.session_ttl)
    }

    /// Create a manager with an explicit session validity window.
    #[must_use]
    pub fn with_ttl(directory: UserDirectory, ttl: Duration) -> Self {
        Self {
            directory,
            sessions: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Register an observer for session start and end.
    ///
    /// Only a weak reference is kept; dropped observers are pruned lazily.
    pub fn register_observer(&self, observer: Weak<dyn SessionObserver>) {
        write(&self.observers).push(observer);
    }

    /// Verify credentials and open a session.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidCredentials` if the email is malformed or
    /// unknown or the password is wrong.
    /// Returns `AuthError::RoleNotFound` if the account has no role record.
    #[instrument(skip(self, credentials), fields(identity = %credentials.email))]
    pub fn authenticate(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let record = Email::parse(&credentials.email)
            .ok()
            .and_then(|email| self.directory.get(&email));
        let Some(record) = record else {
            directory::verify_absent_account(credentials.password.expose_secret());
            debug!("Unknown account");
            return Err(AuthError::InvalidCredentials);
        };

        if !record.verify_password(credentials.password.expose_secret()) {
            debug!("Password mismatch");
            return Err(AuthError::InvalidCredentials);
        }

        let role = record.role.ok_or(AuthError::RoleNotFound)?;

        let issued_at = Utc::now();
        let session = Session {
            token: SessionToken::generate(),
            identity: record.email.clone(),
            role,
            issued_at,
            expires_at: issued_at
                .checked_add_signed(self.ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        write(&self.sessions).insert(session.token.clone(), session.clone());
        info!(%role, "Session started");

        for observer in self.live_observers() {
            observer.session_started(&session);
        }

        Ok(session)
    }

    /// Re-derive the session's role from the directory.
    ///
    /// The role carried on the session is never trusted for authorization.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::RoleNotFound` if the identity has no role record.
    pub fn resolve_role(&self, session: &Session) -> Result<Role, AuthError> {
        self.directory
            .get(&session.identity)
            .and_then(|record| record.role)
            .ok_or(AuthError::RoleNotFound)
    }

    /// Look up the live session for a token.
    ///
    /// A session found past its validity window is ended on the spot.
    #[must_use]
    pub fn current_session(&self, token: &SessionToken) -> Option<Session> {
        let session = read(&self.sessions).get(token).cloned()?;

        if session.is_expired_at(Utc::now()) {
            self.end_session(token, "expired");
            return None;
        }

        Some(session)
    }

    /// Resolve a presented token to its session and server-side role.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::SessionExpired` if the token has no live session.
    /// Returns `AuthError::RoleNotFound` if the identity lost its role record.
    pub fn validate(&self, token: &SessionToken) -> Result<(Session, Role), AuthError> {
        let session = self
            .current_session(token)
            .ok_or(AuthError::SessionExpired)?;
        let role = self.resolve_role(&session)?;
        Ok((session, role))
    }

    /// Require that a token belongs to a session with the given role.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Forbidden` if the resolved role differs, otherwise
    /// as [`validate`](Self::validate).
    pub fn require_role(&self, token: &SessionToken, required: Role) -> Result<Session, AuthError> {
        let (session, role) = self.validate(token)?;
        if role != required {
            return Err(AuthError::Forbidden(format!(
                "{required} role required, session has {role}"
            )));
        }
        Ok(session)
    }

    /// End a session. Calling it again for the same session does nothing.
    #[instrument(skip(self, session), fields(identity = %session.identity))]
    pub fn logout(&self, session: &Session) {
        self.end_session(&session.token, "logout");
    }

    /// End every session past its validity window.
    ///
    /// Returns the number of sessions ended.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<SessionToken> = read(&self.sessions)
            .values()
            .filter(|session| session.is_expired_at(now))
            .map(|session| session.token.clone())
            .collect();

        expired
            .iter()
            .filter(|token| self.end_session(token, "expired"))
            .count()
    }

    /// Sweep expired sessions on an interval until the manager is dropped.
    #[must_use]
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let purged = manager.purge_expired();
                if purged > 0 {
                    info!(purged, "Purged expired sessions");
                }
            }
        })
    }

    /// Number of live sessions, expired ones included until swept.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        read(&self.sessions).len()
    }

    /// Remove a session and notify observers. Returns whether it existed.
    fn end_session(&self, token: &SessionToken, reason: &'static str) -> bool {
        let Some(session) = write(&self.sessions).remove(token) else {
            return false;
        };

        info!(identity = %session.identity, reason, "Session ended");

        for observer in self.live_observers() {
            observer.session_ended(&session);
        }

        true
    }

    fn live_observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        let mut observers = write(&self.observers);
        let before = observers.len();
        observers.retain(|observer| observer.strong_count() > 0);
        if observers.len() < before {
            warn!(dropped = before - observers.len(), "Pruned dropped session observers");
        }
        observers.iter().filter_map(Weak::upgrade).collect()
    }
}
