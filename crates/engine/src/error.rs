//! Unified error handling for the ticket engine.
//!
//! Each component fails with one of the family enums below; [`TicketError`]
//! wraps them so `?` composes from the service layer down to the store.

use std::time::Duration;

use thiserror::Error;

use ticket_desk_core::{EmailError, PhoneError, TicketId, TicketStatus};

/// Input rejected before it reaches the store. Terminal for the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Contact email does not match the address grammar.
    #[error("invalid email: {0}")]
    InvalidEmail(#[from] EmailError),

    /// Contact phone is not exactly ten digits.
    #[error("invalid phone: {0}")]
    InvalidPhone(#[from] PhoneError),

    /// Requested status change does not follow a legal edge.
    #[error("illegal status transition from {from} to {to}")]
    IllegalTransition {
        /// Current status.
        from: TicketStatus,
        /// Requested status.
        to: TicketStatus,
    },
}

/// Identity and permission failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Unknown identity or wrong secret.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The identity has no recognised role record.
    #[error("role not found")]
    RoleNotFound,

    /// The role may not perform the action.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The session token is unknown, logged out, or past its validity window.
    #[error("session expired")]
    SessionExpired,
}

/// Lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotFoundError {
    /// No ticket with this id exists.
    #[error("ticket not found: {0}")]
    TicketNotFound(TicketId),
}

/// Concurrency failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    /// The caller's version is behind the stored one. Re-fetch and retry.
    #[error("stale version: expected {expected}, current is {current}")]
    StaleVersion {
        /// Version the caller based the change on.
        expected: u64,
        /// Version currently stored.
        current: u64,
    },

    /// A local mutation for this ticket is still awaiting confirmation.
    #[error("mutation already pending for ticket {0}")]
    PendingMutation(TicketId),
}

/// Attachment upload failures. The enclosing write is aborted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The blob store rejected or failed the upload.
    #[error("upload failed: {0}")]
    UploadFailed(String),

    /// The payload exceeds the attachment limit and was never sent.
    #[error("attachment is {size} bytes, limit is {max}")]
    PayloadTooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Maximum accepted size in bytes.
        max: usize,
    },

    /// The upload did not finish within the configured timeout.
    #[error("upload timed out after {0:?}")]
    Timeout(Duration),
}

/// Any failure surfaced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TicketError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TicketError {
    /// Whether re-fetching and retrying can succeed.
    ///
    /// Only a stale version qualifies; everything else is terminal for the call.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(ConflictError::StaleVersion { .. }))
    }
}

impl From<EmailError> for TicketError {
    fn from(err: EmailError) -> Self {
        Self::Validation(err.into())
    }
}

impl From<PhoneError> for TicketError {
    fn from(err: PhoneError) -> Self {
        Self::Validation(err.into())
    }
}
