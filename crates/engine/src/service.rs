//! Session-authenticated entry point to the ticket store.
//!
//! Every call presents a [`SessionToken`]. The service re-derives the
//! caller's role server-side, asks [`AuthorizationGate`], uploads any
//! attachment, and only then touches the [`TicketStore`]. A rejected or
//! failed call never reaches the store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use ticket_desk_core::{Email, Role, SubscriptionId, Ticket, TicketDraft, TicketId, TicketPatch};

use crate::auth::{AuthSessionManager, Session, SessionToken};
use crate::blob::{Attachment, BlobStore, upload_attachment};
use crate::config::EngineConfig;
use crate::error::{AuthError, ConflictError, NotFoundError, TicketError};
use crate::policy::{Action, AuthorizationGate, QueryScope, ScopePredicate};
use crate::store::{TicketStore, validate_draft};
use crate::subscription::{Subscription, SubscriptionEngine};

/// Wires authentication, policy, blob upload and storage together.
pub struct TicketService<B> {
    auth: Arc<AuthSessionManager>,
    store: Arc<TicketStore>,
    subscriptions: Arc<SubscriptionEngine>,
    blobs: B,
    upload_timeout: Duration,
}

impl<B: BlobStore> TicketService<B> {
    /// Build a service over existing components.
    ///
    /// The subscription engine is registered with `auth` so that ending a
    /// session closes its subscriptions.
    pub fn new(
        auth: Arc<AuthSessionManager>,
        store: Arc<TicketStore>,
        subscriptions: Arc<SubscriptionEngine>,
        blobs: B,
        config: &EngineConfig,
    ) -> Self {
        subscriptions.attach_to(&auth);
        Self {
            auth,
            store,
            subscriptions,
            blobs,
            upload_timeout: config.upload_timeout,
        }
    }

    #[must_use]
    pub fn auth(&self) -> &AuthSessionManager {
        &self.auth
    }

    #[must_use]
    pub fn store(&self) -> &TicketStore {
        &self.store
    }

    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionEngine {
        &self.subscriptions
    }

    #[must_use]
    pub const fn blobs(&self) -> &B {
        &self.blobs
    }

    /// Create a ticket owned by the caller.
    ///
    /// The draft is validated before any attachment is uploaded, so an
    /// invalid draft never leaves a stray blob behind.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` if the session is invalid or the draft sets
    /// support-only fields as a customer, `ValidationError` for a bad draft,
    /// or `StorageError` if the upload fails.
    #[instrument(skip_all)]
    pub async fn create(
        &self,
        token: &SessionToken,
        mut draft: TicketDraft,
        attachment: Option<Attachment>,
    ) -> Result<Ticket, TicketError> {
        let (session, role) = self.auth.validate(token)?;
        AuthorizationGate::authorize(role, &session.identity, Action::Create(&draft)).into_result()?;
        validate_draft(&draft)?;

        if let Some(attachment) = attachment {
            draft.attachment_ref = Some(self.upload(attachment).await?);
        }

        self.store.create(draft, session.identity)
    }

    /// Apply a patch to a ticket the caller may edit.
    ///
    /// An attachment, if given, replaces `attachmentRef` and is authorized
    /// as a content change.
    ///
    /// # Errors
    ///
    /// Returns `NotFoundError`, `AuthError::Forbidden`,
    /// `ValidationError::IllegalTransition`, `ConflictError::StaleVersion`
    /// or `StorageError` as the call progresses.
    #[instrument(skip(self, token, id, patch, attachment), fields(ticket_id = %id))]
    pub async fn update(
        &self,
        token: &SessionToken,
        id: TicketId,
        expected_version: u64,
        mut patch: TicketPatch,
        attachment: Option<Attachment>,
    ) -> Result<Ticket, TicketError> {
        let (session, role) = self.auth.validate(token)?;
        let ticket = self.store.get(id).ok_or(NotFoundError::TicketNotFound(id))?;

        let mut checked = patch.clone();
        if let Some(attachment) = &attachment {
            checked.attachment_ref = Some(attachment.name.clone());
        }
        AuthorizationGate::authorize(
            role,
            &session.identity,
            Action::Update {
                ticket: &ticket,
                patch: &checked,
            },
        )
        .into_result()?;

        // The decision above holds only for this version; the store's own
        // version check then pins the commit to it
        if ticket.version != expected_version {
            return Err(ConflictError::StaleVersion {
                expected: expected_version,
                current: ticket.version,
            }
            .into());
        }

        if let Some(attachment) = attachment {
            patch.attachment_ref = Some(self.upload(attachment).await?);
        }

        self.store.update(id, expected_version, &patch)
    }

    /// Delete a ticket the caller may delete.
    ///
    /// # Errors
    ///
    /// Returns `NotFoundError::TicketNotFound` or `AuthError`.
    #[instrument(skip(self, token, id), fields(ticket_id = %id))]
    pub fn delete(&self, token: &SessionToken, id: TicketId) -> Result<(), TicketError> {
        let (session, role) = self.auth.validate(token)?;
        let ticket = self.store.get(id).ok_or(NotFoundError::TicketNotFound(id))?;
        AuthorizationGate::authorize(role, &session.identity, Action::Delete(&ticket)).into_result()?;
        self.store.delete(id)
    }

    /// Fetch one ticket.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Forbidden` if a customer asks for someone else's
    /// ticket, or `AuthError::SessionExpired`.
    pub fn get(&self, token: &SessionToken, id: TicketId) -> Result<Option<Ticket>, TicketError> {
        let (session, role) = self.auth.validate(token)?;
        let Some(ticket) = self.store.get(id) else {
            return Ok(None);
        };
        AuthorizationGate::authorize(role, &session.identity, Action::Read(&ticket)).into_result()?;
        Ok(Some(ticket))
    }

    /// List tickets in a scope, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Forbidden` if a customer asks for `All`.
    pub fn query(&self, token: &SessionToken, scope: QueryScope) -> Result<Vec<Ticket>, TicketError> {
        let (session, role) = self.auth.validate(token)?;
        let predicate = AuthorizationGate::scope_for(role, &session.identity, scope)?;
        Ok(self.store.query(|ticket| predicate.matches(ticket)))
    }

    /// Open a live view of a scope. It closes when the session ends.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Forbidden` if a customer asks for `All`.
    pub fn subscribe(
        &self,
        token: &SessionToken,
        scope: QueryScope,
    ) -> Result<Subscription, TicketError> {
        let (session, role) = self.auth.validate(token)?;
        let predicate = AuthorizationGate::scope_for(role, &session.identity, scope)?;
        debug!(identity = %session.identity, ?scope, "Opening subscription");
        self.open_while_live(&session, predicate)
    }

    /// Register a subscription, then confirm the session outlived the
    /// registration.
    ///
    /// A logout that removed the session before the registration existed
    /// found nothing to close, so the subscription is closed here instead.
    fn open_while_live(
        &self,
        session: &Session,
        predicate: ScopePredicate,
    ) -> Result<Subscription, TicketError> {
        let subscription = self.subscriptions.open_for_session(session, predicate);
        if self.auth.current_session(&session.token).is_none() {
            self.subscriptions.close_subscription(subscription.id());
            return Err(AuthError::SessionExpired.into());
        }
        Ok(subscription)
    }

    /// Stop a subscription's delivery.
    pub fn close_subscription(&self, id: SubscriptionId) -> bool {
        self.subscriptions.close_subscription(id)
    }

    /// The identity and server-side role behind a token.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::SessionExpired` or `AuthError::RoleNotFound`.
    pub fn whoami(&self, token: &SessionToken) -> Result<(Email, Role), TicketError> {
        let (session, role) = self.auth.validate(token)?;
        Ok((session.identity, role))
    }

    async fn upload(&self, attachment: Attachment) -> Result<String, TicketError> {
        Ok(upload_attachment(&self.blobs, attachment, self.upload_timeout).await?)
    }
}
