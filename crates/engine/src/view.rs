//! Client-side mirror of a subscription with optimistic mutations.
//!
//! A [`ClientViewCache`] is seeded from a subscription snapshot and kept
//! current by applying its diffs in arrival order. Local creates, updates
//! and deletes show up in the view immediately, tagged pending, and are
//! confirmed when the matching diff arrives or rolled back when the server
//! refuses them.
//!
//! Each id has at most one mutation in flight. A second attempt while the
//! first is still pending fails fast with `ConflictError::PendingMutation`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use tracing::{debug, info, instrument};

use ticket_desk_core::{Email, SubscriptionId, Ticket, TicketDraft, TicketId, TicketPatch, TicketStatus};

use crate::auth::SessionToken;
use crate::blob::{Attachment, BlobStore};
use crate::error::{AuthError, ConflictError, NotFoundError, TicketError};
use crate::policy::QueryScope;
use crate::service::TicketService;
use crate::store::validate_draft;
use crate::subscription::{Diff, DiffStream};

/// Where a locally initiated mutation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Applied locally, not yet confirmed by a diff.
    Pending,
    /// The server's diff matched the mutation.
    Confirmed,
    /// The server refused it and the local view was restored.
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    kind: PendingKind,
    /// Server version that confirms a create or update, once accepted.
    /// Deletes are confirmed by their `Removed` diff instead.
    awaiting: Option<u64>,
}

#[derive(Debug, Clone)]
struct Entry {
    /// Last state delivered by the server.
    confirmed: Option<Ticket>,
    /// What the viewer sees. `None` hides a ticket pending deletion.
    shown: Option<Ticket>,
    pending: Option<Pending>,
}

/// Ordered, optimistic view of one subscription scope.
pub struct ClientViewCache<B: BlobStore> {
    service: Arc<TicketService<B>>,
    token: SessionToken,
    identity: Email,
    subscription_id: SubscriptionId,
    diffs: Option<DiffStream>,
    order: Vec<TicketId>,
    entries: HashMap<TicketId, Entry>,
    outcomes: HashMap<TicketId, MutationState>,
}

impl<B: BlobStore> ClientViewCache<B> {
    /// Subscribe to `scope` and seed the view from the snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` if the session is invalid or the scope is not
    /// allowed for its role.
    pub fn open(
        service: Arc<TicketService<B>>,
        token: SessionToken,
        scope: QueryScope,
    ) -> Result<Self, TicketError> {
        let (identity, _) = service.whoami(&token)?;
        let subscription = service.subscribe(&token, scope)?;
        let (subscription_id, initial, diffs) = subscription.into_parts();

        let mut cache = Self {
            service,
            token,
            identity,
            subscription_id,
            diffs: Some(diffs),
            order: Vec::with_capacity(initial.len()),
            entries: HashMap::with_capacity(initial.len()),
            outcomes: HashMap::new(),
        };
        for ticket in initial {
            cache.order.push(ticket.id);
            cache.entries.insert(
                ticket.id,
                Entry {
                    confirmed: Some(ticket.clone()),
                    shown: Some(ticket),
                    pending: None,
                },
            );
        }
        Ok(cache)
    }

    /// Visible tickets in order, optimistic changes included.
    pub fn tickets(&self) -> impl Iterator<Item = &Ticket> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id)?.shown.as_ref())
    }

    #[must_use]
    pub fn get(&self, id: TicketId) -> Option<&Ticket> {
        self.entries.get(&id)?.shown.as_ref()
    }

    /// Number of visible tickets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tickets().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a mutation on `id` awaits confirmation.
    #[must_use]
    pub fn is_pending(&self, id: TicketId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.pending.is_some())
    }

    /// Outcome of the most recent mutation on `id`.
    #[must_use]
    pub fn mutation_state(&self, id: TicketId) -> Option<MutationState> {
        self.outcomes.get(&id).copied()
    }

    /// Whether the diff stream has ended and the view was discarded.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.diffs.is_none()
    }

    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Wait for the next diff, apply it and return it.
    ///
    /// Returns `None` once the subscription has ended; the view is then
    /// discarded.
    pub async fn next_diff(&mut self) -> Option<Diff> {
        let next = self.diffs.as_mut()?.next().await;
        self.accept(next)
    }

    /// Apply every diff that is already available without waiting.
    ///
    /// Returns how many were applied.
    pub fn drain_ready(&mut self) -> usize {
        let mut applied = 0;
        while let Some(stream) = self.diffs.as_mut() {
            let Some(next) = stream.next().now_or_never() else {
                break;
            };
            if self.accept(next).is_some() {
                applied += 1;
            }
        }
        applied
    }

    /// Stop the subscription and discard the view.
    pub fn close(&mut self) {
        self.service.close_subscription(self.subscription_id);
        self.discard();
    }

    /// Create a ticket, showing it immediately under a provisional id.
    ///
    /// On success the entry is re-keyed to the server id and stays pending
    /// until its `Added` diff arrives.
    ///
    /// # Errors
    ///
    /// Returns the server's refusal after removing the provisional entry,
    /// or `AuthError::SessionExpired` if the view is closed.
    #[instrument(skip_all, fields(identity = %self.identity))]
    pub async fn create(
        &mut self,
        draft: TicketDraft,
        attachment: Option<Attachment>,
    ) -> Result<Ticket, TicketError> {
        self.ensure_open()?;
        let provisional = self.provisional_ticket(&draft)?;
        let provisional_id = provisional.id;

        self.order.push(provisional_id);
        self.entries.insert(
            provisional_id,
            Entry {
                confirmed: None,
                shown: Some(provisional),
                pending: Some(Pending {
                    kind: PendingKind::Create,
                    awaiting: None,
                }),
            },
        );
        self.outcomes.insert(provisional_id, MutationState::Pending);

        match self.service.create(&self.token, draft, attachment).await {
            Ok(ticket) => {
                self.outcomes.remove(&provisional_id);
                self.rekey(provisional_id, &ticket);
                Ok(ticket)
            }
            Err(err) => {
                // The provisional id was never handed out, so nothing can ask about it
                debug!(error = %err, "Optimistic create rolled back");
                self.remove_entry(provisional_id);
                self.outcomes.remove(&provisional_id);
                Err(err)
            }
        }
    }

    /// Patch a visible ticket optimistically.
    ///
    /// # Errors
    ///
    /// Returns `ConflictError::PendingMutation` without contacting the server
    /// if `id` already has a mutation pending, `NotFoundError` if the ticket
    /// is not in the view, or the server's refusal after rolling back.
    #[instrument(skip(self, id, patch), fields(ticket_id = %id))]
    pub async fn update(&mut self, id: TicketId, patch: TicketPatch) -> Result<Ticket, TicketError> {
        let (expected_version, optimistic) = {
            let entry = self.claim(id)?;
            let current = entry.shown.as_ref().ok_or(NotFoundError::TicketNotFound(id))?;
            let mut optimistic = current.clone();
            patch.apply_to(&mut optimistic);
            (current.version, optimistic)
        };
        self.begin(id, PendingKind::Update, Some(optimistic));

        let result = self
            .service
            .update(&self.token, id, expected_version, patch, None)
            .await;
        match result {
            Ok(ticket) => {
                self.accepted(id, &ticket);
                Ok(ticket)
            }
            Err(err) => {
                self.roll_back(id, &err);
                Err(err)
            }
        }
    }

    /// Hide a ticket immediately and ask the server to delete it.
    ///
    /// # Errors
    ///
    /// As [`update`](Self::update).
    #[instrument(skip(self, id), fields(ticket_id = %id))]
    pub async fn delete(&mut self, id: TicketId) -> Result<(), TicketError> {
        {
            let entry = self.claim(id)?;
            if entry.shown.is_none() {
                return Err(NotFoundError::TicketNotFound(id).into());
            }
        }
        self.begin(id, PendingKind::Delete, None);

        match self.service.delete(&self.token, id) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.roll_back(id, &err);
                Err(err)
            }
        }
    }

    fn ensure_open(&self) -> Result<(), TicketError> {
        if self.is_closed() {
            return Err(AuthError::SessionExpired.into());
        }
        Ok(())
    }

    /// Check that `id` can take a new mutation and return its entry.
    fn claim(&mut self, id: TicketId) -> Result<&mut Entry, TicketError> {
        self.ensure_open()?;
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(NotFoundError::TicketNotFound(id))?;
        if entry.pending.is_some() {
            return Err(ConflictError::PendingMutation(id).into());
        }
        Ok(entry)
    }

    fn begin(&mut self, id: TicketId, kind: PendingKind, shown: Option<Ticket>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.shown = shown;
            entry.pending = Some(Pending {
                kind,
                awaiting: None,
            });
        }
        self.outcomes.insert(id, MutationState::Pending);
    }

    fn accepted(&mut self, id: TicketId, ticket: &Ticket) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.shown = Some(ticket.clone());
        if let Some(pending) = entry.pending.as_mut() {
            pending.awaiting = Some(ticket.version);
        }
    }

    fn roll_back(&mut self, id: TicketId, err: &TicketError) {
        debug!(ticket_id = %id, error = %err, "Optimistic mutation rolled back");
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.pending = None;
            entry.shown.clone_from(&entry.confirmed);
        }
        self.outcomes.insert(id, MutationState::RolledBack);
    }

    fn rekey(&mut self, provisional_id: TicketId, ticket: &Ticket) {
        if let Some(slot) = self.order.iter_mut().find(|id| **id == provisional_id) {
            *slot = ticket.id;
        }
        if let Some(mut entry) = self.entries.remove(&provisional_id) {
            entry.shown = Some(ticket.clone());
            entry.pending = Some(Pending {
                kind: PendingKind::Create,
                awaiting: Some(ticket.version),
            });
            self.entries.insert(ticket.id, entry);
        }
        self.outcomes.insert(ticket.id, MutationState::Pending);
    }

    fn provisional_ticket(&self, draft: &TicketDraft) -> Result<Ticket, TicketError> {
        let (contact_email, phone) = validate_draft(draft)?;
        let now = Utc::now();
        Ok(Ticket {
            id: TicketId::generate(),
            title: draft.title.clone(),
            description: draft.description.clone(),
            priority: draft.priority,
            category: draft.category,
            status: TicketStatus::Open,
            created_by: self.identity.clone(),
            assigned_to: draft.assigned_to.clone(),
            contact_email,
            phone,
            attachment_ref: draft.attachment_ref.clone(),
            agent_remarks: draft.agent_remarks.clone(),
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    fn accept(&mut self, next: Option<Diff>) -> Option<Diff> {
        let Some(diff) = next else {
            self.discard();
            return None;
        };
        self.apply(&diff);
        Some(diff)
    }

    fn apply(&mut self, diff: &Diff) {
        match diff {
            Diff::Added(ticket) | Diff::Modified(ticket) => self.apply_ticket(ticket),
            Diff::Removed(id) => {
                let Some(entry) = self.remove_entry(*id) else {
                    return;
                };
                match entry.pending {
                    Some(Pending {
                        kind: PendingKind::Delete,
                        ..
                    }) => {
                        self.outcomes.insert(*id, MutationState::Confirmed);
                    }
                    // Deleted elsewhere while a local edit was in flight
                    Some(_) => {
                        self.outcomes.remove(id);
                    }
                    None => {}
                }
            }
        }
    }

    fn apply_ticket(&mut self, ticket: &Ticket) {
        let id = ticket.id;
        let Some(entry) = self.entries.get_mut(&id) else {
            self.order.push(id);
            self.entries.insert(
                id,
                Entry {
                    confirmed: Some(ticket.clone()),
                    shown: Some(ticket.clone()),
                    pending: None,
                },
            );
            return;
        };

        entry.confirmed = Some(ticket.clone());
        match entry.pending {
            None => entry.shown = Some(ticket.clone()),
            Some(Pending {
                kind: PendingKind::Create | PendingKind::Update,
                awaiting: Some(version),
            }) if ticket.version >= version => {
                entry.pending = None;
                entry.shown = Some(ticket.clone());
                self.outcomes.insert(id, MutationState::Confirmed);
            }
            // Still waiting: keep showing the optimistic state
            Some(_) => {}
        }
    }

    fn remove_entry(&mut self, id: TicketId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        self.order.retain(|existing| *existing != id);
        Some(entry)
    }

    fn discard(&mut self) {
        if self.diffs.take().is_some() {
            info!(subscription_id = %self.subscription_id, "Client view discarded");
        }
        self.order.clear();
        self.entries.clear();
        self.outcomes.clear();
    }
}

impl<B: BlobStore> Drop for ClientViewCache<B> {
    fn drop(&mut self) {
        if self.diffs.is_some() {
            self.service.close_subscription(self.subscription_id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use ticket_desk_core::Role;

    use super::*;
    use crate::auth::{AuthSessionManager, Credentials, UserDirectory};
    use crate::blob::MemoryBlobStore;
    use crate::config::EngineConfig;
    use crate::error::ValidationError;
    use crate::store::TicketStore;
    use crate::subscription::SubscriptionEngine;

    const PASSWORD: &str = "correct-horse";

    fn service() -> Arc<TicketService<MemoryBlobStore>> {
        let mut directory = UserDirectory::new();
        for (email, role) in [("a@x.com", Role::Customer), ("agent@x.com", Role::Support)] {
            directory
                .add_user(Email::parse(email).unwrap(), Some(role), PASSWORD)
                .unwrap();
        }
        let config = EngineConfig::default();
        let auth = Arc::new(AuthSessionManager::new(directory, &config));
        let store = Arc::new(TicketStore::new(&config));
        let subscriptions = Arc::new(SubscriptionEngine::new(Arc::clone(&store)));
        Arc::new(TicketService::new(
            auth,
            store,
            subscriptions,
            MemoryBlobStore::new(),
            &config,
        ))
    }

    fn login(service: &TicketService<MemoryBlobStore>, email: &str) -> SessionToken {
        service
            .auth()
            .authenticate(&Credentials::new(email, PASSWORD))
            .unwrap()
            .token
    }

    fn draft(title: &str) -> TicketDraft {
        TicketDraft {
            title: title.to_string(),
            description: "Cannot sign in".to_string(),
            contact_email: "a@x.com".to_string(),
            phone: "5551234567".to_string(),
            ..TicketDraft::default()
        }
    }

    async fn settle<B: BlobStore>(cache: &mut ClientViewCache<B>) -> Diff {
        tokio::time::timeout(Duration::from_secs(1), cache.next_diff())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_optimistic_create_confirms_on_diff() {
        let service = service();
        let a = login(&service, "a@x.com");
        let mut cache = ClientViewCache::open(Arc::clone(&service), a, QueryScope::Own).unwrap();

        let ticket = cache.create(draft("Login fails"), None).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.is_pending(ticket.id));
        assert_eq!(cache.mutation_state(ticket.id), Some(MutationState::Pending));

        assert_eq!(settle(&mut cache).await, Diff::Added(ticket.clone()));
        assert!(!cache.is_pending(ticket.id));
        assert_eq!(cache.mutation_state(ticket.id), Some(MutationState::Confirmed));
        assert_eq!(cache.get(ticket.id), Some(&ticket));
    }

    #[tokio::test]
    async fn test_invalid_create_is_never_shown() {
        let service = service();
        let a = login(&service, "a@x.com");
        let mut cache = ClientViewCache::open(Arc::clone(&service), a, QueryScope::Own).unwrap();

        let mut bad = draft("Login fails");
        bad.contact_email = "not-an-email".to_string();
        assert!(matches!(
            cache.create(bad, None).await,
            Err(TicketError::Validation(ValidationError::InvalidEmail(_)))
        ));
        assert!(cache.is_empty());
        assert_eq!(cache.drain_ready(), 0);
    }

    #[tokio::test]
    async fn test_refused_creates_leave_no_outcomes() {
        let service = service();
        let a = login(&service, "a@x.com");
        let mut cache = ClientViewCache::open(Arc::clone(&service), a, QueryScope::Own).unwrap();

        // Passes local validation, so each attempt is shown before the server refuses it
        for _ in 0..3 {
            let mut assigned = draft("Login fails");
            assigned.assigned_to = Some("agent1".to_string());
            let err = cache.create(assigned, None).await.unwrap_err();
            assert!(matches!(err, TicketError::Auth(AuthError::Forbidden(_))));
        }

        assert!(cache.is_empty());
        assert!(cache.order.is_empty());
        assert!(cache.outcomes.is_empty());
        assert_eq!(cache.drain_ready(), 0);
    }

    #[tokio::test]
    async fn test_refused_update_rolls_back() {
        let service = service();
        let a = login(&service, "a@x.com");
        let mut cache = ClientViewCache::open(Arc::clone(&service), a, QueryScope::Own).unwrap();
        let ticket = cache.create(draft("Login fails"), None).await.unwrap();
        settle(&mut cache).await;

        // Customers may not drive status
        let patch = TicketPatch {
            status: Some(TicketStatus::InProgress),
            ..TicketPatch::default()
        };
        let err = cache.update(ticket.id, patch).await.unwrap_err();
        assert!(matches!(err, TicketError::Auth(AuthError::Forbidden(_))));
        assert_eq!(cache.get(ticket.id), Some(&ticket));
        assert_eq!(
            cache.mutation_state(ticket.id),
            Some(MutationState::RolledBack)
        );
    }

    #[tokio::test]
    async fn test_second_mutation_fails_fast() {
        let service = service();
        let a = login(&service, "a@x.com");
        let mut cache = ClientViewCache::open(Arc::clone(&service), a, QueryScope::Own).unwrap();
        let ticket = cache.create(draft("Login fails"), None).await.unwrap();
        settle(&mut cache).await;

        let retitle = TicketPatch {
            title: Some("Still failing".to_string()),
            ..TicketPatch::default()
        };
        let updated = cache.update(ticket.id, retitle.clone()).await.unwrap();
        assert_eq!(cache.get(ticket.id).unwrap().title, "Still failing");

        // The Modified diff has not been applied yet
        assert_eq!(
            cache.update(ticket.id, retitle).await,
            Err(ConflictError::PendingMutation(ticket.id).into())
        );
        assert_eq!(
            cache.delete(ticket.id).await,
            Err(ConflictError::PendingMutation(ticket.id).into())
        );

        assert_eq!(settle(&mut cache).await, Diff::Modified(updated));
        assert_eq!(cache.mutation_state(ticket.id), Some(MutationState::Confirmed));
    }

    #[tokio::test]
    async fn test_optimistic_delete() {
        let service = service();
        let a = login(&service, "a@x.com");
        let mut cache = ClientViewCache::open(Arc::clone(&service), a, QueryScope::Own).unwrap();
        let ticket = cache.create(draft("Login fails"), None).await.unwrap();
        settle(&mut cache).await;

        cache.delete(ticket.id).await.unwrap();
        assert_eq!(cache.get(ticket.id), None);
        assert!(cache.is_pending(ticket.id));

        assert_eq!(settle(&mut cache).await, Diff::Removed(ticket.id));
        assert!(cache.is_empty());
        assert_eq!(cache.mutation_state(ticket.id), Some(MutationState::Confirmed));
    }

    #[tokio::test]
    async fn test_remote_changes_flow_in() {
        let service = service();
        let a = login(&service, "a@x.com");
        let agent = login(&service, "agent@x.com");
        let mut cache =
            ClientViewCache::open(Arc::clone(&service), agent.clone(), QueryScope::All).unwrap();

        let ticket = service.create(&a, draft("Login fails"), None).await.unwrap();
        let patch = TicketPatch {
            status: Some(TicketStatus::InProgress),
            ..TicketPatch::default()
        };
        service
            .update(&agent, ticket.id, 1, patch, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.drain_ready(), 2);
        assert_eq!(cache.get(ticket.id).unwrap().version, 2);
        assert_eq!(cache.mutation_state(ticket.id), None);
    }

    #[tokio::test]
    async fn test_logout_discards_view() {
        let service = service();
        let a = login(&service, "a@x.com");
        let mut cache =
            ClientViewCache::open(Arc::clone(&service), a.clone(), QueryScope::Own).unwrap();
        cache.create(draft("Login fails"), None).await.unwrap();
        settle(&mut cache).await;

        let session = service.auth().current_session(&a).unwrap();
        service.auth().logout(&session);

        assert_eq!(cache.next_diff().await, None);
        assert!(cache.is_closed());
        assert!(cache.is_empty());
        assert!(cache.outcomes.is_empty());
        assert_eq!(
            cache.create(draft("again"), None).await,
            Err(AuthError::SessionExpired.into())
        );
        assert_eq!(service.subscriptions().active_subscriptions(), 0);
    }
}
