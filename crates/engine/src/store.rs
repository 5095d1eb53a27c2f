//! The authoritative ticket collection.
//!
//! Every accepted write is committed under the store's write lock and its
//! event is published to the event log before the lock is released, so the
//! log order is the commit order. Readers clone `Arc`s out of the map and
//! never hold the lock while callers inspect results.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use ticket_desk_core::{Email, Phone, Ticket, TicketDraft, TicketId, TicketPatch, TicketStatus};

use crate::config::EngineConfig;
use crate::error::{ConflictError, NotFoundError, TicketError, ValidationError};
use crate::sync::{read, write};

/// What a committed write changed.
#[derive(Debug, Clone)]
pub enum Change {
    Created(Arc<Ticket>),
    Updated(Arc<Ticket>),
    Deleted(TicketId),
}

impl Change {
    /// The ticket the change applies to.
    #[must_use]
    pub fn ticket_id(&self) -> TicketId {
        match self {
            Self::Created(ticket) | Self::Updated(ticket) => ticket.id,
            Self::Deleted(id) => *id,
        }
    }
}

/// One entry of the store's event log.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// Position in commit order, starting at 1.
    pub seq: u64,
    pub change: Change,
}

struct Slot {
    /// Insertion position, used to order query results.
    inserted: u64,
    ticket: Arc<Ticket>,
}

#[derive(Default)]
struct StoreState {
    tickets: HashMap<TicketId, Slot>,
    next_insert: u64,
    next_seq: u64,
}

/// Server-side ticket collection with change notification.
pub struct TicketStore {
    state: RwLock<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl TicketStore {
    /// Create an empty store sized from configuration.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_capacity(config.subscription_buffer)
    }

    /// Create an empty store whose event log buffers `capacity` events per
    /// consumer.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            state: RwLock::new(StoreState::default()),
            events,
        }
    }

    /// Validate a draft and record a new ticket.
    ///
    /// # Errors
    ///
    /// Returns the first `ValidationError` found, checking title,
    /// description, contact email and phone in that order. Nothing is
    /// recorded on failure.
    #[instrument(skip(self, draft), fields(created_by = %created_by))]
    pub fn create(&self, draft: TicketDraft, created_by: Email) -> Result<Ticket, TicketError> {
        let (contact_email, phone) = validate_draft(&draft)?;

        let now = Utc::now();
        let ticket = Ticket {
            id: TicketId::generate(),
            title: draft.title,
            description: draft.description,
            priority: draft.priority,
            category: draft.category,
            status: TicketStatus::Open,
            created_by,
            assigned_to: draft.assigned_to,
            contact_email,
            phone,
            attachment_ref: draft.attachment_ref,
            agent_remarks: draft.agent_remarks,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let committed = Arc::new(ticket);

        let mut state = write(&self.state);
        state.next_insert += 1;
        let inserted = state.next_insert;
        state.tickets.insert(
            committed.id,
            Slot {
                inserted,
                ticket: Arc::clone(&committed),
            },
        );
        self.publish(&mut state, Change::Created(Arc::clone(&committed)));
        drop(state);

        info!(ticket_id = %committed.id, "Ticket created");
        Ok(Ticket::clone(&committed))
    }

    /// Apply a patch if the caller saw the current version.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingField` for an empty patch or a blank
    /// title or description, `NotFoundError::TicketNotFound` if the ticket is
    /// gone, `ConflictError::StaleVersion` if `expected_version` is behind,
    /// and `ValidationError::IllegalTransition` for a status change off the
    /// state machine.
    #[instrument(skip(self, id, patch), fields(ticket_id = %id))]
    pub fn update(
        &self,
        id: TicketId,
        expected_version: u64,
        patch: &TicketPatch,
    ) -> Result<Ticket, TicketError> {
        validate_patch(patch)?;

        let mut state = write(&self.state);
        let slot = state
            .tickets
            .get_mut(&id)
            .ok_or(NotFoundError::TicketNotFound(id))?;

        let current = slot.ticket.version;
        if expected_version != current {
            debug!(current, "Rejected stale update");
            return Err(ConflictError::StaleVersion {
                expected: expected_version,
                current,
            }
            .into());
        }

        if let Some(to) = patch.status {
            let from = slot.ticket.status;
            if from != to && !from.can_transition_to(to) {
                return Err(ValidationError::IllegalTransition { from, to }.into());
            }
        }

        let mut next = Ticket::clone(&slot.ticket);
        patch.apply_to(&mut next);
        next.version = current + 1;
        next.updated_at = Utc::now();

        let committed = Arc::new(next);
        slot.ticket = Arc::clone(&committed);
        self.publish(&mut state, Change::Updated(Arc::clone(&committed)));
        drop(state);

        info!(version = committed.version, "Ticket updated");
        Ok(Ticket::clone(&committed))
    }

    /// Remove a ticket. No tombstone is kept.
    ///
    /// # Errors
    ///
    /// Returns `NotFoundError::TicketNotFound` if the ticket does not exist.
    #[instrument(skip(self, id), fields(ticket_id = %id))]
    pub fn delete(&self, id: TicketId) -> Result<(), TicketError> {
        let mut state = write(&self.state);
        if state.tickets.remove(&id).is_none() {
            return Err(NotFoundError::TicketNotFound(id).into());
        }
        self.publish(&mut state, Change::Deleted(id));
        drop(state);

        info!("Ticket deleted");
        Ok(())
    }

    /// Fetch one ticket.
    #[must_use]
    pub fn get(&self, id: TicketId) -> Option<Ticket> {
        read(&self.state)
            .tickets
            .get(&id)
            .map(|slot| Ticket::clone(&slot.ticket))
    }

    /// All tickets matching `predicate`, in insertion order.
    pub fn query(&self, predicate: impl Fn(&Ticket) -> bool) -> Vec<Ticket> {
        let matching = {
            let state = read(&self.state);
            collect_ordered(&state, &predicate)
        };
        matching.iter().map(|ticket| Ticket::clone(ticket)).collect()
    }

    /// Number of stored tickets.
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.state).tickets.len()
    }

    /// Whether the store holds no tickets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Join the event log and take a snapshot at the same instant.
    ///
    /// Writers publish while holding the write lock, so every commit is
    /// either reflected in the snapshot or delivered on the receiver, never
    /// both and never neither.
    pub(crate) fn snapshot_and_subscribe(
        &self,
        predicate: impl Fn(&Ticket) -> bool,
    ) -> (Vec<Arc<Ticket>>, broadcast::Receiver<StoreEvent>) {
        let state = read(&self.state);
        let receiver = self.events.subscribe();
        let snapshot = collect_ordered(&state, &predicate);
        drop(state);
        (snapshot, receiver)
    }

    /// Snapshot without subscribing, for consumers that fell behind.
    ///
    /// Also returns the sequence number of the last commit it reflects.
    pub(crate) fn snapshot(&self, predicate: impl Fn(&Ticket) -> bool) -> (Vec<Arc<Ticket>>, u64) {
        let state = read(&self.state);
        (collect_ordered(&state, &predicate), state.next_seq)
    }

    fn publish(&self, state: &mut StoreState, change: Change) {
        state.next_seq += 1;
        // No receivers just means nobody is watching.
        let _ = self.events.send(StoreEvent {
            seq: state.next_seq,
            change,
        });
    }
}

fn collect_ordered(state: &StoreState, predicate: &impl Fn(&Ticket) -> bool) -> Vec<Arc<Ticket>> {
    let mut slots: Vec<&Slot> = state
        .tickets
        .values()
        .filter(|slot| predicate(&slot.ticket))
        .collect();
    slots.sort_by_key(|slot| slot.inserted);
    slots
        .into_iter()
        .map(|slot| Arc::clone(&slot.ticket))
        .collect()
}

/// Check a draft's required and contact fields.
///
/// # Errors
///
/// Returns the first violation in field order: title, description, contact
/// email, phone.
pub fn validate_draft(draft: &TicketDraft) -> Result<(Email, Phone), ValidationError> {
    if draft.title.trim().is_empty() {
        return Err(ValidationError::MissingField("title"));
    }
    if draft.description.trim().is_empty() {
        return Err(ValidationError::MissingField("description"));
    }
    if draft.contact_email.trim().is_empty() {
        return Err(ValidationError::MissingField("contactEmail"));
    }
    let contact_email = Email::parse(&draft.contact_email)?;
    let phone = Phone::parse(&draft.phone)?;

    Ok((contact_email, phone))
}

fn validate_patch(patch: &TicketPatch) -> Result<(), ValidationError> {
    if patch.is_empty() {
        return Err(ValidationError::MissingField("patch"));
    }
    if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(ValidationError::MissingField("title"));
    }
    if patch
        .description
        .as_deref()
        .is_some_and(|d| d.trim().is_empty())
    {
        return Err(ValidationError::MissingField("description"));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::sync::Barrier;

    use ticket_desk_core::{EmailError, PhoneError, Priority};

    use super::*;

    fn email(s: &str) -> Email {
        Email::parse(s).unwrap()
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

    fn status(to: TicketStatus) -> TicketPatch {
        TicketPatch {
            status: Some(to),
            ..TicketPatch::default()
        }
    }

    #[test]
    fn test_create_assigns_server_fields() {
        let store = TicketStore::with_capacity(16);
        let ticket = store.create(draft("Login fails"), email("a@x.com")).unwrap();

        assert_eq!(ticket.version, 1);
        assert_eq!(ticket.status, TicketStatus::Open);
        assert_eq!(ticket.priority, Priority::Medium);
        assert_eq!(ticket.created_at, ticket.updated_at);
        assert_eq!(store.get(ticket.id), Some(ticket));
    }

    #[test]
    fn test_create_validation_order() {
        let store = TicketStore::with_capacity(16);
        let owner = email("a@x.com");

        let mut bad = draft("  ");
        bad.contact_email = "nope".to_string();
        assert_eq!(
            store.create(bad, owner.clone()),
            Err(ValidationError::MissingField("title").into())
        );

        let mut bad = draft("Login fails");
        bad.contact_email = "nope".to_string();
        bad.phone = "123".to_string();
        assert_eq!(
            store.create(bad, owner.clone()),
            Err(ValidationError::InvalidEmail(EmailError::MissingAtSymbol).into())
        );

        let mut bad = draft("Login fails");
        bad.phone = "555123456".to_string();
        assert!(matches!(
            store.create(bad, owner.clone()),
            Err(TicketError::Validation(ValidationError::InvalidPhone(
                PhoneError::WrongLength { .. }
            )))
        ));

        let mut bad = draft("Login fails");
        bad.phone = "   ".to_string();
        assert_eq!(
            store.create(bad, owner),
            Err(ValidationError::InvalidPhone(PhoneError::Empty).into())
        );

        assert!(store.is_empty());
    }

    #[test]
    fn test_update_bumps_version() {
        let store = TicketStore::with_capacity(16);
        let ticket = store.create(draft("Login fails"), email("a@x.com")).unwrap();

        let updated = store
            .update(ticket.id, 1, &status(TicketStatus::InProgress))
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, TicketStatus::InProgress);
        assert!(updated.updated_at >= ticket.updated_at);
        assert_eq!(updated.created_by, ticket.created_by);
    }

    #[test]
    fn test_update_rejects_stale_version() {
        let store = TicketStore::with_capacity(16);
        let ticket = store.create(draft("Login fails"), email("a@x.com")).unwrap();
        store
            .update(ticket.id, 1, &status(TicketStatus::InProgress))
            .unwrap();

        let err = store
            .update(ticket.id, 1, &status(TicketStatus::Closed))
            .unwrap_err();
        assert_eq!(
            err,
            ConflictError::StaleVersion {
                expected: 1,
                current: 2
            }
            .into()
        );
        assert!(err.is_retryable());
        assert_eq!(store.get(ticket.id).unwrap().status, TicketStatus::InProgress);
    }

    #[test]
    fn test_update_rejects_illegal_transition() {
        let store = TicketStore::with_capacity(16);
        let ticket = store.create(draft("Login fails"), email("a@x.com")).unwrap();
        let err = store
            .update(ticket.id, 1, &status(TicketStatus::Closed))
            .unwrap_err();
        assert!(matches!(
            err,
            TicketError::Validation(ValidationError::IllegalTransition { .. })
        ));
        assert_eq!(store.get(ticket.id).unwrap().version, 1);
    }

    #[test]
    fn test_update_rejects_empty_patch() {
        let store = TicketStore::with_capacity(16);
        let ticket = store.create(draft("Login fails"), email("a@x.com")).unwrap();
        assert_eq!(
            store.update(ticket.id, 1, &TicketPatch::default()),
            Err(ValidationError::MissingField("patch").into())
        );
    }

    #[test]
    fn test_missing_ticket() {
        let store = TicketStore::with_capacity(16);
        let id = TicketId::generate();
        assert_eq!(
            store.update(id, 1, &status(TicketStatus::InProgress)),
            Err(NotFoundError::TicketNotFound(id).into())
        );
        assert_eq!(
            store.delete(id),
            Err(NotFoundError::TicketNotFound(id).into())
        );
    }

    #[test]
    fn test_delete_is_terminal() {
        let store = TicketStore::with_capacity(16);
        let ticket = store.create(draft("Login fails"), email("a@x.com")).unwrap();
        store.delete(ticket.id).unwrap();
        assert_eq!(store.get(ticket.id), None);
        assert!(store.delete(ticket.id).is_err());
    }

    #[test]
    fn test_query_keeps_insertion_order() {
        let store = TicketStore::with_capacity(16);
        let a = email("a@x.com");
        let b = email("b@x.com");
        let first = store.create(draft("first"), a.clone()).unwrap();
        store.create(draft("second"), b).unwrap();
        let third = store.create(draft("third"), a.clone()).unwrap();

        // Updating does not move a ticket
        store
            .update(first.id, 1, &status(TicketStatus::InProgress))
            .unwrap();

        let titles: Vec<String> = store
            .query(|t| t.is_owned_by(&a))
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, vec!["first", "third"]);
        assert_eq!(store.query(|_| true).len(), 3);
        assert_eq!(store.get(third.id).unwrap().title, "third");
    }

    #[test]
    fn test_events_follow_commit_order() {
        let store = TicketStore::with_capacity(16);
        let (snapshot, mut events) = store.snapshot_and_subscribe(|_| true);
        assert!(snapshot.is_empty());

        let ticket = store.create(draft("Login fails"), email("a@x.com")).unwrap();
        store
            .update(ticket.id, 1, &status(TicketStatus::InProgress))
            .unwrap();
        store.delete(ticket.id).unwrap();

        let first = events.try_recv().unwrap();
        assert_eq!(first.seq, 1);
        assert!(matches!(first.change, Change::Created(ref t) if t.version == 1));
        let second = events.try_recv().unwrap();
        assert!(matches!(second.change, Change::Updated(ref t) if t.version == 2));
        let third = events.try_recv().unwrap();
        assert!(matches!(third.change, Change::Deleted(id) if id == ticket.id));
        assert_eq!(third.seq, 3);
    }

    #[test]
    fn test_concurrent_same_version_updates() {
        let store = TicketStore::with_capacity(16);
        let ticket = store.create(draft("Login fails"), email("a@x.com")).unwrap();
        let barrier = Barrier::new(2);

        let results: Vec<Result<Ticket, TicketError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = [Priority::High, Priority::Low]
                .into_iter()
                .map(|priority| {
                    let store = &store;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        store.update(
                            ticket.id,
                            1,
                            &TicketPatch {
                                priority: Some(priority),
                                ..TicketPatch::default()
                            },
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners: Vec<&Ticket> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].version, 2);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(TicketError::Conflict(ConflictError::StaleVersion { .. }))
        )));
        assert_eq!(store.get(ticket.id).unwrap().version, 2);
    }
}
