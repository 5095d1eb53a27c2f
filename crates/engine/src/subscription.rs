//! Live, scope-filtered views of the ticket store.
//!
//! A subscription is an initial snapshot plus a lazy stream of [`Diff`]s
//! read from the store's event log. Each subscription remembers the
//! versions it has seen, so nothing in the snapshot is delivered twice and
//! a consumer that falls behind the log catches up from a fresh snapshot
//! instead of missing changes.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, RwLock, Weak};
use std::task::{Context, Poll};

use async_stream::stream;
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use ticket_desk_core::{SubscriptionId, Ticket, TicketId};

use crate::auth::{AuthSessionManager, Session, SessionObserver, SessionToken};
use crate::policy::ScopePredicate;
use crate::store::{Change, StoreEvent, TicketStore};
use crate::sync::{read, write};

/// An incremental change delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diff {
    /// A ticket entered the scope.
    Added(Ticket),
    /// A ticket already in scope changed.
    Modified(Ticket),
    /// A ticket left the scope or was deleted.
    Removed(TicketId),
}

impl Diff {
    #[must_use]
    pub fn ticket_id(&self) -> TicketId {
        match self {
            Self::Added(ticket) | Self::Modified(ticket) => ticket.id,
            Self::Removed(id) => *id,
        }
    }
}

/// The diff half of a subscription.
pub type DiffStream = Pin<Box<dyn Stream<Item = Diff> + Send>>;

/// An open subscription: its snapshot and the diffs that follow it.
///
/// The subscription is itself a `Stream` of diffs. It ends when closed,
/// when its session ends, or when the store is dropped.
pub struct Subscription {
    id: SubscriptionId,
    initial: Vec<Ticket>,
    diffs: DiffStream,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Tickets in scope when the subscription opened, in insertion order.
    #[must_use]
    pub fn initial_snapshot(&self) -> &[Ticket] {
        &self.initial
    }

    /// Split into id, snapshot and diff stream.
    #[must_use]
    pub fn into_parts(self) -> (SubscriptionId, Vec<Ticket>, DiffStream) {
        (self.id, self.initial, self.diffs)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("initial", &self.initial.len())
            .finish_non_exhaustive()
    }
}

impl Stream for Subscription {
    type Item = Diff;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Diff>> {
        self.diffs.as_mut().poll_next(cx)
    }
}

struct Registration {
    owner: Option<SessionToken>,
    closer: watch::Sender<bool>,
}

type Registry = RwLock<HashMap<SubscriptionId, Registration>>;

/// Opens and closes subscriptions over one store.
pub struct SubscriptionEngine {
    store: Arc<TicketStore>,
    registry: Arc<Registry>,
}

impl SubscriptionEngine {
    #[must_use]
    pub fn new(store: Arc<TicketStore>) -> Self {
        Self {
            store,
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Close subscriptions automatically when their session ends.
    pub fn attach_to(self: &Arc<Self>, auth: &AuthSessionManager) {
        let observer: Weak<dyn SessionObserver> = Arc::<Self>::downgrade(self);
        auth.register_observer(observer);
    }

    /// Open a subscription not tied to any session.
    #[must_use]
    pub fn open_subscription(&self, predicate: ScopePredicate) -> Subscription {
        self.open(predicate, None)
    }

    /// Open a subscription that closes when `session` ends.
    #[must_use]
    pub fn open_for_session(&self, session: &Session, predicate: ScopePredicate) -> Subscription {
        self.open(predicate, Some(session.token.clone()))
    }

    /// Stop delivery on a subscription. Returns whether it was open.
    ///
    /// Once this returns the stream yields no further diffs.
    pub fn close_subscription(&self, id: SubscriptionId) -> bool {
        let Some(registration) = write(&self.registry).remove(&id) else {
            return false;
        };
        registration.closer.send_replace(true);
        debug!(subscription_id = %id, "Subscription closed");
        true
    }

    /// Number of subscriptions still open.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        read(&self.registry).len()
    }

    /// Close every subscription owned by a session token.
    ///
    /// Returns how many were closed.
    pub fn close_for_session(&self, token: &SessionToken) -> usize {
        let owned: Vec<Registration> = {
            let mut registry = write(&self.registry);
            let ids: Vec<SubscriptionId> = registry
                .iter()
                .filter(|(_, reg)| reg.owner.as_ref() == Some(token))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| registry.remove(id)).collect()
        };

        for registration in &owned {
            registration.closer.send_replace(true);
        }
        owned.len()
    }

    fn open(&self, predicate: ScopePredicate, owner: Option<SessionToken>) -> Subscription {
        let id = SubscriptionId::generate();
        let (closer, closed) = watch::channel(false);

        let (snapshot, events) = self
            .store
            .snapshot_and_subscribe(|ticket| predicate.matches(ticket));

        let mut view = ScopeView::new(predicate);
        view.seed(&snapshot);
        let initial: Vec<Ticket> = snapshot.iter().map(|t| Ticket::clone(t)).collect();

        write(&self.registry).insert(id, Registration { owner, closer });
        info!(subscription_id = %id, initial = initial.len(), "Subscription opened");

        let guard = Deregister {
            id,
            registry: Arc::downgrade(&self.registry),
        };
        let diffs = diff_stream(
            Arc::downgrade(&self.store),
            view,
            events,
            closed,
            guard,
        );

        Subscription {
            id,
            initial,
            diffs: Box::pin(diffs),
        }
    }
}

impl SessionObserver for SubscriptionEngine {
    fn session_ended(&self, session: &Session) {
        let closed = self.close_for_session(&session.token);
        if closed > 0 {
            info!(identity = %session.identity, closed, "Closed subscriptions for ended session");
        }
    }
}

/// Removes a registration once its stream is dropped.
struct Deregister {
    id: SubscriptionId,
    registry: Weak<Registry>,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            write(&registry).remove(&self.id);
        }
    }
}

fn is_closed(closed: &watch::Receiver<bool>) -> bool {
    *closed.borrow()
}

fn diff_stream(
    store: Weak<TicketStore>,
    mut view: ScopeView,
    mut events: broadcast::Receiver<StoreEvent>,
    mut closed: watch::Receiver<bool>,
    guard: Deregister,
) -> impl Stream<Item = Diff> + Send {
    stream! {
        let guard = guard;
        let subscription_id = guard.id;
        // Events at or below this sequence are already in the last resync
        let mut resynced_at = 0;

        'deliver: loop {
            if is_closed(&closed) {
                break;
            }

            let received = tokio::select! {
                biased;
                _ = closed.changed() => break,
                received = events.recv() => received,
            };

            match received {
                Ok(event) if event.seq <= resynced_at => {}
                Ok(event) => {
                    if let Some(diff) = view.apply(event.change) {
                        if is_closed(&closed) {
                            break;
                        }
                        yield diff;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%subscription_id, skipped, "Subscriber lagged, resynchronising");
                    let Some(store) = store.upgrade() else {
                        break;
                    };
                    let (snapshot, seq) = store.snapshot(|_| true);
                    drop(store);
                    resynced_at = seq;
                    for diff in view.resync(&snapshot) {
                        if is_closed(&closed) {
                            break 'deliver;
                        }
                        yield diff;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }

        debug!(%subscription_id, "Diff stream ended");
    }
}

/// What one subscription currently shows, and the newest version it has
/// seen of every ticket.
struct ScopeView {
    predicate: ScopePredicate,
    versions: HashMap<TicketId, u64>,
    visible: HashSet<TicketId>,
}

impl ScopeView {
    fn new(predicate: ScopePredicate) -> Self {
        Self {
            predicate,
            versions: HashMap::new(),
            visible: HashSet::new(),
        }
    }

    fn seed(&mut self, snapshot: &[Arc<Ticket>]) {
        for ticket in snapshot {
            self.versions.insert(ticket.id, ticket.version);
            self.visible.insert(ticket.id);
        }
    }

    /// Translate one committed change into at most one diff.
    fn apply(&mut self, change: Change) -> Option<Diff> {
        match change {
            Change::Created(ticket) | Change::Updated(ticket) => {
                let id = ticket.id;
                if self
                    .versions
                    .get(&id)
                    .is_some_and(|&seen| ticket.version <= seen)
                {
                    return None;
                }
                self.versions.insert(id, ticket.version);

                let was_visible = self.visible.contains(&id);
                match (was_visible, self.predicate.matches(&ticket)) {
                    (false, true) => {
                        self.visible.insert(id);
                        Some(Diff::Added(Ticket::clone(&ticket)))
                    }
                    (true, true) => Some(Diff::Modified(Ticket::clone(&ticket))),
                    (true, false) => {
                        self.visible.remove(&id);
                        Some(Diff::Removed(id))
                    }
                    (false, false) => None,
                }
            }
            Change::Deleted(id) => {
                self.versions.remove(&id);
                self.visible.remove(&id).then_some(Diff::Removed(id))
            }
        }
    }

    /// Bring the view current against a full snapshot of the store.
    fn resync(&mut self, snapshot: &[Arc<Ticket>]) -> Vec<Diff> {
        let present: HashSet<TicketId> = snapshot.iter().map(|t| t.id).collect();
        let mut diffs: Vec<Diff> = self
            .visible
            .iter()
            .filter(|id| !present.contains(id))
            .map(|id| Diff::Removed(*id))
            .collect();
        for diff in &diffs {
            let id = diff.ticket_id();
            self.visible.remove(&id);
            self.versions.remove(&id);
        }
        self.versions.retain(|id, _| present.contains(id));

        for ticket in snapshot {
            diffs.extend(self.apply(Change::Updated(Arc::clone(ticket))));
            // Record versions of out-of-scope tickets too, so older buffered
            // events for them are recognised as stale
            self.versions.insert(ticket.id, ticket.version);
        }
        diffs
    }
}
