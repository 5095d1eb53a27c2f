//! Integration tests for Ticket Desk.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p ticket-desk-integration-tests
//! ```
//!
//! # Test Categories
//!
//! - `scenario` - The customer/support walkthrough and scope isolation
//! - `concurrency` - Racing writers and commit ordering
//! - `session_teardown` - Logout and expiry closing live views
//! - `attachments` - Upload limits and failures aborting writes
//!
//! Everything runs in-process; no external services are needed.

#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;

use ticket_desk_core::{Email, Role, TicketDraft};
use ticket_desk_engine::auth::{AuthSessionManager, Credentials, UserDirectory};
use ticket_desk_engine::{
    BlobStore, Diff, EngineConfig, MemoryBlobStore, SessionToken, StorageError, Subscription,
    SubscriptionEngine, TicketService, TicketStore,
};

/// Password shared by every test account.
pub const PASSWORD: &str = "correct-horse";

/// Accounts provisioned in every context.
pub const ACCOUNTS: [(&str, Role); 4] = [
    ("a@x.com", Role::Customer),
    ("b@x.com", Role::Customer),
    ("agent@x.com", Role::Support),
    ("agent2@x.com", Role::Support),
];

/// A fully wired engine over in-memory collaborators.
pub struct TestContext<B: BlobStore = MemoryBlobStore> {
    pub auth: Arc<AuthSessionManager>,
    pub store: Arc<TicketStore>,
    pub subscriptions: Arc<SubscriptionEngine>,
    pub service: Arc<TicketService<B>>,
}

impl TestContext<MemoryBlobStore> {
    #[must_use]
    pub fn new() -> Self {
        Self::with(EngineConfig::default(), MemoryBlobStore::new())
    }
}

impl Default for TestContext<MemoryBlobStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: BlobStore> TestContext<B> {
    /// Build a context with explicit configuration and blob store.
    pub fn with(config: EngineConfig, blobs: B) -> Self {
        let mut directory = UserDirectory::new();
        for (email, role) in ACCOUNTS {
            directory
                .add_user(Email::parse(email).unwrap(), Some(role), PASSWORD)
                .unwrap();
        }

        let auth = Arc::new(AuthSessionManager::new(directory, &config));
        let store = Arc::new(TicketStore::new(&config));
        let subscriptions = Arc::new(SubscriptionEngine::new(Arc::clone(&store)));
        let service = Arc::new(TicketService::new(
            Arc::clone(&auth),
            Arc::clone(&store),
            Arc::clone(&subscriptions),
            blobs,
            &config,
        ));

        Self {
            auth,
            store,
            subscriptions,
            service,
        }
    }

    /// Log in a provisioned account and return its token.
    pub fn login(&self, email: &str) -> SessionToken {
        self.auth
            .authenticate(&Credentials::new(email, PASSWORD))
            .unwrap()
            .token
    }
}

/// A valid draft filed by `contact`.
#[must_use]
pub fn draft(title: &str, contact: &str) -> TicketDraft {
    TicketDraft {
        title: title.to_string(),
        description: "Steps to reproduce attached".to_string(),
        contact_email: contact.to_string(),
        phone: "5551234567".to_string(),
        ..TicketDraft::default()
    }
}

/// Wait briefly for the next diff; panics if none arrives.
pub async fn next_diff(subscription: &mut Subscription) -> Diff {
    tokio::time::timeout(Duration::from_secs(1), subscription.next())
        .await
        .expect("timed out waiting for a diff")
        .expect("subscription ended")
}

/// Assert that no diff arrives within a short window.
pub async fn assert_no_diff(subscription: &mut Subscription) {
    let waited = tokio::time::timeout(Duration::from_millis(50), subscription.next()).await;
    assert!(waited.is_err(), "unexpected diff: {waited:?}");
}

/// A blob store that refuses every upload.
#[derive(Debug, Default)]
pub struct RejectingBlobStore;

impl BlobStore for RejectingBlobStore {
    async fn upload(&self, _name: &str, _bytes: Vec<u8>) -> Result<String, StorageError> {
        Err(StorageError::UploadFailed("bucket unavailable".to_string()))
    }
}

/// A blob store that never answers.
#[derive(Debug, Default)]
pub struct StalledBlobStore;

impl BlobStore for StalledBlobStore {
    async fn upload(&self, _name: &str, _bytes: Vec<u8>) -> Result<String, StorageError> {
        futures::future::pending().await
    }
}

/// A blob store that holds every upload until [`release`](Self::release)
/// is called.
#[derive(Debug, Default)]
pub struct GatedBlobStore {
    inner: MemoryBlobStore,
    entered: Notify,
    released: Notify,
}

impl GatedBlobStore {
    /// Wait until an upload is being held.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let one held upload finish.
    pub fn release(&self) {
        self.released.notify_one();
    }

    /// Number of uploads that completed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl BlobStore for GatedBlobStore {
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        self.entered.notify_one();
        self.released.notified().await;
        self.inner.upload(name, bytes).await
    }
}
