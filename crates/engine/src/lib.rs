//! Ticket Desk Engine - role-scoped ticket synchronization.
//!
//! # Components
//!
//! - [`auth::AuthSessionManager`] - verifies credentials, resolves a role and
//!   owns session lifecycle
//! - [`policy::AuthorizationGate`] - decides what each role may read and write
//! - [`store::TicketStore`] - the authoritative collection with optimistic
//!   concurrency and a change log
//! - [`subscription::SubscriptionEngine`] - scope-filtered snapshot plus
//!   diff streams
//! - [`view::ClientViewCache`] - a viewer's local mirror with optimistic
//!   mutations
//!
//! [`service::TicketService`] wires them together behind session tokens and
//! handles attachment upload through a [`blob::BlobStore`].
//!
//! # Lifecycle
//!
//! Nothing here is global. Build a store, an auth manager and a subscription
//! engine, hand them to a service, and drop them when done. Ending a session
//! closes every subscription it opened.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod auth;
pub mod blob;
pub mod config;
pub mod error;
pub mod policy;
pub mod service;
pub mod store;
pub mod subscription;
mod sync;
pub mod view;

pub use auth::{AuthSessionManager, Credentials, Session, SessionObserver, SessionToken, UserDirectory};
pub use blob::{Attachment, BlobStore, MAX_ATTACHMENT_BYTES, MemoryBlobStore};
pub use config::{ConfigError, EngineConfig};
pub use error::{
    AuthError, ConflictError, NotFoundError, StorageError, TicketError, ValidationError,
};
pub use policy::{AuthorizationGate, QueryScope, ScopePredicate};
pub use service::TicketService;
pub use store::TicketStore;
pub use subscription::{Diff, Subscription, SubscriptionEngine};
pub use view::{ClientViewCache, MutationState};
