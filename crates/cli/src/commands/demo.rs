//! Scripted customer/support scenario.
//!
//! Runs against a fresh in-memory engine with three live viewers:
//!
//! 1. Customer `a@x.com` files "Login fails"
//! 2. Support assigns it to `agent1` and starts work
//! 3. Support deletes it
//!
//! Every diff each viewer receives is logged, so the output shows scope
//! filtering (customer `b@x.com` sees nothing) and per-ticket ordering.
//!
//! # Usage
//!
//! ```bash
//! td-cli demo
//! td-cli demo --users users.yaml --password 'correct-horse'
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{info, warn};

use ticket_desk_core::{Email, Role, TicketDraft, TicketPatch, TicketStatus};
use ticket_desk_engine::auth::{
    AuthSessionManager, Credentials, DirectoryError, SessionToken, UserDirectory,
};
use ticket_desk_engine::{
    AuthError, ClientViewCache, ConfigError, EngineConfig, MemoryBlobStore, QueryScope,
    SubscriptionEngine, TicketError, TicketService, TicketStore,
};

const CUSTOMER_A: &str = "a@x.com";
const CUSTOMER_B: &str = "b@x.com";
const SUPPORT: &str = "agent@x.com";

/// How long to wait for a viewer's next diff before moving on.
const SETTLE: Duration = Duration::from_millis(100);

/// Errors that can occur while running the scenario.
#[derive(Debug, Error)]
pub enum DemoError {
    /// Engine configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The user directory could not be built.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// A scenario account could not log in.
    #[error("login failed for {0}: {1}")]
    Login(&'static str, AuthError),

    /// A directory file was given without the accounts' password.
    #[error("--password is required with a users file")]
    MissingPassword,

    /// A scenario step was refused.
    #[error(transparent)]
    Ticket(#[from] TicketError),
}

type Viewer = ClientViewCache<MemoryBlobStore>;

/// Run the scenario.
///
/// # Errors
///
/// Returns `DemoError` if setup fails or any step is refused.
pub async fn run(users: Option<PathBuf>, password: Option<SecretString>) -> Result<(), DemoError> {
    let config = EngineConfig::from_env()?;

    let (directory, password) = match users.or_else(|| config.users_file.clone()) {
        Some(path) => {
            let password = password.ok_or(DemoError::MissingPassword)?;
            info!(path = %path.display(), "Loading user directory");
            (UserDirectory::load(&path)?, password)
        }
        None => builtin_directory()?,
    };

    let auth = Arc::new(AuthSessionManager::new(directory, &config));
    let reaper = auth.spawn_reaper(config.reaper_interval);
    let store = Arc::new(TicketStore::new(&config));
    let subscriptions = Arc::new(SubscriptionEngine::new(Arc::clone(&store)));
    let service = Arc::new(TicketService::new(
        Arc::clone(&auth),
        store,
        subscriptions,
        MemoryBlobStore::new(),
        &config,
    ));

    let login = |email: &'static str| {
        auth.authenticate(&Credentials::new(email, password.expose_secret()))
            .map_err(|e| DemoError::Login(email, e))
    };
    let session_a = login(CUSTOMER_A)?;
    let session_b = login(CUSTOMER_B)?;
    let session_support = login(SUPPORT)?;

    let mut viewer_a = Viewer::open(Arc::clone(&service), session_a.token.clone(), QueryScope::Own)?;
    let mut viewer_b = Viewer::open(Arc::clone(&service), session_b.token.clone(), QueryScope::Own)?;
    let mut viewer_support = Viewer::open(
        Arc::clone(&service),
        session_support.token.clone(),
        QueryScope::All,
    )?;

    info!("Step 1: customer files a ticket");
    let ticket = viewer_a
        .create(
            TicketDraft {
                title: "Login fails".to_string(),
                description: "The sign-in page rejects my password".to_string(),
                contact_email: CUSTOMER_A.to_string(),
                phone: "5551234567".to_string(),
                ..TicketDraft::default()
            },
            None,
        )
        .await?;
    settle_all(&mut [
        ("a", &mut viewer_a),
        ("b", &mut viewer_b),
        ("support", &mut viewer_support),
    ])
    .await;

    info!("Step 2: support assigns and starts work");
    viewer_support
        .update(
            ticket.id,
            TicketPatch {
                assigned_to: Some(Some("agent1".to_string())),
                status: Some(TicketStatus::InProgress),
                ..TicketPatch::default()
            },
        )
        .await?;
    settle_all(&mut [
        ("a", &mut viewer_a),
        ("b", &mut viewer_b),
        ("support", &mut viewer_support),
    ])
    .await;

    info!("Step 3: support deletes the ticket");
    viewer_support.delete(ticket.id).await?;
    settle_all(&mut [
        ("a", &mut viewer_a),
        ("b", &mut viewer_b),
        ("support", &mut viewer_support),
    ])
    .await;

    let remaining = service.get(&session_support.token, ticket.id)?;
    info!(ticket_id = %ticket.id, found = remaining.is_some(), "Lookup after delete");

    for session in [&session_a, &session_b, &session_support] {
        auth.logout(session);
    }
    info!(
        subscriptions = service.subscriptions().active_subscriptions(),
        sessions = auth.active_sessions(),
        "Scenario finished"
    );

    reaper.abort();
    Ok(())
}

/// Apply every diff each viewer receives until it goes quiet.
async fn settle_all(viewers: &mut [(&'static str, &mut Viewer)]) {
    for (name, viewer) in viewers.iter_mut() {
        loop {
            match tokio::time::timeout(SETTLE, viewer.next_diff()).await {
                Ok(Some(diff)) => info!(viewer = *name, ?diff, "Diff received"),
                Ok(None) => {
                    warn!(viewer = *name, "Subscription ended");
                    break;
                }
                Err(_) => break,
            }
        }
        info!(viewer = *name, visible = viewer.len(), "Viewer settled");
    }
}

/// Scenario accounts sharing one random password.
fn builtin_directory() -> Result<(UserDirectory, SecretString), DirectoryError> {
    let password = SecretString::from(random_password());
    let mut directory = UserDirectory::new();
    for (email, role) in [
        (CUSTOMER_A, Role::Customer),
        (CUSTOMER_B, Role::Customer),
        (SUPPORT, Role::Support),
    ] {
        let email = Email::parse(email).map_err(|source| DirectoryError::InvalidEmail {
            email: email.to_string(),
            source,
        })?;
        directory.add_user(email, Some(role), password.expose_secret())?;
    }
    Ok((directory, password))
}

/// 32 random bytes, URL-safe encoded.
fn random_password() -> String {
    SessionToken::generate().as_str().to_string()
}
