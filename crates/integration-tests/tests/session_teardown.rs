//! Logout and expiry closing every live view a session owns.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use ticket_desk_core::TicketPatch;
use ticket_desk_engine::{
    AuthError, ClientViewCache, Diff, EngineConfig, MemoryBlobStore, QueryScope, TicketError,
};
use ticket_desk_integration_tests::{TestContext, draft, next_diff};

#[tokio::test]
async fn test_logout_closes_only_that_sessions_subscriptions() {
    let ctx = TestContext::new();
    let a = ctx.login("a@x.com");
    let agent = ctx.login("agent@x.com");

    let mut sub_a1 = ctx.service.subscribe(&a, QueryScope::Own).unwrap();
    let mut sub_a2 = ctx.service.subscribe(&a, QueryScope::Own).unwrap();
    let mut sub_support = ctx.service.subscribe(&agent, QueryScope::All).unwrap();
    assert_eq!(ctx.subscriptions.active_subscriptions(), 3);

    let session = ctx.auth.current_session(&a).unwrap();
    ctx.auth.logout(&session);

    // Closed before logout returned
    assert_eq!(ctx.subscriptions.active_subscriptions(), 1);
    assert_eq!(sub_a1.next().await, None);
    assert_eq!(sub_a2.next().await, None);

    // The other viewer is unaffected
    let ticket = ctx
        .service
        .create(&agent, draft("Phone line down", "a@x.com"), None)
        .await
        .unwrap();
    assert_eq!(next_diff(&mut sub_support).await, Diff::Added(ticket));

    // Logging out twice is harmless
    ctx.auth.logout(&session);
    assert_eq!(ctx.subscriptions.active_subscriptions(), 1);
}

#[tokio::test]
async fn test_logout_discards_client_views() {
    let ctx = TestContext::new();
    let a = ctx.login("a@x.com");
    let mut view =
        ClientViewCache::open(Arc::clone(&ctx.service), a.clone(), QueryScope::Own).unwrap();

    let ticket = view.create(draft("Login fails", "a@x.com"), None).await.unwrap();
    view.next_diff().await.unwrap();
    assert_eq!(view.len(), 1);

    let session = ctx.auth.current_session(&a).unwrap();
    ctx.auth.logout(&session);

    assert_eq!(view.next_diff().await, None);
    assert!(view.is_closed());
    assert!(view.is_empty());
    assert_eq!(
        view.update(ticket.id, TicketPatch::default()).await,
        Err(AuthError::SessionExpired.into())
    );

    // The ticket itself outlives the session
    assert!(ctx.store.get(ticket.id).is_some());
}

#[tokio::test]
async fn test_expiry_cascades_through_reaper() {
    let config = EngineConfig {
        session_ttl: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let ctx = TestContext::with(config, MemoryBlobStore::new());
    let a = ctx.login("a@x.com");
    let mut sub = ctx.service.subscribe(&a, QueryScope::Own).unwrap();

    let reaper = ctx.auth.spawn_reaper(Duration::from_millis(20));
    let ended = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .unwrap();
    assert_eq!(ended, None);
    assert_eq!(ctx.subscriptions.active_subscriptions(), 0);
    assert_eq!(ctx.auth.active_sessions(), 0);
    reaper.abort();

    assert_eq!(
        ctx.service.query(&a, QueryScope::Own),
        Err(TicketError::Auth(AuthError::SessionExpired))
    );
}

#[tokio::test]
async fn test_explicit_close_keeps_session() {
    let ctx = TestContext::new();
    let a = ctx.login("a@x.com");
    let mut sub = ctx.service.subscribe(&a, QueryScope::Own).unwrap();

    assert!(ctx.service.close_subscription(sub.id()));
    assert_eq!(sub.next().await, None);

    // The session still works and can subscribe again
    let mut again = ctx.service.subscribe(&a, QueryScope::Own).unwrap();
    let ticket = ctx
        .service
        .create(&a, draft("Login fails", "a@x.com"), None)
        .await
        .unwrap();
    assert_eq!(next_diff(&mut again).await, Diff::Added(ticket));
}
