//! Racing writers and commit ordering.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Barrier;

use ticket_desk_core::{Priority, TicketId, TicketPatch};
use ticket_desk_engine::{ConflictError, Diff, QueryScope, TicketError};
use ticket_desk_integration_tests::{TestContext, draft, next_diff};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_version_race_has_one_winner() {
    let ctx = TestContext::new();
    let a = ctx.login("a@x.com");
    let agents = [ctx.login("agent@x.com"), ctx.login("agent2@x.com")];

    for round in 0..20 {
        let ticket = ctx
            .service
            .create(&a, draft(&format!("race {round}"), "a@x.com"), None)
            .await
            .unwrap();

        let barrier = Arc::new(Barrier::new(agents.len()));
        let tasks: Vec<_> = agents
            .iter()
            .zip([Priority::High, Priority::Low])
            .map(|(token, priority)| {
                let service = Arc::clone(&ctx.service);
                let barrier = Arc::clone(&barrier);
                let token = token.clone();
                let id = ticket.id;
                tokio::spawn(async move {
                    let patch = TicketPatch {
                        priority: Some(priority),
                        ..TicketPatch::default()
                    };
                    barrier.wait().await;
                    service.update(&token, id, 1, patch, None).await
                })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1, "round {round}: {results:?}");
        assert_eq!(winners[0].version, 2);

        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(
            loser,
            &TicketError::Conflict(ConflictError::StaleVersion {
                expected: 1,
                current: 2
            })
        );
        assert!(loser.is_retryable());

        let stored = ctx.store.get(ticket.id).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.priority, winners[0].priority);
    }
}

#[tokio::test]
async fn test_loser_retries_with_fresh_version() {
    let ctx = TestContext::new();
    let a = ctx.login("a@x.com");
    let agent = ctx.login("agent@x.com");
    let ticket = ctx
        .service
        .create(&a, draft("Login fails", "a@x.com"), None)
        .await
        .unwrap();

    let remark = |text: &str| TicketPatch {
        agent_remarks: Some(text.to_string()),
        ..TicketPatch::default()
    };
    ctx.service
        .update(&agent, ticket.id, 1, remark("first"), None)
        .await
        .unwrap();

    let err = ctx
        .service
        .update(&agent, ticket.id, 1, remark("second"), None)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let fresh = ctx.service.get(&agent, ticket.id).unwrap().unwrap();
    let retried = ctx
        .service
        .update(&agent, ticket.id, fresh.version, remark("second"), None)
        .await
        .unwrap();
    assert_eq!(retried.version, 3);
    assert_eq!(retried.agent_remarks.as_deref(), Some("second"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_diffs_follow_each_tickets_commit_order() {
    let ctx = TestContext::new();
    let a = ctx.login("a@x.com");
    let agent = ctx.login("agent@x.com");

    let mut tickets = Vec::new();
    for i in 0..4 {
        tickets.push(
            ctx.service
                .create(&a, draft(&format!("ticket {i}"), "a@x.com"), None)
                .await
                .unwrap(),
        );
    }

    let mut sub = ctx.service.subscribe(&agent, QueryScope::All).unwrap();
    assert_eq!(sub.initial_snapshot().len(), 4);

    const WRITES: u64 = 10;
    let writers: Vec<_> = tickets
        .iter()
        .map(|ticket| {
            let service = Arc::clone(&ctx.service);
            let token = agent.clone();
            let id = ticket.id;
            tokio::spawn(async move {
                for version in 1..=WRITES {
                    let patch = TicketPatch {
                        agent_remarks: Some(format!("note {version}")),
                        ..TicketPatch::default()
                    };
                    service.update(&token, id, version, patch, None).await.unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let mut last_seen: HashMap<TicketId, u64> =
        tickets.iter().map(|t| (t.id, t.version)).collect();
    let expected = tickets.len() as u64 * WRITES;
    for _ in 0..expected {
        match next_diff(&mut sub).await {
            Diff::Modified(ticket) => {
                let last = last_seen.get_mut(&ticket.id).unwrap();
                assert_eq!(ticket.version, *last + 1, "per-ticket order broken");
                *last = ticket.version;
            }
            other => panic!("expected Modified, got {other:?}"),
        }
    }

    for ticket in &tickets {
        assert_eq!(last_seen[&ticket.id], WRITES + 1);
        assert_eq!(ctx.store.get(ticket.id).unwrap().version, WRITES + 1);
    }
}
