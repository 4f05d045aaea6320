//! Properties that must hold on every tick, checked over full runs.

use std::collections::BTreeSet;
use std::path::PathBuf;

use foreman::core::ticket::{Ticket, TicketId, TicketState};
use foreman::orchestration::ReviewQueueBuilder;

use crate::fixtures::{secs, t0, HarnessBuilder};

/// Lock exclusivity: tickets with overlapping file sets are never in
/// flight at the same time, even with more workers than tickets.
#[tokio::test]
async fn test_no_overlapping_files_in_flight() {
    let mut harness = HarnessBuilder::new().workers(4).build();
    // Three pairs contending for three files
    for (id, file) in [
        ("T1", "a.rs"),
        ("T2", "a.rs"),
        ("T3", "b.rs"),
        ("T4", "b.rs"),
        ("T5", "c.rs"),
        ("T6", "c.rs"),
    ] {
        harness
            .enqueue(Ticket::new(id, id, "").with_files([file, "shared/util.rs"]))
            .await;
    }

    let mut now = t0();
    for _ in 0..100 {
        harness.tick(now).await;

        let store = harness.orchestrator.store();
        let store = store.read().await;
        let in_flight: Vec<&Ticket> = store
            .all_tickets()
            .filter(|t| t.state.is_in_flight())
            .collect();
        let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
        for ticket in &in_flight {
            for file in &ticket.estimated_files {
                assert!(
                    seen.insert(file.clone()),
                    "file {} held by two in-flight tickets",
                    file.display()
                );
            }
        }
        let done = store.all_terminal();
        drop(store);
        if done {
            break;
        }
        now += secs(5);
    }
    assert!(harness.all_terminal().await);
}

/// Dependency gating: a ticket is never assigned before every
/// dependency has completed, across a three-deep chain.
#[tokio::test]
async fn test_never_assigned_before_dependencies_complete() {
    let mut harness = HarnessBuilder::new().workers(4).build();
    harness.enqueue(Ticket::new("T1", "base", "")).await;
    harness
        .enqueue(Ticket::new("T2", "mid", "").with_dependencies(["T1"]))
        .await;
    harness
        .enqueue(Ticket::new("T3", "top", "").with_dependencies(["T2"]))
        .await;

    harness.tick_until_terminal(t0(), secs(5)).await;

    for (ticket, dep) in [("T2", "T1"), ("T3", "T2")] {
        let assigned_at = harness
            .sink
            .for_ticket(&TicketId::from(ticket))
            .iter()
            .find(|e| e.to == TicketState::Assigned)
            .expect("assignment entry")
            .at;
        let dep_completed_at = harness
            .sink
            .for_ticket(&TicketId::from(dep))
            .iter()
            .find(|e| e.to == TicketState::Completed)
            .expect("completion entry")
            .at;
        assert!(
            assigned_at > dep_completed_at,
            "{} assigned at {} before {} completed at {}",
            ticket,
            assigned_at,
            dep,
            dep_completed_at
        );
    }
}

/// Idempotence: once the batch is done, further ticks change nothing.
#[tokio::test]
async fn test_extra_ticks_after_completion_are_noops() {
    let mut harness = HarnessBuilder::new().workers(2).build();
    harness.enqueue(Ticket::new("T1", "t", "")).await;
    harness.enqueue(Ticket::new("T2", "t", "")).await;

    let end = harness.tick_until_terminal(t0(), secs(5)).await;
    let audit_len = harness.sink.len();

    let first = harness.tick(end + secs(60)).await;
    let second = harness.tick(end + secs(60)).await;
    assert_eq!(first.transitions, 0);
    assert_eq!(second.transitions, 0);
    assert_eq!(harness.sink.len(), audit_len);
}

/// Idempotence while blocked: a ticket whose dependency was never
/// enqueued stays queued without generating transitions.
#[tokio::test]
async fn test_blocked_ticket_produces_no_transitions() {
    let mut harness = HarnessBuilder::new().workers(1).build();
    harness
        .enqueue(Ticket::new("T1", "t", "").with_dependencies(["never-enqueued"]))
        .await;

    let now = t0();
    for i in 0..5 {
        let report = harness.tick(now + secs(i * 5)).await;
        assert_eq!(report.transitions, 0);
        assert_eq!(report.assigned, 0);
    }
    assert_eq!(harness.state_of("T1").await, TicketState::Queued);
}

/// A failed dependency skips its dependents, transitively, and none of
/// them is ever assigned.
#[tokio::test]
async fn test_failed_dependency_skips_dependents() {
    let executor = std::sync::Arc::new(crate::fixtures::ScriptedExecutor::new());
    executor.always_fault("T1");
    let mut harness = HarnessBuilder::new().workers(2).executor(executor).build();

    harness.enqueue(Ticket::new("T1", "doomed", "")).await;
    harness
        .enqueue(Ticket::new("T2", "dependent", "").with_dependencies(["T1"]))
        .await;
    harness
        .enqueue(Ticket::new("T3", "transitive", "").with_dependencies(["T2"]))
        .await;

    // T1 escalates as repeated_failure; reject it so it fails
    let quiet_at = harness.tick_until_quiet(t0(), secs(5)).await;
    harness
        .orchestrator
        .resolve_escalation(
            &TicketId::from("T1"),
            foreman::orchestration::Resolution::Rejected,
            quiet_at,
        )
        .await
        .unwrap();
    harness.tick_until_terminal(quiet_at + secs(5), secs(5)).await;

    assert_eq!(harness.state_of("T1").await, TicketState::Failed);
    assert_eq!(harness.state_of("T2").await, TicketState::Skipped);
    assert_eq!(harness.state_of("T3").await, TicketState::Skipped);
    for id in ["T2", "T3"] {
        let entries = harness.sink.for_ticket(&TicketId::from(id));
        assert!(
            entries.iter().all(|e| e.to != TicketState::Assigned),
            "{} was assigned despite failed dependency",
            id
        );
    }
}

/// Review ranking is a pure, stable function of the ticket multiset.
#[test]
fn test_review_order_stable_across_input_permutations() {
    fn completed(id: &str, score: f64, flagged: bool) -> Ticket {
        let mut ticket = Ticket::new(id, id, "");
        ticket.state = TicketState::Completed;
        ticket.quality_score = Some(score);
        ticket.security_flagged = flagged;
        ticket.completed_at = Some(chrono::Utc::now());
        ticket
    }

    let tickets = vec![
        completed("T1", 55.0, false),
        completed("T2", 88.0, true),
        completed("T3", 92.0, false),
        completed("T4", 61.0, true),
        completed("T5", 92.0, false),
    ];

    let forward = ReviewQueueBuilder::build(tickets.iter());
    let backward = ReviewQueueBuilder::build(tickets.iter().rev());
    let f: Vec<_> = forward.iter().map(|i| i.ticket_id.clone()).collect();
    let b: Vec<_> = backward.iter().map(|i| i.ticket_id.clone()).collect();
    assert_eq!(f, b);

    // Every flagged ticket precedes every unflagged one
    let last_flagged = forward
        .iter()
        .rposition(|i| i.security_flagged)
        .expect("flagged tickets present");
    let first_unflagged = forward
        .iter()
        .position(|i| !i.security_flagged)
        .expect("unflagged tickets present");
    assert!(last_flagged < first_unflagged);
}
