//! Fault injection, backoff, stall detection, and escalation handling.

use std::sync::Arc;

use chrono::Duration;

use foreman::core::ticket::{Ticket, TicketId, TicketState};
use foreman::gate::GateOutcome;
use foreman::orchestration::{Resolution, ReviewQueueBuilder, StepResult, TriggerRegistry, TriggerType};

use crate::fixtures::{secs, t0, HarnessBuilder, ScriptedExecutor, ScriptedGate};

/// A single recoverable fault retries the same checkpoint and the
/// ticket still completes, with the attempt recorded.
#[tokio::test]
async fn test_single_fault_retries_and_completes() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("T1", vec![StepResult::Fault("tool crashed".to_string())]);
    let mut harness = HarnessBuilder::new().workers(1).executor(executor).build();
    harness.enqueue(Ticket::new("T1", "flaky once", "")).await;

    harness.tick_until_terminal(t0(), secs(5)).await;

    let ticket = harness.ticket("T1").await;
    assert_eq!(ticket.state, TicketState::Completed);
    assert_eq!(ticket.attempt_count, 1);

    let entries = harness.sink.for_ticket(&TicketId::from("T1"));
    assert!(entries
        .iter()
        .any(|e| e.reason.contains("retry after recoverable fault")));
}

/// Backoff parks the ticket: before the deadline a tick produces no
/// transitions, after it the ticket re-executes.
#[tokio::test]
async fn test_backoff_parks_until_deadline() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("T1", vec![StepResult::Fault("transient".to_string())]);
    let mut harness = HarnessBuilder::new().workers(1).executor(executor).build();
    harness.enqueue(Ticket::new("T1", "t", "")).await;

    let start = t0();
    harness.tick(start).await; // assign
    harness.tick(start + secs(1)).await; // enter planning
    let fault_at = start + secs(2);
    harness.tick(fault_at).await; // fault, attempts=1, backoff 1s

    let ticket = harness.ticket("T1").await;
    assert_eq!(ticket.attempt_count, 1);
    let retry_at = ticket.retry_at.expect("backoff deadline set");
    assert_eq!(retry_at, fault_at + Duration::milliseconds(1000));

    // Before the deadline: parked, nothing happens
    let report = harness
        .tick(fault_at + Duration::milliseconds(500))
        .await;
    assert_eq!(report.transitions, 0);
    assert_eq!(harness.state_of("T1").await, TicketState::Planning);

    // After the deadline the script is exhausted and work proceeds
    harness.tick_until_terminal(fault_at + secs(2), secs(5)).await;
    assert_eq!(harness.state_of("T1").await, TicketState::Completed);
}

/// A worker that stops making progress is detected via the stall
/// timeout and treated as a recoverable fault; persistent stalling
/// exhausts the retry budget and escalates.
#[tokio::test]
async fn test_stalled_worker_escalates_after_retry_budget() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("T1", vec![StepResult::Pending; 10]);
    let mut harness = HarnessBuilder::new().workers(1).executor(executor).build();
    harness.enqueue(Ticket::new("T1", "hung", "")).await;

    let start = t0();
    harness.tick(start).await; // assign
    harness.tick(start + secs(5)).await; // enter planning
    harness.tick(start + secs(10)).await; // pending, no progress

    // Step past the stall timeout repeatedly; each detection burns one
    // attempt until the budget is exhausted
    let mut now = start + secs(10);
    for _ in 0..10 {
        now += secs(301);
        harness.tick(now).await;
        if harness.state_of("T1").await == TicketState::Escalated {
            break;
        }
    }

    assert_eq!(harness.state_of("T1").await, TicketState::Escalated);
    let ticket = harness.ticket("T1").await;
    assert_eq!(ticket.attempt_count, 3);
    let open = harness.orchestrator.open_escalations();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].trigger_type, TriggerType::RepeatedFailure);
    assert!(open[0].context.contains("no progress"));

    // The slot and its lease were freed for other work
    assert_eq!(harness.orchestrator.busy_count(), 0);
}

/// Rejecting an escalation fails the ticket, and the failure shows up
/// in the review report with its full transition history.
#[tokio::test]
async fn test_rejected_escalation_fails_with_history() {
    let executor = Arc::new(ScriptedExecutor::new());
    executor.always_fault("T1");
    let mut harness = HarnessBuilder::new().workers(1).executor(executor).build();
    harness.enqueue(Ticket::new("T1", "doomed", "")).await;
    harness.enqueue(Ticket::new("T2", "fine", "")).await;

    let quiet_at = harness.tick_until_quiet(t0(), secs(5)).await;
    harness
        .orchestrator
        .resolve_escalation(&TicketId::from("T1"), Resolution::Rejected, quiet_at)
        .await
        .unwrap();
    harness.tick_until_terminal(quiet_at + secs(5), secs(5)).await;

    let store = harness.orchestrator.store();
    let store = store.read().await;
    let queue = ReviewQueueBuilder::build_with_history(store.all_tickets(), &harness.sink);
    assert_eq!(queue.len(), 2);
    // Completed work first, the failure after it
    assert_eq!(queue[0].ticket_id, TicketId::from("T2"));
    assert_eq!(queue[1].ticket_id, TicketId::from("T1"));
    assert_eq!(queue[1].state, TicketState::Failed);
    assert!(queue[1]
        .history
        .iter()
        .any(|e| e.reason == "escalation rejected"));
}

/// A hard gate block is terminal: the ticket fails immediately with no
/// retry and no attempt consumed.
#[tokio::test]
async fn test_gate_hard_block_fails_without_retry() {
    let gate = Arc::new(ScriptedGate::passing(90.0));
    gate.script("T1", vec![GateOutcome::hard_blocked(12.0)]);
    let mut harness = HarnessBuilder::new().workers(1).gate(gate).build();
    harness.enqueue(Ticket::new("T1", "insecure", "")).await;

    harness.tick_until_terminal(t0(), secs(5)).await;

    let ticket = harness.ticket("T1").await;
    assert_eq!(ticket.state, TicketState::Failed);
    assert_eq!(ticket.attempt_count, 0);
    assert_eq!(ticket.quality_score, Some(12.0));
    assert!(ticket.security_flagged);
}

/// A soft gate failure sends the ticket back to implementing with
/// backoff; a subsequent pass completes it.
#[tokio::test]
async fn test_gate_soft_fail_reimplements_then_passes() {
    let gate = Arc::new(ScriptedGate::passing(90.0));
    gate.script("T1", vec![GateOutcome::failing(40.0)]);
    let mut harness = HarnessBuilder::new().workers(1).gate(gate).build();
    harness.enqueue(Ticket::new("T1", "rough draft", "")).await;

    harness.tick_until_terminal(t0(), secs(5)).await;

    let ticket = harness.ticket("T1").await;
    assert_eq!(ticket.state, TicketState::Completed);
    assert_eq!(ticket.attempt_count, 1);
    assert_eq!(ticket.quality_score, Some(90.0));

    let entries = harness.sink.for_ticket(&TicketId::from("T1"));
    let reentered = entries
        .iter()
        .any(|e| e.from == TicketState::GateCheck && e.to == TicketState::Implementing);
    assert!(reentered, "expected gate failure to re-enter implementing");
}

/// Trigger detection escalates a security-sensitive ticket straight
/// from the queue, before it is ever assigned or takes a lease;
/// approval waives the trigger and the ticket completes without
/// re-escalating.
#[tokio::test]
async fn test_security_trigger_escalates_then_waived_on_approval() {
    let mut harness = HarnessBuilder::new()
        .workers(1)
        .triggers(TriggerRegistry::with_defaults())
        .build();
    harness
        .enqueue(Ticket::new("T1", "login fix", "").with_files(["src/auth.py"]))
        .await;

    let start = t0();
    let report = harness.tick(start).await;

    assert_eq!(harness.state_of("T1").await, TicketState::Escalated);
    assert_eq!(report.escalated, 1);
    assert_eq!(report.assigned, 0);
    assert_eq!(harness.orchestrator.busy_count(), 0);
    assert_eq!(
        harness.orchestrator.locks().read().await.locked_key_count(),
        0
    );
    let entries = harness.sink.for_ticket(&TicketId::from("T1"));
    assert!(entries.iter().all(|e| e.to != TicketState::Assigned));
    let open = harness.orchestrator.open_escalations();
    assert_eq!(open[0].trigger_type, TriggerType::Security);
    assert!(open[0].context.contains("auth.py"));

    harness
        .orchestrator
        .resolve_escalation(
            &TicketId::from("T1"),
            Resolution::ApprovedContinue,
            start + secs(10),
        )
        .await
        .unwrap();

    // Estimated files unchanged; the waiver alone stops re-escalation
    let ticket = harness.ticket("T1").await;
    assert!(ticket.waived_triggers.contains(&TriggerType::Security));
    assert_eq!(ticket.estimated_files.len(), 1);

    harness.tick_until_terminal(start + secs(15), secs(5)).await;
    assert_eq!(harness.state_of("T1").await, TicketState::Completed);
}
