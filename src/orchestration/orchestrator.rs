//! Orchestrator: the scheduling control loop.
//!
//! Each `run_tick` is one pass over the pool: poll busy slots and apply
//! whatever the lifecycle machine plans for their tickets, then fill
//! idle slots from the candidate queue under lock constraints. The tick
//! never blocks on any single worker's external wait, and running it
//! twice with no new input produces no additional transitions.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::store::TicketStore;
use crate::core::ticket::{TicketId, TicketState};
use crate::error::{Error, Result};
use crate::orchestration::escalation::{EscalationRecord, Resolution, TriggerType};
use crate::orchestration::locks::LockManager;
use crate::orchestration::policy::AssignmentPolicy;
use crate::orchestration::worker::{LifecycleMachine, StepPlan, WorkerId, WorkerSlot};
use crate::{flog, flog_debug, flog_warn};

/// Events emitted for ticket lifecycle changes, so external components
/// (CLI progress output, dashboards) can react without polling.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    TicketAssigned {
        ticket_id: TicketId,
        worker_id: WorkerId,
    },
    TicketCompleted {
        ticket_id: TicketId,
        quality_score: f64,
    },
    TicketFailed {
        ticket_id: TicketId,
        reason: String,
    },
    TicketSkipped {
        ticket_id: TicketId,
        reason: String,
    },
    TicketEscalated {
        ticket_id: TicketId,
        trigger: TriggerType,
    },
    /// Every ticket in the store has reached a terminal state.
    BatchComplete,
}

/// What one scheduling tick did. `transitions == 0` on a quiescent
/// store is the idempotence guarantee.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub transitions: usize,
    pub assigned: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub escalated: usize,
}

/// The control loop tying store, locks, policy, and lifecycle together.
pub struct Orchestrator {
    store: Arc<RwLock<TicketStore>>,
    locks: Arc<RwLock<LockManager>>,
    machine: LifecycleMachine,
    policy: AssignmentPolicy,
    config: Config,
    slots: Vec<WorkerSlot>,
    escalations: Vec<EscalationRecord>,
    event_tx: mpsc::Sender<OrchestratorEvent>,
    batch_complete_sent: bool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<RwLock<TicketStore>>,
        locks: Arc<RwLock<LockManager>>,
        machine: LifecycleMachine,
        policy: AssignmentPolicy,
        event_tx: mpsc::Sender<OrchestratorEvent>,
    ) -> Self {
        let config = machine.config().clone();
        let slots = (0..config.max_workers).map(|_| WorkerSlot::new()).collect();
        Self {
            store,
            locks,
            machine,
            policy,
            config,
            slots,
            escalations: Vec::new(),
            event_tx,
            batch_complete_sent: false,
        }
    }

    pub fn store(&self) -> Arc<RwLock<TicketStore>> {
        Arc::clone(&self.store)
    }

    pub fn locks(&self) -> Arc<RwLock<LockManager>> {
        Arc::clone(&self.locks)
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_idle()).count()
    }

    /// All escalation records raised so far, open and resolved.
    pub fn escalations(&self) -> &[EscalationRecord] {
        &self.escalations
    }

    pub fn open_escalations(&self) -> Vec<EscalationRecord> {
        self.escalations
            .iter()
            .filter(|r| r.is_open())
            .cloned()
            .collect()
    }

    /// Flag a ticket for cooperative cancellation; honored at the next
    /// tick's transition boundary.
    pub async fn cancel(&self, ticket_id: &TicketId) -> Result<()> {
        self.store.write().await.request_cancel(ticket_id)
    }

    /// One scheduling tick.
    ///
    /// Order of operations: reclaim expired locks, propagate skips from
    /// failed dependencies, apply cancellations, poll busy slots,
    /// screen candidates for triggers, fill idle slots. Time is passed
    /// in so ticks are deterministic.
    pub async fn run_tick(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        self.locks.write().await.reclaim_expired(now);

        let skipped = self.store.write().await.propagate_skips(now)?;
        for ticket_id in skipped {
            report.transitions += 1;
            report.skipped += 1;
            let _ = self
                .event_tx
                .send(OrchestratorEvent::TicketSkipped {
                    ticket_id,
                    reason: "dependency terminated without completing".to_string(),
                })
                .await;
        }

        let cancelled = self.store.write().await.apply_cancellations(now)?;
        for ticket_id in cancelled {
            report.transitions += 1;
            report.skipped += 1;
            let _ = self
                .event_tx
                .send(OrchestratorEvent::TicketSkipped {
                    ticket_id,
                    reason: "cancelled".to_string(),
                })
                .await;
        }

        self.poll_busy_slots(now, &mut report).await?;
        self.screen_candidates(now, &mut report).await?;
        self.fill_idle_slots(now, &mut report).await?;

        if !self.batch_complete_sent && self.store.read().await.all_terminal() {
            self.batch_complete_sent = true;
            flog!("batch complete");
            let _ = self.event_tx.send(OrchestratorEvent::BatchComplete).await;
        }

        Ok(report)
    }

    async fn poll_busy_slots(
        &mut self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        for idx in 0..self.slots.len() {
            let Some(ticket_id) = self.slots[idx].current_ticket.clone() else {
                continue;
            };

            let Some(snapshot) = self.store.read().await.get(&ticket_id).cloned() else {
                // Archived out from under us; free the slot
                self.release_slot(idx).await;
                continue;
            };

            // The ticket left the slot's ownership through skip
            // propagation or cancellation; clean up.
            if !snapshot.state.is_in_flight() {
                self.release_slot(idx).await;
                continue;
            }

            let stalled = self.slots[idx]
                .last_progress_at
                .map(|at| now - at >= self.config.stall_timeout())
                .unwrap_or(false);
            let plan = if stalled {
                flog_warn!(
                    "worker {} stalled on ticket {}",
                    self.slots[idx].id.short(),
                    ticket_id
                );
                self.machine
                    .fault_plan(&snapshot, "worker made no progress within stall timeout")
            } else {
                self.machine.step(&snapshot, now)
            };

            self.apply_plan(idx, &ticket_id, plan, now, report).await?;
        }
        Ok(())
    }

    async fn apply_plan(
        &mut self,
        slot_idx: usize,
        ticket_id: &TicketId,
        plan: StepPlan,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        match plan {
            StepPlan::Hold => {
                // A backoff park is deliberate waiting, not a stall.
                let parked = self
                    .store
                    .read()
                    .await
                    .get(ticket_id)
                    .and_then(|t| t.retry_at)
                    .map(|at| now < at)
                    .unwrap_or(false);
                if parked {
                    self.slots[slot_idx].last_progress_at = Some(now);
                }
            }
            StepPlan::Enter { to, reason, output } => {
                {
                    let mut store = self.store.write().await;
                    if let Some(output) = output {
                        if let Some(ticket) = store.get_mut(ticket_id) {
                            ticket.last_output = Some(output);
                        }
                    }
                    store.mark(ticket_id, to, &reason, now)?;
                }
                report.transitions += 1;
                self.slots[slot_idx].last_progress_at = Some(now);
            }
            StepPlan::Retry {
                reenter,
                fault,
                outcome,
                attempts,
            } => {
                {
                    let mut store = self.store.write().await;
                    if let Some(ticket) = store.get_mut(ticket_id) {
                        ticket.attempt_count = attempts;
                        ticket.retry_at = Some(now + self.config.backoff_delay(attempts));
                        if let Some(outcome) = &outcome {
                            ticket.quality_score = Some(outcome.quality_score);
                            ticket.security_flagged |= outcome.security_flagged;
                        }
                    }
                    let reason = format!("retry after recoverable fault: {}", fault);
                    store.mark(ticket_id, reenter, &reason, now)?;
                }
                report.transitions += 1;
                self.slots[slot_idx].last_progress_at = Some(now);
            }
            StepPlan::Escalate {
                trigger,
                context,
                attempts,
            } => {
                {
                    let mut store = self.store.write().await;
                    if let Some(ticket) = store.get_mut(ticket_id) {
                        ticket.attempt_count = attempts;
                    }
                    let reason = format!("escalated: {}", trigger);
                    store.mark(ticket_id, TicketState::Escalated, &reason, now)?;
                }
                self.escalations.push(EscalationRecord::new(
                    ticket_id.clone(),
                    trigger,
                    context,
                    now,
                ));
                self.release_slot(slot_idx).await;
                report.transitions += 1;
                report.escalated += 1;
                let _ = self
                    .event_tx
                    .send(OrchestratorEvent::TicketEscalated {
                        ticket_id: ticket_id.clone(),
                        trigger,
                    })
                    .await;
            }
            StepPlan::GatePass { outcome, done } => {
                {
                    let mut store = self.store.write().await;
                    if let Some(ticket) = store.get_mut(ticket_id) {
                        ticket.quality_score = Some(outcome.quality_score);
                        ticket.security_flagged |= outcome.security_flagged;
                        ticket.gate_passes += 1;
                    }
                    if done {
                        store.mark(ticket_id, TicketState::Completed, "gate passed", now)?;
                    } else {
                        store.mark(
                            ticket_id,
                            TicketState::GateCheck,
                            "first gate passed, strict second pass required",
                            now,
                        )?;
                    }
                }
                report.transitions += 1;
                if done {
                    self.release_slot(slot_idx).await;
                    report.completed += 1;
                    let _ = self
                        .event_tx
                        .send(OrchestratorEvent::TicketCompleted {
                            ticket_id: ticket_id.clone(),
                            quality_score: outcome.quality_score,
                        })
                        .await;
                } else {
                    self.slots[slot_idx].last_progress_at = Some(now);
                }
            }
            StepPlan::GateHardFail { outcome } => {
                {
                    let mut store = self.store.write().await;
                    if let Some(ticket) = store.get_mut(ticket_id) {
                        ticket.quality_score = Some(outcome.quality_score);
                        ticket.security_flagged |= outcome.security_flagged;
                    }
                    store.mark(
                        ticket_id,
                        TicketState::Failed,
                        "gate hard block: critical finding",
                        now,
                    )?;
                }
                self.release_slot(slot_idx).await;
                report.transitions += 1;
                report.failed += 1;
                let _ = self
                    .event_tx
                    .send(OrchestratorEvent::TicketFailed {
                        ticket_id: ticket_id.clone(),
                        reason: "gate hard block".to_string(),
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// Escalate queued candidates that match a trigger before they are
    /// assigned, so no lease is ever taken for work a human must
    /// approve first.
    async fn screen_candidates(
        &mut self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let candidates = self.store.read().await.candidates();
        for ticket_id in candidates {
            let Some(snapshot) = self.store.read().await.get(&ticket_id).cloned() else {
                continue;
            };
            let Some((trigger, context)) = self.machine.detect_trigger(&snapshot) else {
                continue;
            };
            {
                let mut store = self.store.write().await;
                let reason = format!("escalated: {}", trigger);
                store.mark(&ticket_id, TicketState::Escalated, &reason, now)?;
            }
            self.escalations.push(EscalationRecord::new(
                ticket_id.clone(),
                trigger,
                context,
                now,
            ));
            report.transitions += 1;
            report.escalated += 1;
            let _ = self
                .event_tx
                .send(OrchestratorEvent::TicketEscalated { ticket_id, trigger })
                .await;
        }
        Ok(())
    }

    async fn fill_idle_slots(
        &mut self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        for idx in 0..self.slots.len() {
            if !self.slots[idx].is_idle() {
                continue;
            }
            let worker_id = self.slots[idx].id;

            let assignment = {
                let store = self.store.read().await;
                let candidates = store.candidates();
                if candidates.is_empty() {
                    break;
                }
                let mut locks = self.locks.write().await;
                self.policy.next_for(
                    worker_id,
                    &candidates,
                    &store,
                    &mut locks,
                    now,
                    self.config.lock_timeout(),
                )
            };

            let Some((ticket_id, lease)) = assignment else {
                // Every remaining candidate is lock-blocked; later
                // slots would see the same picture.
                break;
            };

            {
                let mut store = self.store.write().await;
                store.mark(&ticket_id, TicketState::Assigned, "assigned to worker", now)?;
                if let Some(ticket) = store.get_mut(&ticket_id) {
                    ticket.assigned_worker = Some(worker_id);
                }
            }
            self.slots[idx].assign(ticket_id.clone(), lease, now);
            report.transitions += 1;
            report.assigned += 1;
            flog_debug!("assigned ticket={} worker={}", ticket_id, worker_id.short());
            let _ = self
                .event_tx
                .send(OrchestratorEvent::TicketAssigned {
                    ticket_id,
                    worker_id,
                })
                .await;
        }
        Ok(())
    }

    async fn release_slot(&mut self, idx: usize) {
        if let Some(lease) = self.slots[idx].clear() {
            self.locks.write().await.release(&lease);
        }
    }

    /// Apply a human resolution to a ticket's open escalation.
    ///
    /// Approval re-queues the ticket with its fields preserved, waives
    /// the trigger so it does not immediately re-escalate, and resets
    /// the retry budget. Rejection fails the ticket.
    pub async fn resolve_escalation(
        &mut self,
        ticket_id: &TicketId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let trigger = {
            let record = self
                .escalations
                .iter_mut()
                .find(|r| r.ticket_id == *ticket_id && r.is_open())
                .ok_or_else(|| Error::EscalationNotFound {
                    id: ticket_id.clone(),
                })?;
            record.resolve(resolution, now);
            record.trigger_type
        };

        match resolution {
            Resolution::ApprovedContinue => {
                let mut store = self.store.write().await;
                if let Some(ticket) = store.get_mut(ticket_id) {
                    ticket.waived_triggers.insert(trigger);
                    ticket.attempt_count = 0;
                    ticket.retry_at = None;
                }
                store.mark(ticket_id, TicketState::Queued, "escalation approved, re-queued", now)?;
            }
            Resolution::Rejected => {
                self.store
                    .write()
                    .await
                    .mark(ticket_id, TicketState::Failed, "escalation rejected", now)?;
                let _ = self
                    .event_tx
                    .send(OrchestratorEvent::TicketFailed {
                        ticket_id: ticket_id.clone(),
                        reason: "escalation rejected".to_string(),
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// Drive ticks on wall-clock time until the batch finishes, the
    /// token is cancelled, or no schedulable work remains (everything
    /// left is parked on open escalations or unsatisfiable
    /// dependencies).
    pub async fn run_to_completion(
        &mut self,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let now = Utc::now();
            let report = self.run_tick(now).await?;

            if self.store.read().await.all_terminal() {
                break;
            }

            let quiescent = report.transitions == 0
                && report.assigned == 0
                && self.busy_count() == 0;
            if quiescent {
                let candidates = self.store.read().await.candidates();
                if candidates.is_empty() {
                    flog_warn!(
                        "no schedulable work remains ({} open escalation(s)); stopping",
                        self.open_escalations().len()
                    );
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        Ok(())
    }
}
