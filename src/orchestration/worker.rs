//! Worker slots and the per-ticket lifecycle state machine.
//!
//! A `WorkerSlot` is a concurrent execution context; the pool size is
//! fixed at orchestrator construction. The `LifecycleMachine` decides,
//! for one busy ticket and one instant, what should happen next: it is
//! a pure planner — it never mutates the ticket or the store — so every
//! decision is deterministic and unit-testable. The orchestrator
//! applies the returned `StepPlan`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::core::ticket::{Ticket, TicketId, TicketState};
use crate::gate::{GateOutcome, GateRunner};
use crate::orchestration::escalation::{TriggerRegistry, TriggerType};
use crate::orchestration::locks::LeaseToken;

/// Unique identifier for a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a slot currently owns a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

/// A concurrent execution context in the fixed-size pool.
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub current_ticket: Option<TicketId>,
    /// Lease over the ticket's estimated files, released when the
    /// ticket leaves the slot.
    pub lease: Option<LeaseToken>,
    /// Updated whenever the ticket makes observable progress; used for
    /// stalled-slot detection.
    pub last_progress_at: Option<DateTime<Utc>>,
}

impl WorkerSlot {
    pub fn new() -> Self {
        Self {
            id: WorkerId::new(),
            status: WorkerStatus::Idle,
            current_ticket: None,
            lease: None,
            last_progress_at: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    pub fn assign(&mut self, ticket: TicketId, lease: LeaseToken, now: DateTime<Utc>) {
        self.status = WorkerStatus::Busy;
        self.current_ticket = Some(ticket);
        self.lease = Some(lease);
        self.last_progress_at = Some(now);
    }

    /// Return the slot to idle, yielding the lease for release.
    pub fn clear(&mut self) -> Option<LeaseToken> {
        self.status = WorkerStatus::Idle;
        self.current_ticket = None;
        self.last_progress_at = None;
        self.lease.take()
    }
}

impl Default for WorkerSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// The executor checkpoints a worker drives a ticket through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Planning,
    Implementing,
}

/// Result of asking the external agent to work a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// Checkpoint finished; the output is retained on the ticket for
    /// trigger inspection and gating.
    Done(String),
    /// Work is still in flight; poll again next tick.
    Pending,
    /// Transient failure (tool error, rate limit). Retried with backoff.
    Fault(String),
}

/// External agent seam: performs the actual work for a checkpoint.
///
/// Implementations wrap whatever executes tickets (an AI agent, a build
/// farm, a human). The scheduler only sees `Done`/`Pending`/`Fault`.
pub trait TicketExecutor: Send + Sync {
    fn execute(&self, ticket: &Ticket, checkpoint: Checkpoint) -> StepResult;
}

/// Executor that completes every checkpoint immediately. Used by the
/// CLI's dry-run mode to exercise the schedule without real agents.
#[derive(Debug, Default, Clone)]
pub struct ImmediateExecutor;

impl TicketExecutor for ImmediateExecutor {
    fn execute(&self, ticket: &Ticket, checkpoint: Checkpoint) -> StepResult {
        match checkpoint {
            Checkpoint::Planning => StepResult::Done(format!("plan for {}", ticket.id)),
            Checkpoint::Implementing => {
                StepResult::Done(format!("implementation for {}", ticket.id))
            }
        }
    }
}

/// What the orchestrator should do with a busy ticket this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum StepPlan {
    /// Nothing to do (backoff park, work still pending).
    Hold,
    /// Plain transition to the next checkpoint.
    Enter {
        to: TicketState,
        reason: String,
        output: Option<String>,
    },
    /// Recoverable fault: bump the attempt count to `attempts`, park
    /// until backoff elapses, then re-enter `reenter`.
    Retry {
        reenter: TicketState,
        fault: String,
        outcome: Option<GateOutcome>,
        attempts: u32,
    },
    /// Hand the ticket to a human; locks are released and the slot freed.
    Escalate {
        trigger: TriggerType,
        context: String,
        attempts: u32,
    },
    /// Gate passed. `done` is false for a large ticket's first pass,
    /// which stays in `GateCheck` for the stricter second pass.
    GatePass { outcome: GateOutcome, done: bool },
    /// Hard gate block: terminal failure, never retried.
    GateHardFail { outcome: GateOutcome },
}

/// Drives a ticket's checkpoint sequence.
///
/// Holds the executor and gate seams plus the trigger registry; `step`
/// inspects a ticket snapshot and plans the next move.
pub struct LifecycleMachine {
    config: Config,
    executor: Arc<dyn TicketExecutor>,
    gate: Arc<dyn GateRunner>,
    triggers: TriggerRegistry,
}

impl LifecycleMachine {
    pub fn new(
        config: Config,
        executor: Arc<dyn TicketExecutor>,
        gate: Arc<dyn GateRunner>,
        triggers: TriggerRegistry,
    ) -> Self {
        Self {
            config,
            executor,
            gate,
            triggers,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// First matching trigger for a ticket, honoring its waivers. The
    /// orchestrator screens queued candidates with this before any
    /// locks are taken, so flagged work never reaches a slot.
    pub fn detect_trigger(&self, ticket: &Ticket) -> Option<(TriggerType, String)> {
        self.triggers.detect(ticket)
    }

    /// Plan the next move for a busy ticket.
    ///
    /// Trigger detection runs first, at every poll, so a ticket that
    /// matches a configured category escalates regardless of where it
    /// is in the checkpoint sequence.
    pub fn step(&self, ticket: &Ticket, now: DateTime<Utc>) -> StepPlan {
        if !ticket.state.is_in_flight() {
            return StepPlan::Hold;
        }

        if let Some((trigger, context)) = self.detect_trigger(ticket) {
            return StepPlan::Escalate {
                trigger,
                context,
                attempts: ticket.attempt_count,
            };
        }

        // Parked in backoff
        if let Some(retry_at) = ticket.retry_at {
            if now < retry_at {
                return StepPlan::Hold;
            }
        }

        match ticket.state {
            TicketState::Assigned => StepPlan::Enter {
                to: ticket.first_checkpoint(),
                reason: "begin work".to_string(),
                output: None,
            },
            TicketState::Planning => {
                match self.executor.execute(ticket, Checkpoint::Planning) {
                    StepResult::Done(output) => StepPlan::Enter {
                        to: TicketState::Implementing,
                        reason: "plan ready".to_string(),
                        output: Some(output),
                    },
                    StepResult::Pending => StepPlan::Hold,
                    StepResult::Fault(fault) => {
                        self.retry_or_escalate(ticket, TicketState::Planning, fault, None)
                    }
                }
            }
            TicketState::Implementing => {
                match self.executor.execute(ticket, Checkpoint::Implementing) {
                    StepResult::Done(output) => StepPlan::Enter {
                        to: TicketState::GateCheck,
                        reason: "implementation ready".to_string(),
                        output: Some(output),
                    },
                    StepResult::Pending => StepPlan::Hold,
                    StepResult::Fault(fault) => {
                        self.retry_or_escalate(ticket, TicketState::Implementing, fault, None)
                    }
                }
            }
            TicketState::GateCheck => self.run_gate(ticket),
            _ => StepPlan::Hold,
        }
    }

    /// Plan for an externally observed fault (stalled slot, crashed
    /// worker). Same recoverable path as an executor fault.
    pub fn fault_plan(&self, ticket: &Ticket, fault: &str) -> StepPlan {
        let reenter = if ticket.state == TicketState::Planning {
            TicketState::Planning
        } else {
            TicketState::Implementing
        };
        self.retry_or_escalate(ticket, reenter, fault.to_string(), None)
    }

    fn run_gate(&self, ticket: &Ticket) -> StepPlan {
        let outcome = self.gate.run(ticket);
        if outcome.hard_block {
            return StepPlan::GateHardFail { outcome };
        }

        // Large tickets need a second, stricter pass before completion.
        let required_score = if ticket.complexity == crate::core::ticket::Complexity::Large
            && ticket.gate_passes >= 1
        {
            self.config.strict_gate_threshold
        } else {
            self.config.gate_pass_threshold
        };

        if outcome.pass && outcome.quality_score >= required_score {
            let done = ticket.gate_passes + 1 >= ticket.required_gate_passes();
            StepPlan::GatePass { outcome, done }
        } else {
            let fault = format!(
                "gate score {:.1} below required {:.1}",
                outcome.quality_score, required_score
            );
            self.retry_or_escalate(ticket, TicketState::Implementing, fault, Some(outcome))
        }
    }

    fn retry_or_escalate(
        &self,
        ticket: &Ticket,
        reenter: TicketState,
        fault: String,
        outcome: Option<GateOutcome>,
    ) -> StepPlan {
        let attempts = ticket.attempt_count + 1;
        if attempts >= self.config.max_attempts {
            StepPlan::Escalate {
                trigger: TriggerType::RepeatedFailure,
                context: fault,
                attempts,
            }
        } else {
            StepPlan::Retry {
                reenter,
                fault,
                outcome,
                attempts,
            }
        }
    }
}
