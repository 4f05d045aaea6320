//! Ticket data model for the orchestration scheduler.
//!
//! Tickets are the atomic units of work assigned to worker slots. Each
//! ticket tracks its priority, complexity, predicted file footprint,
//! dependencies, and progress through the lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::orchestration::escalation::TriggerType;
use crate::orchestration::WorkerId;

/// Unique identifier for a ticket, stable for the ticket's lifetime.
///
/// Ids are supplied by batch intake (not generated) so that dependency
/// lists in the batch file can refer to tickets by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub String);

impl TicketId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TicketId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TicketId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Scheduling priority. Ordered so that `High` sorts first when
/// candidates are ranked descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Estimated complexity. Determines how deep the checkpoint sequence is:
/// trivial tickets skip planning, large tickets need an extra gate pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Small,
    Medium,
    Large,
}

impl Default for Complexity {
    fn default() -> Self {
        Self::Small
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Trivial => write!(f, "trivial"),
            Complexity::Small => write!(f, "small"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::Large => write!(f, "large"),
        }
    }
}

/// Ticket lifecycle states.
///
/// `Queued -> Assigned -> Planning -> Implementing -> GateCheck` is the
/// normal path; trivial tickets skip `Planning`. `Escalated` parks the
/// ticket for human resolution and re-enters `Queued` (or `Failed` on
/// rejection). `Completed`, `Failed`, and `Skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Queued,
    Assigned,
    Planning,
    Implementing,
    GateCheck,
    Escalated,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for TicketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TicketState::Queued => "queued",
            TicketState::Assigned => "assigned",
            TicketState::Planning => "planning",
            TicketState::Implementing => "implementing",
            TicketState::GateCheck => "gate_check",
            TicketState::Escalated => "escalated",
            TicketState::Completed => "completed",
            TicketState::Failed => "failed",
            TicketState::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

impl TicketState {
    /// No further transitions are permitted out of a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TicketState::Completed | TicketState::Failed | TicketState::Skipped
        )
    }

    /// A worker slot owns the ticket while it is in one of these states.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TicketState::Assigned
                | TicketState::Planning
                | TicketState::Implementing
                | TicketState::GateCheck
        )
    }

    /// Whether the state machine topology permits `from -> to`.
    ///
    /// Self-transitions on `Implementing` (retry re-entry) and
    /// `GateCheck` (second strict pass) are permitted; cancellation
    /// makes `Skipped` reachable from every non-terminal state and
    /// escalation triggers make `Escalated` reachable from `Queued`
    /// (candidate screening) and from every in-flight state.
    pub fn can_transition(from: TicketState, to: TicketState) -> bool {
        use TicketState::*;
        if from.is_terminal() {
            return false;
        }
        // Cooperative cancellation: forced skip from any non-terminal state.
        if to == Skipped {
            return true;
        }
        match (from, to) {
            (Queued, Assigned) => true,
            (Queued, Escalated) => true,
            (Assigned, Planning) => true,
            // Trivial tickets skip planning.
            (Assigned, Implementing) => true,
            (Planning, Implementing) => true,
            (Planning, Planning) => true,
            (Implementing, GateCheck) => true,
            (Implementing, Implementing) => true,
            (Implementing, Failed) => true,
            (GateCheck, Completed) => true,
            (GateCheck, GateCheck) => true,
            (GateCheck, Implementing) => true,
            (GateCheck, Failed) => true,
            (s, Escalated) if s.is_in_flight() => true,
            (Escalated, Queued) => true,
            (Escalated, Failed) => true,
            _ => false,
        }
    }
}

/// A unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    /// Stable identifier, supplied at intake.
    pub id: TicketId,
    /// Short human-readable summary.
    pub title: String,
    /// Full description of the work. Trigger predicates inspect this.
    pub description: String,
    pub priority: Priority,
    pub complexity: Complexity,
    /// Resource keys (paths) the ticket is expected to touch. The
    /// assignment policy acquires leases on exactly this set.
    pub estimated_files: BTreeSet<PathBuf>,
    /// Tickets that must reach `Completed` before this one is assignable.
    pub dependencies: BTreeSet<TicketId>,
    pub state: TicketState,
    /// Worker currently holding the ticket, if any.
    pub assigned_worker: Option<WorkerId>,
    /// Execution attempts so far, bounded by the configured maximum.
    pub attempt_count: u32,
    /// Gate result once gates have run.
    pub quality_score: Option<f64>,
    /// Carried alongside the score; flagged tickets sort first for review.
    pub security_flagged: bool,
    /// Successful gate passes so far (large tickets need two).
    pub gate_passes: u32,
    /// FIFO sequence assigned by the store at enqueue. Tie-break key.
    pub enqueue_order: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Backoff deadline; the ticket does not re-execute before this.
    pub retry_at: Option<DateTime<Utc>>,
    /// Cooperative cancellation flag, honored at the next transition boundary.
    pub cancel_requested: bool,
    /// Trigger categories waived by an approved escalation resolution;
    /// detection skips these for the rest of the ticket's life.
    #[serde(default)]
    pub waived_triggers: BTreeSet<TriggerType>,
    /// Most recent executor output, inspected by trigger predicates.
    pub last_output: Option<String>,
}

impl Ticket {
    /// Create a new queued ticket. `enqueue_order` is assigned by the store.
    pub fn new(id: impl Into<TicketId>, title: &str, description: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: description.to_string(),
            priority: Priority::default(),
            complexity: Complexity::default(),
            estimated_files: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            state: TicketState::Queued,
            assigned_worker: None,
            attempt_count: 0,
            quality_score: None,
            security_flagged: false,
            gate_passes: 0,
            enqueue_order: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_at: None,
            cancel_requested: false,
            waived_triggers: BTreeSet::new(),
            last_output: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.estimated_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, D>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<TicketId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// The checkpoint entered right after assignment. Trivial tickets
    /// skip planning entirely.
    pub fn first_checkpoint(&self) -> TicketState {
        if self.complexity == Complexity::Trivial {
            TicketState::Implementing
        } else {
            TicketState::Planning
        }
    }

    /// Gate passes required before the ticket may complete.
    pub fn required_gate_passes(&self) -> u32 {
        if self.complexity == Complexity::Large {
            2
        } else {
            1
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Intake representation of a ticket, as found in a batch file.
///
/// A batch is a JSON array of these; `into_ticket()` produces the
/// runtime record with bookkeeping fields zeroed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub estimated_files: Vec<PathBuf>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl TicketSpec {
    pub fn into_ticket(self) -> Ticket {
        Ticket::new(self.id.as_str(), &self.title, &self.description)
            .with_priority(self.priority)
            .with_complexity(self.complexity)
            .with_files(self.estimated_files)
            .with_dependencies(self.dependencies)
    }
}
