//! Scheduling machinery: worker pool, file locks, assignment policy,
//! the per-ticket lifecycle machine, escalation handling, and the
//! orchestrator tick loop that drives them.

pub mod escalation;
pub mod locks;
pub mod orchestrator;
pub mod policy;
pub mod review;
pub mod worker;

pub use escalation::{EscalationRecord, Resolution, TriggerRegistry, TriggerType};
pub use locks::{AcquireOutcome, LeaseToken, LockManager};
pub use orchestrator::{Orchestrator, OrchestratorEvent, TickReport};
pub use policy::{AssignmentPolicy, LockGranularity};
pub use review::{ReviewItem, ReviewQueueBuilder};
pub use worker::{
    Checkpoint, ImmediateExecutor, LifecycleMachine, StepPlan, StepResult, TicketExecutor,
    WorkerId, WorkerSlot, WorkerStatus,
};
