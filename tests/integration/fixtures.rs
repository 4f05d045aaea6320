//! Test fixtures for integration tests.
//!
//! Provides a scripted executor and gate (so fault and score sequences
//! can be injected per ticket) and a harness that wires a full
//! orchestrator with an in-memory audit sink and deterministic time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, RwLock};

use foreman::audit::MemoryAuditSink;
use foreman::config::Config;
use foreman::core::store::TicketStore;
use foreman::core::ticket::{Ticket, TicketId, TicketState};
use foreman::gate::{GateOutcome, GateRunner};
use foreman::orchestration::{
    AssignmentPolicy, Checkpoint, LifecycleMachine, LockManager, Orchestrator,
    OrchestratorEvent, StepResult, TicketExecutor, TickReport, TriggerRegistry,
};

/// Executor with per-ticket scripted results. Tickets without a script
/// complete every checkpoint immediately; a ticket marked as faulting
/// returns a recoverable fault on every call until cleared.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<TicketId, Vec<StepResult>>>,
    faulting: Mutex<HashSet<TicketId>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue explicit results for a ticket, consumed in order. Once the
    /// queue is exhausted the ticket completes checkpoints normally.
    pub fn script(&self, id: &str, results: Vec<StepResult>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(TicketId::from(id), results);
    }

    /// Make every call for this ticket fault until `clear_fault`.
    pub fn always_fault(&self, id: &str) {
        self.faulting.lock().unwrap().insert(TicketId::from(id));
    }

    pub fn clear_fault(&self, id: &str) {
        self.faulting.lock().unwrap().remove(&TicketId::from(id));
    }
}

impl TicketExecutor for ScriptedExecutor {
    fn execute(&self, ticket: &Ticket, checkpoint: Checkpoint) -> StepResult {
        if self.faulting.lock().unwrap().contains(&ticket.id) {
            return StepResult::Fault("injected fault".to_string());
        }
        let mut scripts = self.scripts.lock().unwrap();
        if let Some(queue) = scripts.get_mut(&ticket.id) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        match checkpoint {
            Checkpoint::Planning => StepResult::Done(format!("plan for {}", ticket.id)),
            Checkpoint::Implementing => {
                StepResult::Done(format!("implementation for {}", ticket.id))
            }
        }
    }
}

/// Gate with per-ticket scripted outcomes, consumed in order. Tickets
/// without a script (or with an exhausted queue) pass at the default
/// score.
pub struct ScriptedGate {
    outcomes: Mutex<HashMap<TicketId, Vec<GateOutcome>>>,
    default_score: f64,
}

impl ScriptedGate {
    pub fn passing(default_score: f64) -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            default_score,
        }
    }

    pub fn script(&self, id: &str, outcomes: Vec<GateOutcome>) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(TicketId::from(id), outcomes);
    }
}

impl GateRunner for ScriptedGate {
    fn run(&self, ticket: &Ticket) -> GateOutcome {
        let mut outcomes = self.outcomes.lock().unwrap();
        if let Some(queue) = outcomes.get_mut(&ticket.id) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        GateOutcome::passing(self.default_score)
    }
}

/// A wired orchestrator plus the channels and sinks tests inspect.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub sink: Arc<MemoryAuditSink>,
    events: mpsc::Receiver<OrchestratorEvent>,
    /// Events drained so far, in emission order.
    pub collected: Vec<OrchestratorEvent>,
}

pub struct HarnessBuilder {
    config: Config,
    executor: Arc<dyn TicketExecutor>,
    gate: Arc<dyn GateRunner>,
    triggers: TriggerRegistry,
    policy: AssignmentPolicy,
}

impl HarnessBuilder {
    /// Defaults: two workers, immediate completion, passing gate at 90,
    /// no escalation triggers, per-file locking.
    pub fn new() -> Self {
        Self {
            config: Config {
                max_workers: 2,
                ..Default::default()
            },
            executor: Arc::new(ScriptedExecutor::new()),
            gate: Arc::new(ScriptedGate::passing(90.0)),
            triggers: TriggerRegistry::new(),
            policy: AssignmentPolicy::default(),
        }
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.max_workers = n;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TicketExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn gate(mut self, gate: Arc<dyn GateRunner>) -> Self {
        self.gate = gate;
        self
    }

    pub fn triggers(mut self, triggers: TriggerRegistry) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn policy(mut self, policy: AssignmentPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Harness {
        let sink = Arc::new(MemoryAuditSink::new());
        let store = Arc::new(RwLock::new(TicketStore::new(sink.clone())));
        let locks = Arc::new(RwLock::new(LockManager::new()));
        let machine =
            LifecycleMachine::new(self.config, self.executor, self.gate, self.triggers);
        let (tx, rx) = mpsc::channel(1024);
        Harness {
            orchestrator: Orchestrator::new(store, locks, machine, self.policy, tx),
            sink,
            events: rx,
            collected: Vec::new(),
        }
    }
}

impl Harness {
    pub async fn enqueue(&self, ticket: Ticket) {
        self.orchestrator
            .store()
            .write()
            .await
            .enqueue(ticket)
            .expect("enqueue failed");
    }

    pub async fn state_of(&self, id: &str) -> TicketState {
        self.orchestrator
            .store()
            .read()
            .await
            .get(&TicketId::from(id))
            .expect("unknown ticket")
            .state
    }

    pub async fn ticket(&self, id: &str) -> Ticket {
        self.orchestrator
            .store()
            .read()
            .await
            .get(&TicketId::from(id))
            .expect("unknown ticket")
            .clone()
    }

    /// Ids of tickets currently in an in-flight state.
    pub async fn in_flight(&self) -> Vec<TicketId> {
        self.orchestrator
            .store()
            .read()
            .await
            .all_tickets()
            .filter(|t| t.state.is_in_flight())
            .map(|t| t.id.clone())
            .collect()
    }

    pub async fn all_terminal(&self) -> bool {
        self.orchestrator.store().read().await.all_terminal()
    }

    /// One tick, draining emitted events into `collected`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let report = self.orchestrator.run_tick(now).await.expect("tick failed");
        while let Ok(event) = self.events.try_recv() {
            self.collected.push(event);
        }
        report
    }

    /// Tick with `step` between ticks until every ticket is terminal.
    /// Returns the time of the last tick.
    pub async fn tick_until_terminal(
        &mut self,
        start: DateTime<Utc>,
        step: Duration,
    ) -> DateTime<Utc> {
        let mut now = start;
        for _ in 0..100 {
            self.tick(now).await;
            if self.all_terminal().await {
                return now;
            }
            now += step;
        }
        panic!("batch did not reach terminal states within 100 ticks");
    }

    /// Tick until two consecutive ticks produce no transitions and no
    /// assignments. Used when escalated (non-terminal) tickets remain.
    pub async fn tick_until_quiet(
        &mut self,
        start: DateTime<Utc>,
        step: Duration,
    ) -> DateTime<Utc> {
        let mut now = start;
        let mut quiet = 0;
        for _ in 0..100 {
            let report = self.tick(now).await;
            if report.transitions == 0 && report.assigned == 0 {
                quiet += 1;
                if quiet >= 2 {
                    return now;
                }
            } else {
                quiet = 0;
            }
            now += step;
        }
        panic!("scheduler did not quiesce within 100 ticks");
    }
}

/// Fixed start time so test timelines are reproducible in failures.
pub fn t0() -> DateTime<Utc> {
    Utc::now()
}

pub fn secs(s: i64) -> Duration {
    Duration::seconds(s)
}
