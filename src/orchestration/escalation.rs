//! Escalation triggers and records.
//!
//! Escalation is a control signal, not an error: it halts autonomous
//! progress on a ticket and hands it to a human. Trigger categories are
//! a closed enum; what *detects* each category is a pluggable predicate
//! registered per category, so new detection logic is added by
//! registering a predicate, not by string matching at call sites.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::core::ticket::{Ticket, TicketId};

static SECURITY_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(auth|login|password|secret|token|crypt|session|permission)").unwrap()
});

static ARCHITECTURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(architecture|architectural|redesign|rewrite)\b").unwrap());

static DATA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(migration|schema|data model)\b").unwrap());

static BREAKING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)breaking[ _-]change").unwrap());

static AMBIGUITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(unclear|ambiguous|tbd|undecided)\b").unwrap());

/// Why a ticket cannot proceed autonomously.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Architecture,
    Security,
    Data,
    BreakingChange,
    Ambiguity,
    RepeatedFailure,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerType::Architecture => "architecture",
            TriggerType::Security => "security",
            TriggerType::Data => "data",
            TriggerType::BreakingChange => "breaking_change",
            TriggerType::Ambiguity => "ambiguity",
            TriggerType::RepeatedFailure => "repeated_failure",
        };
        write!(f, "{}", s)
    }
}

/// Human response to an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// Re-queue the ticket; the trigger is waived for its remaining life.
    ApprovedContinue,
    /// The ticket is rejected and moves to `Failed`.
    Rejected,
}

/// Raised when a ticket escalates; resolved by the external human
/// review collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub ticket_id: TicketId,
    pub trigger_type: TriggerType,
    /// Free-text context captured at detection time.
    pub context: String,
    pub raised_at: DateTime<Utc>,
    pub resolution: Option<Resolution>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscalationRecord {
    pub fn new(
        ticket_id: TicketId,
        trigger_type: TriggerType,
        context: impl Into<String>,
        raised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            ticket_id,
            trigger_type,
            context: context.into(),
            raised_at,
            resolution: None,
            resolved_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolution.is_none()
    }

    pub fn resolve(&mut self, resolution: Resolution, at: DateTime<Utc>) {
        self.resolution = Some(resolution);
        self.resolved_at = Some(at);
    }
}

/// A detection predicate: returns escalation context when the ticket
/// matches the category, `None` otherwise.
pub type TriggerPredicate = Box<dyn Fn(&Ticket) -> Option<String> + Send + Sync>;

/// Ordered registry of trigger predicates, evaluated at entry to every
/// lifecycle state. First match wins.
#[derive(Default)]
pub struct TriggerRegistry {
    predicates: Vec<(TriggerType, TriggerPredicate)>,
}

impl TriggerRegistry {
    /// Empty registry; nothing ever escalates by trigger detection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the stock detection rules for each category.
    /// `RepeatedFailure` has no predicate; the lifecycle machine raises
    /// it directly when the retry budget is exhausted.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(TriggerType::Security, Box::new(security_path_predicate));
        registry.register(
            TriggerType::Architecture,
            Box::new(|t| text_match(t, &ARCHITECTURE_RE, "architecture-level change")),
        );
        registry.register(
            TriggerType::Data,
            Box::new(|t| text_match(t, &DATA_RE, "data/schema change")),
        );
        registry.register(
            TriggerType::BreakingChange,
            Box::new(|t| text_match(t, &BREAKING_RE, "breaking-change marker")),
        );
        registry.register(
            TriggerType::Ambiguity,
            Box::new(|t| text_match(t, &AMBIGUITY_RE, "ambiguous requirements")),
        );
        registry
    }

    pub fn register(&mut self, trigger: TriggerType, predicate: TriggerPredicate) {
        self.predicates.push((trigger, predicate));
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Evaluate predicates in registration order, skipping trigger
    /// types already waived for this ticket by a prior resolution.
    pub fn detect(&self, ticket: &Ticket) -> Option<(TriggerType, String)> {
        for (trigger, predicate) in &self.predicates {
            if ticket.waived_triggers.contains(trigger) {
                continue;
            }
            if let Some(context) = predicate(ticket) {
                return Some((*trigger, context));
            }
        }
        None
    }
}

fn security_path_predicate(ticket: &Ticket) -> Option<String> {
    ticket
        .estimated_files
        .iter()
        .find(|path| SECURITY_PATH_RE.is_match(&path.to_string_lossy()))
        .map(|path| format!("security-sensitive path: {}", path.display()))
}

fn text_match(ticket: &Ticket, re: &Regex, label: &str) -> Option<String> {
    let in_description = re.is_match(&ticket.description);
    let in_output = ticket
        .last_output
        .as_deref()
        .map(|o| re.is_match(o))
        .unwrap_or(false);
    if in_description || in_output {
        Some(label.to_string())
    } else {
        None
    }
}
