//! Gate runner seam.
//!
//! Gates are external quality/security checks (linters, scanners, test
//! suites) run against a ticket's produced artifact. The core only
//! depends on this trait; the real tool integration lives outside.

use serde::{Deserialize, Serialize};

use crate::core::ticket::Ticket;

/// Result of running the gates against a ticket's artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    /// Computed quality score, 0-100.
    pub quality_score: f64,
    /// Set when the gates found anything security-relevant. Flagged
    /// tickets sort to the front of the review queue.
    pub security_flagged: bool,
    /// Whether the gate considers the artifact acceptable.
    pub pass: bool,
    /// A hard block (e.g. critical security finding) fails the ticket
    /// outright; no retry.
    pub hard_block: bool,
}

impl GateOutcome {
    pub fn passing(quality_score: f64) -> Self {
        Self {
            quality_score,
            security_flagged: false,
            pass: true,
            hard_block: false,
        }
    }

    pub fn failing(quality_score: f64) -> Self {
        Self {
            quality_score,
            security_flagged: false,
            pass: false,
            hard_block: false,
        }
    }

    pub fn hard_blocked(quality_score: f64) -> Self {
        Self {
            quality_score,
            security_flagged: true,
            pass: false,
            hard_block: true,
        }
    }

    pub fn with_security_flag(mut self) -> Self {
        self.security_flagged = true;
        self
    }
}

/// External collaborator that scores a ticket's artifact.
///
/// Called synchronously from the `GateCheck` state; implementations
/// that wrap async tools should block on their own runtime handle.
pub trait GateRunner: Send + Sync {
    fn run(&self, ticket: &Ticket) -> GateOutcome;
}

/// Gate that returns a fixed score for every ticket. Used by the CLI's
/// dry-run mode and as a default in examples.
#[derive(Debug, Clone)]
pub struct ConstGate {
    pub outcome: GateOutcome,
}

impl ConstGate {
    pub fn passing(score: f64) -> Self {
        Self {
            outcome: GateOutcome::passing(score),
        }
    }
}

impl GateRunner for ConstGate {
    fn run(&self, _ticket: &Ticket) -> GateOutcome {
        self.outcome.clone()
    }
}
