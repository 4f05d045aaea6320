//! Immutable transition audit trail.
//!
//! Every ticket state transition appends a `TransitionEntry` so a human
//! can reconstruct why a ticket ended where it did. The core emits
//! entries through the `AuditSink` seam; long-term storage is an
//! external concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::core::ticket::{TicketId, TicketState};
use crate::flog;

/// One state transition, recorded at the moment it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEntry {
    pub ticket_id: TicketId,
    pub from: TicketState,
    pub to: TicketState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

impl TransitionEntry {
    pub fn new(
        ticket_id: TicketId,
        from: TicketState,
        to: TicketState,
        at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            ticket_id,
            from,
            to,
            at,
            reason: reason.into(),
        }
    }
}

/// Receives transition entries. Implementations must be cheap; the
/// store calls this inline on every transition.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: TransitionEntry);
}

/// In-memory sink, used by tests and by the CLI to attach transition
/// history to the review report.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<TransitionEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded entries, in record order.
    pub fn entries(&self) -> Vec<TransitionEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Entries for a single ticket, in record order.
    pub fn for_ticket(&self, id: &TicketId) -> Vec<TransitionEntry> {
        self.entries
            .lock()
            .map(|e| e.iter().filter(|t| &t.ticket_id == id).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: TransitionEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

/// Sink that writes transitions to the foreman log file.
#[derive(Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, entry: TransitionEntry) {
        flog!(
            "transition ticket={} {} -> {} reason={}",
            entry.ticket_id,
            entry.from,
            entry.to,
            entry.reason
        );
    }
}
