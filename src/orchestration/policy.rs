//! Assignment policy: choose the next ticket for an idle worker.
//!
//! Work-conserving: the policy walks the candidate sequence in store
//! order (priority desc, FIFO tie-break) and assigns the first ticket
//! whose lock acquisition succeeds. Candidates that lose the lock race
//! stay `Queued` and are re-evaluated on the next tick; an idle worker
//! never stays idle while any lockable candidate exists.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::core::store::TicketStore;
use crate::core::ticket::{Ticket, TicketId};
use crate::flog_trace;
use crate::orchestration::locks::{AcquireOutcome, LeaseToken, LockManager};
use crate::orchestration::worker::WorkerId;

/// What a ticket's lease covers. The three orchestration patterns from
/// the factory model reduce to this one knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockGranularity {
    /// Lock exactly the ticket's estimated files. The canonical mode.
    PerFile,
    /// Lock a single repository-wide key; at most one ticket in flight
    /// touches the tree at a time (branch-isolation equivalent).
    WholeRepository,
    /// No locking; pure queue ordering decides everything.
    Disabled,
}

impl Default for LockGranularity {
    fn default() -> Self {
        Self::PerFile
    }
}

/// Chooses the next ticket for an idle worker under lock constraints.
#[derive(Debug, Clone, Default)]
pub struct AssignmentPolicy {
    pub granularity: LockGranularity,
}

impl AssignmentPolicy {
    pub fn new(granularity: LockGranularity) -> Self {
        Self { granularity }
    }

    /// Resource keys the given ticket's lease must cover.
    pub fn keys_for(&self, ticket: &Ticket) -> BTreeSet<PathBuf> {
        match self.granularity {
            LockGranularity::PerFile => ticket.estimated_files.clone(),
            LockGranularity::WholeRepository => {
                [PathBuf::from("/")].into_iter().collect()
            }
            LockGranularity::Disabled => BTreeSet::new(),
        }
    }

    /// Walk `candidates` in order and return the first whose locks can
    /// be taken, along with the granted lease. `None` means no
    /// assignment is possible this tick.
    pub fn next_for(
        &self,
        worker_id: WorkerId,
        candidates: &[TicketId],
        store: &TicketStore,
        locks: &mut LockManager,
        now: DateTime<Utc>,
        lock_timeout: Duration,
    ) -> Option<(TicketId, LeaseToken)> {
        for candidate in candidates {
            let Some(ticket) = store.get(candidate) else {
                continue;
            };
            let keys = self.keys_for(ticket);
            match locks.try_acquire(&keys, worker_id, now, lock_timeout) {
                AcquireOutcome::Acquired(token) => {
                    return Some((candidate.clone(), token));
                }
                AcquireOutcome::Conflict(conflicts) => {
                    // Left Queued; re-evaluated next tick.
                    flog_trace!(
                        "candidate {} blocked on {} locked key(s)",
                        candidate,
                        conflicts.len()
                    );
                }
            }
        }
        None
    }
}
