//! Ticket store: records, dependency graph, and transition bookkeeping.
//!
//! The store is one of the two shared mutable resources in the system
//! (the other is the lock manager). All ticket mutation funnels through
//! `mark`, which enforces the state machine topology and appends to the
//! audit trail. The store does not decide locking or overlap; that is
//! the assignment policy's job.

use chrono::{DateTime, Utc};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use crate::audit::{AuditSink, TransitionEntry};
use crate::core::ticket::{Ticket, TicketId, TicketState};
use crate::error::{Error, Result};
use crate::flog_debug;

/// Holds all ticket records and their dependency graph.
pub struct TicketStore {
    tickets: HashMap<TicketId, Ticket>,
    /// Enqueue order; the FIFO tie-break for candidate ranking.
    order: Vec<TicketId>,
    next_seq: u64,
    /// Dependency edges run dep -> dependent; used only for cycle checks.
    graph: DiGraph<TicketId, ()>,
    node_index: HashMap<TicketId, NodeIndex>,
    audit: Arc<dyn AuditSink>,
}

impl TicketStore {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            tickets: HashMap::new(),
            order: Vec::new(),
            next_seq: 0,
            graph: DiGraph::new(),
            node_index: HashMap::new(),
            audit,
        }
    }

    fn node_for(&mut self, id: &TicketId) -> NodeIndex {
        if let Some(&index) = self.node_index.get(id) {
            return index;
        }
        let index = self.graph.add_node(id.clone());
        self.node_index.insert(id.clone(), index);
        index
    }

    /// Add a ticket to the store.
    ///
    /// Dependencies may reference tickets that have not been enqueued
    /// yet (batch files list tickets in arbitrary order); such tickets
    /// simply stay unassignable until the dependency arrives and
    /// completes.
    ///
    /// # Errors
    ///
    /// `DuplicateTicket` if the id already exists, `Validation` if the
    /// dependency edges would close a cycle.
    pub fn enqueue(&mut self, mut ticket: Ticket) -> Result<()> {
        if self.tickets.contains_key(&ticket.id) {
            return Err(Error::DuplicateTicket {
                id: ticket.id.clone(),
            });
        }

        let ticket_node = self.node_for(&ticket.id);
        for dep in ticket.dependencies.clone() {
            if dep == ticket.id {
                return Err(Error::Validation(format!(
                    "ticket {} depends on itself",
                    ticket.id
                )));
            }
            let dep_node = self.node_for(&dep);
            let edge = self.graph.add_edge(dep_node, ticket_node, ());
            if is_cyclic_directed(&self.graph) {
                self.graph.remove_edge(edge);
                return Err(Error::Validation(format!(
                    "dependency {} -> {} would create a cycle",
                    dep, ticket.id
                )));
            }
        }

        ticket.enqueue_order = self.next_seq;
        self.next_seq += 1;
        flog_debug!(
            "enqueue ticket={} priority={} order={}",
            ticket.id,
            ticket.priority,
            ticket.enqueue_order
        );
        self.order.push(ticket.id.clone());
        self.tickets.insert(ticket.id.clone(), ticket);
        Ok(())
    }

    pub fn get(&self, id: &TicketId) -> Option<&Ticket> {
        self.tickets.get(id)
    }

    /// Mutable access for the orchestrator and lifecycle machine.
    /// State changes must still go through `mark`.
    pub fn get_mut(&mut self, id: &TicketId) -> Option<&mut Ticket> {
        self.tickets.get_mut(id)
    }

    pub fn contains(&self, id: &TicketId) -> bool {
        self.tickets.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    pub fn all_tickets(&self) -> impl Iterator<Item = &Ticket> {
        self.order.iter().filter_map(|id| self.tickets.get(id))
    }

    /// Transition a ticket, enforcing the state machine topology and
    /// appending an audit entry.
    ///
    /// Timestamps are stamped as a side effect: `started_at` on first
    /// assignment, `completed_at` on reaching a terminal state. Worker
    /// ownership and the retry deadline are cleared whenever the ticket
    /// leaves the in-flight states.
    pub fn mark(
        &mut self,
        id: &TicketId,
        to: TicketState,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ticket = self
            .tickets
            .get_mut(id)
            .ok_or_else(|| Error::TicketNotFound { id: id.clone() })?;
        let from = ticket.state;
        if !TicketState::can_transition(from, to) {
            return Err(Error::InvalidTransition {
                id: id.clone(),
                from,
                to,
            });
        }

        ticket.state = to;
        if to == TicketState::Assigned && ticket.started_at.is_none() {
            ticket.started_at = Some(now);
        }
        if to.is_terminal() {
            ticket.completed_at = Some(now);
        }
        if !to.is_in_flight() {
            ticket.assigned_worker = None;
            ticket.retry_at = None;
        }

        self.audit
            .record(TransitionEntry::new(id.clone(), from, to, now, reason));
        flog_debug!("mark ticket={} {} -> {} ({})", id, from, to, reason);
        Ok(())
    }

    /// Queued tickets whose dependencies are all `Completed`, ordered by
    /// priority descending with FIFO tie-break within a tier.
    ///
    /// Restartable: computed fresh from current state on every call.
    pub fn candidates(&self) -> Vec<TicketId> {
        let mut out: Vec<&Ticket> = self
            .order
            .iter()
            .filter_map(|id| self.tickets.get(id))
            .filter(|t| t.state == TicketState::Queued && !t.cancel_requested)
            .filter(|t| {
                t.dependencies.iter().all(|dep| {
                    self.tickets
                        .get(dep)
                        .map(|d| d.state == TicketState::Completed)
                        .unwrap_or(false)
                })
            })
            .collect();
        // Stable sort: `order` is already FIFO, so equal priorities keep
        // their enqueue order.
        out.sort_by_key(|t| Reverse(t.priority));
        out.iter().map(|t| t.id.clone()).collect()
    }

    /// Skip every non-terminal ticket with a dependency that terminated
    /// without completing, transitively. Returns the skipped ids.
    pub fn propagate_skips(&mut self, now: DateTime<Utc>) -> Result<Vec<TicketId>> {
        let mut skipped = Vec::new();
        loop {
            let doomed: Vec<(TicketId, TicketId)> = self
                .order
                .iter()
                .filter_map(|id| self.tickets.get(id))
                .filter(|t| !t.state.is_terminal())
                .filter_map(|t| {
                    t.dependencies
                        .iter()
                        .find(|dep| {
                            self.tickets
                                .get(dep)
                                .map(|d| {
                                    matches!(
                                        d.state,
                                        TicketState::Failed | TicketState::Skipped
                                    )
                                })
                                .unwrap_or(false)
                        })
                        .map(|dep| (t.id.clone(), dep.clone()))
                })
                .collect();
            if doomed.is_empty() {
                break;
            }
            for (id, dep) in doomed {
                let reason = format!("dependency {} terminated without completing", dep);
                self.mark(&id, TicketState::Skipped, &reason, now)?;
                skipped.push(id);
            }
        }
        Ok(skipped)
    }

    /// Flag a ticket for cooperative cancellation. The flag is honored
    /// at the next tick's transition boundary; terminal tickets are
    /// left untouched.
    pub fn request_cancel(&mut self, id: &TicketId) -> Result<()> {
        let ticket = self
            .tickets
            .get_mut(id)
            .ok_or_else(|| Error::TicketNotFound { id: id.clone() })?;
        if !ticket.state.is_terminal() {
            ticket.cancel_requested = true;
        }
        Ok(())
    }

    /// Force every cancel-flagged non-terminal ticket to `Skipped`.
    /// Returns the ids that changed state.
    pub fn apply_cancellations(&mut self, now: DateTime<Utc>) -> Result<Vec<TicketId>> {
        let flagged: Vec<TicketId> = self
            .order
            .iter()
            .filter_map(|id| self.tickets.get(id))
            .filter(|t| t.cancel_requested && !t.state.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for id in &flagged {
            self.mark(id, TicketState::Skipped, "cancelled", now)?;
        }
        Ok(flagged)
    }

    pub fn terminal_tickets(&self) -> Vec<&Ticket> {
        self.all_tickets().filter(|t| t.is_terminal()).collect()
    }

    pub fn completed_tickets(&self) -> Vec<&Ticket> {
        self.all_tickets()
            .filter(|t| t.state == TicketState::Completed)
            .collect()
    }

    /// True once every ticket in the store has reached a terminal state.
    pub fn all_terminal(&self) -> bool {
        !self.tickets.is_empty() && self.tickets.values().all(|t| t.is_terminal())
    }

    /// Remove and return a terminal ticket. Tickets are immutable once
    /// terminal except for this act of archival.
    pub fn archive(&mut self, id: &TicketId) -> Result<Ticket> {
        let terminal = self
            .tickets
            .get(id)
            .ok_or_else(|| Error::TicketNotFound { id: id.clone() })?
            .is_terminal();
        if !terminal {
            return Err(Error::Validation(format!(
                "ticket {} is not terminal, cannot archive",
                id
            )));
        }
        self.order.retain(|o| o != id);
        self.tickets
            .remove(id)
            .ok_or_else(|| Error::TicketNotFound { id: id.clone() })
    }
}
