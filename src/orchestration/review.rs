//! Review queue builder: rank terminal tickets for human consumption.
//!
//! A pure function over the terminal ticket set. Security-flagged
//! tickets always sort ahead of unflagged ones regardless of score;
//! within each group the order is quality score descending, then
//! priority, then completion time. Failed and skipped tickets are
//! appended after completed ones with their transition history so no
//! ticket disappears silently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::audit::{MemoryAuditSink, TransitionEntry};
use crate::core::ticket::{Priority, Ticket, TicketId, TicketState};

/// One entry in the ranked review queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub ticket_id: TicketId,
    pub title: String,
    pub state: TicketState,
    pub priority: Priority,
    pub quality_score: Option<f64>,
    pub security_flagged: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// Full transition log, attached for failed/skipped diagnosis and
    /// available for completed tickets too.
    #[serde(default)]
    pub history: Vec<TransitionEntry>,
}

impl ReviewItem {
    fn from_ticket(ticket: &Ticket) -> Self {
        Self {
            ticket_id: ticket.id.clone(),
            title: ticket.title.clone(),
            state: ticket.state,
            priority: ticket.priority,
            quality_score: ticket.quality_score,
            security_flagged: ticket.security_flagged,
            completed_at: ticket.completed_at,
            history: Vec::new(),
        }
    }
}

/// Builds the prioritized human review queue from terminal tickets.
pub struct ReviewQueueBuilder;

impl ReviewQueueBuilder {
    /// Rank terminal tickets. Deterministic: the same input multiset
    /// yields the same output order (stable sort over a stable
    /// pre-order by ticket id).
    pub fn build<'a, I>(tickets: I) -> Vec<ReviewItem>
    where
        I: IntoIterator<Item = &'a Ticket>,
    {
        let mut items: Vec<ReviewItem> = tickets
            .into_iter()
            .filter(|t| t.is_terminal())
            .map(ReviewItem::from_ticket)
            .collect();
        // Normalize input order so ranking is input-order independent
        items.sort_by(|a, b| a.ticket_id.cmp(&b.ticket_id));
        items.sort_by(Self::rank);
        items
    }

    /// Like `build`, with each item's transition history attached from
    /// the in-memory audit sink.
    pub fn build_with_history<'a, I>(tickets: I, audit: &MemoryAuditSink) -> Vec<ReviewItem>
    where
        I: IntoIterator<Item = &'a Ticket>,
    {
        let mut items = Self::build(tickets);
        for item in &mut items {
            item.history = audit.for_ticket(&item.ticket_id);
        }
        items
    }

    fn rank(a: &ReviewItem, b: &ReviewItem) -> Ordering {
        // Completed work ranks ahead of failures/skips
        let section = |item: &ReviewItem| match item.state {
            TicketState::Completed => 0u8,
            _ => 1,
        };
        section(a)
            .cmp(&section(b))
            // Security-first within a section
            .then_with(|| b.security_flagged.cmp(&a.security_flagged))
            .then_with(|| {
                let score = |item: &ReviewItem| item.quality_score.unwrap_or(0.0);
                score(b).partial_cmp(&score(a)).unwrap_or(Ordering::Equal)
            })
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.completed_at.cmp(&b.completed_at))
    }
}
