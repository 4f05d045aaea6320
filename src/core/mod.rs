//! Core domain models for foreman orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the scheduler: tickets, their lifecycle states, and the store that
//! tracks them and their dependency graph.

pub mod store;
pub mod ticket;

pub use store::TicketStore;
pub use ticket::{Complexity, Priority, Ticket, TicketId, TicketSpec, TicketState};
