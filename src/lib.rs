pub mod audit;
pub mod config;
pub mod core;
pub mod error;
pub mod gate;
pub mod log;
pub mod orchestration;

pub use config::Config;
pub use core::ticket::{Complexity, Priority, Ticket, TicketId, TicketSpec, TicketState};
pub use error::{Error, Result};
