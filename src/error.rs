use thiserror::Error;

use crate::core::ticket::{TicketId, TicketState};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate ticket id: {id}")]
    DuplicateTicket { id: TicketId },

    #[error("Ticket not found: {id}")]
    TicketNotFound { id: TicketId },

    #[error("Invalid transition for ticket {id}: {from} -> {to}")]
    InvalidTransition {
        id: TicketId,
        from: TicketState,
        to: TicketState,
    },

    #[error("No open escalation for ticket: {id}")]
    EscalationNotFound { id: TicketId },
}

pub type Result<T> = std::result::Result<T, Error>;
