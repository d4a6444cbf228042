use thiserror::Error as ThisError;

use crate::credits::LedgerError;
use crate::money::MoneyError;
use crate::types::GradeId;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Ledger transition rejected (insufficient credit).
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: &'static str, id: String },

    /// A record already exists under the same identifier
    #[error("{resource} with ID {id} already exists")]
    AlreadyExists { resource: &'static str, id: String },

    /// A grade was asked to transition from the wrong state
    #[error("grade {grade} is {actual}, expected {expected}")]
    InvalidState {
        grade: GradeId,
        expected: &'static str,
        actual: &'static str,
    },

    /// Malformed money value reached the storage layer
    #[error(transparent)]
    Money(#[from] MoneyError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Returns a user-safe error message, without leaking internal
    /// implementation details.
    pub fn user_message(&self) -> String {
        match self {
            Error::Ledger(LedgerError::InsufficientCredit { .. }) => {
                "You do not have enough credit for this grading.".to_string()
            }
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::AlreadyExists { .. }
            | Error::InvalidState { .. }
            | Error::Money(_)
            | Error::Other(_) => "Internal service error".to_string(),
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
