//! Error type shared by every ledger operation.
//!
//! Each variant is a per-operation failure. Store operations run inside a
//! single write transaction, so returning any of these rolls the transaction
//! back and leaves previously committed rows untouched.

use thiserror::Error;

use crate::types::{MessageStatus, ParseError};

#[derive(Debug, Error)]
pub enum LedgerError {
    /// A required field is missing or malformed, or the operation is not
    /// allowed in the record's current state.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The id does not exist, or it names a soft-deleted row.
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },

    /// An agent step was appended at a position that is already taken or is
    /// not the next one for its message.
    #[error(
        "position {position} is not available for message `{message_id}` (next position is {expected})"
    )]
    SequenceConflict {
        message_id: String,
        position: i32,
        expected: i32,
    },

    /// `finalize` was called on a message that already reached a terminal state.
    #[error("message `{message_id}` was already finalized as {status}")]
    DoubleFinalize {
        message_id: String,
        status: MessageStatus,
    },

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("could not connect to database: {0}")]
    Connection(#[from] diesel::ConnectionError),
}

impl LedgerError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        LedgerError::Validation(reason.into())
    }
}

impl From<ParseError> for LedgerError {
    fn from(err: ParseError) -> Self {
        LedgerError::Validation(err.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
