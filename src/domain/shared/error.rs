//! Domain errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid dialog transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Another call or registration already holds the dialog
    #[error("Dialog busy with {0}")]
    DialogBusy(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
