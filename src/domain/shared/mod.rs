//! Shared kernel - errors and event plumbing used across the domain

pub mod error;
pub mod events;

pub use error::{DomainError, Result};
pub use events::{DomainEvent, EventMetadata};
