//! Domain layer - Core business logic and rules
//!
//! This layer contains:
//! - The doorbell dialog state machine
//! - Doorbell events published to the rest of the system
//! - The shared kernel (errors, event metadata)

pub mod doorbell;
pub mod shared;

// Re-export commonly used types
pub use shared::{DomainError, Result};
