//! doorbell-sip - SIP signaling for doorbell intercoms
//!
//! Answers the doorbell's INVITE, hangs up again, and registers with a peer
//! in client mode. Laid out in layers: `domain` holds the dialog model,
//! `infrastructure` the SIP stack, `application` the doorbell manager.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::{DomainError, Result};
