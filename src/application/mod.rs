//! Application layer - Use cases and application services
//!
//! Bridges the SIP stack to the doorbell dialog model: inbound requests are
//! dispatched against the dialog state, and the public operations (answer,
//! register, unregister) drive outbound signaling.

pub mod doorbell_manager;

pub use doorbell_manager::DoorbellSipManager;
