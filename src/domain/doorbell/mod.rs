//! Doorbell bounded context
//!
//! One call or registration at a time. The state machine rejects a second
//! dialog until the first is back to Idle.

pub mod event;
pub mod state;

pub use event::{DoorbellEvent, DoorbellEventKind};
pub use state::{DialogState, DialogStatus};
