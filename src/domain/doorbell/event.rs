//! Doorbell domain events

use crate::domain::shared::events::{DomainEvent, EventMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DoorbellEventKind {
    /// The doorbell is calling
    Ringing { from: String },
    /// Our 200 OK went out
    Answered,
    /// The call is over, hung up by either side
    Ended { reason: String },
    /// The caller gave up before the call was over
    Cancelled,
    Registered { expires: u32 },
    RegistrationFailed { status: Option<u16> },
}

/// Event published by the doorbell manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoorbellEvent {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub call_id: Option<String>,
    #[serde(flatten)]
    pub kind: DoorbellEventKind,
}

impl DoorbellEvent {
    pub fn new(call_id: Option<&str>, kind: DoorbellEventKind) -> Self {
        Self {
            metadata: EventMetadata::new(),
            call_id: call_id.map(str::to_string),
            kind,
        }
    }
}

impl DomainEvent for DoorbellEvent {
    fn event_type(&self) -> &'static str {
        match self.kind {
            DoorbellEventKind::Ringing { .. } => "doorbell.ringing",
            DoorbellEventKind::Answered => "doorbell.answered",
            DoorbellEventKind::Ended { .. } => "doorbell.ended",
            DoorbellEventKind::Cancelled => "doorbell.cancelled",
            DoorbellEventKind::Registered { .. } => "doorbell.registered",
            DoorbellEventKind::RegistrationFailed { .. } => "doorbell.registration_failed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata.occurred_at
    }
}
