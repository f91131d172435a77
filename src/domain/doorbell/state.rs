//! Dialog state for the single doorbell call or registration

use crate::domain::shared::{DomainError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the one outstanding dialog stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogStatus {
    /// Nothing in progress
    Idle,
    /// INVITE received, 180 sent
    Ringing,
    /// 200 OK sent, waiting for ACK
    Answer,
    /// ACK received (or waited out)
    AnswerAck,
    /// BYE sent, waiting for its 200
    Hangup,
    /// BYE acknowledged
    HangupAck,
    /// REGISTER in flight
    Registering,
}

impl DialogStatus {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, next: &DialogStatus) -> bool {
        use DialogStatus::*;

        match (self, next) {
            // A new dialog only ever starts from Idle
            (Idle, Ringing) | (Idle, Registering) => true,

            (Ringing, Answer) => true,
            (Answer, AnswerAck) => true,
            (AnswerAck, Hangup) => true,
            (Hangup, HangupAck) => true,

            // CANCEL, BYE, timeouts and failures all land back here
            (_, Idle) => true,

            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DialogStatus::Idle => "Idle",
            DialogStatus::Ringing => "Ringing",
            DialogStatus::Answer => "Answer",
            DialogStatus::AnswerAck => "AnswerAck",
            DialogStatus::Hangup => "Hangup",
            DialogStatus::HangupAck => "HangupAck",
            DialogStatus::Registering => "Registering",
        }
    }
}

impl fmt::Display for DialogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current status plus the Call-ID it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogState {
    status: DialogStatus,
    call_id: Option<String>,
    since: DateTime<Utc>,
}

impl DialogState {
    pub fn new() -> Self {
        Self {
            status: DialogStatus::Idle,
            call_id: None,
            since: Utc::now(),
        }
    }

    pub fn status(&self) -> DialogStatus {
        self.status
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    /// When the current status was entered
    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    pub fn is_idle(&self) -> bool {
        self.status == DialogStatus::Idle
    }

    /// Claim the dialog for a new call or registration
    pub fn begin(&mut self, status: DialogStatus, call_id: &str) -> Result<()> {
        if let Some(owner) = &self.call_id {
            return Err(DomainError::DialogBusy(owner.clone()));
        }
        self.transition(status)?;
        self.call_id = Some(call_id.to_string());
        Ok(())
    }

    pub fn transition(&mut self, next: DialogStatus) -> Result<()> {
        if !self.status.can_transition_to(&next) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.since = Utc::now();
        if next == DialogStatus::Idle {
            self.call_id = None;
        }
        Ok(())
    }

    /// Force the dialog back to Idle, whatever it was doing
    pub fn reset(&mut self) -> DialogStatus {
        let previous = self.status;
        self.status = DialogStatus::Idle;
        self.call_id = None;
        self.since = Utc::now();
        previous
    }
}

impl Default for DialogState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DialogStatus::*;

    #[test]
    fn test_answer_path() {
        let mut state = DialogState::new();
        state.begin(Ringing, "call-1").unwrap();
        assert_eq!(state.call_id(), Some("call-1"));
        for next in [Answer, AnswerAck, Hangup, HangupAck, Idle] {
            state.transition(next).unwrap();
        }
        assert!(state.is_idle());
        assert_eq!(state.call_id(), None);
    }

    #[test]
    fn test_single_flight() {
        let mut state = DialogState::new();
        state.begin(Ringing, "call-1").unwrap();
        let err = state.begin(Ringing, "call-2").unwrap_err();
        assert_eq!(err, DomainError::DialogBusy("call-1".to_string()));
        assert_eq!(state.call_id(), Some("call-1"));
        assert!(state.begin(Registering, "reg").is_err());
    }

    #[test]
    fn test_transition_error_names_both_states() {
        let mut state = DialogState::new();
        let err = state.transition(Hangup).unwrap_err();
        assert_eq!(err.to_string(), "Invalid dialog transition: Idle -> Hangup");
        assert!(state.is_idle());
    }

    #[test]
    fn test_no_skipping_ahead() {
        assert!(!Idle.can_transition_to(&Answer));
        assert!(!Ringing.can_transition_to(&AnswerAck));
        assert!(!Registering.can_transition_to(&Ringing));
        assert!(Answer.can_transition_to(&Idle));
    }

    #[test]
    fn test_reset_reports_previous() {
        let mut state = DialogState::new();
        state.begin(Registering, "reg-1").unwrap();
        assert_eq!(state.reset(), Registering);
        assert!(state.is_idle());
    }
}
