//! SIP request handlers

use super::message::{SipError, SipResponse};
use super::transaction::IncomingRequest;
use async_trait::async_trait;

/// Transaction user for inbound requests.
///
/// Requests are handed over one at a time in arrival order. Returning
/// `Ok(Some(response))` sends it through the request's server transaction.
/// `Ok(None)` sends nothing for an ACK; any other request left unanswered, or
/// an `Err`, gets `500 Server Internal Error` so its transaction can complete.
#[async_trait]
pub trait SipHandler: Send + Sync {
    async fn handle_request(&self, request: &IncomingRequest) -> Result<Option<SipResponse>, SipError>;
}
