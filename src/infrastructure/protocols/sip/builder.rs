//! SIP message builder utilities

use super::headers::{CSeq, Via};
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use bytes::Bytes;
use rand::Rng;

/// RFC 3261 magic cookie prefix for branch parameters
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Generate a new Via branch
pub fn generate_branch() -> String {
    let random: u64 = rand::thread_rng().gen();
    format!("{}{:x}", BRANCH_MAGIC_COOKIE, random)
}

/// Generate a From/To tag
pub fn generate_tag() -> String {
    let random: u32 = rand::thread_rng().gen();
    format!("{:08x}", random)
}

/// Default reason phrase for a status code
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    reason: Option<String>,
    to_tag: Option<String>,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: None,
            to_tag: None,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn unauthorized() -> Self {
        Self::new(401)
    }

    pub fn server_internal_error() -> Self {
        Self::new(500)
    }

    pub fn reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    /// Add a tag to the To header unless the request already carried one
    pub fn to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(tag.to_string());
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers.push(("content-type".to_string(), content_type.to_string()));
        self.body = body.into();
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let reason = self
            .reason
            .unwrap_or_else(|| reason_phrase(self.status_code).to_string());
        let mut response = SipResponse::new(self.status_code, reason);

        // Copy essential headers from request
        response.headers.via = request.headers.via.clone();
        response.headers.from = request.headers.from.clone();
        response.headers.call_id = request.headers.call_id.clone();
        response.headers.cseq = request.headers.cseq.clone();

        let mut to = request
            .headers
            .to
            .clone()
            .ok_or_else(|| SipError::InvalidMessage("request has no To header".to_string()))?;
        if let Some(tag) = &self.to_tag {
            if to.tag().is_none() {
                to = to.with_tag(tag);
            }
        }
        response.headers.to = Some(to);

        for (name, value) in self.headers {
            response.headers.set(&name, value);
        }
        response.body = self.body;

        Ok(response)
    }
}

/// Response generated locally on behalf of a request (timeouts, transport failures)
pub fn synthesize_response(request: &SipRequest, status: u16) -> SipResponse {
    let reason = reason_phrase(status);
    let mut response = SipResponse::new(status, reason);
    response.headers.via = request.headers.via.clone();
    response.headers.from = request.headers.from.clone();
    response.headers.to = request.headers.to.clone();
    response.headers.call_id = request.headers.call_id.clone();
    response.headers.cseq = request.headers.cseq.clone();
    response
}

/// ACK for a non-2xx final response to an INVITE (RFC 3261 Section 17.1.1.3)
pub fn build_ack(invite: &SipRequest, response: &SipResponse) -> SipRequest {
    let mut ack = SipRequest::new(SipMethod::Ack, invite.uri.clone());
    ack.headers.via = invite.headers.via.iter().take(1).cloned().collect::<Vec<Via>>();
    ack.headers.from = invite.headers.from.clone();
    ack.headers.to = response.headers.to.clone().or_else(|| invite.headers.to.clone());
    ack.headers.call_id = invite.headers.call_id.clone();
    ack.headers.cseq = invite
        .headers
        .cseq
        .as_ref()
        .map(|c| CSeq::new(c.seq, SipMethod::Ack));
    ack.headers.route = invite.headers.route.clone();
    ack.headers.set("max-forwards", "70");
    ack
}
