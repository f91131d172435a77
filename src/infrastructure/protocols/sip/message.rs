//! SIP message types

use super::headers::Headers;
use super::parser;
use super::uri::SipUri;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::TransportError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
    /// Any method token this stack has no name for
    Extension(String),
}

impl SipMethod {
    pub fn as_str(&self) -> &str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
            SipMethod::Extension(token) => token,
        }
    }

    /// Methods are case-sensitive on the wire
    pub fn from_token(token: &str) -> Self {
        match token {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "CANCEL" => SipMethod::Cancel,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            other => SipMethod::Extension(other.to_string()),
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SIP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: SipUri,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: SipUri) -> Self {
        Self {
            method,
            uri,
            version: "2.0".to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id.as_deref()
    }

    pub fn branch(&self) -> Option<&str> {
        self.headers.top_via().and_then(|v| v.branch())
    }

    pub fn to_bytes(&self) -> Bytes {
        parser::serialize_request(self)
    }
}

/// SIP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status: u16,
    /// Reason phrase as received; may be empty
    pub reason: String,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            version: "2.0".to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn is_provisional(&self) -> bool {
        self.status < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id.as_deref()
    }

    pub fn branch(&self) -> Option<&str> {
        self.headers.top_via().and_then(|v| v.branch())
    }

    pub fn to_bytes(&self) -> Bytes {
        parser::serialize_response(self)
    }
}

/// SIP message (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        Ok(parser::parse_message(data)?)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        parser::serialize(self)
    }
}

impl From<SipRequest> for SipMessage {
    fn from(request: SipRequest) -> Self {
        SipMessage::Request(request)
    }
}

impl From<SipResponse> for SipMessage {
    fn from(response: SipResponse) -> Self {
        SipMessage::Response(response)
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMessage::Request(req) => write!(f, "{} {}", req.method, req.uri),
            SipMessage::Response(resp) => write!(f, "{} {}", resp.status, resp.reason),
        }
    }
}
