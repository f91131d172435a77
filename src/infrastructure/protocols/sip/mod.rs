//! SIP protocol implementation
//!
//! A small RFC 3261 stack sized for a doorbell intercom: one UDP socket,
//! optional stream transports, the four transaction state machines and
//! digest authentication.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Application Layer     │
//! │ (Doorbell SIP manager)  │
//! └───────────┬─────────────┘
//!             │ SipHandler / SipServer::send
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │  (Client/Server TXN)    │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │  (UDP, TCP, TLS, WS)    │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod flow;
pub mod handler;
pub mod headers;
pub mod message;
pub mod parser;
pub mod resolver;
pub mod rport;
pub mod sdp;
pub mod search;
pub mod server;
pub mod transaction;
pub mod transport;
pub mod uri;

pub use auth::{Credentials, DigestAuth, DigestContext};
pub use builder::ResponseBuilder;
pub use flow::{Flow, FlowTokenSigner};
pub use handler::SipHandler;
pub use headers::{AuthHeader, CSeq, Headers, NameAddr, Via};
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use parser::ParseError;
pub use resolver::{Candidate, DnsResolver, Resolver, StaticResolver};
pub use sdp::SdpSession;
pub use search::{sequential_search, RequestSender, SearchResult};
pub use server::{SipServer, SipServerConfig};
pub use transaction::{IncomingRequest, SipTimers, TransactionKey, TransactionLayer};
pub use transport::{Connection, TransportConfig, TransportLayer, TransportProtocol};
pub use uri::SipUri;
