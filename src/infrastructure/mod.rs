//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - The SIP protocol stack
//! - TLS client configuration for stream transports

pub mod protocols;
pub mod tls;
