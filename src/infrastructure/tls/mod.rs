/// TLS configuration for SIP stream transports
pub mod config;

pub use config::TlsConfig;
