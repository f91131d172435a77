//! Configuration management
//!
//! Defaults, then an optional TOML file, then `DOORBELL__*` environment
//! variables (`DOORBELL__SIP__LOCAL_PORT=5062`).

use crate::infrastructure::protocols::sip::SipTimers;
use crate::infrastructure::tls::TlsConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "DOORBELL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub doorbell: DoorbellConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    /// Local address to bind; probed against the doorbell's address family when unset
    pub local_ip: Option<String>,
    /// Fixed local port; a random port in 10000..60000 when unset
    pub local_port: Option<u16>,
    pub public_address: Option<String>,
    pub public_port: Option<u16>,
    pub rport: bool,
    pub listen_tcp: bool,
    /// Host part of flow-token URIs
    pub hostname: Option<String>,
    /// Zero disables the ring time limit
    pub ring_time_limit_ms: u64,
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
    pub tls: TlsConfig,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            local_ip: None,
            local_port: None,
            public_address: None,
            public_port: None,
            rport: true,
            listen_tcp: false,
            hostname: None,
            ring_time_limit_ms: 600_000,
            t1_ms: 500,
            t2_ms: 4_000,
            t4_ms: 5_000,
            tls: TlsConfig::default(),
        }
    }
}

impl SipConfig {
    pub fn timers(&self) -> SipTimers {
        SipTimers {
            t1: Duration::from_millis(self.t1_ms),
            t2: Duration::from_millis(self.t2_ms),
            t4: Duration::from_millis(self.t4_ms),
            ring_time_limit: Duration::from_millis(self.ring_time_limit_ms),
        }
    }
}

/// Which side of the intercom this device plays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorbellMode {
    /// Accept calls from the doorbell at `doorbell_ip`
    #[default]
    Gateway,
    /// Register with a peer and accept calls relayed by it
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DoorbellConfig {
    pub mode: DoorbellMode,
    pub doorbell_ip: String,
    pub auto_answer: bool,
    pub auto_answer_delay_ms: u64,
    /// How long `answer()` waits for the ACK to its 200 OK
    pub ack_timeout_ms: u64,
    /// How long `answer()` waits for the 200 to its BYE
    pub bye_timeout_ms: u64,
    pub client: ClientConfig,
}

impl Default for DoorbellConfig {
    fn default() -> Self {
        Self {
            mode: DoorbellMode::Gateway,
            doorbell_ip: "192.168.1.10".to_string(),
            auto_answer: false,
            auto_answer_delay_ms: 1_000,
            ack_timeout_ms: 5_000,
            bye_timeout_ms: 5_000,
            client: ClientConfig::default(),
        }
    }
}

impl DoorbellConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn bye_timeout(&self) -> Duration {
        Duration::from_millis(self.bye_timeout_ms)
    }
}

/// Registration credentials for client mode
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub user: String,
    pub password: String,
    pub peer_ip: String,
    pub peer_port: u16,
    /// Reused as the REGISTER Call-ID; random per attempt when unset
    pub call_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            peer_ip: String::new(),
            peer_port: 5060,
            call_id: None,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("peer_ip", &self.peer_ip)
            .field("peer_port", &self.peer_port)
            .field("call_id", &self.call_id)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Layer defaults, the TOML file at `path` (if it exists) and the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default()).context("encoding default configuration")?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml).required(false));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("reading configuration")?
            .try_deserialize()
            .context("decoding configuration")
    }

    /// Render as TOML, e.g. to seed a config file
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("encoding configuration as TOML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.doorbell.mode, DoorbellMode::Gateway);
        assert!(config.sip.rport);
        assert_eq!(config.sip.timers().timeout(), Duration::from_secs(32));
        assert_eq!(config.sip.timers().ring_time_limit, Duration::from_secs(600));
        assert_eq!(config.doorbell.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.doorbell.bye_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_toml_file() {
        let path = std::env::temp_dir().join(format!("doorbell-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
[sip]
local_port = 5062
t1_ms = 250

[doorbell]
mode = "client"
doorbell_ip = "10.0.0.7"

[doorbell.client]
user = "alice"
password = "secret"
peer_ip = "10.0.0.1"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.sip.local_port, Some(5062));
        assert_eq!(config.sip.timers().t1, Duration::from_millis(250));
        assert_eq!(config.sip.t2_ms, 4_000);
        assert_eq!(config.doorbell.mode, DoorbellMode::Client);
        assert_eq!(config.doorbell.client.user, "alice");
        assert_eq!(config.doorbell.client.peer_port, 5060);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/doorbell.toml"))).unwrap();
        assert_eq!(config.doorbell.doorbell_ip, "192.168.1.10");
    }

    #[test]
    fn test_to_toml_round_trip() {
        let mut config = Config::default();
        config.doorbell.auto_answer = true;
        let text = config.to_toml().unwrap();
        assert!(text.contains("[doorbell]"));

        let parsed: Config = toml::from_str(&text).unwrap();
        assert!(parsed.doorbell.auto_answer);
        assert_eq!(parsed.sip.ring_time_limit_ms, 600_000);
    }

    #[test]
    fn test_client_password_redacted() {
        let mut client = ClientConfig::default();
        client.password = "hunter2".to_string();
        assert!(!format!("{:?}", client).contains("hunter2"));
    }
}
