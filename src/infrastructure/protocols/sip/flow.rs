//! Flow tokens: authenticated socket-flow identifiers carried in a URI user part
//!
//! A flow is the `{protocol, remote, local}` association a message travelled
//! over. Encoding it into a URI lets a later request be routed back over the
//! same socket even when the peer has no routable address of its own.

use super::message::SipError;
use super::transport::TransportProtocol;
use super::uri::SipUri;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

/// One transport association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flow {
    pub protocol: TransportProtocol,
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

impl Flow {
    pub fn new(protocol: TransportProtocol, remote: SocketAddr, local: SocketAddr) -> Self {
        Self {
            protocol,
            remote,
            local,
        }
    }

    /// `PROTO,remote-ip,remote-port,local-ip,local-port`
    fn fields(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.protocol.as_str(),
            self.remote.ip(),
            self.remote.port(),
            self.local.ip(),
            self.local.port()
        )
    }

    fn from_fields(fields: &str) -> Option<Self> {
        let mut parts = fields.split(',');
        let protocol = parts.next()?.parse().ok()?;
        let remote_ip = parts.next()?.parse().ok()?;
        let remote_port = parts.next()?.parse().ok()?;
        let local_ip = parts.next()?.parse().ok()?;
        let local_port = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            protocol,
            remote: SocketAddr::new(remote_ip, remote_port),
            local: SocketAddr::new(local_ip, local_port),
        })
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} <-> {}", self.protocol.as_str(), self.local, self.remote)
    }
}

/// Signs and verifies flow tokens with a secret owned by one transport instance
#[derive(Clone)]
pub struct FlowTokenSigner {
    keyed: HmacSha1,
}

impl FlowTokenSigner {
    pub fn new(secret: &[u8]) -> Result<Self, SipError> {
        let keyed = HmacSha1::new_from_slice(secret)
            .map_err(|e| SipError::Internal(format!("flow token key: {}", e)))?;
        Ok(Self { keyed })
    }

    /// Signer with a fresh random 32-byte secret
    pub fn random() -> Result<Self, SipError> {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::new(&secret)
    }

    pub fn encode(&self, flow: &Flow) -> String {
        let fields = flow.fields();
        let mut mac = self.keyed.clone();
        mac.update(fields.as_bytes());
        let hash = STANDARD.encode(mac.finalize().into_bytes());
        URL_SAFE.encode(format!("{},{}", hash, fields))
    }

    /// Decode a token, rejecting it unless the HMAC matches
    pub fn decode(&self, token: &str) -> Option<Flow> {
        let raw = URL_SAFE.decode(token).ok()?;
        let raw = String::from_utf8(raw).ok()?;
        let (hash, fields) = raw.split_once(',')?;
        let hash = STANDARD.decode(hash).ok()?;

        let mut mac = self.keyed.clone();
        mac.update(fields.as_bytes());
        if mac.verify_slice(&hash).is_err() {
            debug!("Rejecting flow token with bad signature");
            return None;
        }
        Flow::from_fields(fields)
    }

    /// `sip:<token>@<hostname>` (`sips` for TLS flows)
    pub fn encode_uri(&self, flow: &Flow, hostname: &str) -> SipUri {
        let mut uri = SipUri::new(hostname).with_user(self.encode(flow));
        if flow.protocol == TransportProtocol::Tls {
            uri.scheme = "sips".to_string();
        }
        uri
    }

    pub fn decode_uri(&self, uri: &SipUri) -> Option<Flow> {
        uri.user.as_deref().and_then(|user| self.decode(user))
    }
}

impl fmt::Debug for FlowTokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FlowTokenSigner")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> Flow {
        Flow::new(
            TransportProtocol::Udp,
            "192.168.1.20:5060".parse().unwrap(),
            "192.168.1.50:40000".parse().unwrap(),
        )
    }

    #[test]
    fn test_round_trip() {
        let signer = FlowTokenSigner::random().unwrap();
        let token = signer.encode(&flow());
        assert!(!token.contains('+') && !token.contains('/'));
        assert_eq!(signer.decode(&token), Some(flow()));
    }

    #[test]
    fn test_ipv6_flow() {
        let signer = FlowTokenSigner::new(b"secret").unwrap();
        let f = Flow::new(
            TransportProtocol::Tls,
            "[2001:db8::1]:5061".parse().unwrap(),
            "[2001:db8::2]:5061".parse().unwrap(),
        );
        let uri = signer.encode_uri(&f, "door.local");
        assert_eq!(uri.scheme, "sips");
        assert_eq!(uri.host, "door.local");
        assert_eq!(signer.decode_uri(&uri), Some(f));
    }

    #[test]
    fn test_other_secret_rejects() {
        let a = FlowTokenSigner::new(b"secret-a").unwrap();
        let b = FlowTokenSigner::new(b"secret-b").unwrap();
        assert_eq!(b.decode(&a.encode(&flow())), None);
    }

    #[test]
    fn test_garbage_rejects() {
        let signer = FlowTokenSigner::random().unwrap();
        assert_eq!(signer.decode("not a token"), None);
        assert_eq!(signer.decode(""), None);
    }
}
