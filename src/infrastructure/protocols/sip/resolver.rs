//! Destination resolution for outbound requests (RFC 3263, without NAPTR)
//!
//! A request URI becomes an ordered list of [`Candidate`]s. WebSocket URIs and
//! literal IPs skip DNS entirely; names with an explicit port go straight to
//! A/AAAA; names without one try SRV per transport before falling back.

use super::transport::TransportProtocol;
use super::uri::SipUri;
use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One place to try sending a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub protocol: TransportProtocol,
    /// IPv6 literals keep their brackets
    pub host: String,
    pub port: u16,
}

impl Candidate {
    pub fn new(protocol: TransportProtocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
        }
    }

    fn from_ip(protocol: TransportProtocol, ip: IpAddr, port: u16) -> Self {
        let host = match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{}]", v6),
        };
        Self::new(protocol, host, port)
    }

    pub fn host_unbracketed(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.protocol.as_str(), self.host, self.port)
    }
}

/// SRV answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub target: String,
    pub port: u16,
}

/// Raw DNS queries. Failures come back as empty answers.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn srv(&self, name: &str) -> Vec<SrvRecord>;

    async fn ips(&self, host: &str) -> Vec<IpAddr>;
}

/// System resolver backed by hickory
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryLookup {
    pub fn from_system() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!("Falling back to default DNS configuration: {}", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver }
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn srv(&self, name: &str) -> Vec<SrvRecord> {
        match self.resolver.srv_lookup(name).await {
            Ok(lookup) => lookup
                .iter()
                .map(|srv| SrvRecord {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    target: srv.target().to_utf8().trim_end_matches('.').to_string(),
                    port: srv.port(),
                })
                .collect(),
            Err(e) => {
                debug!("SRV lookup for {} failed: {}", name, e);
                Vec::new()
            }
        }
    }

    async fn ips(&self, host: &str) -> Vec<IpAddr> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().collect(),
            Err(e) => {
                debug!("A/AAAA lookup for {} failed: {}", host, e);
                Vec::new()
            }
        }
    }
}

/// Turns a URI into an ordered candidate list
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, uri: &SipUri) -> Vec<Candidate>;
}

/// RFC 3263 style resolver over a [`DnsLookup`] backend
///
/// ```rust
/// use doorbell_sip::infrastructure::protocols::sip::resolver::{DnsResolver, Resolver, StaticLookup};
/// use doorbell_sip::infrastructure::protocols::sip::{SipUri, TransportProtocol};
///
/// # tokio_test::block_on(async {
/// let resolver = DnsResolver::new(StaticLookup::new());
/// let uri = SipUri::parse("sip:door@192.168.1.10").unwrap();
/// let candidates = resolver.resolve(&uri).await;
/// assert_eq!(candidates.len(), 1);
/// assert_eq!(candidates[0].protocol, TransportProtocol::Udp);
/// assert_eq!(candidates[0].port, 5060);
/// # })
/// ```
pub struct DnsResolver<L: DnsLookup = HickoryLookup> {
    lookup: L,
}

impl DnsResolver<HickoryLookup> {
    pub fn from_system() -> Self {
        Self::new(HickoryLookup::from_system())
    }
}

impl<L: DnsLookup> DnsResolver<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    /// Transports to try, most preferred first
    fn transports(uri: &SipUri) -> Vec<TransportProtocol> {
        if let Some(requested) = uri.transport().and_then(|t| t.parse::<TransportProtocol>().ok()) {
            return vec![requested];
        }
        if uri.is_secure() {
            return vec![TransportProtocol::Tls];
        }
        vec![TransportProtocol::Udp, TransportProtocol::Tcp, TransportProtocol::Tls]
    }

    fn srv_name(protocol: TransportProtocol, host: &str) -> String {
        match protocol {
            TransportProtocol::Udp => format!("_sip._udp.{}", host),
            TransportProtocol::Tls => format!("_sips._tcp.{}", host),
            _ => format!("_sip._tcp.{}", host),
        }
    }

    async fn fan_out(&self, host: &str, port: Option<u16>, transports: &[TransportProtocol]) -> Vec<Candidate> {
        let ips = self.lookup.ips(host).await;
        transports
            .iter()
            .flat_map(|protocol| {
                let port = port.unwrap_or_else(|| protocol.default_port());
                ips.iter().map(move |ip| Candidate::from_ip(*protocol, *ip, port))
            })
            .collect()
    }
}

#[async_trait]
impl<L: DnsLookup> Resolver for DnsResolver<L> {
    async fn resolve(&self, uri: &SipUri) -> Vec<Candidate> {
        let transports = Self::transports(uri);

        // WebSocket targets are dialed by URL, never through DNS SRV
        if let Some(protocol) = transports.first().filter(|p| p.is_websocket()) {
            let port = uri.port.unwrap_or_else(|| protocol.default_port());
            return vec![Candidate::new(*protocol, uri.host.clone(), port)];
        }

        if let Ok(ip) = uri.host_unbracketed().parse::<IpAddr>() {
            let protocol = transports[0];
            let port = uri.port.unwrap_or_else(|| protocol.default_port());
            return vec![Candidate::from_ip(protocol, ip, port)];
        }

        if uri.port.is_some() {
            let candidates = self.fan_out(&uri.host, uri.port, &transports).await;
            debug!("Resolved {} to {} candidate(s) via A/AAAA", uri, candidates.len());
            return candidates;
        }

        let mut candidates = Vec::new();
        for protocol in &transports {
            let mut records = self.lookup.srv(&Self::srv_name(*protocol, &uri.host)).await;
            records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
            for record in records {
                for ip in self.lookup.ips(&record.target).await {
                    candidates.push(Candidate::from_ip(*protocol, ip, record.port));
                }
            }
        }
        if !candidates.is_empty() {
            debug!("Resolved {} to {} candidate(s) via SRV", uri, candidates.len());
            return candidates;
        }

        let candidates = self.fan_out(&uri.host, None, &transports).await;
        if candidates.is_empty() {
            warn!("No candidates for {}", uri);
        }
        candidates
    }
}

/// Fixed host table, for tests and lab setups without DNS
#[derive(Clone, Default)]
pub struct StaticResolver {
    entries: Arc<RwLock<HashMap<String, Vec<Candidate>>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, host: &str, candidates: Vec<Candidate>) {
        self.entries
            .write()
            .await
            .insert(host.to_ascii_lowercase(), candidates);
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, uri: &SipUri) -> Vec<Candidate> {
        self.entries
            .read()
            .await
            .get(&uri.host.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

/// In-memory [`DnsLookup`] with canned answers
#[derive(Default)]
pub struct StaticLookup {
    srv: HashMap<String, Vec<SrvRecord>>,
    ips: HashMap<String, Vec<IpAddr>>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_srv(mut self, name: &str, records: Vec<SrvRecord>) -> Self {
        self.srv.insert(name.to_string(), records);
        self
    }

    pub fn with_ips(mut self, host: &str, ips: Vec<IpAddr>) -> Self {
        self.ips.insert(host.to_string(), ips);
        self
    }
}

#[async_trait]
impl DnsLookup for StaticLookup {
    async fn srv(&self, name: &str) -> Vec<SrvRecord> {
        self.srv.get(name).cloned().unwrap_or_default()
    }

    async fn ips(&self, host: &str) -> Vec<IpAddr> {
        self.ips.get(host).cloned().unwrap_or_default()
    }
}
