//! SIP transport layer - UDP, TCP, TLS and WebSocket flows
//!
//! One UDP socket is shared by every datagram flow. Stream transports get one
//! `StreamConnection` per remote, reused while it stays up and forgotten when
//! its reader hits EOF or an error.

use super::flow::{Flow, FlowTokenSigner};
use super::message::{SipError, SipMessage, SipRequest};
use super::parser::framed_length;
use super::resolver::Candidate;
use super::rport;
use super::uri::SipUri;
use crate::infrastructure::tls::TlsConfig;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_MESSAGE_SIZE: usize = 65535;

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
            TransportProtocol::Ws => "WS",
            TransportProtocol::Wss => "WSS",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportProtocol::Udp => 5060,
            TransportProtocol::Tcp => 5060,
            TransportProtocol::Tls => 5061,
            TransportProtocol::Ws => 80,
            TransportProtocol::Wss => 443,
        }
    }

    /// Everything but UDP retransmits on its own
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportProtocol::Udp)
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, TransportProtocol::Ws | TransportProtocol::Wss)
    }
}

impl FromStr for TransportProtocol {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportProtocol::Udp),
            "TCP" => Ok(TransportProtocol::Tcp),
            "TLS" => Ok(TransportProtocol::Tls),
            "WS" => Ok(TransportProtocol::Ws),
            "WSS" => Ok(TransportProtocol::Wss),
            other => Err(SipError::TransportError(format!("unknown transport: {}", other))),
        }
    }
}

/// A send/receive association with one remote
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    fn protocol(&self) -> TransportProtocol;

    fn flow(&self) -> Flow;

    async fn send(&self, message: &SipMessage) -> Result<(), SipError>;

    /// Drop one reference. The underlying socket stays up.
    fn release(&self);

    fn is_reliable(&self) -> bool {
        self.protocol().is_reliable()
    }
}

/// Incoming SIP message with the connection it arrived on
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub connection: Arc<dyn Connection>,
}

impl IncomingMessage {
    pub fn source(&self) -> SocketAddr {
        self.connection.flow().remote
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.connection.protocol()
    }
}

/// Datagram flow over the shared UDP socket; lifecycle is a no-op
pub struct UdpConnection {
    socket: Arc<UdpSocket>,
    flow: Flow,
}

impl fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpConnection({})", self.flow)
    }
}

#[async_trait]
impl Connection for UdpConnection {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    fn flow(&self) -> Flow {
        self.flow
    }

    async fn send(&self, message: &SipMessage) -> Result<(), SipError> {
        let data = message.to_bytes();
        debug!("Sending {} bytes to {} via UDP: {}", data.len(), self.flow.remote, message);
        self.socket
            .send_to(&data, self.flow.remote)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;
        Ok(())
    }

    fn release(&self) {}
}

trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

type BoxedIo = Box<dyn IoStream>;

enum StreamWriter {
    Raw(WriteHalf<BoxedIo>),
    WebSocket(SplitSink<WebSocketStream<BoxedIo>, Message>),
}

/// TCP, TLS or WebSocket connection, reference counted
pub struct StreamConnection {
    flow: Flow,
    writer: Mutex<StreamWriter>,
    refs: AtomicUsize,
}

impl StreamConnection {
    fn new(flow: Flow, writer: StreamWriter) -> Self {
        Self {
            flow,
            writer: Mutex::new(writer),
            refs: AtomicUsize::new(0),
        }
    }

    fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let result = match &mut *writer {
            StreamWriter::Raw(w) => w.shutdown().await.map_err(|e| e.to_string()),
            StreamWriter::WebSocket(sink) => sink.close().await.map_err(|e| e.to_string()),
        };
        if let Err(e) = result {
            debug!("Error closing {}: {}", self.flow, e);
        }
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamConnection({}, refs={})", self.flow, self.ref_count())
    }
}

#[async_trait]
impl Connection for StreamConnection {
    fn protocol(&self) -> TransportProtocol {
        self.flow.protocol
    }

    fn flow(&self) -> Flow {
        self.flow
    }

    async fn send(&self, message: &SipMessage) -> Result<(), SipError> {
        let data = message.to_bytes();
        debug!(
            "Sending {} bytes to {} via {}: {}",
            data.len(),
            self.flow.remote,
            self.flow.protocol.as_str(),
            message
        );

        let mut writer = self.writer.lock().await;
        match &mut *writer {
            StreamWriter::Raw(w) => {
                w.write_all(&data).await?;
                w.flush().await?;
            }
            StreamWriter::WebSocket(sink) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                sink.send(Message::text(text))
                    .await
                    .map_err(|e| SipError::TransportError(format!("WebSocket send: {}", e)))?;
            }
        }
        Ok(())
    }

    fn release(&self) {
        let _ = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }
}

/// Transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub bind: SocketAddr,
    /// Host written into outbound Via headers (defaults to the bound IP)
    pub public_address: Option<String>,
    pub public_port: Option<u16>,
    /// Ask for symmetric response routing on UDP
    pub rport: bool,
    /// Accept inbound TCP on the UDP port
    pub listen_tcp: bool,
    /// Host part of flow-token URIs (defaults to the bound IP)
    pub hostname: Option<String>,
    pub tls: TlsConfig,
}

impl TransportConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            public_address: None,
            public_port: None,
            rport: true,
            listen_tcp: false,
            hostname: None,
            tls: TlsConfig::default(),
        }
    }
}

type StreamKey = (TransportProtocol, SocketAddr);

struct Shared {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    streams: RwLock<HashMap<StreamKey, Arc<StreamConnection>>>,
    inbound: mpsc::UnboundedSender<IncomingMessage>,
}

impl Shared {
    /// Parse, stamp and hand a message to the transaction layer
    fn deliver(&self, data: &[u8], connection: Arc<dyn Connection>) {
        let remote = connection.flow().remote;
        let message = match SipMessage::parse(data) {
            Ok(m) => m,
            Err(e) => {
                if !data.iter().all(|b| b.is_ascii_whitespace()) {
                    warn!("Discarding unparsable message from {}: {}", remote, e);
                }
                return;
            }
        };

        let message = match message {
            SipMessage::Request(mut request) => {
                rport::stamp_inbound(&mut request, remote);
                SipMessage::Request(request)
            }
            response => response,
        };
        debug!("Received from {} via {}: {}", remote, connection.protocol().as_str(), message);

        if self.inbound.send(IncomingMessage { message, connection }).is_err() {
            warn!("Inbound channel closed, dropping message from {}", remote);
        }
    }

    async fn register(self: &Arc<Self>, io: BoxedIo, flow: Flow) -> Arc<StreamConnection> {
        let (reader, writer) = tokio::io::split(io);
        let connection = Arc::new(StreamConnection::new(flow, StreamWriter::Raw(writer)));
        self.streams
            .write()
            .await
            .insert((flow.protocol, flow.remote), connection.clone());

        let shared = self.clone();
        let conn = connection.clone();
        tokio::spawn(async move {
            shared.read_stream(reader, conn).await;
        });
        connection
    }

    async fn register_websocket(
        self: &Arc<Self>,
        ws: WebSocketStream<BoxedIo>,
        flow: Flow,
    ) -> Arc<StreamConnection> {
        let (sink, stream) = ws.split();
        let connection = Arc::new(StreamConnection::new(flow, StreamWriter::WebSocket(sink)));
        self.streams
            .write()
            .await
            .insert((flow.protocol, flow.remote), connection.clone());

        let shared = self.clone();
        let conn = connection.clone();
        tokio::spawn(async move {
            shared.read_websocket(stream, conn).await;
        });
        connection
    }

    async fn read_stream(self: Arc<Self>, mut reader: ReadHalf<BoxedIo>, connection: Arc<StreamConnection>) {
        let mut buf = BytesMut::with_capacity(8192);
        loop {
            // CRLF keep-alives between messages
            while buf.first().map_or(false, |b| *b == b'\r' || *b == b'\n') {
                buf.advance(1);
            }
            match framed_length(&buf, MAX_MESSAGE_SIZE) {
                Ok(Some(total)) if buf.len() >= total => {
                    let frame = buf.split_to(total);
                    self.deliver(&frame, connection.clone());
                    continue;
                }
                Ok(Some(_)) => {}
                Ok(None) if buf.len() > MAX_MESSAGE_SIZE => {
                    warn!("Oversized header block from {}, closing", connection.flow.remote);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Unframeable message from {}: {}, closing", connection.flow.remote, e);
                    break;
                }
            }

            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!("Connection closed by {}", connection.flow.remote);
                    break;
                }
                Ok(size) => debug!("Received {} bytes from {}", size, connection.flow.remote),
                Err(e) => {
                    warn!("Read error on {}: {}", connection.flow, e);
                    break;
                }
            }
        }
        self.forget(&connection).await;
    }

    async fn read_websocket(
        self: Arc<Self>,
        mut stream: SplitStream<WebSocketStream<BoxedIo>>,
        connection: Arc<StreamConnection>,
    ) {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => self.deliver(text.as_bytes(), connection.clone()),
                Ok(Message::Binary(data)) => self.deliver(&data, connection.clone()),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error on {}: {}", connection.flow, e);
                    break;
                }
            }
        }
        self.forget(&connection).await;
    }

    /// Error-driven teardown: the connection is no longer offered for reuse
    async fn forget(&self, connection: &Arc<StreamConnection>) {
        let key = (connection.flow.protocol, connection.flow.remote);
        let mut streams = self.streams.write().await;
        if streams.get(&key).map_or(false, |c| Arc::ptr_eq(c, connection)) {
            streams.remove(&key);
            info!("Dropped {}", connection.flow);
        }
    }
}

/// Transport layer handle
pub struct TransportLayer {
    config: TransportConfig,
    shared: Arc<Shared>,
    signer: FlowTokenSigner,
    tls: Option<TlsConnector>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TransportLayer {
    /// Bind the UDP socket (and optional TCP listener) and start receiving.
    pub async fn bind(
        config: TransportConfig,
        inbound: mpsc::UnboundedSender<IncomingMessage>,
    ) -> Result<Self, SipError> {
        Self::bind_with_signer(config, inbound, FlowTokenSigner::random()?).await
    }

    pub async fn bind_with_signer(
        config: TransportConfig,
        inbound: mpsc::UnboundedSender<IncomingMessage>,
        signer: FlowTokenSigner,
    ) -> Result<Self, SipError> {
        let tls = config.tls.connector()?;

        let socket = UdpSocket::bind(config.bind)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket {}: {}", config.bind, e)))?;
        let local_addr = socket.local_addr()?;
        info!("UDP transport listening on {}", local_addr);

        let shared = Arc::new(Shared {
            socket: Arc::new(socket),
            local_addr,
            streams: RwLock::new(HashMap::new()),
            inbound,
        });

        let mut tasks = vec![tokio::spawn(Self::receive_loop(shared.clone()))];

        if config.listen_tcp {
            let listener = TcpListener::bind(local_addr)
                .await
                .map_err(|e| SipError::TransportError(format!("Failed to bind TCP socket: {}", e)))?;
            info!("TCP transport listening on {}", local_addr);
            tasks.push(tokio::spawn(Self::accept_loop(listener, shared.clone())));
        }

        Ok(Self {
            config,
            shared,
            signer,
            tls,
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    async fn receive_loop(shared: Arc<Shared>) {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

        loop {
            match shared.socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);
                    let connection = Arc::new(UdpConnection {
                        socket: shared.socket.clone(),
                        flow: Flow::new(TransportProtocol::Udp, source, shared.local_addr),
                    });
                    shared.deliver(&buf[..size], connection);
                }
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms
                    warn!("Failed to receive UDP packet: {}", e);
                }
            }
        }
    }

    async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
        loop {
            match listener.accept().await {
                Ok((stream, source)) => {
                    info!("Accepted TCP connection from {}", source);
                    let local = stream.local_addr().unwrap_or(shared.local_addr);
                    let flow = Flow::new(TransportProtocol::Tcp, source, local);
                    shared.register(Box::new(stream), flow).await;
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                    break;
                }
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Connection to a resolved candidate: shared UDP flow, or a live/new stream
    pub async fn open(&self, candidate: &Candidate) -> Result<Arc<dyn Connection>, SipError> {
        let remote = tokio::net::lookup_host((candidate.host_unbracketed(), candidate.port))
            .await
            .map_err(|e| SipError::TransportError(format!("resolve {}: {}", candidate, e)))?
            .next()
            .ok_or_else(|| SipError::TransportError(format!("no address for {}", candidate)))?;

        if candidate.protocol == TransportProtocol::Udp {
            return Ok(Arc::new(UdpConnection {
                socket: self.shared.socket.clone(),
                flow: Flow::new(TransportProtocol::Udp, remote, self.shared.local_addr),
            }));
        }

        if let Some(existing) = self.shared.streams.read().await.get(&(candidate.protocol, remote)) {
            existing.acquire();
            debug!("Reusing {}", existing.flow);
            return Ok(existing.clone());
        }

        let connection = self.dial(candidate, remote).await?;
        connection.acquire();
        Ok(connection)
    }

    async fn dial(&self, candidate: &Candidate, remote: SocketAddr) -> Result<Arc<StreamConnection>, SipError> {
        info!("Connecting to {} via {}", remote, candidate.protocol.as_str());
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(remote))
            .await
            .map_err(|_| SipError::TransportError(format!("connect to {} timed out", remote)))?
            .map_err(|e| SipError::TransportError(format!("Failed to connect to {}: {}", remote, e)))?;
        let local = tcp.local_addr()?;
        let flow = Flow::new(candidate.protocol, remote, local);

        let io: BoxedIo = match candidate.protocol {
            TransportProtocol::Tls | TransportProtocol::Wss => {
                Box::new(self.tls_handshake(tcp, candidate).await?)
            }
            _ => Box::new(tcp),
        };

        if candidate.protocol.is_websocket() {
            let ws = websocket_handshake(io, candidate).await?;
            Ok(self.shared.register_websocket(ws, flow).await)
        } else {
            Ok(self.shared.register(io, flow).await)
        }
    }

    async fn tls_handshake(
        &self,
        tcp: TcpStream,
        candidate: &Candidate,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, SipError> {
        let connector = self
            .tls
            .as_ref()
            .ok_or_else(|| SipError::TransportError("TLS requested but no CA bundle configured".to_string()))?;
        let name = self
            .config
            .tls
            .server_name
            .clone()
            .unwrap_or_else(|| candidate.host_unbracketed().to_string());
        let server_name = rustls::pki_types::ServerName::try_from(name)
            .map_err(|e| SipError::TransportError(format!("invalid TLS server name: {}", e)))?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| SipError::TransportError(format!("TLS handshake with {}: {}", candidate, e)))
    }

    /// Connection that owns `flow`, if it is still up
    pub async fn get(&self, flow: &Flow) -> Option<Arc<dyn Connection>> {
        if flow.protocol == TransportProtocol::Udp {
            if flow.local != self.shared.local_addr {
                return None;
            }
            return Some(Arc::new(UdpConnection {
                socket: self.shared.socket.clone(),
                flow: *flow,
            }));
        }

        let streams = self.shared.streams.read().await;
        let connection = streams.get(&(flow.protocol, flow.remote))?;
        if connection.flow.local != flow.local {
            return None;
        }
        connection.acquire();
        Some(connection.clone())
    }

    /// Host and port advertised in our Via and Contact headers
    pub fn public_host_port(&self) -> (String, u16) {
        let local = self.shared.local_addr;
        let host = self.config.public_address.clone().unwrap_or_else(|| match local {
            SocketAddr::V4(a) => a.ip().to_string(),
            SocketAddr::V6(a) => format!("[{}]", a.ip()),
        });
        (host, self.config.public_port.unwrap_or(local.port()))
    }

    /// Top-Via stamping for a request about to leave over `protocol`
    pub fn prepare_outbound(&self, request: &mut SipRequest, protocol: TransportProtocol) {
        let (host, port) = self.public_host_port();
        rport::stamp_outbound(request, protocol, &host, port, self.config.rport);
    }

    pub fn encode_flow_uri(&self, flow: &Flow) -> SipUri {
        let hostname = self
            .config
            .hostname
            .clone()
            .unwrap_or_else(|| self.public_host_port().0);
        self.signer.encode_uri(flow, &hostname)
    }

    pub fn decode_flow_uri(&self, uri: &SipUri) -> Option<Flow> {
        self.signer.decode_uri(uri)
    }

    pub async fn stream_count(&self) -> usize {
        self.shared.streams.read().await.len()
    }

    /// Stop receiving and close every stream connection
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            task.abort();
        }

        let streams: Vec<Arc<StreamConnection>> =
            self.shared.streams.write().await.drain().map(|(_, c)| c).collect();
        for connection in streams {
            connection.shutdown().await;
        }
        info!("Transport on {} stopped", self.shared.local_addr);
    }
}

async fn websocket_handshake(io: BoxedIo, candidate: &Candidate) -> Result<WebSocketStream<BoxedIo>, SipError> {
    let scheme = if candidate.protocol == TransportProtocol::Wss { "wss" } else { "ws" };
    let url = format!("{}://{}:{}", scheme, candidate.host, candidate.port);
    let mut request = url
        .into_client_request()
        .map_err(|e| SipError::TransportError(format!("WebSocket request {}: {}", candidate, e)))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("sip"));

    let (ws, _) = tokio_tungstenite::client_async(request, io)
        .await
        .map_err(|e| SipError::TransportError(format!("WebSocket handshake with {}: {}", candidate, e)))?;
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipMethod;
    use tokio::io::AsyncReadExt;

    const OPTIONS: &str = "OPTIONS sip:door@127.0.0.1 SIP/2.0\r\nVia: SIP/2.0/TCP 127.0.0.1:1;branch=z9hG4bKt;rport\r\nTo: <sip:door@127.0.0.1>\r\nFrom: <sip:a@127.0.0.1>;tag=1\r\nCall-ID: t1\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";

    async fn bind(listen_tcp: bool) -> (TransportLayer, mpsc::UnboundedReceiver<IncomingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut config = TransportConfig::new("127.0.0.1:0".parse().unwrap());
        config.listen_tcp = listen_tcp;
        (TransportLayer::bind(config, tx).await.unwrap(), rx)
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("udp".parse::<TransportProtocol>().unwrap(), TransportProtocol::Udp);
        assert_eq!("WSS".parse::<TransportProtocol>().unwrap(), TransportProtocol::Wss);
        assert!("sctp".parse::<TransportProtocol>().is_err());
        assert!(!TransportProtocol::Udp.is_reliable());
        assert!(TransportProtocol::Tls.is_reliable());
    }

    #[tokio::test]
    async fn test_udp_receive_stamps_via() {
        let (transport, mut rx) = bind(false).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let text = OPTIONS.replace("SIP/2.0/TCP", "SIP/2.0/UDP");
        peer.send_to(text.as_bytes(), transport.local_addr()).await.unwrap();

        let incoming = rx.recv().await.unwrap();
        assert_eq!(incoming.source(), peer.local_addr().unwrap());
        let req = incoming.message.as_request().unwrap();
        assert_eq!(req.method, SipMethod::Options);
        let via = req.headers.top_via().unwrap();
        assert_eq!(via.params.value("received"), Some("127.0.0.1"));
        assert_eq!(
            via.params.value("rport"),
            Some(peer.local_addr().unwrap().port().to_string().as_str())
        );
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_udp_noise_is_discarded() {
        let (transport, mut rx) = bind(false).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"\r\n\r\n", transport.local_addr()).await.unwrap();
        peer.send_to(b"garbage", transport.local_addr()).await.unwrap();
        peer.send_to(OPTIONS.as_bytes(), transport.local_addr()).await.unwrap();

        let incoming = rx.recv().await.unwrap();
        assert!(incoming.message.is_request());
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_tcp_framing_and_flow_lookup() {
        let (transport, mut rx) = bind(true).await;
        let mut client = TcpStream::connect(transport.local_addr()).await.unwrap();
        let two = format!("\r\n{}{}", OPTIONS, OPTIONS.replace("t1", "t2"));
        client.write_all(two.as_bytes()).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.message.headers().call_id.as_deref(), Some("t1"));
        assert_eq!(second.message.headers().call_id.as_deref(), Some("t2"));

        let flow = first.connection.flow();
        assert_eq!(flow.protocol, TransportProtocol::Tcp);
        let connection = transport.get(&flow).await.unwrap();
        connection.send(&second.message).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("OPTIONS sip:door@127.0.0.1 SIP/2.0"));
        connection.release();
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_tcp_oversized_content_length_closes_stream() {
        let (transport, mut rx) = bind(true).await;
        let mut client = TcpStream::connect(transport.local_addr()).await.unwrap();
        let huge = OPTIONS.replace("Content-Length: 0", "Content-Length: 4000000000");
        client.write_all(huge.as_bytes()).await.unwrap();

        // the server drops its end instead of waiting for the body
        let mut buf = vec![0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.stream_count().await, 0);
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_open_reuses_stream() {
        let (server, _server_rx) = bind(true).await;
        let (client, _client_rx) = bind(false).await;
        let candidate = Candidate::new(TransportProtocol::Tcp, "127.0.0.1", server.local_addr().port());

        let a = client.open(&candidate).await.unwrap();
        let b = client.open(&candidate).await.unwrap();
        assert_eq!(a.flow(), b.flow());
        assert_eq!(client.stream_count().await, 1);
        a.release();
        b.release();
        // release never tears the stream down
        assert_eq!(client.stream_count().await, 1);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_get_unknown_flow() {
        let (transport, _rx) = bind(false).await;
        let flow = Flow::new(
            TransportProtocol::Tcp,
            "127.0.0.1:9".parse().unwrap(),
            transport.local_addr(),
        );
        assert!(transport.get(&flow).await.is_none());

        let udp = Flow::new(TransportProtocol::Udp, "127.0.0.1:9".parse().unwrap(), transport.local_addr());
        assert!(transport.get(&udp).await.is_some());
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_flow_uri_round_trip() {
        let (transport, _rx) = bind(false).await;
        let flow = Flow::new(TransportProtocol::Udp, "10.1.1.1:5060".parse().unwrap(), transport.local_addr());
        let uri = transport.encode_flow_uri(&flow);
        assert_eq!(uri.host, "127.0.0.1");
        assert_eq!(transport.decode_flow_uri(&uri), Some(flow));
        transport.stop().await;
    }
}
