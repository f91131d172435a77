//! Doorbell SIP manager
//!
//! Drives the one doorbell dialog at a time. In gateway mode the doorbell
//! calls us directly; in client mode we register with a peer that relays the
//! call. Either way an answered call is hung up again straight after the ACK,
//! which is all the intercom needs to open its door relay.

use crate::config::{Config, DoorbellConfig, DoorbellMode, SipConfig};
use crate::domain::doorbell::{DialogState, DialogStatus, DoorbellEvent, DoorbellEventKind};
use crate::domain::shared::DomainError;
use crate::infrastructure::protocols::sip::builder::{generate_tag, ResponseBuilder};
use crate::infrastructure::protocols::sip::sdp::{SdpSession, SDP_CONTENT_TYPE};
use crate::infrastructure::protocols::sip::transaction::ServerTransaction;
use crate::infrastructure::protocols::sip::{
    CSeq, Credentials, DigestContext, Flow, IncomingRequest, NameAddr, SipError, SipHandler, SipMethod, SipRequest,
    SipResponse, SipServer, SipServerConfig, SipUri, TransportConfig,
};
use async_trait::async_trait;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Expires requested by `register()`
pub const REGISTER_EXPIRES: u32 = 3600;

const BIND_ATTEMPTS: usize = 3;
const EPHEMERAL_PORTS: std::ops::Range<u16> = 10000..60000;
const USER_AGENT: &str = concat!("doorbell-sip/", env!("CARGO_PKG_VERSION"));
const ALLOW: &str = "REGISTER, INVITE, ACK, CANCEL, BYE";

/// The INVITE being answered
#[derive(Debug, Clone)]
struct InviteContext {
    request: SipRequest,
    transaction: ServerTransaction,
    flow: Flow,
    local_tag: String,
}

impl InviteContext {
    fn call_id(&self) -> &str {
        self.request.call_id().unwrap_or_default()
    }
}

#[derive(Default)]
struct Dialog {
    state: DialogState,
    invite: Option<InviteContext>,
    /// Released by the ACK to our 200 OK
    ack: Option<oneshot::Sender<()>>,
}

impl Dialog {
    /// Back to Idle; a pending ACK wait wakes up with an error
    fn clear(&mut self) -> DialogStatus {
        self.invite = None;
        self.ack = None;
        self.state.reset()
    }

    fn owned_by(&self, call_id: &str) -> bool {
        self.state.call_id() == Some(call_id)
    }
}

fn state_error(e: DomainError) -> SipError {
    SipError::Internal(e.to_string())
}

fn uri_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}

fn same_host(a: &str, b: &str) -> bool {
    match (a.parse::<IpAddr>(), b.parse::<IpAddr>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a.eq_ignore_ascii_case(b),
    }
}

/// Expiry granted by a registrar: the Expires header, else the Contact's expires param
fn granted_expires(response: &SipResponse) -> Option<u32> {
    response.headers.expires().or_else(|| {
        response
            .headers
            .contact
            .iter()
            .find_map(|c| c.params.value("expires").and_then(|v| v.trim().parse().ok()))
    })
}

/// Local address the OS would use to reach `target`.
///
/// Connecting a UDP socket sends nothing; it only runs route selection.
pub async fn probe_local_ip(target: IpAddr) -> Result<IpAddr, SipError> {
    let any = match target {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = UdpSocket::bind(SocketAddr::new(any, 0)).await?;
    socket.connect(SocketAddr::new(target, 9)).await?;
    let local = socket.local_addr()?.ip();
    debug!("Probed local address {} towards {}", local, target);
    Ok(local)
}

fn server_config(sip: &SipConfig, bind: SocketAddr) -> SipServerConfig {
    let mut transport = TransportConfig::new(bind);
    transport.public_address = sip.public_address.clone();
    transport.public_port = sip.public_port;
    transport.rport = sip.rport;
    transport.listen_tcp = sip.listen_tcp;
    transport.hostname = sip.hostname.clone();
    transport.tls = sip.tls.clone();
    SipServerConfig {
        transport,
        timers: sip.timers(),
    }
}

/// Bind on `local_ip`, retrying random ports unless a fixed one is configured
async fn bind_server(sip: &SipConfig, local_ip: IpAddr, handler: Arc<dyn SipHandler>) -> Result<SipServer, SipError> {
    let attempts = if sip.local_port.is_some() { 1 } else { BIND_ATTEMPTS };
    let mut last_error = None;

    for attempt in 1..=attempts {
        let port = sip
            .local_port
            .unwrap_or_else(|| rand::thread_rng().gen_range(EPHEMERAL_PORTS));
        match SipServer::start(server_config(sip, SocketAddr::new(local_ip, port)), handler.clone()).await {
            Ok(server) => return Ok(server),
            Err(e) => {
                warn!("Bind attempt {}/{} on {}:{} failed: {}", attempt, attempts, local_ip, port, e);
                last_error = Some(e);
            }
        }
    }

    let e = last_error.unwrap_or_else(|| SipError::TransportError("no bind attempted".to_string()));
    error!("Giving up binding a SIP socket on {}: {}", local_ip, e);
    Err(e)
}

struct Inner {
    doorbell: DoorbellConfig,
    local_ip: IpAddr,
    server: RwLock<Option<Arc<SipServer>>>,
    dialog: Mutex<Dialog>,
    events: broadcast::Sender<DoorbellEvent>,
    cseq: AtomicU32,
}

impl Inner {
    async fn server(&self) -> Result<Arc<SipServer>, SipError> {
        self.server
            .read()
            .await
            .clone()
            .ok_or_else(|| SipError::Internal("SIP server is not running".to_string()))
    }

    fn emit(&self, call_id: Option<&str>, kind: DoorbellEventKind) {
        let event = DoorbellEvent::new(call_id, kind);
        debug!("Event {:?}", event.kind);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::SeqCst)
    }

    async fn contact(&self, user: Option<&str>) -> Result<NameAddr, SipError> {
        let server = self.server().await?;
        let (host, port) = server.transport().public_host_port();
        let mut uri = SipUri::new(host).with_port(port);
        if let Some(user) = user.filter(|u| !u.is_empty()) {
            uri = uri.with_user(user);
        }
        Ok(NameAddr::new(uri))
    }

    /// Gateway mode trusts the doorbell's socket address. Client mode trusts
    /// the Contact (else From) host when it is the peer or ourselves.
    fn check_auth(&self, incoming: &IncomingRequest) -> bool {
        match self.doorbell.mode {
            DoorbellMode::Gateway => self
                .doorbell
                .doorbell_ip
                .parse::<IpAddr>()
                .map(|ip| ip == incoming.source().ip())
                .unwrap_or(false),
            DoorbellMode::Client => {
                let headers = &incoming.request.headers;
                let Some(address) = headers.contact.first().or(headers.from.as_ref()) else {
                    return false;
                };
                let host = address.uri.host_unbracketed();
                same_host(host, &self.doorbell.client.peer_ip) || same_host(host, &self.local_ip.to_string())
            }
        }
    }

    async fn dispatch(&self, incoming: &IncomingRequest) -> Result<Option<SipResponse>, SipError> {
        let request = &incoming.request;
        let mut dialog = self.dialog.lock().await;
        let status = dialog.state.status();

        match (&request.method, status) {
            (SipMethod::Register, _) => {
                let mut response = ResponseBuilder::ok().build_for_request(request)?;
                response.headers.contact = request.headers.contact.clone();
                if let Some(expires) = request.headers.expires() {
                    response.headers.set("expires", expires.to_string());
                }
                debug!("Accepted REGISTER from {}", incoming.source());
                Ok(Some(response))
            }
            (SipMethod::Invite, DialogStatus::Idle) => self.on_invite(&mut dialog, incoming).map(Some),
            (SipMethod::Ack, DialogStatus::Answer) => {
                info!("ACK received for {}", dialog.state.call_id().unwrap_or_default());
                if let Some(ack) = dialog.ack.take() {
                    let _ = ack.send(());
                }
                Ok(None)
            }
            (SipMethod::Ack, _) => {
                debug!("Ignoring ACK in {}", status);
                Ok(None)
            }
            (SipMethod::Cancel, DialogStatus::Ringing | DialogStatus::Answer)
            | (SipMethod::Bye, DialogStatus::AnswerAck | DialogStatus::Hangup)
                if !dialog.owned_by(request.call_id().unwrap_or_default()) =>
            {
                warn!(
                    "{} for {:?} does not match call {}",
                    request.method,
                    request.call_id(),
                    dialog.state.call_id().unwrap_or_default()
                );
                Ok(Some(ResponseBuilder::new(481).build_for_request(request)?))
            }
            (SipMethod::Cancel, DialogStatus::Ringing | DialogStatus::Answer) => {
                let response = ResponseBuilder::ok().build_for_request(request)?;
                if status == DialogStatus::Ringing {
                    if let Some(invite) = &dialog.invite {
                        let terminated = ResponseBuilder::new(487)
                            .to_tag(&invite.local_tag)
                            .build_for_request(&invite.request)?;
                        if let Err(e) = invite.transaction.respond(terminated) {
                            warn!("Failed to terminate cancelled INVITE: {}", e);
                        }
                    }
                }
                let call_id = dialog.state.call_id().map(str::to_string);
                dialog.clear();
                info!("Call {} cancelled in {}", call_id.as_deref().unwrap_or_default(), status);
                self.emit(call_id.as_deref(), DoorbellEventKind::Cancelled);
                Ok(Some(response))
            }
            (SipMethod::Bye, DialogStatus::AnswerAck | DialogStatus::Hangup) => {
                let response = ResponseBuilder::ok().build_for_request(request)?;
                let call_id = dialog.state.call_id().map(str::to_string);
                dialog.clear();
                info!("Call {} hung up by peer", call_id.as_deref().unwrap_or_default());
                self.emit(
                    call_id.as_deref(),
                    DoorbellEventKind::Ended {
                        reason: "remote hangup".to_string(),
                    },
                );
                Ok(Some(response))
            }
            (SipMethod::Invite | SipMethod::Cancel | SipMethod::Bye, _) => {
                warn!("Rejecting {} in {}", request.method, status);
                Ok(Some(ResponseBuilder::new(400).build_for_request(request)?))
            }
            _ => Ok(Some(
                ResponseBuilder::new(405)
                    .header("allow", ALLOW)
                    .build_for_request(request)?,
            )),
        }
    }

    fn on_invite(&self, dialog: &mut Dialog, incoming: &IncomingRequest) -> Result<SipResponse, SipError> {
        let request = &incoming.request;
        let call_id = request
            .call_id()
            .ok_or_else(|| SipError::InvalidMessage("INVITE without Call-ID".to_string()))?;
        let transaction = incoming
            .transaction
            .clone()
            .ok_or_else(|| SipError::TransactionError("INVITE without server transaction".to_string()))?;

        let local_tag = generate_tag();
        let ringing = ResponseBuilder::new(180).to_tag(&local_tag).build_for_request(request)?;
        dialog.state.begin(DialogStatus::Ringing, call_id).map_err(state_error)?;

        if let Some(offer) = std::str::from_utf8(&request.body).ok().and_then(SdpSession::parse) {
            debug!("Offer from {}: {:?}", incoming.source(), offer.audio_codecs());
        }
        let from = request
            .headers
            .from
            .as_ref()
            .map(|f| f.uri.to_string())
            .unwrap_or_default();
        info!("Doorbell ringing: {} from {}", call_id, incoming.source());

        dialog.invite = Some(InviteContext {
            request: request.clone(),
            transaction,
            flow: incoming.flow(),
            local_tag,
        });
        self.emit(Some(call_id), DoorbellEventKind::Ringing { from });
        Ok(ringing)
    }

    /// 200 OK, wait for ACK, BYE, wait for its 200
    async fn run_answer(
        &self,
        invite: &InviteContext,
        ok: SipResponse,
        ack: oneshot::Receiver<()>,
    ) -> Result<(), SipError> {
        let call_id = invite.call_id();
        invite.transaction.respond(ok)?;
        self.emit(Some(call_id), DoorbellEventKind::Answered);

        let ack_timeout = self.doorbell.ack_timeout();
        match tokio::time::timeout(ack_timeout, ack).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(SipError::Internal(format!("{} cleared while waiting for ACK", call_id))),
            Err(_) => warn!("No ACK for {} within {:?}", call_id, ack_timeout),
        }

        let bye = {
            let mut dialog = self.dialog.lock().await;
            if !dialog.owned_by(call_id) {
                return Err(SipError::Internal(format!("{} cleared before hangup", call_id)));
            }
            dialog.state.transition(DialogStatus::AnswerAck).map_err(state_error)?;
            let bye = self.build_bye(invite);
            dialog.state.transition(DialogStatus::Hangup).map_err(state_error)?;
            bye
        };

        info!("Hanging up {}", call_id);
        let bye_timeout = self.doorbell.bye_timeout();
        let response = tokio::time::timeout(bye_timeout, self.send_bye(invite, bye))
            .await
            .map_err(|_| SipError::Timeout(format!("no response to BYE for {} within {:?}", call_id, bye_timeout)))??;

        if response.is_success() {
            let mut dialog = self.dialog.lock().await;
            if dialog.owned_by(call_id) {
                dialog.state.transition(DialogStatus::HangupAck).map_err(state_error)?;
            }
        } else {
            warn!("BYE for {} answered {} {}", call_id, response.status, response.reason);
        }
        Ok(())
    }

    fn build_bye(&self, invite: &InviteContext) -> SipRequest {
        let request = &invite.request;
        let target = request
            .headers
            .contact
            .first()
            .or(request.headers.from.as_ref())
            .map(|a| a.uri.clone())
            .unwrap_or_else(|| request.uri.clone());

        let mut bye = SipRequest::new(SipMethod::Bye, target);
        bye.headers.from = request.headers.to.clone().map(|to| {
            if to.tag().is_some() {
                to
            } else {
                to.with_tag(&invite.local_tag)
            }
        });
        bye.headers.to = request.headers.from.clone();
        bye.headers.call_id = request.headers.call_id.clone();
        bye.headers.cseq = Some(CSeq::new(self.next_cseq(), SipMethod::Bye));
        bye.headers.route = request.headers.record_route.clone();
        bye.headers.set("max-forwards", "70");
        bye.headers.set("user-agent", USER_AGENT);
        bye
    }

    /// Over the INVITE's flow, falling back to resolving its Contact
    async fn send_bye(&self, invite: &InviteContext, bye: SipRequest) -> Result<SipResponse, SipError> {
        let server = self.server().await?;
        match server.send_on_flow(&invite.flow, bye.clone()).await {
            Err(SipError::TransportError(e)) => {
                warn!("{} unusable ({}), resolving {}", invite.flow, e, bye.uri);
                server.send(bye).await
            }
            other => other,
        }
    }

    async fn finish(&self, call_id: &str, reason: &str) {
        let mut dialog = self.dialog.lock().await;
        if !dialog.owned_by(call_id) {
            debug!("{} was already cleared", call_id);
            return;
        }
        let previous = dialog.clear();
        info!("Call {} finished in {} ({})", call_id, previous, reason);
        self.emit(
            Some(call_id),
            DoorbellEventKind::Ended {
                reason: reason.to_string(),
            },
        );
    }

    async fn registration(&self, expires: u32) -> bool {
        let call_id = self
            .doorbell
            .client
            .call_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        {
            let mut dialog = self.dialog.lock().await;
            if let Err(e) = dialog.state.begin(DialogStatus::Registering, &call_id) {
                warn!("REGISTER refused: {}", e);
                return false;
            }
        }

        let outcome = self.send_register(expires, &call_id).await;

        {
            let mut dialog = self.dialog.lock().await;
            if dialog.owned_by(&call_id) {
                dialog.clear();
            }
        }

        match outcome {
            Ok(response) if response.is_success() => {
                let granted = granted_expires(&response).unwrap_or(expires);
                info!("Registered with {} for {}s", self.doorbell.client.peer_ip, granted);
                self.emit(None, DoorbellEventKind::Registered { expires: granted });
                if granted > 0 {
                    self.schedule_register(granted);
                }
                true
            }
            Ok(response) => {
                warn!("REGISTER failed: {} {}", response.status, response.reason);
                self.emit(
                    None,
                    DoorbellEventKind::RegistrationFailed {
                        status: Some(response.status),
                    },
                );
                false
            }
            Err(e) => {
                warn!("REGISTER failed: {}", e);
                self.emit(None, DoorbellEventKind::RegistrationFailed { status: None });
                false
            }
        }
    }

    async fn build_register(&self, expires: u32, call_id: &str) -> Result<SipRequest, SipError> {
        let client = &self.doorbell.client;
        let peer: IpAddr = client
            .peer_ip
            .parse()
            .map_err(|_| SipError::InvalidMessage(format!("invalid peer ip {:?}", client.peer_ip)))?;
        let host = uri_host(peer);

        let mut request = SipRequest::new(SipMethod::Register, SipUri::new(host.clone()).with_port(client.peer_port));
        let aor = NameAddr::new(SipUri::new(host).with_user(client.user.clone()));
        request.headers.from = Some(aor.clone().with_tag(&generate_tag()));
        request.headers.to = Some(aor);
        request.headers.call_id = Some(call_id.to_string());
        request.headers.cseq = Some(CSeq::new(self.next_cseq(), SipMethod::Register));
        request.headers.contact.push(self.contact(Some(&client.user)).await?);
        request.headers.set("expires", expires.to_string());
        request.headers.set("max-forwards", "70");
        request.headers.set("user-agent", USER_AGENT);
        Ok(request)
    }

    /// REGISTER, answering one 401/407 challenge
    async fn send_register(&self, expires: u32, call_id: &str) -> Result<SipResponse, SipError> {
        let server = self.server().await?;
        let mut request = self.build_register(expires, call_id).await?;
        let response = server.send(request.clone()).await?;
        if !matches!(response.status, 401 | 407) {
            return Ok(response);
        }

        info!("REGISTER challenged with {}, resending with credentials", response.status);
        let client = &self.doorbell.client;
        let credentials = Credentials::new(&client.user, &client.password);
        let mut digest = DigestContext::new();
        request.headers.via.clear();
        request.headers.cseq = Some(CSeq::new(self.next_cseq(), SipMethod::Register));
        digest.sign_request(&mut request, Some((&response, &credentials)))?;

        let response = server.send(request).await?;
        if digest.authenticate_response(&response) == Some(false) {
            warn!("Registrar's rspauth does not match our credentials");
        }
        Ok(response)
    }

    /// Re-registration hook; scheduling is left to the caller
    fn schedule_register(&self, expires: u32) {
        info!("Registration valid for {}s, re-registration is not scheduled", expires);
    }
}

#[async_trait]
impl SipHandler for Inner {
    async fn handle_request(&self, incoming: &IncomingRequest) -> Result<Option<SipResponse>, SipError> {
        let request = &incoming.request;
        debug!("{} {} from {}", request.method, request.uri, incoming.source());

        if !self.check_auth(incoming) {
            warn!("Rejecting {} from unauthorized {}", request.method, incoming.source());
            if request.method == SipMethod::Ack {
                return Ok(None);
            }
            return Ok(Some(ResponseBuilder::new(403).build_for_request(request)?));
        }

        match self.dispatch(incoming).await {
            Ok(response) => Ok(response),
            Err(e) => {
                let previous = self.dialog.lock().await.clear();
                error!("Dispatching {} failed in {}: {}", request.method, previous, e);
                Err(e)
            }
        }
    }
}

/// Handle to the running doorbell SIP stack
#[derive(Clone)]
pub struct DoorbellSipManager {
    inner: Arc<Inner>,
}

impl DoorbellSipManager {
    /// Bind the SIP socket and start answering requests.
    ///
    /// The local address comes from `sip.local_ip`, else it is probed towards
    /// the doorbell (gateway) or the peer (client).
    pub async fn start_server(config: &Config) -> Result<Self, SipError> {
        let doorbell = config.doorbell.clone();
        let target = match doorbell.mode {
            DoorbellMode::Gateway => &doorbell.doorbell_ip,
            DoorbellMode::Client => &doorbell.client.peer_ip,
        };

        let local_ip = match &config.sip.local_ip {
            Some(ip) => ip
                .parse::<IpAddr>()
                .map_err(|_| SipError::TransportError(format!("invalid local ip {:?}", ip)))?,
            None => {
                let target = target
                    .parse::<IpAddr>()
                    .map_err(|_| SipError::TransportError(format!("invalid target ip {:?}", target)))?;
                probe_local_ip(target).await?
            }
        };

        let (events, _) = broadcast::channel(32);
        let inner = Arc::new(Inner {
            doorbell,
            local_ip,
            server: RwLock::new(None),
            dialog: Mutex::new(Dialog::default()),
            events,
            cseq: AtomicU32::new(1),
        });

        let server = bind_server(&config.sip, local_ip, inner.clone()).await?;
        info!("Doorbell SIP manager listening on {} ({:?} mode)", server.local_addr(), inner.doorbell.mode);
        *inner.server.write().await = Some(Arc::new(server));
        Ok(Self { inner })
    }

    /// Gateway mode: wait for the doorbell to call
    pub async fn start_gateway(config: &Config) -> Result<Self, SipError> {
        Self::start_server(config).await
    }

    /// Client mode: bind, then register with the peer.
    ///
    /// A failed registration is logged, not returned.
    pub async fn start_client(config: &Config) -> Result<Self, SipError> {
        let manager = Self::start_server(config).await?;
        if !manager.register().await {
            warn!("Initial registration with {} failed", config.doorbell.client.peer_ip);
        }
        Ok(manager)
    }

    pub async fn start(config: &Config) -> Result<Self, SipError> {
        match config.doorbell.mode {
            DoorbellMode::Gateway => Self::start_gateway(config).await,
            DoorbellMode::Client => Self::start_client(config).await,
        }
    }

    /// Answer the ringing call and hang straight up again.
    ///
    /// Returns false without sending anything unless a call is ringing. The
    /// dialog is always back in Idle when this returns.
    pub async fn answer(&self) -> bool {
        let inner = &self.inner;
        let contact = match inner.contact(None).await {
            Ok(contact) => contact,
            Err(e) => {
                warn!("Cannot answer: {}", e);
                return false;
            }
        };

        let (invite, ok, ack) = {
            let mut dialog = inner.dialog.lock().await;
            let status = dialog.state.status();
            let Some(invite) = dialog.invite.clone().filter(|_| status == DialogStatus::Ringing) else {
                warn!("Nothing to answer in {}", status);
                return false;
            };

            let sdp = SdpSession::doorbell_answer(inner.local_ip).to_string();
            let mut ok = match ResponseBuilder::ok()
                .to_tag(&invite.local_tag)
                .body(SDP_CONTENT_TYPE, sdp)
                .build_for_request(&invite.request)
            {
                Ok(ok) => ok,
                Err(e) => {
                    error!("Cannot build 200 OK: {}", e);
                    dialog.clear();
                    return false;
                }
            };
            ok.headers.contact.push(contact);

            if let Err(e) = dialog.state.transition(DialogStatus::Answer) {
                warn!("Cannot answer: {}", e);
                return false;
            }
            let (tx, rx) = oneshot::channel();
            dialog.ack = Some(tx);
            (invite, ok, rx)
        };

        let call_id = invite.call_id().to_string();
        info!("Answering {}", call_id);
        if let Err(e) = inner.run_answer(&invite, ok, ack).await {
            warn!("Call {}: {}", call_id, e);
        }
        inner.finish(&call_id, "local hangup").await;
        true
    }

    /// REGISTER with Expires 3600. Only from Idle.
    pub async fn register(&self) -> bool {
        self.inner.registration(REGISTER_EXPIRES).await
    }

    /// REGISTER with Expires 0. Only from Idle.
    pub async fn unregister(&self) -> bool {
        self.inner.registration(0).await
    }

    pub async fn status(&self) -> DialogStatus {
        self.inner.dialog.lock().await.state.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DoorbellEvent> {
        self.inner.events.subscribe()
    }

    pub fn mode(&self) -> DoorbellMode {
        self.inner.doorbell.mode
    }

    pub fn local_ip(&self) -> IpAddr {
        self.inner.local_ip
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.server.read().await.as_ref().map(|s| s.local_addr())
    }

    /// Tear down every transaction and the socket; the dialog ends in Idle
    pub async fn stop(&self) {
        let server = self.inner.server.write().await.take();
        if let Some(server) = server {
            server.stop().await;
        }
        let previous = self.inner.dialog.lock().await.clear();
        if previous != DialogStatus::Idle {
            info!("Dialog dropped from {} on shutdown", previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granted_expires_prefers_header() {
        let mut response = SipResponse::new(200, "OK");
        let mut contact = NameAddr::new(SipUri::new("10.0.0.5").with_port(5062));
        contact.params.set("expires", Some("120".to_string()));
        response.headers.contact.push(contact);
        assert_eq!(granted_expires(&response), Some(120));

        response.headers.set("expires", "600");
        assert_eq!(granted_expires(&response), Some(600));
        assert_eq!(granted_expires(&SipResponse::new(200, "OK")), None);
    }

    #[test]
    fn test_same_host() {
        assert!(same_host("10.0.0.1", "10.0.0.1"));
        assert!(same_host("::1", "0:0:0:0:0:0:0:1"));
        assert!(same_host("Door.Local", "door.local"));
        assert!(!same_host("10.0.0.1", "10.0.0.2"));
    }

    #[test]
    fn test_uri_host_brackets_v6() {
        assert_eq!(uri_host("10.0.0.1".parse().unwrap()), "10.0.0.1");
        assert_eq!(uri_host("fe80::1".parse().unwrap()), "[fe80::1]");
    }

    #[tokio::test]
    async fn test_probe_loopback() {
        let ip = probe_local_ip("127.0.0.1".parse().unwrap()).await.unwrap();
        assert!(ip.is_loopback());
    }

    #[tokio::test]
    async fn test_fixed_port_bind_conflict() {
        let mut config = Config::default();
        config.sip.local_ip = Some("127.0.0.1".to_string());
        config.doorbell.doorbell_ip = "127.0.0.1".to_string();
        config.sip.local_port = Some(0);

        let first = DoorbellSipManager::start_gateway(&config).await.unwrap();
        let taken = first.local_addr().await.unwrap();

        config.sip.local_port = Some(taken.port());
        assert!(DoorbellSipManager::start_gateway(&config).await.is_err());
        first.stop().await;
        assert!(first.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_answer_without_call_is_noop() {
        let mut config = Config::default();
        config.sip.local_ip = Some("127.0.0.1".to_string());
        config.sip.local_port = Some(0);
        let manager = DoorbellSipManager::start_gateway(&config).await.unwrap();

        assert!(!manager.answer().await);
        assert_eq!(manager.status().await, DialogStatus::Idle);
        manager.stop().await;
    }
}
