//! SIP Transaction Layer
//!
//! Implements client and server transactions as per RFC 3261 Section 17
//!
//! ## Transaction Types
//! - INVITE Client Transaction (ICT) - Section 17.1.1
//! - INVITE Server Transaction (IST) - Section 17.2.1
//! - Non-INVITE Client Transaction (NICT) - Section 17.1.2
//! - Non-INVITE Server Transaction (NIST) - Section 17.2.2
//!
//! All transactions live inside one task. Inbound messages, responses from the
//! transaction user and timer expiries are serialized through it, so no two
//! state transitions ever race on the same transaction.

pub mod fsm;

pub use fsm::{Action, Machine, Scheduler, SipTimers, Timer, TimerType};

use super::builder::synthesize_response;
use super::flow::Flow;
use super::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::transport::{Connection, IncomingMessage};
use fsm::{InviteClient, InviteServer, NonInviteClient, NonInviteServer};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Longest a single send may hold up the transaction task
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Transaction identity: `(method, Call-ID, top Via branch)`.
///
/// ACK is keyed as INVITE so it lands on the transaction it acknowledges.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionKey {
    pub method: String,
    pub call_id: String,
    pub branch: String,
}

impl TransactionKey {
    pub fn from_request(request: &SipRequest) -> Option<Self> {
        let method = if request.method == SipMethod::Ack {
            SipMethod::Invite.as_str().to_string()
        } else {
            request
                .headers
                .cseq
                .as_ref()
                .map(|c| c.method.as_str().to_string())
                .unwrap_or_else(|| request.method.as_str().to_string())
        };
        Some(Self {
            method,
            call_id: request.call_id()?.to_string(),
            branch: request.branch().unwrap_or_default().to_string(),
        })
    }

    pub fn from_response(response: &SipResponse) -> Option<Self> {
        Some(Self {
            method: response.headers.cseq.as_ref()?.method.as_str().to_string(),
            call_id: response.call_id()?.to_string(),
            branch: response.branch().unwrap_or_default().to_string(),
        })
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.method, self.call_id, self.branch)
    }
}

/// Request handed up to the transaction user
#[derive(Debug)]
pub struct IncomingRequest {
    pub request: SipRequest,
    pub connection: Arc<dyn Connection>,
    /// `None` for an ACK that matched no transaction or was passed through one
    pub transaction: Option<ServerTransaction>,
}

impl IncomingRequest {
    pub fn source(&self) -> SocketAddr {
        self.connection.flow().remote
    }

    pub fn flow(&self) -> Flow {
        self.connection.flow()
    }

    /// Respond through the server transaction
    pub fn respond(&self, response: SipResponse) -> Result<(), SipError> {
        match &self.transaction {
            Some(transaction) => transaction.respond(response),
            None => Err(SipError::TransactionError(format!(
                "{} has no server transaction",
                self.request.method
            ))),
        }
    }
}

/// Handle for answering an inbound request
#[derive(Debug, Clone)]
pub struct ServerTransaction {
    key: TransactionKey,
    commands: mpsc::UnboundedSender<Command>,
}

impl ServerTransaction {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn respond(&self, response: SipResponse) -> Result<(), SipError> {
        self.commands
            .send(Command::Respond {
                key: self.key.clone(),
                response,
            })
            .map_err(|_| SipError::TransactionError("transaction layer stopped".to_string()))
    }
}

/// Handle for an outbound request's responses
#[derive(Debug)]
pub struct ClientTransaction {
    key: TransactionKey,
    responses: mpsc::UnboundedReceiver<SipResponse>,
}

impl ClientTransaction {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// Next response, provisional or final
    pub async fn next_response(&mut self) -> Option<SipResponse> {
        self.responses.recv().await
    }

    /// Skip provisionals and wait for the final response.
    ///
    /// Timeouts and transport failures arrive as synthesized 408/503.
    pub async fn final_response(&mut self) -> Result<SipResponse, SipError> {
        while let Some(response) = self.responses.recv().await {
            if !response.is_provisional() {
                return Ok(response);
            }
            debug!("{}: provisional {} {}", self.key, response.status, response.reason);
        }
        Err(SipError::TransactionError(format!(
            "{} ended without a final response",
            self.key
        )))
    }
}

#[derive(Debug)]
enum Command {
    Send {
        request: SipRequest,
        connection: Arc<dyn Connection>,
        responses: mpsc::UnboundedSender<SipResponse>,
        reply: oneshot::Sender<Result<TransactionKey, SipError>>,
    },
    Respond {
        key: TransactionKey,
        response: SipResponse,
    },
    Timer {
        key: TransactionKey,
        id: u64,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Destroy {
        done: oneshot::Sender<()>,
    },
}

struct TokioScheduler<'a> {
    key: &'a TransactionKey,
    commands: &'a mpsc::UnboundedSender<Command>,
    next_id: &'a mut u64,
}

impl Scheduler for TokioScheduler<'_> {
    fn schedule(&mut self, timer_type: TimerType, after: Duration) -> Timer {
        *self.next_id += 1;
        let id = *self.next_id;
        let key = self.key.clone();
        let commands = self.commands.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = commands.send(Command::Timer { key, id });
        });
        Timer::new(id, timer_type, Some(handle))
    }
}

struct Entry {
    machine: Machine,
    connection: Arc<dyn Connection>,
    responses: Option<mpsc::UnboundedSender<SipResponse>>,
}

struct Actor {
    timers: SipTimers,
    entries: HashMap<TransactionKey, Entry>,
    commands: mpsc::UnboundedSender<Command>,
    up: mpsc::UnboundedSender<IncomingRequest>,
    next_timer: u64,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<IncomingMessage>,
    ) {
        let mut inbound_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Destroy { done }) => {
                        self.destroy();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                message = inbound.recv(), if inbound_open => match message {
                    Some(message) => self.handle_incoming(message).await,
                    None => inbound_open = false,
                },
            }
        }
        debug!("Transaction layer stopped");
    }

    /// Run `f` against a live transaction with a scheduler bound to it
    fn apply<R, F>(&mut self, key: &TransactionKey, f: F) -> Option<R>
    where
        F: FnOnce(&mut Machine, &mut dyn Scheduler) -> R,
    {
        let entry = self.entries.get_mut(key)?;
        let mut scheduler = TokioScheduler {
            key,
            commands: &self.commands,
            next_id: &mut self.next_timer,
        };
        Some(f(&mut entry.machine, &mut scheduler))
    }

    /// Carry out actions; returns false if any send failed
    async fn perform(&mut self, key: &TransactionKey, actions: Vec<Action>) -> bool {
        let Some(entry) = self.entries.get(key) else {
            return true;
        };
        let connection = entry.connection.clone();
        let responses = entry.responses.clone();
        let mut delivered = true;

        for action in actions {
            match action {
                Action::Send(message) => match tokio::time::timeout(SEND_TIMEOUT, connection.send(&message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("{}: send failed: {}", key, e);
                        delivered = false;
                    }
                    Err(_) => {
                        warn!("{}: send to {} stalled for {:?}", key, connection.flow(), SEND_TIMEOUT);
                        delivered = false;
                    }
                },
                Action::Deliver(SipMessage::Response(response)) => {
                    if let Some(tx) = &responses {
                        let _ = tx.send(response);
                    }
                }
                Action::Deliver(SipMessage::Request(request)) => {
                    self.pass_up(request, connection.clone(), None);
                }
            }
        }
        delivered
    }

    fn reap(&mut self, key: &TransactionKey) {
        if self.entries.get(key).map_or(false, |e| e.machine.is_terminated()) {
            if let Some(entry) = self.entries.remove(key) {
                debug!("{} {} terminated", entry.machine.kind(), key);
            }
        }
    }

    fn pass_up(&self, request: SipRequest, connection: Arc<dyn Connection>, transaction: Option<ServerTransaction>) {
        let incoming = IncomingRequest {
            request,
            connection,
            transaction,
        };
        if self.up.send(incoming).is_err() {
            warn!("No transaction user listening, dropping request");
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                request,
                connection,
                responses,
                reply,
            } => {
                let Some(key) = TransactionKey::from_request(&request) else {
                    let _ = reply.send(Err(SipError::InvalidMessage(
                        "request lacks Call-ID".to_string(),
                    )));
                    return;
                };
                if self.entries.contains_key(&key) {
                    let _ = reply.send(Err(SipError::TransactionError(format!("{} already exists", key))));
                    return;
                }

                let reliable = connection.is_reliable();
                let timers = self.timers;
                let mut scheduler = TokioScheduler {
                    key: &key,
                    commands: &self.commands,
                    next_id: &mut self.next_timer,
                };
                let (machine, actions) = if request.method == SipMethod::Invite {
                    let (m, a) = InviteClient::start(request.clone(), timers, reliable, &mut scheduler);
                    (Machine::InviteClient(m), a)
                } else {
                    let (m, a) = NonInviteClient::start(request.clone(), timers, reliable, &mut scheduler);
                    (Machine::NonInviteClient(m), a)
                };
                debug!("{} {} created over {}", machine.kind(), key, connection.flow());

                self.entries.insert(
                    key.clone(),
                    Entry {
                        machine,
                        connection,
                        responses: Some(responses.clone()),
                    },
                );
                let _ = reply.send(Ok(key.clone()));

                if !self.perform(&key, actions).await {
                    let _ = responses.send(synthesize_response(&request, 503));
                    if let Some(entry) = self.entries.get_mut(&key) {
                        entry.machine.terminate();
                    }
                }
                self.reap(&key);
            }
            Command::Respond { key, response } => {
                let status = response.status;
                let result = self
                    .apply(&key, |machine, scheduler| machine.respond(response, scheduler))
                    .unwrap_or_else(|| Err(SipError::TransactionError(format!("{} not found", key))));
                match result {
                    Ok(actions) => {
                        debug!("{}: responding {}", key, status);
                        self.perform(&key, actions).await;
                    }
                    Err(e) => warn!("Dropping {} response: {}", status, e),
                }
                self.reap(&key);
            }
            Command::Timer { key, id } => {
                if let Some(actions) = self.apply(&key, |machine, scheduler| machine.on_timer(id, scheduler)) {
                    self.perform(&key, actions).await;
                    self.reap(&key);
                }
            }
            Command::Count { reply } => {
                let _ = reply.send(self.entries.len());
            }
            Command::Destroy { .. } => {}
        }
    }

    async fn handle_incoming(&mut self, incoming: IncomingMessage) {
        let IncomingMessage { message, connection } = incoming;

        let key = match &message {
            SipMessage::Request(request) => TransactionKey::from_request(request),
            SipMessage::Response(response) => TransactionKey::from_response(response),
        };
        let Some(key) = key else {
            warn!("Dropping message without transaction identity from {}", connection.flow().remote);
            return;
        };

        if let Some(actions) = self.apply(&key, |machine, scheduler| machine.on_message(&message, scheduler)) {
            self.perform(&key, actions).await;
            self.reap(&key);
            return;
        }

        let request = match message {
            SipMessage::Request(request) => request,
            SipMessage::Response(response) => {
                debug!("Stray {} response for {}", response.status, key);
                return;
            }
        };

        if request.method == SipMethod::Ack {
            self.pass_up(request, connection, None);
            return;
        }

        let machine = if request.method == SipMethod::Invite {
            Machine::InviteServer(InviteServer::new(self.timers, connection.is_reliable()))
        } else {
            Machine::NonInviteServer(NonInviteServer::new(self.timers))
        };
        debug!("{} {} created for {}", machine.kind(), key, connection.flow().remote);

        self.entries.insert(
            key.clone(),
            Entry {
                machine,
                connection: connection.clone(),
                responses: None,
            },
        );
        let transaction = ServerTransaction {
            key,
            commands: self.commands.clone(),
        };
        self.pass_up(request, connection, Some(transaction));
    }

    fn destroy(&mut self) {
        let count = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            entry.machine.terminate();
        }
        info!("Transaction layer destroyed, {} transaction(s) terminated", count);
    }
}

/// Handle to the transaction task
#[derive(Debug, Clone)]
pub struct TransactionLayer {
    commands: mpsc::UnboundedSender<Command>,
}

impl TransactionLayer {
    /// Spawn the transaction task over the transport's inbound channel.
    ///
    /// Returns the handle and the stream of requests for the transaction user.
    pub fn start(
        timers: SipTimers,
        inbound: mpsc::UnboundedReceiver<IncomingMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<IncomingRequest>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (up_tx, up_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            timers,
            entries: HashMap::new(),
            commands: commands_tx.clone(),
            up: up_tx,
            next_timer: 0,
        };
        tokio::spawn(actor.run(commands_rx, inbound));

        (Self { commands: commands_tx }, up_rx)
    }

    /// Start a client transaction and send the request over `connection`
    pub async fn send_request(
        &self,
        request: SipRequest,
        connection: Arc<dyn Connection>,
    ) -> Result<ClientTransaction, SipError> {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                request,
                connection,
                responses: responses_tx,
                reply: reply_tx,
            })
            .map_err(|_| SipError::TransactionError("transaction layer stopped".to_string()))?;

        let key = reply_rx
            .await
            .map_err(|_| SipError::TransactionError("transaction layer stopped".to_string()))??;
        Ok(ClientTransaction {
            key,
            responses: responses_rx,
        })
    }

    /// Number of live transactions
    pub async fn len(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Count { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Terminate every live transaction and stop the task
    pub async fn destroy(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Destroy { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::builder::ResponseBuilder;
    use crate::infrastructure::protocols::sip::headers::{CSeq, NameAddr, Via};
    use crate::infrastructure::protocols::sip::transport::TransportProtocol;
    use crate::infrastructure::protocols::sip::uri::SipUri;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingConnection {
        sent: Mutex<Vec<SipMessage>>,
        fail: bool,
    }

    impl RecordingConnection {
        fn sent(&self) -> Vec<SipMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        fn protocol(&self) -> TransportProtocol {
            TransportProtocol::Udp
        }

        fn flow(&self) -> Flow {
            Flow::new(
                TransportProtocol::Udp,
                "10.0.0.2:5060".parse().unwrap(),
                "10.0.0.1:5060".parse().unwrap(),
            )
        }

        async fn send(&self, message: &SipMessage) -> Result<(), SipError> {
            if self.fail {
                return Err(SipError::TransportError("unreachable".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        fn release(&self) {}
    }

    /// A stream whose peer stopped reading
    #[derive(Debug)]
    struct StalledConnection;

    #[async_trait]
    impl Connection for StalledConnection {
        fn protocol(&self) -> TransportProtocol {
            TransportProtocol::Tcp
        }

        fn flow(&self) -> Flow {
            Flow::new(
                TransportProtocol::Tcp,
                "10.0.0.3:5060".parse().unwrap(),
                "10.0.0.1:5060".parse().unwrap(),
            )
        }

        async fn send(&self, _message: &SipMessage) -> Result<(), SipError> {
            std::future::pending().await
        }

        fn release(&self) {}
    }

    fn request(method: SipMethod, branch: &str) -> SipRequest {
        let mut req = SipRequest::new(method.clone(), SipUri::new("10.0.0.1").with_user("door"));
        let mut via = Via::new("UDP", "10.0.0.2", Some(5060));
        via.set_branch(branch);
        req.headers.via.push(via);
        req.headers.from = Some(NameAddr::new(SipUri::new("10.0.0.2").with_user("100")).with_tag("x"));
        req.headers.to = Some(NameAddr::new(SipUri::new("10.0.0.1").with_user("door")));
        req.headers.call_id = Some("txn-test".to_string());
        req.headers.cseq = Some(CSeq::new(1, method));
        req
    }

    fn setup() -> (
        TransactionLayer,
        mpsc::UnboundedSender<IncomingMessage>,
        mpsc::UnboundedReceiver<IncomingRequest>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (layer, up) = TransactionLayer::start(SipTimers::default(), inbound_rx);
        (layer, inbound_tx, up)
    }

    fn inject(tx: &mpsc::UnboundedSender<IncomingMessage>, message: impl Into<SipMessage>, conn: &Arc<RecordingConnection>) {
        tx.send(IncomingMessage {
            message: message.into(),
            connection: conn.clone(),
        })
        .unwrap();
    }

    #[test]
    fn test_ack_keyed_as_invite() {
        let invite = TransactionKey::from_request(&request(SipMethod::Invite, "z9hG4bKa")).unwrap();
        let mut ack = request(SipMethod::Ack, "z9hG4bKa");
        ack.headers.cseq = Some(CSeq::new(1, SipMethod::Ack));
        assert_eq!(TransactionKey::from_request(&ack).unwrap(), invite);

        let bye = TransactionKey::from_request(&request(SipMethod::Bye, "z9hG4bKa")).unwrap();
        assert_ne!(bye, invite);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_response_retransmits_until_ack() {
        let (layer, inbound, mut up) = setup();
        let conn = Arc::new(RecordingConnection::default());
        let invite = request(SipMethod::Invite, "z9hG4bKist");

        inject(&inbound, invite.clone(), &conn);
        let incoming = up.recv().await.unwrap();
        let response = ResponseBuilder::new(486).to_tag("t").build_for_request(&invite).unwrap();
        incoming.respond(response).unwrap();

        tokio::time::sleep(Duration::from_millis(1600)).await;
        // initial + Timer G at 500ms and 1500ms
        assert_eq!(conn.sent().len(), 3);

        // retransmitted INVITE gets the same answer, no new transaction
        inject(&inbound, invite.clone(), &conn);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(conn.sent().len(), 4);
        assert_eq!(layer.len().await, 1);

        let mut ack = request(SipMethod::Ack, "z9hG4bKist");
        ack.headers.cseq = Some(CSeq::new(1, SipMethod::Ack));
        inject(&inbound, ack, &conn);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(conn.sent().len(), 4);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(layer.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_ack_passes_up() {
        let (_layer, inbound, mut up) = setup();
        let conn = Arc::new(RecordingConnection::default());
        inject(&inbound, request(SipMethod::Ack, "z9hG4bKnew"), &conn);
        let incoming = up.recv().await.unwrap();
        assert_eq!(incoming.request.method, SipMethod::Ack);
        assert!(incoming.transaction.is_none());
        assert!(incoming.respond(SipResponse::new(200, "OK")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_final_response() {
        let (layer, inbound, _up) = setup();
        let conn = Arc::new(RecordingConnection::default());
        let register = request(SipMethod::Register, "z9hG4bKnict");

        let mut txn = layer.send_request(register.clone(), conn.clone()).await.unwrap();
        let trying = synthesize_response(&register, 100);
        let ok = synthesize_response(&register, 200);
        inject(&inbound, trying, &conn);
        inject(&inbound, ok, &conn);

        assert_eq!(txn.final_response().await.unwrap().status, 200);
        assert_eq!(conn.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_timeout_synthesizes_408() {
        let (layer, _inbound, _up) = setup();
        let conn = Arc::new(RecordingConnection::default());
        let mut txn = layer
            .send_request(request(SipMethod::Options, "z9hG4bKto"), conn.clone())
            .await
            .unwrap();

        assert_eq!(txn.final_response().await.unwrap().status, 408);
        // 0, .5, 1.5, 3.5, 7.5 then every 4s up to 31.5
        assert_eq!(conn.sent().len(), 11);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(layer.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_send_failure_synthesizes_503() {
        let (layer, _inbound, _up) = setup();
        let conn = Arc::new(RecordingConnection {
            fail: true,
            ..Default::default()
        });
        let mut txn = layer
            .send_request(request(SipMethod::Invite, "z9hG4bKfail"), conn)
            .await
            .unwrap();
        assert_eq!(txn.final_response().await.unwrap().status, 503);
        assert!(layer.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_does_not_block_other_transactions() {
        let (layer, inbound, mut up) = setup();
        let started = tokio::time::Instant::now();
        let mut slow = layer
            .send_request(request(SipMethod::Options, "z9hG4bKslow"), Arc::new(StalledConnection))
            .await
            .unwrap();

        let conn = Arc::new(RecordingConnection::default());
        inject(&inbound, request(SipMethod::Bye, "z9hG4bKfast"), &conn);
        let incoming = up.recv().await.unwrap();
        assert_eq!(incoming.request.method, SipMethod::Bye);
        assert!(started.elapsed() <= SEND_TIMEOUT + Duration::from_millis(100));

        assert_eq!(slow.final_response().await.unwrap().status, 503);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(layer.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_response_dropped() {
        let (layer, inbound, _up) = setup();
        let conn = Arc::new(RecordingConnection::default());
        inject(&inbound, synthesize_response(&request(SipMethod::Bye, "z9hG4bKx"), 200), &conn);
        assert!(layer.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_terminates_everything() {
        let (layer, inbound, mut up) = setup();
        let conn = Arc::new(RecordingConnection::default());
        inject(&inbound, request(SipMethod::Invite, "z9hG4bKd1"), &conn);
        let _incoming = up.recv().await.unwrap();
        let mut txn = layer
            .send_request(request(SipMethod::Register, "z9hG4bKd2"), conn.clone())
            .await
            .unwrap();
        assert_eq!(layer.len().await, 2);

        layer.destroy().await;
        assert!(txn.final_response().await.is_err());
        assert_eq!(layer.len().await, 0);
    }
}
