//! SIP stack: transport, transactions and resolution behind one handle

use super::builder::{generate_branch, ResponseBuilder};
use super::flow::Flow;
use super::handler::SipHandler;
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use super::resolver::{Candidate, DnsResolver, Resolver};
use super::search::{sequential_search, RequestSender};
use super::transaction::{IncomingRequest, SipTimers, TransactionLayer};
use super::transport::{Connection, TransportConfig, TransportLayer};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// SIP server configuration
#[derive(Debug, Clone)]
pub struct SipServerConfig {
    pub transport: TransportConfig,
    pub timers: SipTimers,
}

impl SipServerConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            transport: TransportConfig::new(bind),
            timers: SipTimers::default(),
        }
    }
}

/// Running SIP stack.
///
/// Inbound requests are handed to the handler one at a time. Outbound
/// requests go out through [`SipServer::send`], which honours flow tokens and
/// otherwise resolves the Request-URI and fails over across candidates.
pub struct SipServer {
    transport: TransportLayer,
    transactions: TransactionLayer,
    resolver: Arc<dyn Resolver>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SipServer {
    /// Start with the system DNS resolver
    pub async fn start(config: SipServerConfig, handler: Arc<dyn SipHandler>) -> Result<Self, SipError> {
        Self::start_with_resolver(config, handler, Arc::new(DnsResolver::from_system())).await
    }

    pub async fn start_with_resolver(
        config: SipServerConfig,
        handler: Arc<dyn SipHandler>,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self, SipError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = TransportLayer::bind(config.transport, inbound_tx).await?;
        let (transactions, requests) = TransactionLayer::start(config.timers, inbound_rx);
        let dispatcher = tokio::spawn(Self::dispatch_loop(requests, handler));

        info!("SIP server started on {}", transport.local_addr());
        Ok(Self {
            transport,
            transactions,
            resolver,
            dispatcher: std::sync::Mutex::new(Some(dispatcher)),
        })
    }

    async fn dispatch_loop(mut requests: mpsc::UnboundedReceiver<IncomingRequest>, handler: Arc<dyn SipHandler>) {
        while let Some(incoming) = requests.recv().await {
            let request = &incoming.request;
            debug!("Dispatching {} from {}", request.method, incoming.source());

            let outcome = handler.handle_request(&incoming).await;
            if request.method == SipMethod::Ack {
                if let Err(e) = outcome {
                    error!("Handler error for ACK from {}: {}", incoming.source(), e);
                }
                continue;
            }

            // Every other request owns a server transaction that only a final response ends
            let response = match outcome {
                Ok(Some(response)) => Ok(response),
                Ok(None) => {
                    warn!("Handler left {} from {} unanswered", request.method, incoming.source());
                    ResponseBuilder::server_internal_error().build_for_request(request)
                }
                Err(e) => {
                    error!("Handler error for {} from {}: {}", request.method, incoming.source(), e);
                    ResponseBuilder::server_internal_error().build_for_request(request)
                }
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!("Cannot build 500 response: {}", e);
                    continue;
                }
            };

            if let Err(e) = incoming.respond(response) {
                warn!("Failed to respond to {}: {}", request.method, e);
            }
        }
        debug!("Dispatch loop finished");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn transport(&self) -> &TransportLayer {
        &self.transport
    }

    pub fn transactions(&self) -> &TransactionLayer {
        &self.transactions
    }

    /// Send a request and wait for its final response.
    ///
    /// A Request-URI carrying a valid flow token is sent over that flow.
    /// Anything else is resolved and tried candidate by candidate.
    pub async fn send(&self, request: SipRequest) -> Result<SipResponse, SipError> {
        if let Some(flow) = self.transport.decode_flow_uri(&request.uri) {
            debug!("{} routed by flow token to {}", request.method, flow);
            return self.send_on_flow(&flow, request).await;
        }

        let candidates = self.resolver.resolve(&request.uri).await;
        debug!("{} resolved to {} candidate(s)", request.uri, candidates.len());
        let result = sequential_search(self, &candidates, &request).await;
        if result.failovers > 0 {
            info!("{} answered after {} failover(s)", request.method, result.failovers);
        }
        Ok(result.response)
    }

    /// Send over an existing flow, typically the one a dialog arrived on
    pub async fn send_on_flow(&self, flow: &Flow, request: SipRequest) -> Result<SipResponse, SipError> {
        let connection = self
            .transport
            .get(flow)
            .await
            .ok_or_else(|| SipError::TransportError(format!("{} is no longer connected", flow)))?;
        self.send_on(connection, request).await
    }

    async fn send_on(&self, connection: Arc<dyn Connection>, mut request: SipRequest) -> Result<SipResponse, SipError> {
        self.transport.prepare_outbound(&mut request, connection.protocol());
        if let Some(via) = request.headers.top_via_mut() {
            if via.branch().is_none() {
                via.set_branch(&generate_branch());
            }
        }

        debug!("Sending {} {} over {}", request.method, request.uri, connection.flow());
        let result = match self.transactions.send_request(request, connection.clone()).await {
            Ok(mut transaction) => transaction.final_response().await,
            Err(e) => Err(e),
        };
        connection.release();
        result
    }

    /// Destroy every live transaction and close the transport
    pub async fn stop(&self) {
        info!("Stopping SIP server");
        let dispatcher = match self.dispatcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = dispatcher {
            task.abort();
        }
        self.transactions.destroy().await;
        self.transport.stop().await;
        info!("SIP server stopped");
    }
}

#[async_trait]
impl RequestSender for SipServer {
    /// Each candidate is a new transaction, so it gets a fresh branch
    async fn send_to(&self, candidate: &Candidate, mut request: SipRequest) -> Result<SipResponse, SipError> {
        let connection = self.transport.open(candidate).await?;
        self.transport.prepare_outbound(&mut request, connection.protocol());
        if let Some(via) = request.headers.top_via_mut() {
            via.set_branch(&generate_branch());
        }
        self.send_on(connection, request).await
    }
}
