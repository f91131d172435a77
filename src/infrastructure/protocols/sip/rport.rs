/// Via stamping for NAT traversal (RFC 3261 Section 18.2.1, RFC 3581)
///
/// Inbound requests learn `received`/`rport` from the socket they arrived on;
/// outbound requests advertise the local public address and ask for symmetric
/// response routing over UDP.
use super::headers::Via;
use super::message::SipRequest;
use super::transport::TransportProtocol;
use std::net::SocketAddr;
use tracing::debug;

/// Stamp `received` (always) and `rport` (only if the sender asked for it) on the top Via
pub fn stamp_inbound(request: &mut SipRequest, source: SocketAddr) {
    let Some(via) = request.headers.top_via_mut() else {
        return;
    };

    via.params.set("received", Some(source.ip().to_string()));
    if via.params.get("rport") == Some(None) {
        via.params.set("rport", Some(source.port().to_string()));
        debug!("Stamped rport={} on Via from {}", source.port(), source);
    }
}

/// Rewrite the top Via with our advertised address before sending a request.
///
/// A request without Via gets one; its branch is left to the caller.
pub fn stamp_outbound(
    request: &mut SipRequest,
    protocol: TransportProtocol,
    public_host: &str,
    public_port: u16,
    rport_enabled: bool,
) {
    if request.headers.via.is_empty() {
        request
            .headers
            .via
            .push(Via::new(protocol.as_str(), public_host, Some(public_port)));
    }

    if let Some(via) = request.headers.top_via_mut() {
        via.protocol = protocol.as_str().to_string();
        via.host = public_host.to_string();
        via.port = Some(public_port);
        if protocol == TransportProtocol::Udp && rport_enabled && !via.params.contains("rport") {
            via.params.set("rport", None);
        }
    }
}

/// Extract rport value from a Via
pub fn rport_of(via: &Via) -> Option<u16> {
    via.params.value("rport").and_then(|p| p.parse().ok())
}

/// Extract received parameter from a Via
pub fn received_of(via: &Via) -> Option<&str> {
    via.params.value("received")
}
