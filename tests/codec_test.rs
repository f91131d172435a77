//! Wire codec and flow token integration tests

use doorbell_sip::infrastructure::protocols::sip::parser::{parse_message, ParseError};
use doorbell_sip::infrastructure::protocols::sip::{
    Flow, FlowTokenSigner, SipMessage, SipMethod, SipUri, TransportProtocol,
};

fn doorbell_invite() -> String {
    [
        "INVITE sip:intercom@192.168.1.50:5062 SIP/2.0",
        "Via: SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bK776asdhds;rport",
        "Max-Forwards: 70",
        "To: <sip:intercom@192.168.1.50:5062>",
        "From: \"Front Door\" <sip:door@192.168.1.10>;tag=1928301774",
        "Call-ID: a84b4c76e66710@192.168.1.10",
        "CSeq: 314159 INVITE",
        "Contact: <sip:door@192.168.1.10:5060>",
        "Record-Route: <sip:proxy.local;lr>",
        "X-Door-Id: 7",
        "X-Door-Id: 8",
        "Content-Type: application/sdp",
        "Content-Length: 10",
        "",
        "v=0\r\ns=-\r\n",
    ]
    .join("\r\n")
}

#[test]
fn test_parse_doorbell_invite() {
    let message = parse_message(doorbell_invite().as_bytes()).unwrap();
    let request = message.as_request().unwrap();

    assert_eq!(request.method, SipMethod::Invite);
    assert_eq!(request.uri.port, Some(5062));
    assert_eq!(request.branch(), Some("z9hG4bK776asdhds"));
    assert!(request.headers.top_via().unwrap().params.contains("rport"));
    assert_eq!(request.headers.from.as_ref().unwrap().display_name.as_deref(), Some("Front Door"));
    assert_eq!(request.headers.cseq.as_ref().unwrap().seq, 314159);
    assert_eq!(request.headers.record_route.len(), 1);
    assert_eq!(request.headers.get("x-door-id"), Some("7,8"));
    assert_eq!(&request.body[..], b"v=0\r\ns=-\r\n");
}

#[test]
fn test_serialize_is_stable_after_one_pass() {
    let first = parse_message(doorbell_invite().as_bytes()).unwrap().to_bytes();
    let second = parse_message(&first).unwrap().to_bytes();
    assert_eq!(first, second);
}

#[test]
fn test_caller_content_length_is_ignored() {
    let mut message = parse_message(doorbell_invite().as_bytes()).unwrap();
    if let SipMessage::Request(request) = &mut message {
        request.headers.set("content-length", "999");
        request.body = bytes::Bytes::from_static(b"v=0\r\n");
    }
    let text = String::from_utf8(message.to_bytes().to_vec()).unwrap();
    assert!(text.contains("Content-Length: 5\r\n"));
    assert!(!text.contains("999"));
}

#[test]
fn test_noise_is_malformed() {
    let result = parse_message(b"\x00\x01garbage\r\n\r\n");
    assert!(matches!(result, Err(ParseError::MalformedStartLine(_))));
}

#[test]
fn test_uri_round_trip_keeps_every_field() {
    let text = "sips:alice:pw@[2001:db8::5]:5061;transport=tls;lr?subject=door&priority=urgent";
    let uri = SipUri::parse(text).unwrap();
    assert_eq!(uri.scheme, "sips");
    assert_eq!(uri.user.as_deref(), Some("alice"));
    assert_eq!(uri.password.as_deref(), Some("pw"));
    assert_eq!(uri.host_unbracketed(), "2001:db8::5");
    assert_eq!(uri.params.value("transport"), Some("tls"));
    assert!(uri.params.contains("lr"));
    assert_eq!(uri.headers.value("priority"), Some("urgent"));

    let reparsed = SipUri::parse(&uri.to_string()).unwrap();
    assert_eq!(reparsed, uri);
}

#[test]
fn test_flow_token_survives_uri_serialization() {
    let signer = FlowTokenSigner::random().unwrap();
    let flow = Flow::new(
        TransportProtocol::Tcp,
        "192.168.1.10:41234".parse().unwrap(),
        "192.168.1.50:5062".parse().unwrap(),
    );
    let uri = signer.encode_uri(&flow, "intercom.local");
    let reparsed = SipUri::parse(&uri.to_string()).unwrap();
    assert_eq!(signer.decode_uri(&reparsed), Some(flow));
}

#[test]
fn test_flow_token_single_bit_corruption_is_rejected() {
    let signer = FlowTokenSigner::new(b"doorbell flow secret").unwrap();
    let flow = Flow::new(
        TransportProtocol::Udp,
        "10.0.0.7:5060".parse().unwrap(),
        "10.0.0.2:40000".parse().unwrap(),
    );
    let token = signer.encode(&flow);
    assert_eq!(signer.decode(&token), Some(flow));

    let mut checked = 0;
    for index in 0..token.len() {
        for bit in 0..8 {
            let mut bytes = token.clone().into_bytes();
            bytes[index] ^= 1 << bit;
            let Ok(corrupted) = String::from_utf8(bytes) else {
                continue;
            };
            assert_eq!(signer.decode(&corrupted), None, "byte {} bit {} decoded", index, bit);
            checked += 1;
        }
    }
    assert!(checked > token.len());
}
