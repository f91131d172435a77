//! Resolution plus sequential failover across candidates

use async_trait::async_trait;
use doorbell_sip::infrastructure::protocols::sip::builder::synthesize_response;
use doorbell_sip::infrastructure::protocols::sip::resolver::{DnsResolver, Resolver, StaticLookup};
use doorbell_sip::infrastructure::protocols::sip::{
    sequential_search, Candidate, CSeq, NameAddr, RequestSender, SipError, SipMethod, SipRequest, SipResponse,
    SipUri, TransportProtocol,
};
use mockall::{mock, Sequence};

mock! {
    Sender {}

    #[async_trait]
    impl RequestSender for Sender {
        async fn send_to(&self, candidate: &Candidate, request: SipRequest) -> Result<SipResponse, SipError>;
    }
}

fn options(uri: SipUri) -> SipRequest {
    let mut request = SipRequest::new(SipMethod::Options, uri.clone());
    request.headers.from = Some(NameAddr::new(SipUri::new("192.168.1.50").with_user("intercom")).with_tag("f"));
    request.headers.to = Some(NameAddr::new(uri));
    request.headers.call_id = Some("failover@intercom".to_string());
    request.headers.cseq = Some(CSeq::new(1, SipMethod::Options));
    request
}

async fn three_udp_candidates() -> (SipUri, Vec<Candidate>) {
    let lookup = StaticLookup::new().with_ips(
        "doorbell.example",
        vec![
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
        ],
    );
    let uri = SipUri::parse("sip:door@doorbell.example:5060;transport=udp").unwrap();
    let candidates = DnsResolver::new(lookup).resolve(&uri).await;
    (uri, candidates)
}

#[tokio::test]
async fn test_two_unreachable_candidates_then_success() {
    let (uri, candidates) = three_udp_candidates().await;
    assert_eq!(candidates.len(), 3);
    assert!(candidates.iter().all(|c| c.protocol == TransportProtocol::Udp && c.port == 5060));

    let mut sender = MockSender::new();
    let mut seq = Sequence::new();
    for host in ["10.0.0.1", "10.0.0.2"] {
        sender
            .expect_send_to()
            .withf(move |candidate, _| candidate.host == host)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|candidate, _| Err(SipError::TransportError(format!("cannot open {}", candidate))));
    }
    sender
        .expect_send_to()
        .withf(|candidate, _| candidate.host == "10.0.0.3")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, request| {
            let mut ok = synthesize_response(&request, 200);
            ok.headers.set("server", "third");
            Ok(ok)
        });

    let result = sequential_search(&sender, &candidates, &options(uri)).await;
    assert_eq!(result.response.status, 200);
    assert_eq!(result.response.headers.get("server"), Some("third"));
    assert_eq!(result.failovers, 2);
}

#[tokio::test]
async fn test_final_error_stops_the_search() {
    let (uri, candidates) = three_udp_candidates().await;

    let mut sender = MockSender::new();
    sender
        .expect_send_to()
        .times(1)
        .returning(|_, request| Ok(synthesize_response(&request, 486)));

    let result = sequential_search(&sender, &candidates, &options(uri)).await;
    assert_eq!(result.response.status, 486);
    assert_eq!(result.failovers, 0);
}

#[tokio::test]
async fn test_unresolvable_host_is_404() {
    let uri = SipUri::parse("sip:door@nowhere.example").unwrap();
    let candidates = DnsResolver::new(StaticLookup::new()).resolve(&uri).await;
    assert!(candidates.is_empty());

    let mut sender = MockSender::new();
    sender.expect_send_to().never();

    let result = sequential_search(&sender, &candidates, &options(uri)).await;
    assert_eq!(result.response.status, 404);
    assert_eq!(result.failovers, 0);
}
