//! Sequential failover across resolved candidates (RFC 3263 Section 4.3)

use super::builder::synthesize_response;
use super::message::{SipError, SipRequest, SipResponse};
use super::resolver::Candidate;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Sends one request to one candidate and waits for its final response
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestSender: Send + Sync {
    async fn send_to(&self, candidate: &Candidate, request: SipRequest) -> Result<SipResponse, SipError>;
}

/// Outcome of a sequential search
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub response: SipResponse,
    /// Candidates abandoned because they answered 503 or could not be reached
    pub failovers: usize,
}

/// Try candidates in order until one answers with something other than 503.
///
/// A send error counts as a 503 from that candidate. With every candidate
/// exhausted the last 503 is returned; with no candidates at all, a 404.
pub async fn sequential_search<S>(sender: &S, candidates: &[Candidate], request: &SipRequest) -> SearchResult
where
    S: RequestSender + ?Sized,
{
    let mut failovers = 0;
    let mut last: Option<SipResponse> = None;

    for (index, candidate) in candidates.iter().enumerate() {
        debug!("Trying candidate {}/{}: {}", index + 1, candidates.len(), candidate);

        let response = match sender.send_to(candidate, request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Candidate {} failed: {}", candidate, e);
                synthesize_response(request, 503)
            }
        };

        if response.status != 503 {
            return SearchResult { response, failovers };
        }

        if index + 1 < candidates.len() {
            failovers += 1;
            info!("{} answered 503, failing over", candidate);
        }
        last = Some(response);
    }

    let response = last.unwrap_or_else(|| {
        warn!("No candidates left for {}", request.uri);
        synthesize_response(request, 404)
    });
    SearchResult { response, failovers }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipMethod;
    use crate::infrastructure::protocols::sip::transport::TransportProtocol;
    use crate::infrastructure::protocols::sip::uri::SipUri;
    use mockall::predicate::always;
    use mockall::Sequence;

    fn candidates(n: u16) -> Vec<Candidate> {
        (0..n)
            .map(|i| Candidate::new(TransportProtocol::Udp, "10.0.0.1", 5060 + i))
            .collect()
    }

    fn request() -> SipRequest {
        SipRequest::new(SipMethod::Options, SipUri::new("pbx.example.com"))
    }

    #[tokio::test]
    async fn test_empty_candidates_is_404() {
        let sender = MockRequestSender::new();
        let result = sequential_search(&sender, &[], &request()).await;
        assert_eq!(result.response.status, 404);
        assert_eq!(result.failovers, 0);
    }

    #[tokio::test]
    async fn test_first_non_503_wins() {
        let mut sender = MockRequestSender::new();
        sender
            .expect_send_to()
            .with(always(), always())
            .times(1)
            .returning(|_, _| Ok(SipResponse::new(486, "Busy Here")));

        let result = sequential_search(&sender, &candidates(3), &request()).await;
        assert_eq!(result.response.status, 486);
        assert_eq!(result.failovers, 0);
    }

    #[tokio::test]
    async fn test_503_and_errors_advance() {
        let mut sender = MockRequestSender::new();
        let mut seq = Sequence::new();
        sender
            .expect_send_to()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(SipError::TransportError("refused".into())));
        sender
            .expect_send_to()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(SipResponse::new(503, "Service Unavailable")));
        sender
            .expect_send_to()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|c, _| {
                assert_eq!(c.port, 5062);
                Ok(SipResponse::new(200, "OK"))
            });

        let result = sequential_search(&sender, &candidates(3), &request()).await;
        assert_eq!(result.response.status, 200);
        assert_eq!(result.failovers, 2);
    }

    #[tokio::test]
    async fn test_all_503_returns_last() {
        let mut sender = MockRequestSender::new();
        sender
            .expect_send_to()
            .times(2)
            .returning(|_, _| Ok(SipResponse::new(503, "Overloaded")));

        let result = sequential_search(&sender, &candidates(2), &request()).await;
        assert_eq!(result.response.status, 503);
        assert_eq!(result.response.reason, "Overloaded");
        assert_eq!(result.failovers, 1);
    }
}
