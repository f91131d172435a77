//! SIP wire codec: text <-> `SipMessage`

use super::headers::{split_list, AuthHeader, CSeq, Headers, NameAddr, Via};
use super::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::uri::SipUri;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed start line: {0}")]
    MalformedStartLine(String),

    #[error("missing mandatory header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("message exceeds {0} bytes")]
    MessageTooLarge(usize),
}

impl From<ParseError> for SipError {
    fn from(err: ParseError) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// Expand single-letter compact header names (RFC 3261 Section 7.3.3 and extensions)
fn expand_compact(name: &str) -> &str {
    match name {
        "i" => "call-id",
        "m" => "contact",
        "e" => "content-encoding",
        "l" => "content-length",
        "c" => "content-type",
        "f" => "from",
        "s" => "subject",
        "k" => "supported",
        "t" => "to",
        "v" => "via",
        "o" => "event",
        "r" => "refer-to",
        "b" => "referred-by",
        "u" => "allow-events",
        "x" => "session-expires",
        "a" => "accept-contact",
        "j" => "reject-contact",
        "d" => "request-disposition",
        "y" => "identity",
        "n" => "identity-info",
        other => other,
    }
}

/// Wire spelling of a canonical lowercase header name
pub fn pretty_header_name(name: &str) -> String {
    match name {
        "call-id" => "Call-ID".to_string(),
        "cseq" => "CSeq".to_string(),
        "www-authenticate" => "WWW-Authenticate".to_string(),
        "mime-version" => "MIME-Version".to_string(),
        "rack" => "RAck".to_string(),
        "rseq" => "RSeq".to_string(),
        _ => name
            .split('-')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("-"),
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse a complete SIP message.
///
/// A header whose value does not match its grammar is dropped; only a bad
/// start line or a missing mandatory header rejects the message.
pub fn parse_message(data: &[u8]) -> Result<SipMessage, ParseError> {
    let (head, rest) = match find_head_end(data) {
        Some(pos) => (&data[..pos], &data[pos + 4..]),
        None => (data, &data[data.len()..]),
    };
    let head = String::from_utf8_lossy(head);

    let mut lines = head
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .skip_while(|l| l.trim().is_empty());

    let start_line = lines
        .next()
        .ok_or_else(|| ParseError::MalformedStartLine(String::new()))?;

    // Unfold continuation lines
    let mut unfolded: Vec<String> = Vec::new();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = unfolded.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
            }
            continue;
        }
        unfolded.push(line.to_string());
    }

    let mut headers = Headers::new();
    let mut content_length: Option<usize> = None;

    for line in &unfolded {
        let Some((name, value)) = line.split_once(':') else {
            debug!("Dropping header line without colon: {}", line);
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let name = expand_compact(&name);
        let value = value.trim();

        if name == "content-length" {
            match value.parse() {
                Ok(len) => content_length = Some(len),
                Err(_) => debug!("Dropping unparsable Content-Length: {}", value),
            }
            continue;
        }

        if let Err(e) = apply_header(&mut headers, name, value) {
            debug!("Dropping header {}: {}", name, e);
        }
    }

    let body = match content_length {
        Some(len) => Bytes::copy_from_slice(&rest[..len.min(rest.len())]),
        None => Bytes::copy_from_slice(rest),
    };

    let message = parse_start_line(start_line, headers, body)?;
    validate(&message)?;
    Ok(message)
}

fn parse_start_line(line: &str, headers: Headers, body: Bytes) -> Result<SipMessage, ParseError> {
    let malformed = || ParseError::MalformedStartLine(line.to_string());

    if let Some(rest) = line.strip_prefix("SIP/") {
        let mut parts = rest.splitn(3, ' ');
        let version = parts.next().ok_or_else(malformed)?;
        let code = parts.next().ok_or_else(malformed)?;
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let status = code.parse().map_err(|_| malformed())?;
        let reason = parts.next().unwrap_or("").to_string();
        return Ok(SipMessage::Response(SipResponse {
            status,
            reason,
            version: version.to_string(),
            headers,
            body,
        }));
    }

    let mut parts = line.split(' ');
    let (Some(method), Some(uri), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };
    let version = version.strip_prefix("SIP/").ok_or_else(malformed)?;
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(malformed());
    }
    let uri = SipUri::parse(uri).map_err(|_| malformed())?;

    Ok(SipMessage::Request(SipRequest {
        method: SipMethod::from_token(method),
        uri,
        version: version.to_string(),
        headers,
        body,
    }))
}

fn apply_header(headers: &mut Headers, name: &str, value: &str) -> Result<(), ParseError> {
    match name {
        "via" => {
            let vias = split_list(value)
                .into_iter()
                .map(Via::parse)
                .collect::<Result<Vec<_>, _>>()?;
            headers.via.extend(vias);
        }
        "to" => headers.to = Some(NameAddr::parse(value)?),
        "from" => headers.from = Some(NameAddr::parse(value)?),
        "call-id" => {
            if value.is_empty() {
                return Err(ParseError::InvalidHeader("empty call-id".to_string()));
            }
            headers.call_id = Some(value.to_string());
        }
        "cseq" => headers.cseq = Some(CSeq::parse(value)?),
        "contact" | "route" | "record-route" | "path" => {
            let addrs = split_list(value)
                .into_iter()
                .map(NameAddr::parse)
                .collect::<Result<Vec<_>, _>>()?;
            let target = match name {
                "contact" => &mut headers.contact,
                "route" => &mut headers.route,
                "record-route" => &mut headers.record_route,
                _ => &mut headers.path,
            };
            target.extend(addrs);
        }
        "authorization" => headers.authorization.push(AuthHeader::parse(value, true)?),
        "proxy-authorization" => headers.proxy_authorization.push(AuthHeader::parse(value, true)?),
        "www-authenticate" => headers.www_authenticate.push(AuthHeader::parse(value, true)?),
        "proxy-authenticate" => headers.proxy_authenticate.push(AuthHeader::parse(value, true)?),
        "authentication-info" => headers.authentication_info = Some(AuthHeader::parse(value, false)?),
        "proxy-authentication-info" => {
            headers.proxy_authentication_info = Some(AuthHeader::parse(value, false)?)
        }
        _ => headers.append(name, value),
    }
    Ok(())
}

fn validate(message: &SipMessage) -> Result<(), ParseError> {
    let headers = message.headers();
    if message.is_request() && headers.via.is_empty() {
        return Err(ParseError::MissingHeader("Via"));
    }
    if headers.call_id.is_none() {
        return Err(ParseError::MissingHeader("Call-ID"));
    }
    if headers.to.is_none() {
        return Err(ParseError::MissingHeader("To"));
    }
    if headers.from.is_none() {
        return Err(ParseError::MissingHeader("From"));
    }
    if headers.cseq.is_none() {
        return Err(ParseError::MissingHeader("CSeq"));
    }
    Ok(())
}

/// Total size of the first framed message in a stream buffer, once its head is complete.
///
/// Streams require `Content-Length`; when absent the body is taken as empty.
/// A declared size above `max` is rejected before any body bytes are awaited.
pub fn framed_length(buf: &[u8], max: usize) -> Result<Option<usize>, ParseError> {
    let Some(head_end) = find_head_end(buf) else {
        return Ok(None);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]);
    let content_length = head
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| {
            let name = name.trim();
            name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l")
        })
        .map(|(_, value)| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidHeader(format!("content-length: {}", value.trim())))
        })
        .transpose()?
        .unwrap_or(0);
    match (head_end + 4).checked_add(content_length) {
        Some(total) if total <= max => Ok(Some(total)),
        _ => Err(ParseError::MessageTooLarge(max)),
    }
}

pub fn serialize(message: &SipMessage) -> Bytes {
    match message {
        SipMessage::Request(req) => serialize_request(req),
        SipMessage::Response(resp) => serialize_response(resp),
    }
}

pub fn serialize_request(request: &SipRequest) -> Bytes {
    let start = format!("{} {} SIP/{}", request.method, request.uri, request.version);
    write_message(&start, &request.headers, &request.body)
}

pub fn serialize_response(response: &SipResponse) -> Bytes {
    let start = format!("SIP/{} {} {}", response.version, response.status, response.reason);
    write_message(&start, &response.headers, &response.body)
}

fn write_message(start: &str, headers: &Headers, body: &Bytes) -> Bytes {
    let mut head = String::with_capacity(512);
    head.push_str(start);
    head.push_str("\r\n");

    // fmt::Write into a String cannot fail
    let mut line = |name: &str, value: &dyn std::fmt::Display| {
        let _ = write!(head, "{}: {}\r\n", name, value);
    };

    for via in &headers.via {
        line("Via", via);
    }
    if let Some(to) = &headers.to {
        line("To", to);
    }
    if let Some(from) = &headers.from {
        line("From", from);
    }
    if let Some(call_id) = &headers.call_id {
        line("Call-ID", call_id);
    }
    if let Some(cseq) = &headers.cseq {
        line("CSeq", cseq);
    }
    for contact in &headers.contact {
        line("Contact", contact);
    }
    for route in &headers.route {
        line("Route", route);
    }
    for rr in &headers.record_route {
        line("Record-Route", rr);
    }
    for path in &headers.path {
        line("Path", path);
    }
    for auth in &headers.authorization {
        line("Authorization", auth);
    }
    for auth in &headers.proxy_authorization {
        line("Proxy-Authorization", auth);
    }
    for auth in &headers.www_authenticate {
        line("WWW-Authenticate", auth);
    }
    for auth in &headers.proxy_authenticate {
        line("Proxy-Authenticate", auth);
    }
    if let Some(info) = &headers.authentication_info {
        line("Authentication-Info", info);
    }
    if let Some(info) = &headers.proxy_authentication_info {
        line("Proxy-Authentication-Info", info);
    }
    for (name, value) in headers.other.iter().filter(|(name, _)| name != "content-length") {
        line(&pretty_header_name(name), value);
    }
    line("Content-Length", &body.len());
    head.push_str("\r\n");

    let mut out = BytesMut::with_capacity(head.len() + body.len());
    out.put_slice(head.as_bytes());
    out.put_slice(body);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite_text() -> String {
        [
            "INVITE sip:100@192.168.1.50 SIP/2.0",
            "v: SIP/2.0/UDP 192.168.1.20:5060;branch=z9hG4bKabc;rport",
            "Max-Forwards: 70",
            "f: <sip:door@192.168.1.20>;tag=1928",
            "t: <sip:100@192.168.1.50>",
            "i: a84b4c76e66710",
            "CSeq: 1 INVITE",
            "m: <sip:door@192.168.1.20:5060>",
            "Allow: INVITE, ACK",
            "Allow: BYE",
            "c: application/sdp",
            "l: 4",
            "",
            "v=0\r\nEXTRA",
        ]
        .join("\r\n")
    }

    #[test]
    fn test_parse_request_with_compact_headers() {
        let msg = parse_message(invite_text().as_bytes()).unwrap();
        let req = msg.as_request().unwrap();
        assert_eq!(req.method, SipMethod::Invite);
        assert_eq!(req.uri.user.as_deref(), Some("100"));
        assert_eq!(req.headers.call_id.as_deref(), Some("a84b4c76e66710"));
        assert_eq!(req.headers.from.as_ref().unwrap().tag(), Some("1928"));
        assert_eq!(req.headers.contact.len(), 1);
        assert_eq!(req.headers.get("content-type"), Some("application/sdp"));
        assert_eq!(req.headers.get("allow"), Some("INVITE, ACK,BYE"));
        assert_eq!(&req.body[..], b"v=0\r");
    }

    #[test]
    fn test_content_length_clamped_to_available() {
        let text = invite_text().replace("l: 4", "l: 400");
        let msg = parse_message(text.as_bytes()).unwrap();
        assert_eq!(&msg.as_request().unwrap().body[..], b"v=0\r\nEXTRA");
    }

    #[test]
    fn test_bad_header_is_dropped_not_fatal() {
        let text = invite_text().replace("m: <sip:door@192.168.1.20:5060>", "m: <sip:door@host:notaport>");
        let msg = parse_message(text.as_bytes()).unwrap();
        assert!(msg.headers().contact.is_empty());
    }

    #[test]
    fn test_malformed_start_line() {
        let text = invite_text().replace("INVITE sip:100@192.168.1.50 SIP/2.0", "HELLO WORLD");
        assert!(matches!(
            parse_message(text.as_bytes()),
            Err(ParseError::MalformedStartLine(_))
        ));
    }

    #[test]
    fn test_missing_call_id_rejected() {
        let text = invite_text().replace("i: a84b4c76e66710\r\n", "");
        assert_eq!(
            parse_message(text.as_bytes()),
            Err(ParseError::MissingHeader("Call-ID"))
        );
    }

    #[test]
    fn test_folded_header_line() {
        let text = invite_text().replace("Max-Forwards: 70", "Subject: front\r\n  door");
        let msg = parse_message(text.as_bytes()).unwrap();
        assert_eq!(msg.headers().get("subject"), Some("front door"));
    }

    #[test]
    fn test_response_with_empty_reason() {
        let text = "SIP/2.0 200 \r\nVia: SIP/2.0/UDP h;branch=z9hG4bK1\r\nTo: <sip:a@b>\r\nFrom: <sip:c@d>;tag=1\r\nCall-ID: x\r\nCSeq: 1 BYE\r\n\r\n";
        let msg = parse_message(text.as_bytes()).unwrap();
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "");
        assert!(String::from_utf8_lossy(&resp.to_bytes()).starts_with("SIP/2.0 200 \r\n"));
    }

    #[test]
    fn test_serialize_recomputes_content_length() {
        let msg = parse_message(invite_text().as_bytes()).unwrap();
        let text = String::from_utf8(msg.to_bytes().to_vec()).unwrap();
        assert!(text.contains("Content-Length: 4\r\n\r\nv=0\r"));
        assert!(text.contains("Call-ID: a84b4c76e66710\r\n"));
        assert!(text.contains("Content-Type: application/sdp\r\n"));
    }

    #[test]
    fn test_framed_length() {
        let text = invite_text();
        let total = framed_length(text.as_bytes(), 65535).unwrap().unwrap();
        let head_end = text.find("\r\n\r\n").unwrap() + 4;
        assert_eq!(total, head_end + 4);
        assert_eq!(framed_length(b"INVITE sip:a SIP/2.0\r\nVia: x", 65535).unwrap(), None);
    }

    #[test]
    fn test_framed_length_rejects_huge_content_length() {
        let overflow = b"OPTIONS sip:a@b SIP/2.0\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert_eq!(framed_length(overflow, 65535), Err(ParseError::MessageTooLarge(65535)));

        let huge = b"OPTIONS sip:a@b SIP/2.0\r\nContent-Length: 4000000000\r\n\r\n";
        assert_eq!(framed_length(huge, 65535), Err(ParseError::MessageTooLarge(65535)));

        let head = "OPTIONS sip:a@b SIP/2.0\r\nl: 10\r\n\r\n";
        let exact = head.len() + 10;
        assert_eq!(framed_length(head.as_bytes(), exact).unwrap(), Some(exact));
        assert!(framed_length(head.as_bytes(), exact - 1).is_err());
    }

    #[test]
    fn test_framed_length_rejects_garbage_content_length() {
        let text = b"OPTIONS sip:a@b SIP/2.0\r\nContent-Length: -3\r\n\r\n";
        assert!(matches!(framed_length(text, 65535), Err(ParseError::InvalidHeader(_))));
    }

    #[test]
    fn test_pretty_header_names() {
        assert_eq!(pretty_header_name("www-authenticate"), "WWW-Authenticate");
        assert_eq!(pretty_header_name("max-forwards"), "Max-Forwards");
        assert_eq!(pretty_header_name("user-agent"), "User-Agent");
    }
}
