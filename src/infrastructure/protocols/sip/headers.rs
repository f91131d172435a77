//! Typed SIP headers

use super::message::SipMethod;
use super::parser::ParseError;
use super::uri::{split_host_port, Params, SipUri};
use std::fmt;

/// One Via hop: `SIP/2.0/UDP host:port;branch=..;rport`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub version: String,
    pub protocol: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    pub fn new(protocol: &str, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            version: "2.0".to_string(),
            protocol: protocol.to_string(),
            host: host.into(),
            port,
            params: Params::new(),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.value("branch")
    }

    pub fn set_branch(&mut self, branch: &str) {
        self.params.set("branch", Some(branch.to_string()));
    }

    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidHeader(format!("via: {}", input));
        let input = input.trim();

        let (sent_protocol, rest) = input.split_once(char::is_whitespace).ok_or_else(invalid)?;
        let mut parts = sent_protocol.split('/');
        let name = parts.next().ok_or_else(invalid)?;
        let version = parts.next().ok_or_else(invalid)?;
        let protocol = parts.next().ok_or_else(invalid)?;
        if !name.eq_ignore_ascii_case("SIP") || parts.next().is_some() {
            return Err(invalid());
        }

        let (hostport, params) = match rest.trim().split_once(';') {
            Some((hp, p)) => (hp, Params::parse(p, ';')),
            None => (rest.trim(), Params::new()),
        };
        let (host, port) = split_host_port(hostport).ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            version: version.to_string(),
            protocol: protocol.to_ascii_uppercase(),
            host: host.to_string(),
            port,
            params,
        })
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/{}/{} {}", self.version, self.protocol, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        self.params.write(f, ';', ';')
    }
}

/// Address-of-record grammar shared by To, From, Contact, Route, Record-Route and Path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: SipUri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.value("tag")
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.params.set("tag", Some(tag.to_string()));
        self
    }

    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim();
        let invalid = || ParseError::InvalidHeader(format!("address: {}", input));

        if let Some(open) = input.find('<') {
            let close = input[open..].find('>').map(|i| i + open).ok_or_else(invalid)?;
            let display = input[..open].trim();
            let display_name = if display.is_empty() {
                None
            } else {
                Some(unquote(display))
            };
            let uri = SipUri::parse(&input[open + 1..close])?;
            let rest = input[close + 1..].trim();
            let params = match rest.strip_prefix(';') {
                Some(p) => Params::parse(p, ';'),
                None if rest.is_empty() => Params::new(),
                None => return Err(invalid()),
            };
            return Ok(Self {
                display_name,
                uri,
                params,
            });
        }

        // addr-spec without brackets: parameters belong to the header, not the URI
        let (uri, params) = match input.split_once(';') {
            Some((u, p)) => (u, Params::parse(p, ';')),
            None => (input, Params::new()),
        };
        Ok(Self {
            display_name: None,
            uri: SipUri::parse(uri)?,
            params,
        })
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name.replace('\\', "\\\\").replace('"', "\\\""))?;
        }
        write!(f, "<{}>", self.uri)?;
        self.params.write(f, ';', ';')
    }
}

/// `CSeq: 314159 INVITE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: SipMethod,
}

impl CSeq {
    pub fn new(seq: u32, method: SipMethod) -> Self {
        Self { seq, method }
    }

    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidHeader(format!("cseq: {}", input));
        let mut parts = input.split_whitespace();
        let seq = parts.next().and_then(|s| s.parse().ok()).ok_or_else(invalid)?;
        let method = parts.next().ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self {
            seq,
            method: SipMethod::from_token(method),
        })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// Single `name=value` of a credentials/challenge list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthParam {
    pub name: String,
    pub value: String,
    pub quoted: bool,
}

/// Digest challenge or credentials (`Digest realm="x", nonce="y", ...`).
///
/// Also used for `Authentication-Info`, which has no scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthHeader {
    pub scheme: String,
    pub params: Vec<AuthParam>,
}

impl AuthHeader {
    pub fn digest() -> Self {
        Self {
            scheme: "Digest".to_string(),
            params: Vec::new(),
        }
    }

    pub fn info() -> Self {
        Self::default()
    }

    /// Unquoted value of a parameter
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_str())
    }

    pub fn quoted(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.push(AuthParam {
            name: name.to_string(),
            value: value.into(),
            quoted: true,
        });
        self
    }

    pub fn token(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.push(AuthParam {
            name: name.to_string(),
            value: value.into(),
            quoted: false,
        });
        self
    }

    pub fn parse(input: &str, with_scheme: bool) -> Result<Self, ParseError> {
        let input = input.trim();
        let (scheme, rest) = if with_scheme {
            match input.split_once(char::is_whitespace) {
                Some((s, r)) => (s.to_string(), r),
                None => (input.to_string(), ""),
            }
        } else {
            (String::new(), input)
        };

        let mut params = Vec::new();
        for item in split_list(rest) {
            let (name, value) = item
                .split_once('=')
                .ok_or_else(|| ParseError::InvalidHeader(format!("auth param: {}", item)))?;
            let value = value.trim();
            let quoted = value.starts_with('"');
            params.push(AuthParam {
                name: name.trim().to_string(),
                value: if quoted { unquote(value) } else { value.to_string() },
                quoted,
            });
        }

        Ok(Self { scheme, params })
    }
}

impl fmt::Display for AuthHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.scheme.is_empty() {
            write!(f, "{} ", self.scheme)?;
        }
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if p.quoted {
                write!(f, "{}=\"{}\"", p.name, p.value.replace('\\', "\\\\").replace('"', "\\\""))?;
            } else {
                write!(f, "{}={}", p.name, p.value)?;
            }
        }
        Ok(())
    }
}

/// Split a header value on top-level commas, ignoring commas inside quotes or `<...>`.
pub(crate) fn split_list(input: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut depth = 0usize;

    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            ',' if !in_quotes && depth == 0 => {
                items.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(input[start..].trim());
    items.retain(|s| !s.is_empty());
    items
}

/// Strip surrounding quotes and resolve `\x` escapes
pub(crate) fn unquote(input: &str) -> String {
    let input = input.trim();
    let inner = input
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(input);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Header table of a SIP message.
///
/// Well-known headers are typed; everything else lives in `other` under its
/// canonical lowercase name, repeated occurrences comma-joined. `Content-Length`
/// is never stored: it is derived from the body on output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    pub via: Vec<Via>,
    pub to: Option<NameAddr>,
    pub from: Option<NameAddr>,
    pub call_id: Option<String>,
    pub cseq: Option<CSeq>,
    pub contact: Vec<NameAddr>,
    pub route: Vec<NameAddr>,
    pub record_route: Vec<NameAddr>,
    pub path: Vec<NameAddr>,
    pub authorization: Vec<AuthHeader>,
    pub proxy_authorization: Vec<AuthHeader>,
    pub www_authenticate: Vec<AuthHeader>,
    pub proxy_authenticate: Vec<AuthHeader>,
    pub authentication_info: Option<AuthHeader>,
    pub proxy_authentication_info: Option<AuthHeader>,
    pub other: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.via.first()
    }

    pub fn top_via_mut(&mut self) -> Option<&mut Via> {
        self.via.first_mut()
    }

    /// Untyped header by canonical lowercase name
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.other
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Replace an untyped header
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        match self.other.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.other.push((name, value)),
        }
    }

    /// Add to an untyped header, comma-joining repeats
    pub fn append(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        match self.other.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => {
                entry.1.push(',');
                entry.1.push_str(value);
            }
            None => self.other.push((name, value.to_string())),
        }
    }

    pub fn remove(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.other.retain(|(k, _)| *k != name);
    }

    /// `Expires` as seconds
    pub fn expires(&self) -> Option<u32> {
        self.get("expires").and_then(|v| v.trim().parse().ok())
    }
}
