//! SIP URI model and grammar (RFC 3261 Section 19.1)

use super::parser::ParseError;
use std::fmt;
use std::str::FromStr;

/// Ordered `name[=value]` parameter list.
///
/// Lookups are case-insensitive on the name; insertion order is kept so that
/// a parsed URI serializes back the way it arrived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, Option<String>)>);

impl Params {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// Value of a parameter that carries one (`;branch=z9hG4bK..`)
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).flatten()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace the parameter in place, or append it.
    pub fn set(&mut self, name: &str, value: Option<String>) {
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Parse `a=1;b;c=3` (no leading separator)
    pub(crate) fn parse(input: &str, separator: char) -> Self {
        let mut params = Self::new();
        for part in input.split(separator) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((k, v)) => params.0.push((k.trim().to_string(), Some(v.trim().to_string()))),
                None => params.0.push((part.to_string(), None)),
            }
        }
        params
    }

    pub(crate) fn write(&self, f: &mut fmt::Formatter<'_>, lead: char, separator: char) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            let sep = if i == 0 { lead } else { separator };
            match v {
                Some(v) => write!(f, "{}{}={}", sep, k, v)?,
                None => write!(f, "{}{}", sep, k)?,
            }
        }
        Ok(())
    }
}

/// SIP URI: `scheme:[user[:password]@]host[:port][;params][?headers]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Host as written; IPv6 literals keep their brackets.
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
    pub headers: Params,
}

impl SipUri {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            scheme: "sip".to_string(),
            user: None,
            password: None,
            host: host.into(),
            port: None,
            params: Params::new(),
            headers: Params::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.params.set(name, value.map(str::to_string));
        self
    }

    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim();
        let invalid = || ParseError::InvalidUri(input.to_string());

        let (scheme, rest) = input.split_once(':').ok_or_else(invalid)?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') {
            return Err(invalid());
        }

        let (rest, headers) = match rest.split_once('?') {
            Some((r, h)) => (r, Params::parse(h, '&')),
            None => (rest, Params::new()),
        };

        let (userinfo, hostpart) = match rest.rfind('@') {
            Some(pos) => (Some(&rest[..pos]), &rest[pos + 1..]),
            None => (None, rest),
        };

        let (user, password) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((u, p)) => (Some(u.to_string()), Some(p.to_string())),
                None => (Some(info.to_string()), None),
            },
            None => (None, None),
        };

        let (hostport, params) = match hostpart.split_once(';') {
            Some((hp, p)) => (hp, Params::parse(p, ';')),
            None => (hostpart, Params::new()),
        };

        let (host, port) = split_host_port(hostport).ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            user,
            password,
            host: host.to_string(),
            port,
            params,
            headers,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("sips")
    }

    /// `transport` URI parameter, lowercased
    pub fn transport(&self) -> Option<String> {
        self.params.value("transport").map(|t| t.to_ascii_lowercase())
    }

    /// Host without IPv6 brackets
    pub fn host_unbracketed(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

/// Split `host[:port]`, honoring `[v6]:port`.
pub(crate) fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    let input = input.trim();
    if input.starts_with('[') {
        let end = input.find(']')?;
        let host = &input[..=end];
        let rest = &input[end + 1..];
        if rest.is_empty() {
            return Some((host, None));
        }
        let port = rest.strip_prefix(':')?.parse().ok()?;
        return Some((host, Some(port)));
    }
    match input.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((input, None)),
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}", user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            write!(f, "@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        self.params.write(f, ';', ';')?;
        self.headers.write(f, '?', '&')
    }
}

impl FromStr for SipUri {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri = SipUri::parse("sips:alice:pw@example.com:5061;transport=tcp;lr?subject=hi&x=y").unwrap();
        assert_eq!(uri.scheme, "sips");
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.password.as_deref(), Some("pw"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5061));
        assert_eq!(uri.transport().as_deref(), Some("tcp"));
        assert_eq!(uri.params.get("lr"), Some(None));
        assert_eq!(uri.headers.value("subject"), Some("hi"));
        assert!(uri.is_secure());
    }

    #[test]
    fn test_parse_ipv6_host() {
        let uri = SipUri::parse("sip:[2001:db8::1]:5070").unwrap();
        assert_eq!(uri.host, "[2001:db8::1]");
        assert_eq!(uri.host_unbracketed(), "2001:db8::1");
        assert_eq!(uri.port, Some(5070));
        assert_eq!(uri.to_string(), "sip:[2001:db8::1]:5070");
    }

    #[test]
    fn test_reject_garbage() {
        assert!(SipUri::parse("no-scheme-here").is_err());
        assert!(SipUri::parse("sip:host:notaport").is_err());
        assert!(SipUri::parse("sip:").is_err());
    }

    #[test]
    fn test_params_set_and_remove() {
        let mut params = Params::new();
        params.set("rport", None);
        params.set("branch", Some("z9hG4bK1".to_string()));
        params.set("RPORT", Some("5060".to_string()));
        assert_eq!(params.value("rport"), Some("5060"));
        params.remove("branch");
        assert!(!params.contains("branch"));
    }
}
