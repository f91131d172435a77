//! SIP Digest Authentication (RFC 2617, RFC 3261)
//!
//! Client side: [`DigestContext`] answers 401/407 challenges and checks
//! `Authentication-Info`. Server side: [`DigestAuth`] issues stateless,
//! timestamped nonces and verifies credentials against a user table.

use super::headers::AuthHeader;
use super::message::{SipError, SipRequest, SipResponse};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

fn md5_hex(input: impl AsRef<[u8]>) -> String {
    format!("{:x}", md5::compute(input))
}

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    let random: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();
    hex::encode(random)
}

fn is_md5_sess(algorithm: Option<&str>) -> bool {
    algorithm.map_or(false, |a| a.eq_ignore_ascii_case("md5-sess"))
}

/// `MD5(user:realm:password)`
pub fn calculate_user_realm_password_hash(user: &str, realm: &str, password: &str) -> String {
    md5_hex(format!("{}:{}:{}", user, realm, password))
}

/// HA1 from the `user:realm:password` hash; `md5-sess` folds in nonce and cnonce
pub fn calculate_ha1(user_hash: &str, algorithm: Option<&str>, nonce: &str, cnonce: &str) -> String {
    if is_md5_sess(algorithm) {
        md5_hex(format!("{}:{}:{}", user_hash, nonce, cnonce))
    } else {
        user_hash.to_string()
    }
}

/// Request digest for `qop=auth`, `qop=auth-int` (hashes `body`) or legacy RFC 2069
#[allow(clippy::too_many_arguments)]
pub fn calculate_digest(
    ha1: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: Option<&str>,
    body: &[u8],
) -> String {
    match qop {
        Some(qop) if qop.eq_ignore_ascii_case("auth-int") => {
            let ha2 = md5_hex(format!("{}:{}:{}", method, uri, md5_hex(body)));
            md5_hex(format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
        }
        Some(qop) => {
            let ha2 = md5_hex(format!("{}:{}", method, uri));
            md5_hex(format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
        }
        None => {
            let ha2 = md5_hex(format!("{}:{}", method, uri));
            md5_hex(format!("{}:{}:{}", ha1, nonce, ha2))
        }
    }
}

/// User credentials for authentication
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    password: Option<String>,
    /// Precomputed `MD5(user:realm:password)`
    hash: Option<String>,
}

impl Credentials {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            password: Some(password.to_string()),
            hash: None,
        }
    }

    /// Credentials holding only the `user:realm:password` hash
    pub fn with_hash(user: &str, hash: &str) -> Self {
        Self {
            user: user.to_string(),
            password: None,
            hash: Some(hash.to_string()),
        }
    }

    pub fn user_hash(&self, realm: &str) -> String {
        match &self.hash {
            Some(hash) => hash.clone(),
            None => calculate_user_realm_password_hash(&self.user, realm, self.password.as_deref().unwrap_or("")),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("user", &self.user).finish_non_exhaustive()
    }
}

/// Client-side digest state for one realm
#[derive(Debug, Clone)]
pub struct DigestContext {
    pub realm: Option<String>,
    pub nonce: Option<String>,
    pub cnonce: String,
    pub nc: u32,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    /// Challenge came as 407, answer with Proxy-Authorization
    pub proxy: bool,
    pub user: Option<String>,
    /// Request-URI of the last signed request
    pub uri: Option<String>,
    /// Acceptable qop values, most preferred first
    pub qop_preference: Vec<String>,
    ha1: Option<String>,
}

impl Default for DigestContext {
    fn default() -> Self {
        Self {
            realm: None,
            nonce: None,
            cnonce: String::new(),
            nc: 0,
            algorithm: None,
            qop: None,
            opaque: None,
            proxy: false,
            user: None,
            uri: None,
            qop_preference: vec!["auth".to_string(), "auth-int".to_string()],
            ha1: None,
        }
    }
}

impl DigestContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_challenge(&mut self, response: &SipResponse, credentials: &Credentials) -> Result<(), SipError> {
        self.proxy = response.status == 407;
        let offered = if self.proxy {
            &response.headers.proxy_authenticate
        } else {
            &response.headers.www_authenticate
        };

        let mut digests = offered.iter().filter(|c| c.scheme.eq_ignore_ascii_case("digest"));
        let challenge = match &self.realm {
            Some(realm) => offered
                .iter()
                .filter(|c| c.scheme.eq_ignore_ascii_case("digest"))
                .find(|c| c.get("realm") == Some(realm.as_str()))
                .or_else(|| digests.next()),
            None => digests.next(),
        }
        .ok_or_else(|| SipError::Authentication(format!("{} carries no Digest challenge", response.status)))?;

        let realm = challenge
            .get("realm")
            .ok_or_else(|| SipError::Authentication("challenge without realm".to_string()))?
            .to_string();
        let nonce = challenge
            .get("nonce")
            .ok_or_else(|| SipError::Authentication("challenge without nonce".to_string()))?
            .to_string();

        self.qop = match challenge.get("qop") {
            Some(offered) => {
                let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
                let chosen = self
                    .qop_preference
                    .iter()
                    .find(|p| offered.iter().any(|o| o.eq_ignore_ascii_case(p)))
                    .ok_or_else(|| {
                        SipError::Authentication(format!("no acceptable qop in {:?}", offered))
                    })?;
                Some(chosen.clone())
            }
            None => None,
        };

        self.algorithm = challenge.get("algorithm").map(str::to_string);
        self.opaque = challenge.get("opaque").map(str::to_string);
        self.cnonce = random_hex(8);
        self.nc = 0;
        self.user = Some(credentials.user.clone());
        self.ha1 = Some(calculate_ha1(
            &credentials.user_hash(&realm),
            self.algorithm.as_deref(),
            &nonce,
            &self.cnonce,
        ));
        debug!("Digest challenge from realm {} (qop {:?})", realm, self.qop);
        self.realm = Some(realm);
        self.nonce = Some(nonce);
        Ok(())
    }

    /// Add credentials to `request`, first absorbing a 401/407 challenge if given.
    ///
    /// Credentials already on the request for the same realm are replaced.
    pub fn sign_request(
        &mut self,
        request: &mut SipRequest,
        challenge: Option<(&SipResponse, &Credentials)>,
    ) -> Result<(), SipError> {
        if let Some((response, credentials)) = challenge {
            self.take_challenge(response, credentials)?;
        }

        let (Some(ha1), Some(realm), Some(nonce), Some(user)) = (&self.ha1, &self.realm, &self.nonce, &self.user)
        else {
            return Err(SipError::Authentication("no challenge to answer".to_string()));
        };

        self.nc += 1;
        let nc = format!("{:08x}", self.nc);
        let uri = request.uri.to_string();
        let digest = calculate_digest(
            ha1,
            request.method.as_str(),
            &uri,
            nonce,
            &nc,
            &self.cnonce,
            self.qop.as_deref(),
            &request.body,
        );

        let mut header = AuthHeader::digest()
            .quoted("username", user.as_str())
            .quoted("realm", realm.as_str())
            .quoted("nonce", nonce.as_str())
            .quoted("uri", uri.as_str())
            .quoted("response", digest);
        if let Some(algorithm) = &self.algorithm {
            header = header.token("algorithm", algorithm.as_str());
        }
        if let Some(qop) = &self.qop {
            header = header
                .token("qop", qop.as_str())
                .token("nc", nc)
                .quoted("cnonce", self.cnonce.as_str());
        }
        if let Some(opaque) = &self.opaque {
            header = header.quoted("opaque", opaque.as_str());
        }

        let realm = realm.clone();
        let slot = if self.proxy {
            &mut request.headers.proxy_authorization
        } else {
            &mut request.headers.authorization
        };
        slot.retain(|h| h.get("realm") != Some(realm.as_str()));
        slot.push(header);
        self.uri = Some(uri);
        Ok(())
    }

    /// Check `rspauth` in a response's Authentication-Info.
    ///
    /// `None` when there is nothing to check. A matching (or absent) rspauth
    /// with a `nextnonce` rotates the nonce and resets the count.
    pub fn authenticate_response(&mut self, response: &SipResponse) -> Option<bool> {
        let info = if self.proxy {
            response.headers.proxy_authentication_info.as_ref()
        } else {
            response.headers.authentication_info.as_ref()
        }?;

        let verified = match info.get("rspauth") {
            Some(rspauth) => {
                let (ha1, nonce, uri) = (self.ha1.as_ref()?, self.nonce.as_ref()?, self.uri.as_ref()?);
                let nc = info
                    .get("nc")
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{:08x}", self.nc));
                let cnonce = info.get("cnonce").unwrap_or(self.cnonce.as_str());
                let qop = info.get("qop").or(self.qop.as_deref());
                let expected = calculate_digest(ha1, "", uri, nonce, &nc, cnonce, qop, &response.body);
                let ok = expected == rspauth;
                if !ok {
                    warn!("rspauth mismatch in {} response", response.status);
                }
                ok
            }
            None => true,
        };

        if verified {
            if let Some(next) = info.get("nextnonce") {
                debug!("Rotating to nextnonce");
                self.nonce = Some(next.to_string());
                self.nc = 0;
            }
        }
        Some(verified)
    }
}

/// Stateless nonce: `base64("<rfc3339 ms timestamp> <md5(timestamp:tag)>")`
pub fn generate_nonce(tag: &str, timestamp: DateTime<Utc>) -> String {
    let ts = timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    let hash = md5_hex(format!("{}:{}", ts, tag));
    STANDARD.encode(format!("{} {}", ts, hash))
}

/// Timestamp of a nonce minted with `tag`, or `None` if it was not
pub fn extract_nonce_timestamp(nonce: &str, tag: &str) -> Option<DateTime<Utc>> {
    let decoded = String::from_utf8(STANDARD.decode(nonce).ok()?).ok()?;
    let (ts, hash) = decoded.split_once(' ')?;
    if md5_hex(format!("{}:{}", ts, tag)) != hash {
        return None;
    }
    DateTime::parse_from_rfc3339(ts).ok().map(|t| t.with_timezone(&Utc))
}

/// Digest authentication manager (registrar side)
pub struct DigestAuth {
    realm: String,
    tag: String,
    opaque: String,
    nonce_ttl: Duration,
    users: Arc<RwLock<HashMap<String, Credentials>>>,
    nonce_counts: Arc<RwLock<HashMap<String, u32>>>,
}

impl DigestAuth {
    /// Create a new digest authentication manager
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            tag: random_hex(16),
            opaque: random_hex(8),
            nonce_ttl: Duration::from_secs(300),
            users: Arc::new(RwLock::new(HashMap::new())),
            nonce_counts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_nonce_ttl(mut self, ttl: Duration) -> Self {
        self.nonce_ttl = ttl;
        self
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Add a user
    pub async fn add_user(&self, username: &str, password: &str) {
        self.add_credentials(Credentials::new(username, password)).await;
    }

    pub async fn add_credentials(&self, credentials: Credentials) {
        info!("Added user: {}", credentials.user);
        self.users.write().await.insert(credentials.user.clone(), credentials);
    }

    pub fn generate_nonce(&self) -> String {
        generate_nonce(&self.tag, Utc::now())
    }

    /// Attach a fresh challenge to a 401 (or 407 when `proxy`)
    pub fn challenge(&self, response: &mut SipResponse, proxy: bool) {
        let header = AuthHeader::digest()
            .quoted("realm", self.realm.as_str())
            .quoted("nonce", self.generate_nonce())
            .quoted("qop", "auth,auth-int")
            .token("algorithm", "md5")
            .quoted("opaque", self.opaque.as_str());
        debug!("Created auth challenge for realm {}", self.realm);
        if proxy {
            response.headers.proxy_authenticate.push(header);
        } else {
            response.headers.www_authenticate.push(header);
        }
    }

    fn credentials_for<'a>(&self, request: &'a SipRequest) -> Option<&'a AuthHeader> {
        request
            .headers
            .authorization
            .iter()
            .chain(request.headers.proxy_authorization.iter())
            .find(|h| h.get("realm") == Some(self.realm.as_str()))
    }

    async fn ha1_for(&self, auth: &AuthHeader, user: &str, nonce: &str) -> Result<String, SipError> {
        let users = self.users.read().await;
        let credentials = users.get(user).ok_or_else(|| {
            warn!("Authentication failed: unknown user {}", user);
            SipError::Authentication(format!("Unknown user: {}", user))
        })?;
        Ok(calculate_ha1(
            &credentials.user_hash(&self.realm),
            auth.get("algorithm"),
            nonce,
            auth.get("cnonce").unwrap_or(""),
        ))
    }

    /// Verify the request's credentials for this realm; returns the user name
    pub async fn authenticate_request(&self, request: &SipRequest) -> Result<String, SipError> {
        let auth = self
            .credentials_for(request)
            .ok_or_else(|| SipError::Authentication(format!("No credentials for realm {}", self.realm)))?;
        let field = |name: &str| {
            auth.get(name)
                .ok_or_else(|| SipError::Authentication(format!("Missing {} in Authorization", name)))
        };
        let user = field("username")?;
        let nonce = field("nonce")?;
        let uri = field("uri")?;
        let response = field("response")?;

        let issued = extract_nonce_timestamp(nonce, &self.tag)
            .ok_or_else(|| SipError::Authentication("Invalid nonce".to_string()))?;
        let age = Utc::now().signed_duration_since(issued);
        if age.num_milliseconds() < 0 || age.num_milliseconds() as u128 > self.nonce_ttl.as_millis() {
            return Err(SipError::Authentication("Nonce expired".to_string()));
        }

        let qop = auth.get("qop");
        let nc = auth.get("nc").unwrap_or("");
        if qop.is_some() {
            let count = u32::from_str_radix(nc, 16)
                .map_err(|_| SipError::Authentication(format!("Bad nonce count: {}", nc)))?;
            let mut counts = self.nonce_counts.write().await;
            let last = counts.entry(nonce.to_string()).or_insert(0);
            if count <= *last {
                return Err(SipError::Authentication("Replayed nonce count".to_string()));
            }
            *last = count;
        }

        let ha1 = self.ha1_for(auth, user, nonce).await?;
        let expected = calculate_digest(
            &ha1,
            request.method.as_str(),
            uri,
            nonce,
            nc,
            auth.get("cnonce").unwrap_or(""),
            qop,
            &request.body,
        );
        if expected != response {
            warn!("Authentication failed for user {}: response mismatch", user);
            return Err(SipError::Authentication("Invalid credentials".to_string()));
        }

        info!("Authentication successful for user: {}", user);
        Ok(user.to_string())
    }

    /// Add `Authentication-Info` with `rspauth` to a response for an authenticated request
    pub async fn sign_response(&self, request: &SipRequest, response: &mut SipResponse) -> Result<(), SipError> {
        let auth = self
            .credentials_for(request)
            .ok_or_else(|| SipError::Authentication("request carries no credentials".to_string()))?;
        let user = auth.get("username").unwrap_or("");
        let nonce = auth.get("nonce").unwrap_or("");
        let nc = auth.get("nc").unwrap_or("");
        let cnonce = auth.get("cnonce").unwrap_or("");
        let qop = auth.get("qop");

        let ha1 = self.ha1_for(auth, user, nonce).await?;
        let rspauth = calculate_digest(&ha1, "", auth.get("uri").unwrap_or(""), nonce, nc, cnonce, qop, &response.body);

        let mut info = AuthHeader::info().quoted("rspauth", rspauth);
        if let Some(qop) = qop {
            info = info.token("qop", qop).quoted("cnonce", cnonce).token("nc", nc);
        }
        response.headers.authentication_info = Some(info);
        Ok(())
    }

    /// Forget nonce counts for nonces that have aged out
    pub async fn cleanup_nonces(&self) {
        let ttl = self.nonce_ttl;
        let tag = self.tag.clone();
        self.nonce_counts.write().await.retain(|nonce, _| {
            extract_nonce_timestamp(nonce, &tag)
                .map_or(false, |t| Utc::now().signed_duration_since(t).num_milliseconds() as u128 <= ttl.as_millis())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipMethod;
    use crate::infrastructure::protocols::sip::uri::SipUri;

    fn register() -> SipRequest {
        SipRequest::new(SipMethod::Register, SipUri::new("pbx.example.com"))
    }

    fn challenge(params: &[(&str, &str)]) -> SipResponse {
        let mut response = SipResponse::new(401, "Unauthorized");
        let mut header = AuthHeader::digest();
        for (name, value) in params {
            header = header.quoted(name, *value);
        }
        response.headers.www_authenticate.push(header);
        response
    }

    #[test]
    fn test_rfc2617_vector() {
        let user_hash = calculate_user_realm_password_hash("Mufasa", "testrealm@host.com", "Circle Of Life");
        assert_eq!(user_hash, "939e7578ed9e3c518a452acee763bce9");
        let digest = calculate_digest(
            &user_hash,
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "00000001",
            "0a4f113b",
            Some("auth"),
            b"",
        );
        assert_eq!(digest, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_md5_sess_and_auth_int() {
        let hash = calculate_user_realm_password_hash("u", "r", "p");
        assert_eq!(calculate_ha1(&hash, Some("MD5"), "n", "c"), hash);
        assert_eq!(calculate_ha1(&hash, Some("MD5-sess"), "n", "c"), md5_hex(format!("{}:n:c", hash)));

        let ha2 = md5_hex(format!("INVITE:sip:x:{}", md5_hex(b"body")));
        let expected = md5_hex(format!("{}:n:00000001:c:auth-int:{}", hash, ha2));
        assert_eq!(
            calculate_digest(&hash, "INVITE", "sip:x", "n", "00000001", "c", Some("auth-int"), b"body"),
            expected
        );
    }

    #[test]
    fn test_sign_legacy_challenge() {
        let credentials = Credentials::new("door", "secret");
        let mut ctx = DigestContext::new();
        let mut req = register();
        ctx.sign_request(&mut req, Some((&challenge(&[("realm", "test"), ("nonce", "abc123")]), &credentials)))
            .unwrap();

        let auth = &req.headers.authorization[0];
        assert_eq!(auth.get("realm"), Some("test"));
        assert_eq!(auth.get("nonce"), Some("abc123"));
        assert_eq!(auth.get("qop"), None);
        let ha1 = calculate_user_realm_password_hash("door", "test", "secret");
        let expected = calculate_digest(&ha1, "REGISTER", "sip:pbx.example.com", "abc123", "", "", None, b"");
        assert_eq!(auth.get("response"), Some(expected.as_str()));
    }

    #[test]
    fn test_qop_preference_intersection() {
        let credentials = Credentials::new("door", "secret");
        let mut ctx = DigestContext::new();
        let mut req = register();
        let resp = challenge(&[("realm", "r"), ("nonce", "n"), ("qop", "auth-int, auth")]);
        ctx.sign_request(&mut req, Some((&resp, &credentials))).unwrap();
        assert_eq!(ctx.qop.as_deref(), Some("auth"));
        assert_eq!(req.headers.authorization[0].get("nc"), Some("00000001"));

        let mut ctx = DigestContext::new();
        let resp = challenge(&[("realm", "r"), ("nonce", "n"), ("qop", "token-x")]);
        assert!(ctx.sign_request(&mut register(), Some((&resp, &credentials))).is_err());
    }

    #[test]
    fn test_resign_replaces_same_realm() {
        let credentials = Credentials::new("door", "secret");
        let mut ctx = DigestContext::new();
        let mut req = register();
        let resp = challenge(&[("realm", "r"), ("nonce", "n1"), ("qop", "auth")]);
        ctx.sign_request(&mut req, Some((&resp, &credentials))).unwrap();
        let resp = challenge(&[("realm", "r"), ("nonce", "n2"), ("qop", "auth")]);
        ctx.sign_request(&mut req, Some((&resp, &credentials))).unwrap();

        assert_eq!(req.headers.authorization.len(), 1);
        assert_eq!(req.headers.authorization[0].get("nonce"), Some("n2"));
    }

    #[test]
    fn test_proxy_challenge() {
        let credentials = Credentials::with_hash("door", &calculate_user_realm_password_hash("door", "p", "pw"));
        let mut resp = SipResponse::new(407, "Proxy Authentication Required");
        resp.headers
            .proxy_authenticate
            .push(AuthHeader::digest().quoted("realm", "p").quoted("nonce", "x"));
        let mut ctx = DigestContext::new();
        let mut req = register();
        ctx.sign_request(&mut req, Some((&resp, &credentials))).unwrap();
        assert!(req.headers.authorization.is_empty());
        assert_eq!(req.headers.proxy_authorization.len(), 1);
    }

    #[test]
    fn test_sign_without_challenge_fails() {
        assert!(DigestContext::new().sign_request(&mut register(), None).is_err());
    }

    #[test]
    fn test_nonce_round_trip() {
        let now = Utc::now();
        let nonce = generate_nonce("tag", now);
        let ts = extract_nonce_timestamp(&nonce, "tag").unwrap();
        assert_eq!(ts.timestamp_millis(), now.timestamp_millis());
        assert!(extract_nonce_timestamp(&nonce, "other").is_none());
        assert!(extract_nonce_timestamp("garbage", "tag").is_none());
    }

    #[tokio::test]
    async fn test_server_round_trip_with_rspauth() {
        let server = DigestAuth::new("door.local");
        server.add_user("alice", "secret123").await;

        let mut unauthorized = SipResponse::new(401, "Unauthorized");
        server.challenge(&mut unauthorized, false);

        let mut ctx = DigestContext::new();
        let mut req = register();
        ctx.sign_request(&mut req, Some((&unauthorized, &Credentials::new("alice", "secret123"))))
            .unwrap();
        assert_eq!(ctx.qop.as_deref(), Some("auth"));
        assert_eq!(server.authenticate_request(&req).await.unwrap(), "alice");

        // same nc again is a replay
        assert!(server.authenticate_request(&req).await.is_err());

        let mut ok = SipResponse::new(200, "OK");
        server.sign_response(&req, &mut ok).await.unwrap();
        assert_eq!(ctx.authenticate_response(&ok), Some(true));
    }

    #[tokio::test]
    async fn test_server_rejects_bad_password_and_foreign_nonce() {
        let server = DigestAuth::new("door.local");
        server.add_user("alice", "secret123").await;
        let mut unauthorized = SipResponse::new(401, "Unauthorized");
        server.challenge(&mut unauthorized, false);

        let mut ctx = DigestContext::new();
        let mut req = register();
        ctx.sign_request(&mut req, Some((&unauthorized, &Credentials::new("alice", "wrong"))))
            .unwrap();
        assert!(server.authenticate_request(&req).await.is_err());

        let other = DigestAuth::new("door.local");
        other.add_user("alice", "secret123").await;
        let mut ctx = DigestContext::new();
        let mut req = register();
        ctx.sign_request(&mut req, Some((&unauthorized, &Credentials::new("alice", "secret123"))))
            .unwrap();
        assert!(other.authenticate_request(&req).await.is_err());
    }

    #[test]
    fn test_nextnonce_rotation() {
        let credentials = Credentials::new("door", "secret");
        let mut ctx = DigestContext::new();
        let resp = challenge(&[("realm", "r"), ("nonce", "n1"), ("qop", "auth")]);
        ctx.sign_request(&mut register(), Some((&resp, &credentials))).unwrap();

        let mut ok = SipResponse::new(200, "OK");
        ok.headers.authentication_info = Some(AuthHeader::info().quoted("nextnonce", "n2"));
        assert_eq!(ctx.authenticate_response(&ok), Some(true));
        assert_eq!(ctx.nonce.as_deref(), Some("n2"));
        assert_eq!(ctx.nc, 0);

        let mut bad = SipResponse::new(200, "OK");
        bad.headers.authentication_info = Some(AuthHeader::info().quoted("rspauth", "00").quoted("nextnonce", "n3"));
        assert_eq!(ctx.authenticate_response(&bad), Some(false));
        assert_eq!(ctx.nonce.as_deref(), Some("n2"));

        assert_eq!(ctx.authenticate_response(&SipResponse::new(200, "OK")), None);
    }
}
