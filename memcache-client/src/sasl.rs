//! SASL authentication over the binary protocol.
//!
//! [`AuthSession`] is the sans-IO state machine for one connection:
//! it produces the initial response for `SASL_AUTH` and answers every
//! "continue" challenge the server sends back. [`negotiate`] drives it over
//! a live connection.
//!
//! ```text
//! Unauthenticated -> MechanismsRequested -> ChallengeIssued -> Authenticated
//!                                                          \-> Failed
//! ```

use hashring::md5::{Md5, md5, to_hex};
use protocol_memcache::binary::{BinaryRequest, Status};
use tracing::debug;

use crate::binary;
use crate::config::SaslMechanism;
use crate::connection::Connection;
use crate::error::{Error, Result};

/// Server challenges answered before the handshake is abandoned.
const MAX_ROUNDS: usize = 4;

/// `maxbuf` when a DIGEST-MD5 challenge does not name one.
const DEFAULT_MAXBUF: u32 = 65536;

/// Username and password for SASL.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Identity to act as (DIGEST-MD5 only).
    pub authzid: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            authzid: None,
        }
    }

    pub fn with_authzid(mut self, authzid: impl Into<String>) -> Self {
        self.authzid = Some(authzid.into());
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("authzid", &self.authzid)
            .finish()
    }
}

// -- Crypto helpers ----------------------------------------------------------

/// HMAC-MD5 (RFC 2104).
pub fn hmac_md5(key: &[u8], message: &[u8]) -> [u8; 16] {
    let mut block = [0u8; 64];
    if key.len() > block.len() {
        block[..16].copy_from_slice(&md5(key));
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Md5::new();
    inner.update(&block.map(|b| b ^ 0x36));
    inner.update(message);
    let inner = inner.finalize();

    let mut outer = Md5::new();
    outer.update(&block.map(|b| b ^ 0x5c));
    outer.update(&inner);
    outer.finalize()
}

/// CRAM-MD5 reply: `"<username> <hex hmac>"`.
pub fn cram_md5_response(username: &str, password: &str, challenge: &[u8]) -> String {
    format!(
        "{username} {}",
        to_hex(&hmac_md5(password.as_bytes(), challenge))
    )
}

/// A parsed DIGEST-MD5 challenge (RFC 2831 section 2.1.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realms: Vec<String>,
    pub nonce: String,
    pub qop: Option<String>,
    pub charset: Option<String>,
    pub algorithm: String,
    pub maxbuf: u32,
}

impl DigestChallenge {
    /// Parse the directive list; `None` if the challenge is invalid.
    ///
    /// `realm` may repeat, `opaque` and `domain` are ignored, and any other
    /// repeated directive invalidates the challenge.
    pub fn parse(text: &str) -> Option<Self> {
        let mut realms = Vec::new();
        let mut nonce = None;
        let mut qop = None;
        let mut charset = None;
        let mut algorithm = None;
        let mut maxbuf = None;

        let mut others: Vec<String> = Vec::new();

        for (name, value) in directives(text)? {
            let name = name.to_ascii_lowercase();
            let slot = match name.as_str() {
                "realm" => {
                    realms.push(value);
                    continue;
                }
                "opaque" | "domain" => continue,
                "nonce" => &mut nonce,
                "qop" => &mut qop,
                "charset" => &mut charset,
                "algorithm" => &mut algorithm,
                "maxbuf" => &mut maxbuf,
                _ => {
                    if others.contains(&name) {
                        return None;
                    }
                    others.push(name);
                    continue;
                }
            };
            if slot.replace(value).is_some() {
                return None;
            }
        }

        let maxbuf = match maxbuf {
            Some(raw) => raw.parse().ok()?,
            None => DEFAULT_MAXBUF,
        };
        Some(Self {
            realms,
            nonce: nonce?,
            qop,
            charset,
            algorithm: algorithm?,
            maxbuf,
        })
    }

    /// The realm used for the response: the first one offered.
    pub fn realm(&self) -> Option<&str> {
        self.realms.first().map(String::as_str)
    }
}

/// Split `name=value, name="quoted \"value\""` pairs.
fn directives(text: &str) -> Option<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut chars = text.chars().peekable();
    loop {
        while chars.next_if(|c| *c == ',' || c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            return Some(out);
        }

        let mut name = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=') {
            name.push(c);
        }
        chars.next()?; // '='
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            loop {
                match chars.next()? {
                    '\\' => value.push(chars.next()?),
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
            value.truncate(value.trim_end().len());
        }
        out.push((name.trim().to_string(), value));
    }
}

/// Hex `response` value for a DIGEST-MD5 exchange with `qop=auth`.
pub fn digest_md5_hash(
    credentials: &Credentials,
    realm: &str,
    nonce: &str,
    cnonce: &str,
    digest_uri: &str,
) -> String {
    let secret = md5(format!(
        "{}:{realm}:{}",
        credentials.username, credentials.password
    )
    .as_bytes());

    let mut a1 = Md5::new();
    a1.update(&secret);
    a1.update(format!(":{nonce}:{cnonce}").as_bytes());
    if let Some(authzid) = &credentials.authzid {
        a1.update(format!(":{authzid}").as_bytes());
    }
    let ha1 = to_hex(&a1.finalize());
    let ha2 = to_hex(&md5(format!("AUTHENTICATE:{digest_uri}").as_bytes()));

    to_hex(&md5(
        format!("{ha1}:{nonce}:00000001:{cnonce}:auth:{ha2}").as_bytes(),
    ))
}

/// Full DIGEST-MD5 reply for `host`.
pub fn digest_md5_response(
    credentials: &Credentials,
    challenge: &DigestChallenge,
    host: &str,
    cnonce: &str,
) -> String {
    let digest_uri = format!("memcached/{host}");
    let realm = challenge.realm();
    let hash = digest_md5_hash(
        credentials,
        realm.unwrap_or(""),
        &challenge.nonce,
        cnonce,
        &digest_uri,
    );

    let mut out = format!("username=\"{}\",", quote(&credentials.username));
    if let Some(realm) = realm {
        out.push_str(&format!("realm=\"{}\",", quote(realm)));
    }
    if let Some(authzid) = &credentials.authzid {
        out.push_str(&format!("authzid=\"{}\",", quote(authzid)));
    }
    out.push_str(&format!(
        "nonce=\"{}\",cnonce=\"{cnonce}\",nc=00000001,qop=auth,digest-uri=\"{digest_uri}\",response={hash},maxbuf={}",
        quote(&challenge.nonce),
        challenge.maxbuf
    ));
    out
}

fn quote(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

// -- Session -----------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    MechanismsRequested,
    ChallengeIssued,
    Authenticated,
    Failed,
}

/// Per-mechanism exchange progress.
#[derive(Debug, Clone)]
enum Exchange {
    Plain,
    Anonymous,
    Login,
    CramMd5,
    DigestMd5 { cnonce: String },
}

/// Authentication state of one connection.
#[derive(Debug, Clone)]
pub struct AuthSession {
    state: AuthState,
    mechanism: SaslMechanism,
    exchange: Exchange,
    rounds: usize,
}

impl AuthSession {
    pub fn new(mechanism: SaslMechanism) -> Self {
        let cnonce = to_hex(&rand::random::<[u8; 16]>());
        Self::with_cnonce(mechanism, cnonce)
    }

    /// Session with a fixed DIGEST-MD5 client nonce.
    pub fn with_cnonce(mechanism: SaslMechanism, cnonce: String) -> Self {
        let exchange = match mechanism {
            SaslMechanism::Plain => Exchange::Plain,
            SaslMechanism::Anonymous => Exchange::Anonymous,
            SaslMechanism::Login => Exchange::Login,
            SaslMechanism::CramMd5 => Exchange::CramMd5,
            SaslMechanism::DigestMd5 => Exchange::DigestMd5 { cnonce },
        };
        Self {
            state: AuthState::Unauthenticated,
            mechanism,
            exchange,
            rounds: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> AuthState {
        self.state
    }

    #[inline]
    pub fn mechanism(&self) -> SaslMechanism {
        self.mechanism
    }

    /// Record that the mechanism list is being fetched.
    pub fn request_mechanisms(&mut self) {
        self.state = AuthState::MechanismsRequested;
    }

    /// Check the configured mechanism against what the server offers.
    pub fn select(&mut self, offered: &[String]) -> Result<()> {
        let name = self.mechanism.as_str();
        if offered.iter().any(|m| m.eq_ignore_ascii_case(name)) {
            Ok(())
        } else {
            self.state = AuthState::Failed;
            Err(Error::Configuration(format!(
                "server does not offer SASL mechanism {name} (offers: {})",
                offered.join(" ")
            )))
        }
    }

    /// Payload for the `SASL_AUTH` frame.
    pub fn initial(&mut self, credentials: &Credentials) -> Vec<u8> {
        self.state = AuthState::ChallengeIssued;
        match self.exchange {
            Exchange::Plain => {
                let mut out = Vec::with_capacity(
                    2 + credentials.username.len() + credentials.password.len(),
                );
                out.push(0);
                out.extend_from_slice(credentials.username.as_bytes());
                out.push(0);
                out.extend_from_slice(credentials.password.as_bytes());
                out
            }
            Exchange::Anonymous | Exchange::Login => credentials.username.as_bytes().to_vec(),
            Exchange::CramMd5 | Exchange::DigestMd5 { .. } => Vec::new(),
        }
    }

    /// Process a reply to `SASL_AUTH` or `SASL_STEP`.
    ///
    /// Returns the payload for the next `SASL_STEP`, or `None` once the
    /// server accepted the credentials.
    pub fn on_reply(
        &mut self,
        credentials: &Credentials,
        host: &str,
        status: Status,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        match status {
            Status::NoError => {
                self.state = AuthState::Authenticated;
                return Ok(None);
            }
            Status::AuthContinue => {}
            other => {
                self.state = AuthState::Failed;
                let message = String::from_utf8_lossy(payload);
                return Err(Error::AuthenticationFailed(if message.is_empty() {
                    other.as_str().to_string()
                } else {
                    message.into_owned()
                }));
            }
        }

        self.rounds += 1;
        if self.rounds > MAX_ROUNDS {
            return Err(self.fail("too many SASL rounds"));
        }

        let round = self.rounds;
        let next = match &self.exchange {
            Exchange::Login if round == 1 => Ok(credentials.password.as_bytes().to_vec()),
            Exchange::CramMd5 if round == 1 => Ok(cram_md5_response(
                &credentials.username,
                &credentials.password,
                payload,
            )
            .into_bytes()),
            Exchange::DigestMd5 { cnonce } if round == 1 => {
                match DigestChallenge::parse(&String::from_utf8_lossy(payload)) {
                    Some(challenge) => {
                        Ok(digest_md5_response(credentials, &challenge, host, cnonce).into_bytes())
                    }
                    None => Err("invalid DIGEST-MD5 challenge".to_string()),
                }
            }
            // rspauth from the server; an empty frame completes the exchange
            Exchange::DigestMd5 { .. } if round == 2 => Ok(Vec::new()),
            _ => Err(format!(
                "unexpected SASL continue for {}",
                self.mechanism.as_str()
            )),
        };
        next.map(Some).map_err(|reason| self.fail(&reason))
    }

    fn fail(&mut self, reason: &str) -> Error {
        self.state = AuthState::Failed;
        Error::AuthenticationFailed(reason.to_string())
    }
}

// -- Negotiation -------------------------------------------------------------

/// Run the handshake for `session` on a fresh binary connection.
///
/// `mechanisms` caches the server's mechanism list across reconnects. Any
/// failure leaves the session `Failed`.
pub(crate) fn negotiate(
    conn: &mut Connection,
    session: &mut AuthSession,
    mechanisms: &mut Option<Vec<String>>,
    credentials: &Credentials,
    host: &str,
) -> Result<()> {
    let outcome = exchange(conn, session, mechanisms, credentials, host);
    if outcome.is_err() {
        session.state = AuthState::Failed;
    }
    outcome
}

fn exchange(
    conn: &mut Connection,
    session: &mut AuthSession,
    mechanisms: &mut Option<Vec<String>>,
    credentials: &Credentials,
    host: &str,
) -> Result<()> {
    session.request_mechanisms();
    if mechanisms.is_none() {
        binary::send(conn, &BinaryRequest::sasl_list_mechs())?;
        let frame = binary::read(conn)?;
        frame.check().map_err(|e| match e {
            Error::AuthenticationFailed(_) => e,
            other => Error::AuthenticationFailed(format!("listing SASL mechanisms: {other}")),
        })?;
        let list: Vec<String> = String::from_utf8_lossy(&frame.value)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        debug!(peer = %conn.peer(), mechanisms = ?list, "sasl mechanisms");
        *mechanisms = Some(list);
    }
    session.select(mechanisms.as_deref().unwrap_or_default())?;

    let mechanism = session.mechanism().as_str().as_bytes();
    let payload = session.initial(credentials);
    binary::send(conn, &BinaryRequest::sasl_auth(mechanism, &payload))?;
    debug!(peer = %conn.peer(), mechanism = session.mechanism().as_str(), "sasl auth sent");

    loop {
        let frame = binary::read(conn)?;
        match session.on_reply(credentials, host, frame.status, &frame.value)? {
            None => {
                debug!(peer = %conn.peer(), "sasl authenticated");
                return Ok(());
            }
            Some(step) => {
                debug!(peer = %conn.peer(), "sasl step");
                binary::send(conn, &BinaryRequest::sasl_step(mechanism, &step))?;
            }
        }
    }
}
