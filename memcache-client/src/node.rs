//! One server in the pool and its lazily opened connection.

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{Config, Protocol};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::sasl::{self, AuthSession, AuthState, Credentials};

/// Connection settings shared by every node of a client.
#[derive(Clone, Copy)]
pub(crate) struct ConnectOpts<'a> {
    pub config: &'a Config,
    pub credentials: Option<&'a Credentials>,
}

impl ConnectOpts<'_> {
    /// SASL runs only on binary connections with both credentials and a
    /// mechanism configured.
    fn auth(&self) -> Option<(&Credentials, crate::config::SaslMechanism)> {
        match (self.config.protocol, self.credentials, self.config.sasl_mechanism) {
            (Protocol::Binary, Some(credentials), Some(mechanism)) => Some((credentials, mechanism)),
            _ => None,
        }
    }
}

#[derive(Default)]
struct NodeState {
    conn: Option<Connection>,
    session: Option<AuthSession>,
    /// Mechanisms the server offered, kept across reconnects.
    mechanisms: Option<Vec<String>>,
}

pub(crate) struct Node {
    identity: String,
    host: String,
    port: u16,
    weight: u32,
    state: Mutex<NodeState>,
}

impl Node {
    pub fn new(host: &str, port: u16, weight: u32) -> Self {
        let weight = weight.max(1);
        Self {
            identity: Self::identity_of(host, port, weight),
            host: host.to_string(),
            port,
            weight,
            state: Mutex::new(NodeState::default()),
        }
    }

    /// `"host:port:weight"`, with the weight clamped to at least 1.
    pub fn identity_of(host: &str, port: u16, weight: u32) -> String {
        format!("{host}:{port}:{}", weight.max(1))
    }

    #[inline]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// `"host:port"`, the key used for per-server reports.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Run `f` on this node's connection, connecting and authenticating first
    /// if needed. A transport or protocol failure drops the connection so the
    /// next call reconnects.
    pub fn with_conn<T>(
        &self,
        opts: &ConnectOpts<'_>,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.conn.is_none() {
            let mut conn = Connection::connect(&self.host, self.port, opts.config)?;
            state.session = None;
            if let Some((credentials, mechanism)) = opts.auth() {
                let mut session = AuthSession::new(mechanism);
                let outcome = sasl::negotiate(
                    &mut conn,
                    &mut session,
                    &mut state.mechanisms,
                    credentials,
                    &self.host,
                );
                if let Err(e) = outcome {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    state.conn = Some(conn);
                    state.session = Some(session);
                    return Err(e);
                }
                state.session = Some(session);
            }
            state.conn = Some(conn);
        }

        // Data commands only run once the handshake has completed.
        if let Some(session) = &state.session {
            if session.state() != AuthState::Authenticated {
                return Err(Error::AuthenticationFailed(format!(
                    "{} authentication failed earlier on this connection",
                    session.mechanism().as_str()
                )));
            }
        }

        let Some(conn) = state.conn.as_mut() else {
            return Err(Error::Connection(format!("{}: not connected", self.address())));
        };
        let result = f(conn);
        if let Err(e) = &result {
            if e.is_fatal() {
                debug!(peer = %self.address(), error = %e, "dropping connection");
                state.conn = None;
                state.session = None;
            }
        }
        result
    }

    /// Open a short-lived ASCII connection regardless of the configured
    /// protocol, for commands only the text protocol has.
    pub fn side_channel(&self, config: &Config) -> Result<Connection> {
        Connection::connect_with(&self.host, self.port, config, Protocol::Ascii)
    }

    /// Drop the connection without telling the server.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.conn.take().is_some() {
            debug!(peer = %self.address(), "connection reset");
        }
        state.session = None;
    }

    /// Send `quit` and drop the connection.
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.session = None;
        if let Some(conn) = state.conn.take() {
            conn.quit();
        }
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.state.lock().conn.is_some()
    }
}
