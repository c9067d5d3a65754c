//! Client configuration.
//!
//! [`Config`] holds every tunable with its default; [`ConfigBuilder`] is the
//! construction-time surface and [`ClientOption`] the runtime one, applied
//! through `ShardedClient::set_option`.

use std::time::Duration;

use hashring::{Distribution, HashKind};

use crate::error::{Error, Result};

/// Longest accepted key prefix.
pub const MAX_PREFIX_LEN: usize = 128;

/// Wire protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Ascii,
    Binary,
}

/// Compression algorithm for large values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    /// LZ4 block format with a prepended size (lz4_flex).
    #[default]
    Lz4,
    /// Zstandard; requires the `zstd` feature.
    Zstd,
}

/// Serializer for arrays and objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializerKind {
    /// bincode.
    #[default]
    Native,
    Json,
    /// MessagePack; requires the `msgpack` feature.
    Msgpack,
}

/// SASL mechanisms understood by the binary protocol driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    Anonymous,
    Login,
    CramMd5,
    DigestMd5,
}

impl SaslMechanism {
    /// The IANA mechanism name sent on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::Anonymous => "ANONYMOUS",
            SaslMechanism::Login => "LOGIN",
            SaslMechanism::CramMd5 => "CRAM-MD5",
            SaslMechanism::DigestMd5 => "DIGEST-MD5",
        }
    }
}

/// Main configuration for a [`ShardedClient`](crate::ShardedClient).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Protocol
    // -------------------------------------------------------------------------
    pub protocol: Protocol,

    /// Prepended to every key on the wire and stripped from enumerated keys.
    pub prefix_key: String,

    // -------------------------------------------------------------------------
    // Value encoding
    // -------------------------------------------------------------------------
    pub compression: bool,
    pub compression_type: CompressionType,

    /// Compressed form is kept only if `original > compressed * factor`.
    pub compression_factor: f64,

    /// Strings longer than this many bytes are offered to the compressor.
    pub compression_threshold: usize,

    pub serializer: SerializerKind,

    // -------------------------------------------------------------------------
    // Routing
    // -------------------------------------------------------------------------
    pub hash: HashKind,
    pub distribution: Distribution,

    // -------------------------------------------------------------------------
    // Network
    // -------------------------------------------------------------------------
    /// SASL mechanism used when credentials are set (binary only).
    pub sasl_mechanism: Option<SaslMechanism>,

    pub tcp_nodelay: bool,

    /// Connect timeout in milliseconds. 0 means no timeout.
    pub connect_timeout_ms: u64,

    /// Per-syscall write timeout in milliseconds. 0 means no timeout.
    pub send_timeout_ms: u64,

    /// Per-syscall read timeout in milliseconds. 0 means no timeout.
    pub recv_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: Protocol::Ascii,
            prefix_key: String::new(),
            compression: true,
            compression_type: CompressionType::Lz4,
            compression_factor: 1.3,
            compression_threshold: 2000,
            serializer: SerializerKind::Native,
            hash: HashKind::OneAtATime,
            distribution: Distribution::Consistent,
            sasl_mechanism: None,
            tcp_nodelay: false,
            connect_timeout_ms: 1000,
            send_timeout_ms: 0,
            recv_timeout_ms: 0,
        }
    }
}

impl Config {
    /// Create a new config builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the values a builder or option change may have produced.
    pub fn validate(&self) -> Result<()> {
        if self.compression_factor.is_nan() || self.compression_factor <= 0.0 {
            return Err(Error::InvalidArgument(
                "compression factor must be > 0".into(),
            ));
        }
        if self.prefix_key.len() > MAX_PREFIX_LEN {
            return Err(Error::InvalidArgument(format!(
                "prefix key must be at most {MAX_PREFIX_LEN} bytes"
            )));
        }
        if self
            .prefix_key
            .bytes()
            .any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
        {
            return Err(Error::InvalidArgument(
                "prefix key must not contain whitespace or control characters".into(),
            ));
        }
        Ok(())
    }

    /// Apply a runtime option, validating the result.
    ///
    /// On error the config is left unchanged.
    pub fn apply(&mut self, option: ClientOption) -> Result<()> {
        let mut next = self.clone();
        match option {
            ClientOption::Protocol(v) => next.protocol = v,
            ClientOption::Compression(v) => next.compression = v,
            ClientOption::CompressionType(v) => next.compression_type = v,
            ClientOption::CompressionFactor(v) => next.compression_factor = v,
            ClientOption::CompressionThreshold(v) => next.compression_threshold = v,
            ClientOption::Serializer(v) => next.serializer = v,
            ClientOption::PrefixKey(v) => next.prefix_key = v,
            ClientOption::Hash(v) => next.hash = v,
            ClientOption::Distribution(v) => next.distribution = v,
            ClientOption::SaslMechanism(v) => next.sasl_mechanism = v,
            ClientOption::TcpNoDelay(v) => next.tcp_nodelay = v,
            ClientOption::ConnectTimeout(v) => next.connect_timeout_ms = v,
            ClientOption::SendTimeout(v) => next.send_timeout_ms = v,
            ClientOption::RecvTimeout(v) => next.recv_timeout_ms = v,
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        millis(self.send_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        millis(self.recv_timeout_ms)
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// A single runtime option for `ShardedClient::set_option`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOption {
    Protocol(Protocol),
    Compression(bool),
    CompressionType(CompressionType),
    CompressionFactor(f64),
    CompressionThreshold(usize),
    Serializer(SerializerKind),
    PrefixKey(String),
    Hash(HashKind),
    Distribution(Distribution),
    SaslMechanism(Option<SaslMechanism>),
    TcpNoDelay(bool),
    /// Milliseconds, 0 = none.
    ConnectTimeout(u64),
    SendTimeout(u64),
    RecvTimeout(u64),
}

impl ClientOption {
    /// Options that change how connections are opened.
    pub(crate) fn resets_connections(&self) -> bool {
        matches!(
            self,
            ClientOption::Protocol(_)
                | ClientOption::TcpNoDelay(_)
                | ClientOption::ConnectTimeout(_)
                | ClientOption::SendTimeout(_)
                | ClientOption::RecvTimeout(_)
                | ClientOption::SaslMechanism(_)
        )
    }

    /// Options that change key placement.
    pub(crate) fn rebuilds_router(&self) -> bool {
        matches!(self, ClientOption::Hash(_) | ClientOption::Distribution(_))
    }
}

/// Builder for [`Config`].
///
/// ```
/// use memcache_client::{Config, Protocol};
///
/// let config = Config::builder()
///     .protocol(Protocol::Binary)
///     .prefix_key("app:")
///     .compression_threshold(4096)
///     .build()
///     .expect("invalid config");
/// assert_eq!(config.prefix_key, "app:");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn prefix_key(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix_key = prefix.into();
        self
    }

    /// Enable or disable compression of large values.
    pub fn compression(mut self, enable: bool) -> Self {
        self.config.compression = enable;
        self
    }

    pub fn compression_type(mut self, kind: CompressionType) -> Self {
        self.config.compression_type = kind;
        self
    }

    pub fn compression_factor(mut self, factor: f64) -> Self {
        self.config.compression_factor = factor;
        self
    }

    /// Set the string length (in bytes) above which compression is tried.
    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.config.compression_threshold = bytes;
        self
    }

    pub fn serializer(mut self, kind: SerializerKind) -> Self {
        self.config.serializer = kind;
        self
    }

    pub fn hash(mut self, hash: HashKind) -> Self {
        self.config.hash = hash;
        self
    }

    pub fn distribution(mut self, distribution: Distribution) -> Self {
        self.config.distribution = distribution;
        self
    }

    pub fn sasl_mechanism(mut self, mechanism: SaslMechanism) -> Self {
        self.config.sasl_mechanism = Some(mechanism);
        self
    }

    /// Enable or disable TCP_NODELAY on all connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Set the connect timeout (in milliseconds).
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds).
    pub fn send_timeout_ms(mut self, ms: u64) -> Self {
        self.config.send_timeout_ms = ms;
        self
    }

    /// Set the read timeout (in milliseconds).
    pub fn recv_timeout_ms(mut self, ms: u64) -> Self {
        self.config.recv_timeout_ms = ms;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
