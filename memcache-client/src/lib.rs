//! Blocking memcache client for weighted server pools.
//!
//! [`ShardedClient`] routes keys over a pool of memcached servers with a
//! modula or consistent [`Distribution`], speaks either the ASCII or the
//! binary protocol, and stores typed [`Value`]s through a [`ValueCodec`]
//! that records the value type, serialization and compression in the item
//! flags. Adding or removing a server can migrate the keys whose owner
//! changed.
//!
//! Binary connections authenticate with SASL (`PLAIN`, `ANONYMOUS`, `LOGIN`,
//! `CRAM-MD5`, `DIGEST-MD5`) when credentials and a mechanism are set.
//!
//! # Example
//!
//! ```no_run
//! use memcache_client::{Config, Protocol, ShardedClient, Value};
//!
//! let config = Config::builder()
//!     .protocol(Protocol::Binary)
//!     .prefix_key("app:")
//!     .build()?;
//! let mut client = ShardedClient::new(config)?;
//! client.add_servers(&[("10.0.0.1", 11211, 1), ("10.0.0.2", 11211, 2)])?;
//!
//! client.set("visits", 0i64, 0)?;
//! let visits = client.increment("visits", 1, 0, 0)?;
//! assert_eq!(visits, 1);
//!
//! client.get_delayed(&["visits", "missing"], true)?;
//! while let Some(record) = client.fetch() {
//!     println!("{} = {:?} (cas {:?})", record.key, record.value, record.cas);
//! }
//! # Ok::<(), memcache_client::Error>(())
//! ```

mod ascii;
mod binary;
pub mod codec;
mod config;
mod connection;
mod error;
mod node;
pub mod sasl;
mod sharded;
mod value;

pub use codec::{Compressor, Encoded, Serializer, ValueCodec};
pub use config::{
    ClientOption, CompressionType, Config, ConfigBuilder, MAX_PREFIX_LEN, Protocol, SaslMechanism,
    SerializerKind,
};
pub use error::{Error, Result, ResultCode};
pub use hashring::{Distribution, HashKind};
pub use sasl::Credentials;
pub use sharded::{BRIDGE_TTL, Fetched, MAX_KEY_LEN, MigrationReport, ServerInfo, ShardedClient};
pub use value::{FLAG_COMPRESSED, FLAG_SERIALIZED, TYPE_MASK, TypeTag, Value};
