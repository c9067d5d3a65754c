//! Client-side Memcache protocol codec.
//!
//! Both wire formats are sans-IO: requests encode into caller-provided
//! buffers and responses parse from whatever bytes have arrived so far,
//! returning [`ParseError::Incomplete`] until a full reply is buffered.
//!
//! # Features
//!
//! - `ascii` (default): ASCII text protocol support
//! - `binary`: Binary protocol support, including SASL frames
//! - `full`: Both ASCII and binary protocols
//!
//! # ASCII Protocol
//!
//! ```
//! use protocol_memcache::{ReplyKind, Request, Response};
//!
//! let req = Request::get(b"mykey");
//! let mut buf = vec![0u8; req.encoded_len()];
//! let len = req.encode(&mut buf);
//! assert_eq!(&buf[..len], b"get mykey\r\n");
//!
//! let response_data = b"VALUE mykey 0 5\r\nhello\r\nEND\r\n";
//! let (response, consumed) = Response::parse_reply(ReplyKind::Values, response_data).unwrap();
//! assert_eq!(consumed, response_data.len());
//! assert!(!response.is_miss());
//! ```
//!
//! # Binary Protocol
//!
//! The binary protocol uses fixed 24-byte headers and supports quiet
//! pipelined gets and SASL authentication. Enable with the `binary` feature.
//! See the [`binary`] module.

mod error;
#[cfg(feature = "ascii")]
mod request;
#[cfg(feature = "ascii")]
mod response;

#[cfg(feature = "binary")]
pub mod binary;

pub use error::ParseError;
#[cfg(feature = "ascii")]
pub use request::{ReplyKind, Request, RetrieveCommand, StoreCommand, StoreRequest};
#[cfg(feature = "ascii")]
pub use response::{Response, Value, ValueReader};

/// Largest value accepted from the wire, in either protocol.
pub const MAX_VALUE_DATA_LEN: usize = 128 * 1024 * 1024;
