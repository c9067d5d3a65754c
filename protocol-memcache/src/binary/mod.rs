//! Memcache binary protocol codec.
//!
//! Every frame is a fixed 24-byte header followed by extras, key and value.
//! Requests carry magic 0x80 and responses 0x81; the opaque field is echoed
//! back so pipelined replies can be matched to their requests.
//!
//! ```
//! use protocol_memcache::binary::{BinaryRequest, BinaryResponse, Opcode, Status};
//!
//! let frame = BinaryRequest::getk(b"mykey").opaque(1).to_vec();
//! assert_eq!(frame[0], 0x80);
//!
//! let mut reply = BinaryResponse::new(Opcode::GetK, Status::KeyNotFound);
//! reply.header.opaque = 1;
//! let bytes = reply.to_vec();
//! let (parsed, consumed) = BinaryResponse::parse(&bytes).unwrap();
//! assert_eq!(consumed, bytes.len());
//! assert_eq!(parsed.status(), Status::KeyNotFound);
//! ```

mod header;
mod request;
mod response;

pub use header::{HEADER_SIZE, Header, MAX_BODY_LENGTH, Opcode, REQUEST_MAGIC, RESPONSE_MAGIC, Status};
pub use request::BinaryRequest;
pub use response::BinaryResponse;

/// Returns true if `data` starts with a binary response frame.
#[inline]
pub fn is_binary_response(data: &[u8]) -> bool {
    data.first().copied() == Some(RESPONSE_MAGIC)
}
