//! Binary protocol request encoding.

use super::header::{HEADER_SIZE, Header, Opcode};

/// Largest extras section the client sends (incr/decr).
const MAX_EXTRAS: usize = 20;

/// A binary request frame: header fields plus borrowed key and value.
///
/// ```
/// use protocol_memcache::binary::{BinaryRequest, HEADER_SIZE};
///
/// let req = BinaryRequest::set(b"k", b"value", 7, 60).opaque(3);
/// let frame = req.to_vec();
/// assert_eq!(frame.len(), HEADER_SIZE + 8 + 1 + 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRequest<'a> {
    opcode: Opcode,
    extras: [u8; MAX_EXTRAS],
    extras_len: u8,
    key: &'a [u8],
    value: &'a [u8],
    opaque: u32,
    cas: u64,
}

impl<'a> BinaryRequest<'a> {
    fn new(opcode: Opcode, key: &'a [u8], value: &'a [u8]) -> Self {
        Self {
            opcode,
            extras: [0; MAX_EXTRAS],
            extras_len: 0,
            key,
            value,
            opaque: 0,
            cas: 0,
        }
    }

    fn extras(mut self, parts: &[&[u8]]) -> Self {
        let mut len = 0;
        for part in parts {
            self.extras[len..len + part.len()].copy_from_slice(part);
            len += part.len();
        }
        self.extras_len = len as u8;
        self
    }

    // -- Retrieval -----------------------------------------------------------

    pub fn get(key: &'a [u8]) -> Self {
        Self::new(Opcode::Get, key, &[])
    }

    /// Get that echoes the key in the reply.
    pub fn getk(key: &'a [u8]) -> Self {
        Self::new(Opcode::GetK, key, &[])
    }

    /// Quiet GetK: the server stays silent on a miss.
    pub fn getkq(key: &'a [u8]) -> Self {
        Self::new(Opcode::GetKQ, key, &[])
    }

    /// Get-and-touch.
    pub fn gat(key: &'a [u8], exptime: u32) -> Self {
        Self::new(Opcode::Gat, key, &[]).extras(&[&exptime.to_be_bytes()])
    }

    // -- Storage -------------------------------------------------------------

    /// Set, add or replace; extras are `(flags, exptime)`.
    pub fn store(opcode: Opcode, key: &'a [u8], value: &'a [u8], flags: u32, exptime: u32) -> Self {
        Self::new(opcode, key, value).extras(&[&flags.to_be_bytes(), &exptime.to_be_bytes()])
    }

    pub fn set(key: &'a [u8], value: &'a [u8], flags: u32, exptime: u32) -> Self {
        Self::store(Opcode::Set, key, value, flags, exptime)
    }

    pub fn add(key: &'a [u8], value: &'a [u8], flags: u32, exptime: u32) -> Self {
        Self::store(Opcode::Add, key, value, flags, exptime)
    }

    pub fn replace(key: &'a [u8], value: &'a [u8], flags: u32, exptime: u32) -> Self {
        Self::store(Opcode::Replace, key, value, flags, exptime)
    }

    /// Append carries no extras.
    pub fn append(key: &'a [u8], value: &'a [u8]) -> Self {
        Self::new(Opcode::Append, key, value)
    }

    pub fn prepend(key: &'a [u8], value: &'a [u8]) -> Self {
        Self::new(Opcode::Prepend, key, value)
    }

    pub fn delete(key: &'a [u8]) -> Self {
        Self::new(Opcode::Delete, key, &[])
    }

    pub fn touch(key: &'a [u8], exptime: u32) -> Self {
        Self::new(Opcode::Touch, key, &[]).extras(&[&exptime.to_be_bytes()])
    }

    /// Increment or decrement; extras are `(delta, initial, exptime)`.
    ///
    /// An `exptime` of `0xffffffff` makes the server fail with
    /// "key not found" instead of creating the counter.
    pub fn counter(opcode: Opcode, key: &'a [u8], delta: u64, initial: u64, exptime: u32) -> Self {
        Self::new(opcode, key, &[]).extras(&[
            &delta.to_be_bytes(),
            &initial.to_be_bytes(),
            &exptime.to_be_bytes(),
        ])
    }

    // -- Admin ---------------------------------------------------------------

    /// Flush, optionally delayed by `delay` seconds.
    pub fn flush(delay: u32) -> Self {
        let req = Self::new(Opcode::Flush, &[], &[]);
        if delay > 0 {
            req.extras(&[&delay.to_be_bytes()])
        } else {
            req
        }
    }

    pub fn noop() -> Self {
        Self::new(Opcode::Noop, &[], &[])
    }

    pub fn version() -> Self {
        Self::new(Opcode::Version, &[], &[])
    }

    pub fn quit() -> Self {
        Self::new(Opcode::Quit, &[], &[])
    }

    /// Stats, optionally for a group such as `items` or `slabs`.
    pub fn stat(group: Option<&'a [u8]>) -> Self {
        Self::new(Opcode::Stat, group.unwrap_or_default(), &[])
    }

    pub fn verbosity(level: u32) -> Self {
        Self::new(Opcode::Verbosity, &[], &[]).extras(&[&level.to_be_bytes()])
    }

    // -- SASL ----------------------------------------------------------------

    pub fn sasl_list_mechs() -> Self {
        Self::new(Opcode::SaslListMechs, &[], &[])
    }

    /// First authentication frame: mechanism name as key, payload as value.
    pub fn sasl_auth(mechanism: &'a [u8], payload: &'a [u8]) -> Self {
        Self::new(Opcode::SaslAuth, mechanism, payload)
    }

    /// Continuation frame answering a server challenge.
    pub fn sasl_step(mechanism: &'a [u8], payload: &'a [u8]) -> Self {
        Self::new(Opcode::SaslStep, mechanism, payload)
    }

    // -- Header fields -------------------------------------------------------

    #[inline]
    pub fn opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    /// CAS token; non-zero makes storage and delete conditional.
    #[inline]
    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    #[inline]
    pub fn key(&self) -> &'a [u8] {
        self.key
    }

    fn header(&self) -> Header {
        let mut header = Header::request(self.opcode).body(
            usize::from(self.extras_len),
            self.key.len(),
            self.value.len(),
        );
        header.opaque = self.opaque;
        header.cas = self.cas;
        header
    }

    // -- Encoding ------------------------------------------------------------

    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + usize::from(self.extras_len) + self.key.len() + self.value.len()
    }

    /// Encode the frame into `buf`, returning the number of bytes written.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`encoded_len`](Self::encoded_len).
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut pos = self.header().encode(buf);
        for section in [&self.extras[..usize::from(self.extras_len)], self.key, self.value] {
            buf[pos..pos + section.len()].copy_from_slice(section);
            pos += section.len();
        }
        pos
    }

    /// Append the encoded frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + self.encoded_len(), 0);
        self.encode(&mut out[start..]);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }
}
