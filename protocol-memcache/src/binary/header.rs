//! Memcache binary protocol headers.
//!
//! Requests and responses share one 24-byte layout; bytes 6-7 carry the
//! vbucket id in requests and the status in responses.

use crate::MAX_VALUE_DATA_LEN;
use crate::error::ParseError;

/// Magic byte for binary request packets.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Magic byte for binary response packets.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Header size for binary protocol.
pub const HEADER_SIZE: usize = 24;

/// Largest body a header may announce: a maximal value plus the largest
/// extras and key sections.
pub const MAX_BODY_LENGTH: usize = MAX_VALUE_DATA_LEN + u8::MAX as usize + u16::MAX as usize;

/// Binary protocol opcodes used by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0A,
    Version = 0x0B,
    GetK = 0x0C,
    GetKQ = 0x0D,
    Append = 0x0E,
    Prepend = 0x0F,
    Stat = 0x10,
    Verbosity = 0x1B,
    Touch = 0x1C,
    Gat = 0x1D,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
}

impl Opcode {
    /// Try to convert a byte to an opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        let opcode = match value {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Increment,
            0x06 => Opcode::Decrement,
            0x07 => Opcode::Quit,
            0x08 => Opcode::Flush,
            0x09 => Opcode::GetQ,
            0x0A => Opcode::Noop,
            0x0B => Opcode::Version,
            0x0C => Opcode::GetK,
            0x0D => Opcode::GetKQ,
            0x0E => Opcode::Append,
            0x0F => Opcode::Prepend,
            0x10 => Opcode::Stat,
            0x1B => Opcode::Verbosity,
            0x1C => Opcode::Touch,
            0x1D => Opcode::Gat,
            0x20 => Opcode::SaslListMechs,
            0x21 => Opcode::SaslAuth,
            0x22 => Opcode::SaslStep,
            _ => return None,
        };
        Some(opcode)
    }

    /// Quiet opcodes get no reply on a miss.
    #[inline]
    pub fn is_quiet(self) -> bool {
        matches!(self, Opcode::GetQ | Opcode::GetKQ)
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    NoError = 0x0000,
    KeyNotFound = 0x0001,
    KeyExists = 0x0002,
    ValueTooLarge = 0x0003,
    InvalidArguments = 0x0004,
    ItemNotStored = 0x0005,
    NonNumericValue = 0x0006,
    WrongVbucket = 0x0007,
    AuthError = 0x0020,
    AuthContinue = 0x0021,
    UnknownCommand = 0x0081,
    OutOfMemory = 0x0082,
    NotSupported = 0x0083,
    InternalError = 0x0084,
    Busy = 0x0085,
    TempFailure = 0x0086,
}

impl Status {
    /// Convert a wire status. Unknown values map to `InternalError`.
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0000 => Status::NoError,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0006 => Status::NonNumericValue,
            0x0007 => Status::WrongVbucket,
            // 0x08/0x09 were the auth codes in early drafts of the protocol.
            0x0008 | 0x0020 => Status::AuthError,
            0x0009 | 0x0021 => Status::AuthContinue,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0083 => Status::NotSupported,
            0x0085 => Status::Busy,
            0x0086 => Status::TempFailure,
            _ => Status::InternalError,
        }
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self == Status::NoError
    }

    /// Returns the status as a short description.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::NoError => "No error",
            Status::KeyNotFound => "Key not found",
            Status::KeyExists => "Key exists",
            Status::ValueTooLarge => "Value too large",
            Status::InvalidArguments => "Invalid arguments",
            Status::ItemNotStored => "Item not stored",
            Status::NonNumericValue => "Incr/Decr on non-numeric value",
            Status::WrongVbucket => "Wrong vbucket",
            Status::AuthError => "Authentication error",
            Status::AuthContinue => "Authentication continue",
            Status::UnknownCommand => "Unknown command",
            Status::OutOfMemory => "Out of memory",
            Status::NotSupported => "Not supported",
            Status::InternalError => "Internal error",
            Status::Busy => "Busy",
            Status::TempFailure => "Temporary failure",
        }
    }
}

/// Binary protocol header (24 bytes).
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///   +---------------+---------------+---------------+---------------+
///  0| Magic         | Opcode        | Key length                    |
///   +---------------+---------------+---------------+---------------+
///  4| Extras length | Data type     | vbucket id / status           |
///   +---------------+---------------+---------------+---------------+
///  8| Total body length                                             |
///   +---------------+---------------+---------------+---------------+
/// 12| Opaque                                                        |
///   +---------------+---------------+---------------+---------------+
/// 16| CAS                                                           |
///   |                                                               |
///   +---------------+---------------+---------------+---------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u8,
    pub opcode: Opcode,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    /// vbucket id in requests, status in responses.
    pub vbucket_or_status: u16,
    /// extras_length + key_length + value length
    pub total_body_length: u32,
    /// Echoed back unchanged by the server.
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    pub fn request(opcode: Opcode) -> Self {
        Self::with_magic(REQUEST_MAGIC, opcode, 0)
    }

    pub fn response(opcode: Opcode, status: Status) -> Self {
        Self::with_magic(RESPONSE_MAGIC, opcode, status as u16)
    }

    fn with_magic(magic: u8, opcode: Opcode, vbucket_or_status: u16) -> Self {
        Self {
            magic,
            opcode,
            key_length: 0,
            extras_length: 0,
            data_type: 0,
            vbucket_or_status,
            total_body_length: 0,
            opaque: 0,
            cas: 0,
        }
    }

    /// Set the length fields for a body of the given section sizes.
    pub fn body(mut self, extras: usize, key: usize, value: usize) -> Self {
        self.extras_length = extras as u8;
        self.key_length = key as u16;
        self.total_body_length = (extras + key + value) as u32;
        self
    }

    /// Parse a request header (magic 0x80).
    pub fn parse_request(data: &[u8]) -> Result<Self, ParseError> {
        Self::parse_with_magic(data, REQUEST_MAGIC)
    }

    /// Parse a response header (magic 0x81).
    pub fn parse_response(data: &[u8]) -> Result<Self, ParseError> {
        Self::parse_with_magic(data, RESPONSE_MAGIC)
    }

    fn parse_with_magic(data: &[u8], magic: u8) -> Result<Self, ParseError> {
        if data.len() < HEADER_SIZE {
            return Err(ParseError::Incomplete);
        }
        if data[0] != magic {
            return Err(ParseError::InvalidMagic(data[0]));
        }
        let opcode = Opcode::from_u8(data[1]).ok_or(ParseError::UnknownOpcode(data[1]))?;

        let be16 = |at: usize| u16::from_be_bytes([data[at], data[at + 1]]);
        let be32 = |at: usize| {
            u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
        };

        let header = Self {
            magic,
            opcode,
            key_length: be16(2),
            extras_length: data[4],
            data_type: data[5],
            vbucket_or_status: be16(6),
            total_body_length: be32(8),
            opaque: be32(12),
            cas: (u64::from(be32(16)) << 32) | u64::from(be32(20)),
        };

        if usize::from(header.extras_length) + usize::from(header.key_length)
            > header.total_body_length as usize
        {
            return Err(ParseError::Protocol("body shorter than extras and key"));
        }
        if header.total_body_length as usize > MAX_BODY_LENGTH {
            return Err(ParseError::Protocol("body length exceeds the value limit"));
        }
        Ok(header)
    }

    /// Encode the header into the first 24 bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = self.magic;
        buf[1] = self.opcode as u8;
        buf[2..4].copy_from_slice(&self.key_length.to_be_bytes());
        buf[4] = self.extras_length;
        buf[5] = self.data_type;
        buf[6..8].copy_from_slice(&self.vbucket_or_status.to_be_bytes());
        buf[8..12].copy_from_slice(&self.total_body_length.to_be_bytes());
        buf[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        buf[16..24].copy_from_slice(&self.cas.to_be_bytes());
        HEADER_SIZE
    }

    /// Response status (meaningless on request headers).
    #[inline]
    pub fn status(&self) -> Status {
        Status::from_u16(self.vbucket_or_status)
    }

    /// Length of the value section.
    #[inline]
    pub fn value_length(&self) -> usize {
        self.total_body_length as usize
            - usize::from(self.extras_length)
            - usize::from(self.key_length)
    }

    /// Header plus body.
    #[inline]
    pub fn frame_length(&self) -> usize {
        HEADER_SIZE + self.total_body_length as usize
    }
}
