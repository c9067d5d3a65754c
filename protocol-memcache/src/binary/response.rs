//! Binary protocol response frames.

use super::header::{HEADER_SIZE, Header, Opcode, Status};
use crate::error::ParseError;

/// A response frame borrowed from the receive buffer.
///
/// Sections are split exactly as the header describes; interpretation
/// (flags, counter value, error text) is left to the accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryResponse<'a> {
    pub header: Header,
    pub extras: &'a [u8],
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> BinaryResponse<'a> {
    /// Parse one response frame, returning it and the bytes consumed.
    ///
    /// Returns [`ParseError::Incomplete`] until the whole body is buffered.
    pub fn parse(data: &'a [u8]) -> Result<(Self, usize), ParseError> {
        let header = Header::parse_response(data)?;
        let end = header.frame_length();
        if data.len() < end {
            return Err(ParseError::Incomplete);
        }

        let body = &data[HEADER_SIZE..end];
        let (extras, rest) = body.split_at(usize::from(header.extras_length));
        let (key, value) = rest.split_at(usize::from(header.key_length));
        Ok((
            Self {
                header,
                extras,
                key,
                value,
            },
            end,
        ))
    }

    /// Build a response for `opcode`; lengths are derived on encode.
    pub fn new(opcode: Opcode, status: Status) -> Self {
        Self {
            header: Header::response(opcode, status),
            extras: &[],
            key: &[],
            value: &[],
        }
    }

    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.header.status()
    }

    #[inline]
    pub fn opaque(&self) -> u32 {
        self.header.opaque
    }

    #[inline]
    pub fn cas(&self) -> u64 {
        self.header.cas
    }

    /// Item flags from a get-family reply; zero when the extras are absent.
    pub fn flags(&self) -> u32 {
        match self.extras {
            [a, b, c, d, ..] => u32::from_be_bytes([*a, *b, *c, *d]),
            _ => 0,
        }
    }

    /// New counter value from an incr/decr reply.
    pub fn counter(&self) -> Result<u64, ParseError> {
        let bytes: [u8; 8] = self
            .value
            .try_into()
            .map_err(|_| ParseError::Protocol("counter value is not 8 bytes"))?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Server-supplied text for a failed status, or the status description.
    pub fn error_message(&self) -> String {
        if self.value.is_empty() {
            self.status().as_str().to_string()
        } else {
            String::from_utf8_lossy(self.value).into_owned()
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.extras.len() + self.key.len() + self.value.len()
    }

    /// Encode into a fresh buffer with length fields recomputed.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.encoded_len()];
        let header = self
            .header
            .body(self.extras.len(), self.key.len(), self.value.len());
        let mut pos = header.encode(&mut out);
        for section in [self.extras, self.key, self.value] {
            out[pos..pos + section.len()].copy_from_slice(section);
            pos += section.len();
        }
        out
    }
}
