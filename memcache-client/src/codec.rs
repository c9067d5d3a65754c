//! Value encoding: type flags, serialization and compression.
//!
//! Scalars travel as plain text so other clients can read them: strings as
//! UTF-8, integers and floats in decimal, booleans as `"1"` or `""`, null
//! as an empty payload. Arrays and objects always go through the configured
//! [`Serializer`]. Large strings and every serialized payload are offered to
//! the [`Compressor`], and the compressed form is kept only when it beats
//! the original by the configured factor.

use std::collections::BTreeMap;

use protocol_memcache::MAX_VALUE_DATA_LEN;

use crate::config::{CompressionType, Config, SerializerKind};
use crate::error::{Error, Result};
use crate::value::{FLAG_COMPRESSED, FLAG_SERIALIZED, TypeTag, Value};

// -- Collaborators -----------------------------------------------------------

/// Turns structured values into bytes and back.
pub trait Serializer: Send + Sync {
    fn name(&self) -> &'static str;
    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;
    fn deserialize(&self, data: &[u8]) -> Result<Value>;
}

/// Byte-level compression for large payloads.
pub trait Compressor: Send + Sync {
    fn name(&self) -> &'static str;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

fn payload(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Payload(format!("{context}: {err}"))
}

/// bincode, the default serializer.
pub struct Bincode;

impl Serializer for Bincode {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| payload("bincode serialize", e))
    }

    fn deserialize(&self, data: &[u8]) -> Result<Value> {
        bincode::deserialize(data).map_err(|e| payload("bincode deserialize", e))
    }
}

/// Plain JSON documents, readable by any client.
pub struct Json;

impl Json {
    fn to_json(value: &Value) -> Result<serde_json::Value> {
        Ok(match value {
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .ok_or_else(|| Error::Payload(format!("json cannot represent {n}")))?,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Null => serde_json::Value::Null,
            Value::Array(items) => serde_json::Value::Array(
                items.iter().map(Self::to_json).collect::<Result<_>>()?,
            ),
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::to_json(v)?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect::<BTreeMap<_, _>>(),
            ),
        }
    }
}

impl Serializer for Json {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(&Self::to_json(value)?).map_err(|e| payload("json serialize", e))
    }

    fn deserialize(&self, data: &[u8]) -> Result<Value> {
        let json: serde_json::Value =
            serde_json::from_slice(data).map_err(|e| payload("json deserialize", e))?;
        Ok(Self::from_json(json))
    }
}

/// MessagePack via rmp-serde.
#[cfg(feature = "msgpack")]
pub struct Msgpack;

#[cfg(feature = "msgpack")]
impl Serializer for Msgpack {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        rmp_serde::to_vec(value).map_err(|e| payload("msgpack serialize", e))
    }

    fn deserialize(&self, data: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(data).map_err(|e| payload("msgpack deserialize", e))
    }
}

/// LZ4 block format with the uncompressed size prepended.
pub struct Lz4;

impl Compressor for Lz4 {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let [a, b, c, d, ..] = *data else {
            return Err(Error::Payload("lz4 payload too short".into()));
        };
        // Reject the claimed size before lz4_flex allocates for it.
        if u32::from_le_bytes([a, b, c, d]) as usize > MAX_VALUE_DATA_LEN {
            return Err(Error::Payload("lz4 payload claims an oversized value".into()));
        }
        lz4_flex::decompress_size_prepended(data).map_err(|e| payload("lz4 decompress", e))
    }
}

/// Zstandard at level 1.
#[cfg(feature = "zstd")]
pub struct Zstd;

#[cfg(feature = "zstd")]
impl Compressor for Zstd {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        zstd::stream::copy_encode(data, &mut out, 1).map_err(|e| payload("zstd compress", e))?;
        Ok(out)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        use std::io::Read;

        let decoder = zstd::stream::Decoder::new(data).map_err(|e| payload("zstd decompress", e))?;
        let mut out = Vec::new();
        decoder
            .take(MAX_VALUE_DATA_LEN as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| payload("zstd decompress", e))?;
        if out.len() > MAX_VALUE_DATA_LEN {
            return Err(Error::Payload("zstd payload expands past the value limit".into()));
        }
        Ok(out)
    }
}

/// Resolve a serializer, failing if its cargo feature is not compiled in.
pub fn serializer(kind: SerializerKind) -> Result<Box<dyn Serializer>> {
    match kind {
        SerializerKind::Native => Ok(Box::new(Bincode)),
        SerializerKind::Json => Ok(Box::new(Json)),
        #[cfg(feature = "msgpack")]
        SerializerKind::Msgpack => Ok(Box::new(Msgpack)),
        #[cfg(not(feature = "msgpack"))]
        SerializerKind::Msgpack => Err(Error::Configuration(
            "msgpack serializer requires the `msgpack` feature".into(),
        )),
    }
}

/// Resolve a compressor, failing if its cargo feature is not compiled in.
pub fn compressor(kind: CompressionType) -> Result<Box<dyn Compressor>> {
    match kind {
        CompressionType::Lz4 => Ok(Box::new(Lz4)),
        #[cfg(feature = "zstd")]
        CompressionType::Zstd => Ok(Box::new(Zstd)),
        #[cfg(not(feature = "zstd"))]
        CompressionType::Zstd => Err(Error::Configuration(
            "zstd compression requires the `zstd` feature".into(),
        )),
    }
}

// -- ValueCodec --------------------------------------------------------------

/// Bytes and flags ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub flags: u32,
    pub data: Vec<u8>,
}

/// Maps [`Value`]s to flagged payloads and back.
pub struct ValueCodec {
    serializer: Box<dyn Serializer>,
    compressor: Box<dyn Compressor>,
    compress: bool,
    factor: f64,
    threshold: usize,
}

impl ValueCodec {
    /// Build the codec the config asks for.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self::with_parts(
            serializer(config.serializer)?,
            compressor(config.compression_type)?,
            config.compression,
            config.compression_factor,
            config.compression_threshold,
        ))
    }

    /// Build a codec from explicit collaborators.
    pub fn with_parts(
        serializer: Box<dyn Serializer>,
        compressor: Box<dyn Compressor>,
        compress: bool,
        factor: f64,
        threshold: usize,
    ) -> Self {
        Self {
            serializer,
            compressor,
            compress,
            factor,
            threshold,
        }
    }

    pub fn serializer_name(&self) -> &'static str {
        self.serializer.name()
    }

    pub fn compressor_name(&self) -> &'static str {
        self.compressor.name()
    }

    pub fn encode(&self, value: &Value) -> Result<Encoded> {
        let tag = value.tag();
        let mut flags = tag.bit();
        let data = match value {
            Value::Str(s) => s.as_bytes().to_vec(),
            Value::Int(n) => n.to_string().into_bytes(),
            Value::Float(n) => n.to_string().into_bytes(),
            Value::Bool(true) => b"1".to_vec(),
            Value::Bool(false) | Value::Null => Vec::new(),
            Value::Array(_) | Value::Object(_) => {
                flags |= FLAG_SERIALIZED;
                self.serializer.serialize(value)?
            }
        };

        let offer = tag.is_structured() || (tag == TypeTag::Str && data.len() > self.threshold);
        if self.compress && offer {
            let compressed = self.compressor.compress(&data)?;
            if data.len() as f64 > compressed.len() as f64 * self.factor {
                return Ok(Encoded {
                    flags: flags | FLAG_COMPRESSED,
                    data: compressed,
                });
            }
        }
        Ok(Encoded { flags, data })
    }

    pub fn decode(&self, flags: u32, data: &[u8]) -> Result<Value> {
        let inflated;
        let data = if flags & FLAG_COMPRESSED != 0 {
            inflated = self.compressor.decompress(data)?;
            &inflated[..]
        } else {
            data
        };

        if flags & FLAG_SERIALIZED != 0 {
            return self.serializer.deserialize(data);
        }

        match TypeTag::from_flags(flags) {
            None | Some(TypeTag::Str) => String::from_utf8(data.to_vec())
                .map(Value::Str)
                .map_err(|e| payload("string value", e)),
            Some(TypeTag::Int) => parse_text(data).map(Value::Int),
            Some(TypeTag::Float) => parse_text(data).map(Value::Float),
            Some(TypeTag::Bool) => Ok(Value::Bool(!matches!(data, b"" | b"0"))),
            Some(TypeTag::Null) => Ok(Value::Null),
            Some(TypeTag::Array | TypeTag::Object) => Err(Error::Payload(
                "structured value stored without the serialized flag".into(),
            )),
        }
    }
}

/// Parse a decimal scalar; memcached pads decremented counters with spaces.
fn parse_text<T: std::str::FromStr>(data: &[u8]) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let text = std::str::from_utf8(data).map_err(|e| payload("numeric value", e))?;
    text.trim()
        .parse()
        .map_err(|e| payload(&format!("numeric value {text:?}"), e))
}
