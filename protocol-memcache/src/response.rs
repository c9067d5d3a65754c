//! Memcache ASCII response parsing.
//!
//! Single-line replies:
//! - `STORED` / `NOT_STORED` / `EXISTS` / `NOT_FOUND` - storage commands
//! - `DELETED` / `TOUCHED` - delete and touch
//! - `<number>` - incr/decr
//! - `OK` / `VERSION <v>` / `MN` - admin commands
//! - `ERROR` / `CLIENT_ERROR <msg>` / `SERVER_ERROR <msg>` - failures
//!
//! Multi-line replies end with `END`: `VALUE` blocks for retrievals, `STAT`
//! lines for stats, `ITEM` lines for cachedump and `key=` lines for the LRU
//! crawler metadump. An error line anywhere in a multi-line reply ends it.

use crate::MAX_VALUE_DATA_LEN;
use crate::error::ParseError;
use crate::request::ReplyKind;

/// A single value from a retrieval response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub key: Vec<u8>,
    pub flags: u32,
    pub data: Vec<u8>,
    /// CAS unique token, present for `gets` and `gats`.
    pub cas: Option<u64>,
}

/// A parsed memcache response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Zero or more values; empty on a full miss.
    Values(Vec<Value>),
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Touched,
    Ok,
    /// New counter value after incr/decr.
    Numeric(u64),
    Version(Vec<u8>),
    /// `MN`, the meta no-op reply.
    Noop,
    /// `STAT <name> <value>` pairs.
    Stats(Vec<(String, String)>),
    /// Keys listed by cachedump or metadump.
    Keys(Vec<Vec<u8>>),
    /// Generic `ERROR`, with any trailing text.
    Error(Vec<u8>),
    ClientError(Vec<u8>),
    ServerError(Vec<u8>),
}

impl Response {
    /// Returns true if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Response::Error(_) | Response::ClientError(_) | Response::ServerError(_)
        )
    }

    /// Returns true if this represents a cache miss.
    #[inline]
    pub fn is_miss(&self) -> bool {
        match self {
            Response::Values(values) => values.is_empty(),
            Response::NotFound => true,
            _ => false,
        }
    }

    /// The raw error line (without CRLF) for error responses.
    pub fn error_line(&self) -> Option<String> {
        let (prefix, msg) = match self {
            Response::Error(msg) => ("ERROR", msg),
            Response::ClientError(msg) => ("CLIENT_ERROR", msg),
            Response::ServerError(msg) => ("SERVER_ERROR", msg),
            _ => return None,
        };
        if msg.is_empty() {
            Some(prefix.to_owned())
        } else {
            Some(format!("{prefix} {}", String::from_utf8_lossy(msg)))
        }
    }

    /// Parse a single-line or `VALUE` response from a byte buffer.
    ///
    /// Returns the parsed response and the number of bytes consumed. A bare
    /// `END` is an empty value list.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        Self::parse_reply(ReplyKind::Values, data)
    }

    /// Parse a response framed as `kind`.
    ///
    /// Returns [`ParseError::Incomplete`] until the whole reply is buffered.
    pub fn parse_reply(kind: ReplyKind, data: &[u8]) -> Result<(Self, usize), ParseError> {
        match kind {
            ReplyKind::Values => {
                let (line, next) = read_line(data, 0)?;
                if line.starts_with(b"VALUE ") {
                    parse_values(data)
                } else {
                    parse_line(line).map(|r| (r, next))
                }
            }
            ReplyKind::Line | ReplyKind::None => {
                let (line, next) = read_line(data, 0)?;
                parse_line(line).map(|r| (r, next))
            }
            ReplyKind::Stats => parse_listing(data, |line| {
                let rest = line.strip_prefix(b"STAT ")?;
                let mut parts = rest.splitn(2, |&b| b == b' ');
                let name = parts.next()?;
                let value = parts.next().unwrap_or_default();
                Some(Entry::Stat(
                    String::from_utf8_lossy(name).into_owned(),
                    String::from_utf8_lossy(value).into_owned(),
                ))
            }),
            ReplyKind::CacheDump => parse_listing(data, |line| {
                let rest = line.strip_prefix(b"ITEM ")?;
                let key = rest.split(|&b| b == b' ').next()?;
                Some(Entry::Key(key.to_vec()))
            }),
            ReplyKind::MetaDump => parse_listing(data, |line| {
                let rest = line.strip_prefix(b"key=")?;
                let key = rest.split(|&b| b == b' ').next()?;
                Some(Entry::Key(url_decode(key)))
            }),
        }
    }
}

enum Entry {
    Stat(String, String),
    Key(Vec<u8>),
}

/// Locate the line starting at `start`; returns it (without CRLF) and the
/// offset just past its CRLF.
fn read_line(data: &[u8], start: usize) -> Result<(&[u8], usize), ParseError> {
    let rest = &data[start..];
    let end = find_crlf(rest).ok_or(ParseError::Incomplete)?;
    Ok((&rest[..end], start + end + 2))
}

/// Find \r\n in data, return position of \r
fn find_crlf(data: &[u8]) -> Option<usize> {
    memchr::memmem::find(data, b"\r\n")
}

/// Classify an error line, if it is one.
fn error_response(line: &[u8]) -> Option<Response> {
    let tail = |rest: &[u8]| rest.strip_prefix(b" ").unwrap_or(rest).to_vec();
    if let Some(rest) = line.strip_prefix(b"CLIENT_ERROR") {
        return Some(Response::ClientError(tail(rest)));
    }
    if let Some(rest) = line.strip_prefix(b"SERVER_ERROR") {
        return Some(Response::ServerError(tail(rest)));
    }
    if line == b"ERROR" || line.starts_with(b"ERROR ") {
        return Some(Response::Error(tail(&line[5..])));
    }
    None
}

fn parse_line(line: &[u8]) -> Result<Response, ParseError> {
    let response = match line {
        b"STORED" => Response::Stored,
        b"NOT_STORED" => Response::NotStored,
        b"EXISTS" => Response::Exists,
        b"NOT_FOUND" => Response::NotFound,
        b"DELETED" => Response::Deleted,
        b"TOUCHED" => Response::Touched,
        b"OK" => Response::Ok,
        b"MN" => Response::Noop,
        b"END" => Response::Values(Vec::new()),
        _ => {
            if let Some(err) = error_response(line) {
                return Ok(err);
            }
            if let Some(version) = line.strip_prefix(b"VERSION ") {
                return Ok(Response::Version(version.to_vec()));
            }
            // incr/decr reply; memcached may pad the number with spaces.
            let digits = line.trim_ascii_end();
            if !digits.is_empty() && digits.iter().all(u8::is_ascii_digit) {
                return Ok(Response::Numeric(parse_num(digits)?));
            }
            return Err(ParseError::ProtocolDynamic(format!(
                "unexpected response line: {}",
                String::from_utf8_lossy(line)
            )));
        }
    };
    Ok(response)
}

/// Parse `VALUE` blocks up to `END`.
fn parse_values(data: &[u8]) -> Result<(Response, usize), ParseError> {
    match ValueReader::new().feed(data)? {
        (Some(response), consumed) => Ok((response, consumed)),
        (None, _) => Err(ParseError::Incomplete),
    }
}

/// Incremental parser for a retrieval reply.
///
/// [`feed`](Self::feed) consumes every complete `VALUE` block at the front
/// of the buffer and keeps it, so a large multi-get is scanned once no
/// matter how many reads it arrives in. [`wanted`](Self::wanted) tells the
/// caller how many bytes the next block needs before feeding again helps.
///
/// ```
/// use protocol_memcache::{Response, ValueReader};
///
/// let mut reader = ValueReader::new();
/// let (done, consumed) = reader.feed(b"VALUE a 0 1\r\nx\r\nVALUE b 0 5\r\nhe").unwrap();
/// assert!(done.is_none());
/// assert_eq!(consumed, 16);
/// assert_eq!(reader.wanted(), 20);
///
/// let (done, _) = reader.feed(b"VALUE b 0 5\r\nhello\r\nEND\r\n").unwrap();
/// let Some(Response::Values(values)) = done else { panic!() };
/// assert_eq!(values.len(), 2);
/// ```
#[derive(Debug, Default)]
pub struct ValueReader {
    values: Vec<Value>,
    wanted: usize,
}

impl ValueReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes the unconsumed buffer must hold before the next block can
    /// complete; 0 when any new data may help.
    #[inline]
    pub fn wanted(&self) -> usize {
        self.wanted
    }

    /// Consume complete blocks from the front of `data`.
    ///
    /// Returns the finished reply once `END` or an error line is reached,
    /// and always the number of bytes consumed. The caller drops those
    /// bytes before feeding again.
    pub fn feed(&mut self, data: &[u8]) -> Result<(Option<Response>, usize), ParseError> {
        let mut pos = 0;
        self.wanted = 0;

        loop {
            let (line, next) = match read_line(data, pos) {
                Ok(found) => found,
                Err(ParseError::Incomplete) => return Ok((None, pos)),
                Err(e) => return Err(e),
            };

            let Some(header) = line.strip_prefix(b"VALUE ") else {
                let response = if line == b"END" {
                    Response::Values(std::mem::take(&mut self.values))
                } else if self.values.is_empty() {
                    // a status line in place of any values
                    parse_line(line)?
                } else if let Some(err) = error_response(line) {
                    err
                } else {
                    return Err(ParseError::Protocol("expected VALUE or END"));
                };
                return Ok((Some(response), next));
            };

            // VALUE <key> <flags> <bytes> [<cas unique>]
            let mut parts = header.split(|&b| b == b' ').filter(|p| !p.is_empty());
            let (Some(key), Some(flags), Some(bytes)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(ParseError::Protocol("invalid VALUE line"));
            };
            let flags: u32 = parse_num(flags)?;
            let bytes: usize = parse_num(bytes)?;
            if bytes > MAX_VALUE_DATA_LEN {
                return Err(ParseError::Protocol("value data too large"));
            }
            let cas = parts.next().map(parse_num::<u64>).transpose()?;

            let data_end = next + bytes;
            if data.len() < data_end + 2 {
                self.wanted = data_end + 2 - pos;
                return Ok((None, pos));
            }
            if &data[data_end..data_end + 2] != b"\r\n" {
                return Err(ParseError::Protocol("missing data terminator"));
            }

            self.values.push(Value {
                key: key.to_vec(),
                flags,
                data: data[next..data_end].to_vec(),
                cas,
            });
            pos = data_end + 2;
        }
    }
}

/// Parse `END`-terminated listings whose lines `entry` understands.
///
/// Lines `entry` rejects are skipped, so newer server fields do not break
/// older clients.
fn parse_listing(
    data: &[u8],
    entry: impl Fn(&[u8]) -> Option<Entry>,
) -> Result<(Response, usize), ParseError> {
    let mut stats = Vec::new();
    let mut keys = Vec::new();
    let mut pos = 0;

    loop {
        let (line, next) = read_line(data, pos)?;
        pos = next;

        if line == b"END" {
            break;
        }
        if let Some(err) = error_response(line) {
            return Ok((err, pos));
        }
        if line.starts_with(b"BUSY") {
            return Ok((Response::ServerError(line.to_vec()), pos));
        }
        match entry(line) {
            Some(Entry::Stat(name, value)) => stats.push((name, value)),
            Some(Entry::Key(key)) => keys.push(key),
            None => {}
        }
    }

    if keys.is_empty() {
        Ok((Response::Stats(stats), pos))
    } else {
        Ok((Response::Keys(keys), pos))
    }
}

/// Decode the `%XX` escapes memcached applies to metadump keys.
fn url_decode(raw: &[u8]) -> Vec<u8> {
    let hex = |b: u8| (b as char).to_digit(16).map(|d| d as u8);
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' && i + 2 < raw.len() {
            if let (Some(hi), Some(lo)) = (hex(raw[i + 1]), hex(raw[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    out
}

fn parse_num<T: std::str::FromStr>(data: &[u8]) -> Result<T, ParseError> {
    std::str::from_utf8(data)
        .map_err(|_| ParseError::InvalidNumber)?
        .parse()
        .map_err(|_| ParseError::InvalidNumber)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_lines() {
        let cases: &[(&[u8], Response)] = &[
            (b"STORED\r\n", Response::Stored),
            (b"NOT_STORED\r\n", Response::NotStored),
            (b"EXISTS\r\n", Response::Exists),
            (b"NOT_FOUND\r\n", Response::NotFound),
            (b"DELETED\r\n", Response::Deleted),
            (b"TOUCHED\r\n", Response::Touched),
            (b"OK\r\n", Response::Ok),
            (b"MN\r\n", Response::Noop),
        ];
        for (wire, expected) in cases {
            let (resp, consumed) = Response::parse_reply(ReplyKind::Line, wire).unwrap();
            assert_eq!(&resp, expected);
            assert_eq!(consumed, wire.len());
        }
    }

    #[test]
    fn test_parse_end_is_miss() {
        let (resp, consumed) = Response::parse(b"END\r\n").unwrap();
        assert_eq!(resp, Response::Values(vec![]));
        assert_eq!(consumed, 5);
        assert!(resp.is_miss());
    }

    #[test]
    fn test_parse_value() {
        let data = b"VALUE mykey 5 7\r\nmyvalue\r\nEND\r\n";
        let (resp, consumed) = Response::parse(data).unwrap();
        assert_eq!(consumed, data.len());
        let Response::Values(values) = resp else {
            panic!("expected Values");
        };
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].key, b"mykey");
        assert_eq!(values[0].flags, 5);
        assert_eq!(values[0].data, b"myvalue");
        assert_eq!(values[0].cas, None);
    }

    #[test]
    fn test_parse_multi_value_with_cas() {
        let data = b"VALUE key1 0 3 11\r\nfoo\r\nVALUE key2 1 3 12\r\nbar\r\nEND\r\n";
        let (resp, consumed) = Response::parse(data).unwrap();
        assert_eq!(consumed, data.len());
        let Response::Values(values) = resp else {
            panic!("expected Values");
        };
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].cas, Some(11));
        assert_eq!(values[1].key, b"key2");
        assert_eq!(values[1].data, b"bar");
        assert_eq!(values[1].cas, Some(12));
    }

    #[test]
    fn test_value_data_may_contain_crlf() {
        let data = b"VALUE k 0 4\r\n\r\n\r\n\r\nEND\r\n";
        let (resp, _) = Response::parse(data).unwrap();
        let Response::Values(values) = resp else {
            panic!("expected Values");
        };
        assert_eq!(values[0].data, b"\r\n\r\n");
    }

    #[test]
    fn test_incomplete_value() {
        assert_eq!(
            Response::parse(b"VALUE k 0 10\r\nabc"),
            Err(ParseError::Incomplete)
        );
        assert_eq!(
            Response::parse(b"VALUE k 0 3\r\nabc\r\n"),
            Err(ParseError::Incomplete)
        );
        assert_eq!(Response::parse(b"STORED\r"), Err(ParseError::Incomplete));
    }

    #[test]
    fn test_value_reader_resumes() {
        let wire: &[u8] = b"VALUE a 0 3\r\nabc\r\nVALUE b 2 4 9\r\nwxyz\r\nEND\r\n";
        let mut reader = ValueReader::new();
        let mut buf = Vec::new();
        let mut done = None;
        // one byte at a time; consumed bytes never come back
        for &byte in wire {
            buf.push(byte);
            if buf.len() < reader.wanted() {
                continue;
            }
            let (reply, consumed) = reader.feed(&buf).unwrap();
            buf.drain(..consumed);
            if reply.is_some() {
                done = reply;
                break;
            }
        }
        assert!(buf.is_empty());
        let Some(Response::Values(values)) = done else {
            panic!("expected Values");
        };
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].data, b"abc");
        assert_eq!(values[1].flags, 2);
        assert_eq!(values[1].cas, Some(9));
    }

    #[test]
    fn test_value_reader_reports_block_size() {
        let mut reader = ValueReader::new();
        let (done, consumed) = reader.feed(b"VALUE big 0 1000\r\nxx").unwrap();
        assert!(done.is_none());
        assert_eq!(consumed, 0);
        assert_eq!(reader.wanted(), 18 + 1000 + 2);
    }

    #[test]
    fn test_value_reader_status_and_error_lines() {
        let (done, consumed) = ValueReader::new().feed(b"END\r\n").unwrap();
        assert_eq!(done, Some(Response::Values(vec![])));
        assert_eq!(consumed, 5);

        let mut reader = ValueReader::new();
        let (done, _) = reader
            .feed(b"VALUE k 0 1\r\na\r\nSERVER_ERROR out of memory\r\n")
            .unwrap();
        assert_eq!(done, Some(Response::ServerError(b"out of memory".to_vec())));

        let mut reader = ValueReader::new();
        assert_eq!(
            reader.feed(b"VALUE k 0 1\r\na\r\nSTORED\r\n"),
            Err(ParseError::Protocol("expected VALUE or END"))
        );
    }

    #[test]
    fn test_missing_terminator() {
        assert_eq!(
            Response::parse(b"VALUE k 0 3\r\nabcXXEND\r\n"),
            Err(ParseError::Protocol("missing data terminator"))
        );
    }

    #[test]
    fn test_error_lines() {
        let (resp, _) = Response::parse(b"ERROR\r\n").unwrap();
        assert_eq!(resp, Response::Error(vec![]));
        assert_eq!(resp.error_line().as_deref(), Some("ERROR"));

        let (resp, _) = Response::parse(b"CLIENT_ERROR bad data chunk\r\n").unwrap();
        assert_eq!(resp, Response::ClientError(b"bad data chunk".to_vec()));
        assert_eq!(
            resp.error_line().as_deref(),
            Some("CLIENT_ERROR bad data chunk")
        );

        let (resp, _) = Response::parse(b"CLIENT_ERROR\r\n").unwrap();
        assert_eq!(resp, Response::ClientError(vec![]));

        let (resp, _) = Response::parse(b"SERVER_ERROR out of memory\r\n").unwrap();
        assert!(resp.is_error());
    }

    #[test]
    fn test_error_inside_value_stream() {
        let data = b"VALUE k 0 1\r\na\r\nSERVER_ERROR object too large\r\n";
        let (resp, consumed) = Response::parse(data).unwrap();
        assert_eq!(resp, Response::ServerError(b"object too large".to_vec()));
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn test_parse_numeric_and_version() {
        let (resp, _) = Response::parse_reply(ReplyKind::Line, b"42\r\n").unwrap();
        assert_eq!(resp, Response::Numeric(42));
        let (resp, _) = Response::parse_reply(ReplyKind::Line, b"7  \r\n").unwrap();
        assert_eq!(resp, Response::Numeric(7));
        let (resp, _) = Response::parse_reply(ReplyKind::Line, b"VERSION 1.6.21\r\n").unwrap();
        assert_eq!(resp, Response::Version(b"1.6.21".to_vec()));
    }

    #[test]
    fn test_unknown_line() {
        assert!(matches!(
            Response::parse_reply(ReplyKind::Line, b"WAT\r\n"),
            Err(ParseError::ProtocolDynamic(_))
        ));
    }

    #[test]
    fn test_parse_stats() {
        let data = b"STAT pid 123\r\nSTAT version 1.6.21\r\nSTAT items:1:number 3\r\nEND\r\n";
        let (resp, consumed) = Response::parse_reply(ReplyKind::Stats, data).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(
            resp,
            Response::Stats(vec![
                ("pid".into(), "123".into()),
                ("version".into(), "1.6.21".into()),
                ("items:1:number".into(), "3".into()),
            ])
        );
        let (empty, _) = Response::parse_reply(ReplyKind::Stats, b"END\r\n").unwrap();
        assert_eq!(empty, Response::Stats(vec![]));
    }

    #[test]
    fn test_parse_cachedump() {
        let data = b"ITEM foo [3 b; 0 s]\r\nITEM bar [1 b; 1700000000 s]\r\nEND\r\n";
        let (resp, _) = Response::parse_reply(ReplyKind::CacheDump, data).unwrap();
        assert_eq!(resp, Response::Keys(vec![b"foo".to_vec(), b"bar".to_vec()]));
    }

    #[test]
    fn test_parse_metadump() {
        let data = b"key=foo exp=-1 la=1700000000 cas=2 fetch=no cls=1 size=63\r\n\
                     key=a%20b exp=-1 la=1700000000 cas=3 fetch=no cls=1 size=61\r\nEND\r\n";
        let (resp, consumed) = Response::parse_reply(ReplyKind::MetaDump, data).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(resp, Response::Keys(vec![b"foo".to_vec(), b"a b".to_vec()]));
    }

    #[test]
    fn test_metadump_busy() {
        let (resp, _) = Response::parse_reply(
            ReplyKind::MetaDump,
            b"ERROR locked try again later\r\n",
        )
        .unwrap();
        assert!(resp.is_error());
    }

    #[test]
    fn test_metadump_crawler_busy() {
        let (resp, _) = Response::parse_reply(
            ReplyKind::MetaDump,
            b"BUSY currently processing crawler request\r\n",
        )
        .unwrap();
        assert!(resp.is_error());
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode(b"plain"), b"plain");
        assert_eq!(url_decode(b"a%2Fb%25"), b"a/b%");
        assert_eq!(url_decode(b"bad%zz"), b"bad%zz");
        assert_eq!(url_decode(b"tail%4"), b"tail%4");
    }
}
