//! Client-side request encoding for the memcache ASCII protocol.

/// Storage commands sharing the `<cmd> <key> <flags> <exptime> <bytes>` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCommand {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl StoreCommand {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            StoreCommand::Set => b"set",
            StoreCommand::Add => b"add",
            StoreCommand::Replace => b"replace",
            StoreCommand::Append => b"append",
            StoreCommand::Prepend => b"prepend",
        }
    }
}

/// Retrieval commands answered with `VALUE` blocks and `END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveCommand {
    Get,
    /// Like `get`, but every value carries its CAS token.
    Gets,
    /// Get-and-touch.
    Gat,
    /// Get-and-touch with CAS tokens.
    Gats,
}

impl RetrieveCommand {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            RetrieveCommand::Get => b"get",
            RetrieveCommand::Gets => b"gets",
            RetrieveCommand::Gat => b"gat",
            RetrieveCommand::Gats => b"gats",
        }
    }

    #[inline]
    pub fn touches(self) -> bool {
        matches!(self, RetrieveCommand::Gat | RetrieveCommand::Gats)
    }
}

/// How the reply to a request is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// A single status, number or version line.
    Line,
    /// `VALUE` blocks terminated by `END`.
    Values,
    /// `STAT` lines terminated by `END`.
    Stats,
    /// `ITEM` lines terminated by `END`.
    CacheDump,
    /// `key=...` lines terminated by `END`.
    MetaDump,
    /// The server closes the connection without replying.
    None,
}

/// A memcache ASCII command.
///
/// ```
/// use protocol_memcache::Request;
///
/// let req = Request::set(b"greeting", b"hello").flags(1).exptime(60).build();
/// let mut buf = vec![0u8; req.encoded_len()];
/// let len = req.encode(&mut buf);
/// assert_eq!(&buf[..len], b"set greeting 1 60 5\r\nhello\r\n");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    /// `get|gets|gat|gats [<exptime>] <key>*`
    Retrieve {
        command: RetrieveCommand,
        keys: Vec<&'a [u8]>,
        exptime: u32,
    },
    /// `<cmd> <key> <flags> <exptime> <bytes>\r\n<data>`
    Store {
        command: StoreCommand,
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        exptime: u32,
    },
    /// `cas <key> <flags> <exptime> <bytes> <cas_unique>\r\n<data>`
    Cas {
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        exptime: u32,
        cas_unique: u64,
    },
    Touch { key: &'a [u8], exptime: u32 },
    Delete { key: &'a [u8] },
    Incr { key: &'a [u8], delta: u64 },
    Decr { key: &'a [u8], delta: u64 },
    /// `stats [<group>]`
    Stats { group: Option<&'a [u8]> },
    /// `stats cachedump <slab> <limit>`
    CacheDump { slab: u32, limit: u32 },
    /// `lru_crawler metadump all`
    MetaDump,
    /// `flush_all [<delay>]`
    FlushAll { delay: u32 },
    Verbosity { level: u32 },
    Version,
    /// Meta no-op (`mn`), answered with `MN`.
    Noop,
    Quit,
}

impl<'a> Request<'a> {
    #[inline]
    pub fn get(key: &'a [u8]) -> Self {
        Self::retrieve(RetrieveCommand::Get, vec![key], 0)
    }

    /// Multi-key `get`, or `gets` when `with_cas` is set.
    #[inline]
    pub fn get_multi(keys: &[&'a [u8]], with_cas: bool) -> Self {
        let command = if with_cas {
            RetrieveCommand::Gets
        } else {
            RetrieveCommand::Get
        };
        Self::retrieve(command, keys.to_vec(), 0)
    }

    #[inline]
    pub fn gets(keys: &[&'a [u8]]) -> Self {
        Self::get_multi(keys, true)
    }

    /// Get-and-touch: fetch and reset the expiration in one round trip.
    #[inline]
    pub fn gat(exptime: u32, keys: &[&'a [u8]], with_cas: bool) -> Self {
        let command = if with_cas {
            RetrieveCommand::Gats
        } else {
            RetrieveCommand::Gat
        };
        Self::retrieve(command, keys.to_vec(), exptime)
    }

    #[inline]
    fn retrieve(command: RetrieveCommand, keys: Vec<&'a [u8]>, exptime: u32) -> Self {
        Request::Retrieve {
            command,
            keys,
            exptime,
        }
    }

    #[inline]
    pub fn set(key: &'a [u8], value: &'a [u8]) -> StoreRequest<'a> {
        StoreRequest::new(StoreCommand::Set, key, value)
    }

    /// Store only if the key does not already exist.
    #[inline]
    pub fn add(key: &'a [u8], value: &'a [u8]) -> StoreRequest<'a> {
        StoreRequest::new(StoreCommand::Add, key, value)
    }

    /// Store only if the key already exists.
    #[inline]
    pub fn replace(key: &'a [u8], value: &'a [u8]) -> StoreRequest<'a> {
        StoreRequest::new(StoreCommand::Replace, key, value)
    }

    #[inline]
    pub fn append(key: &'a [u8], value: &'a [u8]) -> Self {
        StoreRequest::new(StoreCommand::Append, key, value).build()
    }

    #[inline]
    pub fn prepend(key: &'a [u8], value: &'a [u8]) -> Self {
        StoreRequest::new(StoreCommand::Prepend, key, value).build()
    }

    /// Compare-and-swap: stores only if the CAS token matches.
    #[inline]
    pub fn cas(key: &'a [u8], value: &'a [u8], cas_unique: u64) -> Self {
        Request::Cas {
            key,
            value,
            flags: 0,
            exptime: 0,
            cas_unique,
        }
    }

    #[inline]
    pub fn touch(key: &'a [u8], exptime: u32) -> Self {
        Request::Touch { key, exptime }
    }

    #[inline]
    pub fn delete(key: &'a [u8]) -> Self {
        Request::Delete { key }
    }

    #[inline]
    pub fn incr(key: &'a [u8], delta: u64) -> Self {
        Request::Incr { key, delta }
    }

    #[inline]
    pub fn decr(key: &'a [u8], delta: u64) -> Self {
        Request::Decr { key, delta }
    }

    #[inline]
    pub fn stats(group: Option<&'a [u8]>) -> Self {
        Request::Stats { group }
    }

    #[inline]
    pub fn flush_all(delay: u32) -> Self {
        Request::FlushAll { delay }
    }

    /// The key this request operates on, if it has exactly one.
    pub fn key(&self) -> Option<&'a [u8]> {
        match self {
            Request::Store { key, .. }
            | Request::Cas { key, .. }
            | Request::Touch { key, .. }
            | Request::Delete { key }
            | Request::Incr { key, .. }
            | Request::Decr { key, .. } => Some(*key),
            Request::Retrieve { keys, .. } if keys.len() == 1 => Some(keys[0]),
            _ => None,
        }
    }

    /// How the server frames the reply to this request.
    pub fn reply_kind(&self) -> ReplyKind {
        match self {
            Request::Retrieve { .. } => ReplyKind::Values,
            Request::Stats { .. } => ReplyKind::Stats,
            Request::CacheDump { .. } => ReplyKind::CacheDump,
            Request::MetaDump => ReplyKind::MetaDump,
            Request::Quit => ReplyKind::None,
            _ => ReplyKind::Line,
        }
    }

    /// Exact number of bytes [`encode`](Self::encode) writes.
    pub fn encoded_len(&self) -> usize {
        let mut counter = Counter(0);
        self.write_to(&mut counter);
        counter.0
    }

    /// Encode this request into a buffer.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`encoded_len`](Self::encoded_len).
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut writer = SliceWriter { buf, pos: 0 };
        self.write_to(&mut writer);
        writer.pos
    }

    /// Encode into a freshly allocated buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        let len = self.encode(&mut buf);
        buf.truncate(len);
        buf
    }

    fn write_to<S: Sink>(&self, out: &mut S) {
        match self {
            Request::Retrieve {
                command,
                keys,
                exptime,
            } => {
                out.put(command.as_bytes());
                if command.touches() {
                    out.put(b" ");
                    out.put_num(u64::from(*exptime));
                }
                for key in keys {
                    out.put(b" ");
                    out.put(key);
                }
                out.put(b"\r\n");
            }
            Request::Store {
                command,
                key,
                value,
                flags,
                exptime,
            } => {
                out.put(command.as_bytes());
                write_storage_head(out, key, *flags, *exptime, value.len());
                out.put(b"\r\n");
                out.put(value);
                out.put(b"\r\n");
            }
            Request::Cas {
                key,
                value,
                flags,
                exptime,
                cas_unique,
            } => {
                out.put(b"cas");
                write_storage_head(out, key, *flags, *exptime, value.len());
                out.put(b" ");
                out.put_num(*cas_unique);
                out.put(b"\r\n");
                out.put(value);
                out.put(b"\r\n");
            }
            Request::Touch { key, exptime } => {
                out.put(b"touch ");
                out.put(key);
                out.put(b" ");
                out.put_num(u64::from(*exptime));
                out.put(b"\r\n");
            }
            Request::Delete { key } => {
                out.put(b"delete ");
                out.put(key);
                out.put(b"\r\n");
            }
            Request::Incr { key, delta } => write_counter(out, b"incr ", key, *delta),
            Request::Decr { key, delta } => write_counter(out, b"decr ", key, *delta),
            Request::Stats { group } => {
                out.put(b"stats");
                if let Some(group) = group {
                    out.put(b" ");
                    out.put(group);
                }
                out.put(b"\r\n");
            }
            Request::CacheDump { slab, limit } => {
                out.put(b"stats cachedump ");
                out.put_num(u64::from(*slab));
                out.put(b" ");
                out.put_num(u64::from(*limit));
                out.put(b"\r\n");
            }
            Request::MetaDump => out.put(b"lru_crawler metadump all\r\n"),
            Request::FlushAll { delay } => {
                out.put(b"flush_all");
                if *delay > 0 {
                    out.put(b" ");
                    out.put_num(u64::from(*delay));
                }
                out.put(b"\r\n");
            }
            Request::Verbosity { level } => {
                out.put(b"verbosity ");
                out.put_num(u64::from(*level));
                out.put(b"\r\n");
            }
            Request::Version => out.put(b"version\r\n"),
            Request::Noop => out.put(b"mn\r\n"),
            Request::Quit => out.put(b"quit\r\n"),
        }
    }
}

/// Builder for storage requests with optional flags and exptime.
#[derive(Debug, Clone)]
pub struct StoreRequest<'a> {
    command: StoreCommand,
    key: &'a [u8],
    value: &'a [u8],
    flags: u32,
    exptime: u32,
}

impl<'a> StoreRequest<'a> {
    fn new(command: StoreCommand, key: &'a [u8], value: &'a [u8]) -> Self {
        Self {
            command,
            key,
            value,
            flags: 0,
            exptime: 0,
        }
    }

    #[inline]
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Expiration: seconds from now, or a unix timestamp past 30 days.
    #[inline]
    pub fn exptime(mut self, exptime: u32) -> Self {
        self.exptime = exptime;
        self
    }

    #[inline]
    pub fn build(self) -> Request<'a> {
        Request::Store {
            command: self.command,
            key: self.key,
            value: self.value,
            flags: self.flags,
            exptime: self.exptime,
        }
    }
}

// -- Output sinks ------------------------------------------------------------

trait Sink {
    fn put(&mut self, bytes: &[u8]);

    fn put_num(&mut self, n: u64) {
        let mut digits = itoa::Buffer::new();
        self.put(digits.format(n).as_bytes());
    }
}

struct Counter(usize);

impl Sink for Counter {
    #[inline]
    fn put(&mut self, bytes: &[u8]) {
        self.0 += bytes.len();
    }
}

struct SliceWriter<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl Sink for SliceWriter<'_> {
    #[inline]
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

/// ` <key> <flags> <exptime> <bytes>`
fn write_storage_head<S: Sink>(out: &mut S, key: &[u8], flags: u32, exptime: u32, len: usize) {
    out.put(b" ");
    out.put(key);
    out.put(b" ");
    out.put_num(u64::from(flags));
    out.put(b" ");
    out.put_num(u64::from(exptime));
    out.put(b" ");
    out.put_num(len as u64);
}

fn write_counter<S: Sink>(out: &mut S, cmd: &[u8], key: &[u8], delta: u64) {
    out.put(cmd);
    out.put(key);
    out.put(b" ");
    out.put_num(delta);
    out.put(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(req: &Request<'_>) -> Vec<u8> {
        let bytes = req.to_vec();
        assert_eq!(bytes.len(), req.encoded_len());
        bytes
    }

    #[test]
    fn test_encode_get() {
        assert_eq!(encoded(&Request::get(b"mykey")), b"get mykey\r\n");
    }

    #[test]
    fn test_encode_gets() {
        let keys: &[&[u8]] = &[b"key1", b"key2", b"key3"];
        assert_eq!(encoded(&Request::gets(keys)), b"gets key1 key2 key3\r\n");
        assert_eq!(
            encoded(&Request::get_multi(keys, false)),
            b"get key1 key2 key3\r\n"
        );
    }

    #[test]
    fn test_encode_gat() {
        let keys: &[&[u8]] = &[b"a", b"b"];
        assert_eq!(encoded(&Request::gat(300, keys, false)), b"gat 300 a b\r\n");
        assert_eq!(encoded(&Request::gat(0, keys, true)), b"gats 0 a b\r\n");
    }

    #[test]
    fn test_encode_storage_family() {
        let set = Request::set(b"k", b"hello").flags(2).exptime(30).build();
        assert_eq!(encoded(&set), b"set k 2 30 5\r\nhello\r\n");
        let add = Request::add(b"k", b"v").build();
        assert_eq!(encoded(&add), b"add k 0 0 1\r\nv\r\n");
        let replace = Request::replace(b"k", b"").build();
        assert_eq!(encoded(&replace), b"replace k 0 0 0\r\n\r\n");
        assert_eq!(
            encoded(&Request::append(b"k", b"xy")),
            b"append k 0 0 2\r\nxy\r\n"
        );
        assert_eq!(
            encoded(&Request::prepend(b"k", b"xy")),
            b"prepend k 0 0 2\r\nxy\r\n"
        );
    }

    #[test]
    fn test_encode_cas() {
        let req = Request::Cas {
            key: b"k",
            value: b"data",
            flags: 1,
            exptime: 0,
            cas_unique: 12345678901,
        };
        assert_eq!(encoded(&req), b"cas k 1 0 4 12345678901\r\ndata\r\n");
    }

    #[test]
    fn test_encode_single_key_commands() {
        assert_eq!(encoded(&Request::touch(b"k", 10)), b"touch k 10\r\n");
        assert_eq!(encoded(&Request::delete(b"k")), b"delete k\r\n");
        assert_eq!(encoded(&Request::incr(b"n", 1)), b"incr n 1\r\n");
        assert_eq!(
            encoded(&Request::decr(b"n", u64::MAX)),
            b"decr n 18446744073709551615\r\n"
        );
    }

    #[test]
    fn test_encode_admin_commands() {
        assert_eq!(encoded(&Request::stats(None)), b"stats\r\n");
        assert_eq!(encoded(&Request::stats(Some(b"items"))), b"stats items\r\n");
        assert_eq!(
            encoded(&Request::CacheDump { slab: 3, limit: 0 }),
            b"stats cachedump 3 0\r\n"
        );
        assert_eq!(encoded(&Request::MetaDump), b"lru_crawler metadump all\r\n");
        assert_eq!(encoded(&Request::flush_all(0)), b"flush_all\r\n");
        assert_eq!(encoded(&Request::flush_all(4)), b"flush_all 4\r\n");
        assert_eq!(encoded(&Request::Verbosity { level: 1 }), b"verbosity 1\r\n");
        assert_eq!(encoded(&Request::Version), b"version\r\n");
        assert_eq!(encoded(&Request::Noop), b"mn\r\n");
        assert_eq!(encoded(&Request::Quit), b"quit\r\n");
    }

    #[test]
    fn test_reply_kind() {
        assert_eq!(Request::get(b"k").reply_kind(), ReplyKind::Values);
        assert_eq!(Request::stats(None).reply_kind(), ReplyKind::Stats);
        assert_eq!(Request::MetaDump.reply_kind(), ReplyKind::MetaDump);
        assert_eq!(Request::Quit.reply_kind(), ReplyKind::None);
        assert_eq!(Request::delete(b"k").reply_kind(), ReplyKind::Line);
    }

    #[test]
    fn test_key() {
        assert_eq!(Request::delete(b"k").key(), Some(&b"k"[..]));
        assert_eq!(Request::get(b"one").key(), Some(&b"one"[..]));
        let keys: &[&[u8]] = &[b"a", b"b"];
        assert_eq!(Request::gets(keys).key(), None);
        assert_eq!(Request::Version.key(), None);
    }
}
