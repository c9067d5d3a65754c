//! In-process memcached stand-in for integration tests.
//!
//! Speaks enough of both protocols for the client: storage, retrieval
//! (including quiet binary gets), counters, `stats` with item listings,
//! flush, version, get-and-touch, and SASL on binary connections (`PLAIN`,
//! `LOGIN`, `ANONYMOUS`, `CRAM-MD5` and `DIGEST-MD5`). One thread per
//! connection; all connections share one item table.

#![allow(dead_code)]

/// Expand `fn name(protocol: Protocol)` scenarios into one test per protocol.
#[allow(unused_macros)]
macro_rules! both_protocols {
    ($($name:ident),* $(,)?) => {
        mod ascii {
            $(
                #[test]
                fn $name() {
                    super::$name(memcache_client::Protocol::Ascii);
                }
            )*
        }
        mod binary {
            $(
                #[test]
                fn $name() {
                    super::$name(memcache_client::Protocol::Binary);
                }
            )*
        }
    };
}

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use memcache_client::Credentials;
use memcache_client::sasl::{cram_md5_response, digest_md5_hash};
use parking_lot::Mutex;
use protocol_memcache::binary::{BinaryResponse, HEADER_SIZE, Header, Opcode, REQUEST_MAGIC, Status};

const NO_AUTO_CREATE: u32 = 0xffff_ffff;
const CHALLENGE: &[u8] = b"<1896.697170952@mock.memcached>";
const DIGEST_NONCE: &str = "OA6MG9tEQGm2hh";
const DIGEST_REALM: &str = "mock";
const DEFAULT_MECHANISMS: &str = "PLAIN CRAM-MD5";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub flags: u32,
    pub data: Vec<u8>,
    pub exptime: u32,
    pub cas: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

enum Stored {
    Stored(u64),
    NotStored,
    Exists,
    NotFound,
}

enum CounterError {
    Missing,
    NonNumeric,
}

#[derive(Default)]
struct State {
    items: BTreeMap<Vec<u8>, Entry>,
    next_cas: u64,
    flushes: Vec<u32>,
    verbosity: Option<u32>,
    /// Binary gets for these keys answer with the given status.
    faults: BTreeMap<Vec<u8>, Status>,
}

impl State {
    fn cas(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }

    fn store(
        &mut self,
        mode: Mode,
        key: &[u8],
        flags: u32,
        exptime: u32,
        data: Vec<u8>,
        cas: u64,
    ) -> Stored {
        let existing = self.items.get(key).cloned();
        if cas != 0 {
            match &existing {
                None => return Stored::NotFound,
                Some(entry) if entry.cas != cas => return Stored::Exists,
                Some(_) => {}
            }
        }
        let entry = match (mode, existing) {
            (Mode::Add, Some(_)) => return Stored::NotStored,
            (Mode::Replace | Mode::Append | Mode::Prepend, None) => return Stored::NotStored,
            (Mode::Append, Some(mut entry)) => {
                entry.data.extend_from_slice(&data);
                entry
            }
            (Mode::Prepend, Some(mut entry)) => {
                let mut joined = data;
                joined.extend_from_slice(&entry.data);
                entry.data = joined;
                entry
            }
            _ => Entry {
                flags,
                data,
                exptime,
                cas: 0,
            },
        };
        let cas = self.cas();
        self.items.insert(key.to_vec(), Entry { cas, ..entry });
        Stored::Stored(cas)
    }

    fn counter(&mut self, key: &[u8], delta: u64, increment: bool) -> Result<u64, CounterError> {
        let cas = self.cas();
        let entry = self.items.get_mut(key).ok_or(CounterError::Missing)?;
        let current: u64 = std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or(CounterError::NonNumeric)?;
        let next = if increment {
            current.wrapping_add(delta)
        } else {
            current.saturating_sub(delta)
        };
        entry.data = next.to_string().into_bytes();
        entry.cas = cas;
        Ok(next)
    }

    fn flush(&mut self, delay: u32) {
        self.flushes.push(delay);
        if delay == 0 {
            self.items.clear();
        }
    }
}

#[derive(Clone)]
struct Auth {
    username: String,
    password: String,
    /// Reply to `SASL_LIST_MECHS`; `None` answers `UnknownCommand`.
    mechanisms: Option<String>,
}

#[derive(Default)]
struct Session {
    authenticated: bool,
    login_user: bool,
    digest_verified: bool,
}

enum Flow {
    Reply(Vec<u8>),
    Close(Vec<u8>),
}

/// A running mock server. The listener lives as long as the test process.
pub struct MockServer {
    port: u16,
    state: Arc<Mutex<State>>,
    connections: Arc<AtomicUsize>,
}

impl MockServer {
    pub fn start() -> Self {
        Self::spawn(None)
    }

    /// Binary connections must authenticate with these credentials first.
    pub fn with_sasl(username: &str, password: &str) -> Self {
        Self::with_sasl_mechanisms(username, password, Some(DEFAULT_MECHANISMS))
    }

    /// Like [`with_sasl`](Self::with_sasl), advertising `mechanisms`. With
    /// `None` the mechanism listing itself fails.
    pub fn with_sasl_mechanisms(username: &str, password: &str, mechanisms: Option<&str>) -> Self {
        Self::spawn(Some(Auth {
            username: username.to_string(),
            password: password.to_string(),
            mechanisms: mechanisms.map(str::to_string),
        }))
    }

    fn spawn(auth: Option<Auth>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(State::default()));
        let connections = Arc::new(AtomicUsize::new(0));

        let shared = Arc::clone(&state);
        let accepted = Arc::clone(&connections);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                accepted.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&shared);
                let auth = auth.clone();
                thread::spawn(move || {
                    let _ = serve(stream, &state, auth.as_ref());
                });
            }
        });

        Self {
            port,
            state,
            connections,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn entry(&self, key: &str) -> Option<Entry> {
        self.state.lock().items.get(key.as_bytes()).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state
            .lock()
            .items
            .keys()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect()
    }

    pub fn insert(&self, key: &str, data: &[u8], flags: u32) {
        let mut state = self.state.lock();
        state.store(Mode::Set, key.as_bytes(), flags, 0, data.to_vec(), 0);
    }

    /// Make binary gets of `key` fail with `status`.
    pub fn fail_key(&self, key: &str, status: Status) {
        self.state.lock().faults.insert(key.as_bytes().to_vec(), status);
    }

    pub fn flushes(&self) -> Vec<u32> {
        self.state.lock().flushes.clone()
    }

    pub fn verbosity(&self) -> Option<u32> {
        self.state.lock().verbosity
    }
}

/// A port with nothing listening on it.
pub fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn serve(stream: TcpStream, state: &Mutex<State>, auth: Option<&Auth>) -> io::Result<()> {
    let mut out = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut session = Session {
        authenticated: auth.is_none(),
        ..Session::default()
    };
    loop {
        let first = match reader.fill_buf()? {
            [] => return Ok(()),
            [byte, ..] => *byte,
        };
        let flow = if first == REQUEST_MAGIC {
            binary(&mut reader, state, auth, &mut session)?
        } else {
            ascii(&mut reader, state)?
        };
        match flow {
            Flow::Reply(bytes) => out.write_all(&bytes)?,
            Flow::Close(bytes) => {
                out.write_all(&bytes)?;
                return Ok(());
            }
        }
    }
}

// -- ASCII -------------------------------------------------------------------

fn ascii(reader: &mut BufReader<TcpStream>, state: &Mutex<State>) -> io::Result<Flow> {
    let mut raw = Vec::new();
    reader.read_until(b'\n', &mut raw)?;
    let line = String::from_utf8_lossy(&raw).trim_end().to_string();
    let parts: Vec<&str> = line.split_whitespace().collect();

    let reply = match parts.as_slice() {
        [cmd @ ("get" | "gets"), keys @ ..] => {
            return Ok(Flow::Reply(values(state, keys, None, *cmd == "gets")));
        }
        [cmd @ ("gat" | "gats"), exptime, keys @ ..] => {
            let exptime = exptime.parse().unwrap_or(0);
            return Ok(Flow::Reply(values(state, keys, Some(exptime), *cmd == "gats")));
        }
        [cmd @ ("set" | "add" | "replace" | "append" | "prepend" | "cas"), key, flags, exptime, bytes, rest @ ..] => {
            let len: usize = bytes.parse().unwrap_or(0);
            let mut data = vec![0; len + 2];
            reader.read_exact(&mut data)?;
            data.truncate(len);
            let mode = match *cmd {
                "add" => Mode::Add,
                "replace" => Mode::Replace,
                "append" => Mode::Append,
                "prepend" => Mode::Prepend,
                _ => Mode::Set,
            };
            let cas = match *cmd {
                "cas" => rest.first().and_then(|c| c.parse().ok()).unwrap_or(0),
                _ => 0,
            };
            let outcome = state.lock().store(
                mode,
                key.as_bytes(),
                flags.parse().unwrap_or(0),
                exptime.parse().unwrap_or(0),
                data,
                cas,
            );
            match outcome {
                Stored::Stored(_) => "STORED\r\n".to_string(),
                Stored::NotStored => "NOT_STORED\r\n".to_string(),
                Stored::Exists => "EXISTS\r\n".to_string(),
                Stored::NotFound => "NOT_FOUND\r\n".to_string(),
            }
        }
        ["delete", key] => match state.lock().items.remove(key.as_bytes()) {
            Some(_) => "DELETED\r\n".to_string(),
            None => "NOT_FOUND\r\n".to_string(),
        },
        ["touch", key, exptime] => match state.lock().items.get_mut(key.as_bytes()) {
            Some(entry) => {
                entry.exptime = exptime.parse().unwrap_or(0);
                "TOUCHED\r\n".to_string()
            }
            None => "NOT_FOUND\r\n".to_string(),
        },
        [cmd @ ("incr" | "decr"), key, delta] => {
            let delta = delta.parse().unwrap_or(0);
            match state.lock().counter(key.as_bytes(), delta, *cmd == "incr") {
                Ok(value) => format!("{value}\r\n"),
                Err(CounterError::Missing) => "NOT_FOUND\r\n".to_string(),
                Err(CounterError::NonNumeric) => {
                    "CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_string()
                }
            }
        }
        ["stats"] => {
            let count = state.lock().items.len();
            format!("STAT pid 4242\r\nSTAT curr_items {count}\r\nEND\r\n")
        }
        ["stats", "items"] => {
            let count = state.lock().items.len();
            if count == 0 {
                "END\r\n".to_string()
            } else {
                format!("STAT items:1:number {count}\r\nSTAT items:1:age 10\r\nEND\r\n")
            }
        }
        ["stats", "cachedump", _, _] => {
            let state = state.lock();
            let mut out = String::new();
            for (key, entry) in &state.items {
                out.push_str(&format!(
                    "ITEM {} [{} b; 0 s]\r\n",
                    String::from_utf8_lossy(key),
                    entry.data.len()
                ));
            }
            out.push_str("END\r\n");
            out
        }
        ["lru_crawler", "metadump", "all"] => {
            let state = state.lock();
            let mut out = String::new();
            for (key, entry) in &state.items {
                out.push_str(&format!(
                    "key={} exp=-1 la=0 cas={} fetch=no cls=1 size={}\r\n",
                    String::from_utf8_lossy(key),
                    entry.cas,
                    entry.data.len()
                ));
            }
            out.push_str("END\r\n");
            out
        }
        ["version"] => "VERSION 1.6.21-mock\r\n".to_string(),
        ["flush_all"] => {
            state.lock().flush(0);
            "OK\r\n".to_string()
        }
        ["flush_all", delay] => {
            state.lock().flush(delay.parse().unwrap_or(0));
            "OK\r\n".to_string()
        }
        ["verbosity", level] => {
            state.lock().verbosity = level.parse().ok();
            "OK\r\n".to_string()
        }
        ["mn"] => "MN\r\n".to_string(),
        ["quit"] | [] => return Ok(Flow::Close(Vec::new())),
        _ => "ERROR\r\n".to_string(),
    };
    Ok(Flow::Reply(reply.into_bytes()))
}

/// `VALUE` blocks for the hits among `keys`, touching each when `exptime`
/// is given.
fn values(state: &Mutex<State>, keys: &[&str], exptime: Option<u32>, with_cas: bool) -> Vec<u8> {
    let mut state = state.lock();
    let mut out = Vec::new();
    for key in keys {
        let Some(entry) = state.items.get_mut(key.as_bytes()) else {
            continue;
        };
        if let Some(exptime) = exptime {
            entry.exptime = exptime;
        }
        let header = if with_cas {
            format!("VALUE {key} {} {} {}\r\n", entry.flags, entry.data.len(), entry.cas)
        } else {
            format!("VALUE {key} {} {}\r\n", entry.flags, entry.data.len())
        };
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&entry.data);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"END\r\n");
    out
}

// -- Binary ------------------------------------------------------------------

fn frame(opcode: Opcode, status: Status, opaque: u32, cas: u64, extras: &[u8], key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut response = BinaryResponse::new(opcode, status);
    response.header.opaque = opaque;
    response.header.cas = cas;
    response.extras = extras;
    response.key = key;
    response.value = value;
    response.to_vec()
}

fn error(opcode: Opcode, status: Status, opaque: u32) -> Vec<u8> {
    frame(opcode, status, opaque, 0, &[], &[], status.as_str().as_bytes())
}

fn be32(bytes: &[u8], at: usize) -> u32 {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0)
}

fn be64(bytes: &[u8], at: usize) -> u64 {
    (u64::from(be32(bytes, at)) << 32) | u64::from(be32(bytes, at + 4))
}

fn binary(
    reader: &mut BufReader<TcpStream>,
    state: &Mutex<State>,
    auth: Option<&Auth>,
    session: &mut Session,
) -> io::Result<Flow> {
    let mut head = [0u8; HEADER_SIZE];
    reader.read_exact(&mut head)?;
    let header = Header::parse_request(&head)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let mut body = vec![0; header.total_body_length as usize];
    reader.read_exact(&mut body)?;
    let (extras, rest) = body.split_at(usize::from(header.extras_length));
    let (key, value) = rest.split_at(usize::from(header.key_length));
    let op = header.opcode;
    let opaque = header.opaque;

    let open = matches!(
        op,
        Opcode::SaslListMechs | Opcode::SaslAuth | Opcode::SaslStep | Opcode::Version | Opcode::Quit
    );
    if !session.authenticated && !open {
        return Ok(Flow::Reply(error(op, Status::AuthError, opaque)));
    }

    let reply = match op {
        Opcode::Get | Opcode::GetQ | Opcode::GetK | Opcode::GetKQ => {
            let echoed: &[u8] = if matches!(op, Opcode::GetK | Opcode::GetKQ) {
                key
            } else {
                &[]
            };
            let state = state.lock();
            if let Some(&status) = state.faults.get(key) {
                return Ok(Flow::Reply(error(op, status, opaque)));
            }
            match state.items.get(key) {
                Some(entry) => frame(
                    op,
                    Status::NoError,
                    opaque,
                    entry.cas,
                    &entry.flags.to_be_bytes(),
                    echoed,
                    &entry.data,
                ),
                None if op.is_quiet() => Vec::new(),
                None => frame(
                    op,
                    Status::KeyNotFound,
                    opaque,
                    0,
                    &[],
                    echoed,
                    Status::KeyNotFound.as_str().as_bytes(),
                ),
            }
        }
        Opcode::Set | Opcode::Add | Opcode::Replace | Opcode::Append | Opcode::Prepend => {
            let mode = match op {
                Opcode::Add => Mode::Add,
                Opcode::Replace => Mode::Replace,
                Opcode::Append => Mode::Append,
                Opcode::Prepend => Mode::Prepend,
                _ => Mode::Set,
            };
            let outcome = state.lock().store(
                mode,
                key,
                be32(extras, 0),
                be32(extras, 4),
                value.to_vec(),
                header.cas,
            );
            match outcome {
                Stored::Stored(cas) => frame(op, Status::NoError, opaque, cas, &[], &[], &[]),
                Stored::NotStored => {
                    let status = match mode {
                        Mode::Add => Status::KeyExists,
                        Mode::Replace => Status::KeyNotFound,
                        _ => Status::ItemNotStored,
                    };
                    error(op, status, opaque)
                }
                Stored::Exists => error(op, Status::KeyExists, opaque),
                Stored::NotFound => error(op, Status::KeyNotFound, opaque),
            }
        }
        Opcode::Delete => match state.lock().items.remove(key) {
            Some(_) => frame(op, Status::NoError, opaque, 0, &[], &[], &[]),
            None => error(op, Status::KeyNotFound, opaque),
        },
        Opcode::Touch => match state.lock().items.get_mut(key) {
            Some(entry) => {
                entry.exptime = be32(extras, 0);
                frame(op, Status::NoError, opaque, entry.cas, &[], &[], &[])
            }
            None => error(op, Status::KeyNotFound, opaque),
        },
        Opcode::Increment | Opcode::Decrement => {
            let (delta, initial, exptime) = (be64(extras, 0), be64(extras, 8), be32(extras, 16));
            let mut state = state.lock();
            match state.counter(key, delta, op == Opcode::Increment) {
                Ok(n) => frame(op, Status::NoError, opaque, 0, &[], &[], &n.to_be_bytes()),
                Err(CounterError::NonNumeric) => error(op, Status::NonNumericValue, opaque),
                Err(CounterError::Missing) if exptime == NO_AUTO_CREATE => {
                    error(op, Status::KeyNotFound, opaque)
                }
                Err(CounterError::Missing) => {
                    state.store(Mode::Add, key, 0, exptime, initial.to_string().into_bytes(), 0);
                    frame(op, Status::NoError, opaque, 0, &[], &[], &initial.to_be_bytes())
                }
            }
        }
        Opcode::Stat => {
            let count = state.lock().items.len().to_string();
            let mut out = Vec::new();
            let stats: Vec<(&[u8], &[u8])> = match key {
                b"items" => vec![(&b"items:1:number"[..], count.as_bytes())],
                _ => vec![(&b"pid"[..], &b"4242"[..]), (&b"curr_items"[..], count.as_bytes())],
            };
            for (name, val) in stats {
                out.extend(frame(op, Status::NoError, opaque, 0, &[], name, val));
            }
            out.extend(frame(op, Status::NoError, opaque, 0, &[], &[], &[]));
            out
        }
        Opcode::Version => frame(op, Status::NoError, opaque, 0, &[], &[], b"1.6.21-mock"),
        Opcode::Flush => {
            state.lock().flush(be32(extras, 0));
            frame(op, Status::NoError, opaque, 0, &[], &[], &[])
        }
        Opcode::Verbosity => {
            state.lock().verbosity = Some(be32(extras, 0));
            frame(op, Status::NoError, opaque, 0, &[], &[], &[])
        }
        Opcode::Noop => frame(op, Status::NoError, opaque, 0, &[], &[], &[]),
        Opcode::Quit => {
            return Ok(Flow::Close(frame(op, Status::NoError, opaque, 0, &[], &[], &[])));
        }
        Opcode::SaslListMechs => match auth.and_then(|a| a.mechanisms.as_deref()) {
            Some(list) => frame(op, Status::NoError, opaque, 0, &[], &[], list.as_bytes()),
            None => error(op, Status::UnknownCommand, opaque),
        },
        Opcode::SaslAuth | Opcode::SaslStep => sasl(op, key, value, opaque, auth, session),
        Opcode::Gat => match state.lock().items.get_mut(key) {
            Some(entry) => {
                entry.exptime = be32(extras, 0);
                frame(op, Status::NoError, opaque, entry.cas, &entry.flags.to_be_bytes(), &[], &entry.data)
            }
            None => error(op, Status::KeyNotFound, opaque),
        },
    };
    Ok(Flow::Reply(reply))
}

fn sasl(
    op: Opcode,
    mechanism: &[u8],
    payload: &[u8],
    opaque: u32,
    auth: Option<&Auth>,
    session: &mut Session,
) -> Vec<u8> {
    let Some(auth) = auth else {
        return error(op, Status::UnknownCommand, opaque);
    };
    let accepted = match (op, mechanism) {
        (Opcode::SaslAuth, b"PLAIN") => {
            let mut expected = vec![0];
            expected.extend_from_slice(auth.username.as_bytes());
            expected.push(0);
            expected.extend_from_slice(auth.password.as_bytes());
            payload == expected.as_slice()
        }
        (Opcode::SaslAuth, b"CRAM-MD5") => {
            return frame(op, Status::AuthContinue, opaque, 0, &[], &[], CHALLENGE);
        }
        (Opcode::SaslStep, b"CRAM-MD5") => {
            let expected = cram_md5_response(&auth.username, &auth.password, CHALLENGE);
            payload == expected.as_bytes()
        }
        (Opcode::SaslAuth, b"ANONYMOUS") => true,
        (Opcode::SaslAuth, b"LOGIN") => {
            session.login_user = payload == auth.username.as_bytes();
            if session.login_user {
                return frame(op, Status::AuthContinue, opaque, 0, &[], &[], b"Password:");
            }
            false
        }
        (Opcode::SaslStep, b"LOGIN") => session.login_user && payload == auth.password.as_bytes(),
        (Opcode::SaslAuth, b"DIGEST-MD5") => {
            let challenge = format!(
                "realm=\"{DIGEST_REALM}\",nonce=\"{DIGEST_NONCE}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess"
            );
            return frame(op, Status::AuthContinue, opaque, 0, &[], &[], challenge.as_bytes());
        }
        // the closing empty step after rspauth
        (Opcode::SaslStep, b"DIGEST-MD5") if payload.is_empty() => session.digest_verified,
        (Opcode::SaslStep, b"DIGEST-MD5") => {
            if digest_matches(auth, &String::from_utf8_lossy(payload)) {
                session.digest_verified = true;
                return frame(op, Status::AuthContinue, opaque, 0, &[], &[], b"rspauth=ok");
            }
            false
        }
        _ => false,
    };
    if accepted {
        session.authenticated = true;
        frame(op, Status::NoError, opaque, 0, &[], &[], b"Authenticated")
    } else {
        frame(op, Status::AuthError, opaque, 0, &[], &[], b"Auth failure")
    }
}

fn directive<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    text.split(',').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key.trim() == name).then(|| value.trim().trim_matches('"'))
    })
}

/// Recompute the client's DIGEST-MD5 `response` from its own directives.
fn digest_matches(auth: &Auth, reply: &str) -> bool {
    let fields = (
        directive(reply, "username"),
        directive(reply, "nonce"),
        directive(reply, "cnonce"),
        directive(reply, "digest-uri"),
        directive(reply, "response"),
    );
    let (Some(username), Some(nonce), Some(cnonce), Some(uri), Some(response)) = fields else {
        return false;
    };
    let credentials = Credentials::new(auth.username.as_str(), auth.password.as_str());
    username == auth.username
        && nonce == DIGEST_NONCE
        && directive(reply, "realm") == Some(DIGEST_REALM)
        && response == digest_md5_hash(&credentials, DIGEST_REALM, DIGEST_NONCE, cnonce, uri)
}
