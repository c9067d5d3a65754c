//! Blocking connection to one memcached server.
//!
//! A [`Connection`] owns the socket and a read buffer. Protocol drivers in
//! [`ascii`](crate::ascii) and [`binary`](crate::binary) write whole requests
//! (or whole pipelines) with [`Connection::send`] and pull replies out of
//! the buffer with [`Connection::receive`], which keeps reading until the
//! sans-IO parser stops answering `Incomplete`.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use bytes::{Buf, Bytes, BytesMut};
use protocol_memcache::{ParseError, Response, ValueReader};
use tracing::debug;

use crate::config::{Config, Protocol};
use crate::error::{Error, Result};
use crate::{ascii, binary};

/// Upper bound on a single read syscall.
const READ_CHUNK: usize = 8192;

// -- Operation types ---------------------------------------------------------

/// A raw item as stored on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub flags: u32,
    pub data: Bytes,
    /// CAS unique token; 0 when not requested.
    pub cas: u64,
}

/// Storage semantics for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    /// Compare-and-swap against the given token.
    Cas(u64),
}

/// One write, borrowed from the caller.
#[derive(Debug, Clone, Copy)]
pub struct Store<'a> {
    pub mode: StoreMode,
    pub key: &'a [u8],
    pub data: &'a [u8],
    pub flags: u32,
    pub exptime: u32,
}

// -- Connection --------------------------------------------------------------

pub struct Connection {
    stream: TcpStream,
    buf: BytesMut,
    protocol: Protocol,
    peer: String,
}

impl Connection {
    /// Open a connection with the timeouts and socket options from `config`.
    pub fn connect(host: &str, port: u16, config: &Config) -> Result<Self> {
        Self::connect_with(host, port, config, config.protocol)
    }

    /// Like [`connect`](Self::connect), forcing the wire protocol.
    pub fn connect_with(host: &str, port: u16, config: &Config, protocol: Protocol) -> Result<Self> {
        let peer = format!("{host}:{port}");
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Connection(format!("{peer}: {e}")))?
            .collect();

        let mut last_err = None;
        let mut stream = None;
        for addr in &addrs {
            let attempt = match config.connect_timeout() {
                Some(timeout) => TcpStream::connect_timeout(addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = match (stream, last_err) {
            (Some(stream), _) => stream,
            (None, Some(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(Error::Timeout(format!("connect {peer}: {e}")));
            }
            (None, Some(e)) => return Err(Error::Connection(format!("{peer}: {e}"))),
            (None, None) => {
                return Err(Error::Connection(format!("{peer}: no addresses resolved")));
            }
        };

        let setup = |stream: &TcpStream| -> std::io::Result<()> {
            stream.set_read_timeout(config.recv_timeout())?;
            stream.set_write_timeout(config.send_timeout())?;
            stream.set_nodelay(config.tcp_nodelay)
        };
        setup(&stream).map_err(|e| Error::Connection(format!("{peer}: {e}")))?;

        debug!(peer = %peer, protocol = ?protocol, "connected");
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            protocol,
            peer,
        })
    }

    #[inline]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write a complete request or pipeline.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).map_err(Error::write)?;
        self.stream.flush().map_err(Error::write)
    }

    /// Read until `parse` recognizes a complete reply, then consume it.
    pub fn receive<T>(
        &mut self,
        mut parse: impl FnMut(&[u8]) -> std::result::Result<(T, usize), ParseError>,
    ) -> Result<T> {
        loop {
            if !self.buf.is_empty() {
                match parse(&self.buf) {
                    Ok((reply, consumed)) => {
                        self.buf.advance(consumed);
                        return Ok(reply);
                    }
                    Err(e) if e.is_incomplete() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.fill()?;
        }
    }

    /// Read a retrieval reply, keeping each `VALUE` block as soon as it is
    /// complete so earlier blocks are never scanned again.
    pub fn receive_values(&mut self) -> Result<Response> {
        let mut reader = ValueReader::new();
        loop {
            if !self.buf.is_empty() && self.buf.len() >= reader.wanted() {
                let (done, consumed) = reader.feed(&self.buf)?;
                self.buf.advance(consumed);
                if let Some(response) = done {
                    return Ok(response);
                }
            }
            let short = reader.wanted().saturating_sub(self.buf.len());
            self.buf.reserve(short);
            self.fill()?;
        }
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk).map_err(Error::read)?;
        if n == 0 {
            return Err(Error::ReadFailure(format!("{}: connection closed", self.peer)));
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    // -- Commands -------------------------------------------------------------

    /// Positional multi-get; `None` marks a miss.
    pub fn get_multi(&mut self, keys: &[&[u8]], with_cas: bool) -> Result<Vec<Option<Item>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        debug!(peer = %self.peer, keys = keys.len(), "multi-get");
        match self.protocol {
            Protocol::Ascii => ascii::get_multi(self, keys, with_cas),
            Protocol::Binary => binary::get_multi(self, keys),
        }
    }

    /// Fetch one key and reset its expiry; `None` on a miss. The binary
    /// protocol always returns the CAS token.
    pub fn get_and_touch(&mut self, key: &[u8], exptime: u32, with_cas: bool) -> Result<Option<Item>> {
        match self.protocol {
            Protocol::Ascii => ascii::get_and_touch(self, key, exptime, with_cas),
            Protocol::Binary => binary::get_and_touch(self, key, exptime),
        }
    }

    pub fn store(&mut self, op: &Store<'_>) -> Result<()> {
        match self.protocol {
            Protocol::Ascii => ascii::store(self, op),
            Protocol::Binary => binary::store(self, op),
        }
    }

    /// Pipelined writes. The outer error means the connection failed and no
    /// per-write outcome is known.
    pub fn store_many(&mut self, ops: &[Store<'_>]) -> Result<Vec<Result<()>>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        debug!(peer = %self.peer, writes = ops.len(), "pipelined store");
        match self.protocol {
            Protocol::Ascii => ascii::store_many(self, ops),
            Protocol::Binary => binary::store_many(self, ops),
        }
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        match self.protocol {
            Protocol::Ascii => ascii::delete(self, key),
            Protocol::Binary => binary::delete(self, key),
        }
    }

    pub fn delete_many(&mut self, keys: &[&[u8]]) -> Result<Vec<Result<()>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        debug!(peer = %self.peer, keys = keys.len(), "pipelined delete");
        match self.protocol {
            Protocol::Ascii => ascii::delete_many(self, keys),
            Protocol::Binary => binary::delete_many(self, keys),
        }
    }

    pub fn touch(&mut self, key: &[u8], exptime: u32) -> Result<()> {
        match self.protocol {
            Protocol::Ascii => ascii::touch(self, key, exptime),
            Protocol::Binary => binary::touch(self, key, exptime),
        }
    }

    /// Increment or decrement an existing counter; `NotFound` when absent.
    pub fn counter(&mut self, key: &[u8], delta: u64, increment: bool) -> Result<u64> {
        match self.protocol {
            Protocol::Ascii => ascii::counter(self, key, delta, increment),
            Protocol::Binary => binary::counter(self, key, delta, increment),
        }
    }

    pub fn stats(&mut self, group: Option<&str>) -> Result<Vec<(String, String)>> {
        match self.protocol {
            Protocol::Ascii => ascii::stats(self, group),
            Protocol::Binary => binary::stats(self, group),
        }
    }

    pub fn version(&mut self) -> Result<String> {
        match self.protocol {
            Protocol::Ascii => ascii::version(self),
            Protocol::Binary => binary::version(self),
        }
    }

    pub fn flush(&mut self, delay: u32) -> Result<()> {
        match self.protocol {
            Protocol::Ascii => ascii::flush(self, delay),
            Protocol::Binary => binary::flush(self, delay),
        }
    }

    pub fn verbosity(&mut self, level: u32) -> Result<()> {
        match self.protocol {
            Protocol::Ascii => ascii::verbosity(self, level),
            Protocol::Binary => binary::verbosity(self, level),
        }
    }

    /// Ask the server to close the connection, consuming it.
    pub fn quit(mut self) {
        let frame = match self.protocol {
            Protocol::Ascii => protocol_memcache::Request::Quit.to_vec(),
            Protocol::Binary => protocol_memcache::binary::BinaryRequest::quit().to_vec(),
        };
        if let Err(e) = self.send(&frame) {
            debug!(peer = %self.peer, error = %e, "quit not delivered");
        }
        debug!(peer = %self.peer, "disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn pair(protocol: Protocol) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = thread::spawn(move || listener.accept().unwrap().0);
        let conn = Connection::connect_with("127.0.0.1", port, &Config::default(), protocol).unwrap();
        (conn, accept.join().unwrap())
    }

    #[test]
    fn test_receive_across_reads() {
        let (mut conn, mut server) = pair(Protocol::Ascii);
        let writer = thread::spawn(move || {
            server.write_all(b"VALUE k 0 5\r\nhel").unwrap();
            thread::sleep(std::time::Duration::from_millis(20));
            server.write_all(b"lo\r\nEND\r\nSTORED\r\n").unwrap();
            server
        });
        let items = conn.receive(protocol_memcache::Response::parse).unwrap();
        assert!(!items.is_miss());
        let next = conn.receive(protocol_memcache::Response::parse).unwrap();
        assert_eq!(next, protocol_memcache::Response::Stored);
        drop(writer.join().unwrap());
    }

    #[test]
    fn test_receive_values_in_small_writes() {
        let (mut conn, mut server) = pair(Protocol::Ascii);
        let mut wire = Vec::new();
        for i in 0..200 {
            let data = vec![b'a' + (i % 26) as u8; 1000];
            wire.extend_from_slice(format!("VALUE k{i} {i} 1000\r\n").as_bytes());
            wire.extend_from_slice(&data);
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(b"END\r\nSTORED\r\n");
        let writer = thread::spawn(move || {
            for piece in wire.chunks(777) {
                server.write_all(piece).unwrap();
            }
            server
        });

        let Response::Values(values) = conn.receive_values().unwrap() else {
            panic!("expected values");
        };
        assert_eq!(values.len(), 200);
        assert_eq!(values[199].key, b"k199");
        assert_eq!(values[199].flags, 199);
        assert!(values[27].data.iter().all(|&b| b == b'b'));
        assert_eq!(conn.receive(Response::parse).unwrap(), Response::Stored);
        drop(writer.join().unwrap());
    }

    #[test]
    fn test_receive_values_passes_status_lines() {
        let (mut conn, mut server) = pair(Protocol::Ascii);
        server.write_all(b"SERVER_ERROR busy\r\n").unwrap();
        assert_eq!(
            conn.receive_values().unwrap(),
            Response::ServerError(b"busy".to_vec())
        );
    }

    #[test]
    fn test_closed_peer_is_read_failure() {
        let (mut conn, server) = pair(Protocol::Ascii);
        drop(server);
        let err = conn.receive(protocol_memcache::Response::parse).unwrap_err();
        assert!(matches!(err, Error::ReadFailure(_)), "{err:?}");
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = Connection::connect("127.0.0.1", port, &Config::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Connection(_) | Error::Timeout(_)), "{err:?}");
    }

    #[test]
    fn test_empty_batches_skip_io() {
        let (mut conn, _server) = pair(Protocol::Binary);
        assert!(conn.get_multi(&[], false).unwrap().is_empty());
        assert!(conn.store_many(&[]).unwrap().is_empty());
        assert!(conn.delete_many(&[]).unwrap().is_empty());
    }
}
