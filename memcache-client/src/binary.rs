//! Binary protocol driver.
//!
//! Batches are pipelined: every frame of a batch is written before the
//! first reply is read, and replies are matched back by their opaque, which
//! carries the request's position in the batch.

use bytes::Bytes;
use protocol_memcache::binary::{BinaryRequest, BinaryResponse, Opcode, Status};

use crate::connection::{Connection, Item, Store, StoreMode};
use crate::error::{Error, Result};

/// Counter expiry that stops the server from creating missing counters.
const NO_AUTO_CREATE: u32 = 0xffff_ffff;

/// An owned response frame.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub opcode: Opcode,
    pub status: Status,
    pub opaque: u32,
    pub cas: u64,
    pub flags: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    counter: Option<u64>,
    message: String,
}

impl Frame {
    fn from_response(response: &BinaryResponse<'_>) -> Self {
        let status = response.status();
        Self {
            opcode: response.opcode(),
            status,
            opaque: response.opaque(),
            cas: response.cas(),
            flags: response.flags(),
            key: response.key.to_vec(),
            value: response.value.to_vec(),
            counter: response.counter().ok(),
            message: if status.is_success() {
                String::new()
            } else {
                response.error_message()
            },
        }
    }

    /// `Ok` for a success status, the mapped error otherwise.
    pub fn check(&self) -> Result<()> {
        if self.status.is_success() {
            Ok(())
        } else {
            Err(Error::from_status(self.status, self.message.clone()))
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub(crate) fn send(conn: &mut Connection, request: &BinaryRequest<'_>) -> Result<()> {
    conn.send(&request.to_vec())
}

pub(crate) fn read(conn: &mut Connection) -> Result<Frame> {
    conn.receive(|data| {
        BinaryResponse::parse(data).map(|(response, n)| (Frame::from_response(&response), n))
    })
}

fn execute(conn: &mut Connection, request: &BinaryRequest<'_>) -> Result<Frame> {
    send(conn, request)?;
    let frame = read(conn)?;
    if frame.opcode != request.opcode() {
        return Err(Error::Protocol(format!(
            "reply opcode {:?} does not match request {:?}",
            frame.opcode,
            request.opcode()
        )));
    }
    Ok(frame)
}

/// Reject replies that move backwards or past the end of the batch.
fn check_opaque(opaque: u32, last: Option<u32>, batch: usize) -> Result<usize> {
    let position = opaque as usize;
    if position >= batch || last.is_some_and(|last| opaque <= last) {
        return Err(Error::Protocol(format!(
            "reply opaque {opaque} out of order (previous {last:?}, batch of {batch})"
        )));
    }
    Ok(position)
}

fn opaque(i: usize) -> u32 {
    i as u32
}

// -- Retrieval ---------------------------------------------------------------

/// Quiet `GETKQ` for all but the last key, `GETK` for the last. Misses on
/// the quiet frames produce no reply at all.
///
/// An error status fails the whole batch, but only after the pipeline has
/// been read up to the final `GETK` so the connection stays in step.
pub(crate) fn get_multi(conn: &mut Connection, keys: &[&[u8]]) -> Result<Vec<Option<Item>>> {
    let mut wire = Vec::new();
    let last = keys.len() - 1;
    for (i, key) in keys.iter().enumerate() {
        let request = if i == last {
            BinaryRequest::getk(key)
        } else {
            BinaryRequest::getkq(key)
        };
        request.opaque(opaque(i)).encode_into(&mut wire);
    }
    conn.send(&wire)?;

    let mut items = vec![None; keys.len()];
    let mut failure = None;
    let mut previous = None;
    loop {
        let frame = read(conn)?;
        if !matches!(frame.opcode, Opcode::GetK | Opcode::GetKQ) {
            return Err(Error::Protocol(format!(
                "unexpected {:?} reply inside a multi-get",
                frame.opcode
            )));
        }
        let position = check_opaque(frame.opaque, previous, keys.len())?;
        previous = Some(frame.opaque);

        match frame.status {
            Status::NoError => {
                items[position] = Some(Item {
                    flags: frame.flags,
                    data: Bytes::from(frame.value),
                    cas: frame.cas,
                });
            }
            Status::KeyNotFound => {}
            status => {
                failure.get_or_insert_with(|| Error::from_status(status, frame.message));
            }
        }
        if position == last {
            return match failure {
                Some(e) => Err(e),
                None => Ok(items),
            };
        }
    }
}

/// `GAT` answers like `GET`, with the flags in the extras.
pub(crate) fn get_and_touch(conn: &mut Connection, key: &[u8], exptime: u32) -> Result<Option<Item>> {
    let frame = execute(conn, &BinaryRequest::gat(key, exptime))?;
    if frame.status == Status::KeyNotFound {
        return Ok(None);
    }
    frame.check()?;
    Ok(Some(Item {
        flags: frame.flags,
        data: Bytes::from(frame.value),
        cas: frame.cas,
    }))
}

// -- Storage -----------------------------------------------------------------

fn store_request<'a>(op: &Store<'a>) -> BinaryRequest<'a> {
    match op.mode {
        StoreMode::Set => BinaryRequest::set(op.key, op.data, op.flags, op.exptime),
        StoreMode::Add => BinaryRequest::add(op.key, op.data, op.flags, op.exptime),
        StoreMode::Replace => BinaryRequest::replace(op.key, op.data, op.flags, op.exptime),
        StoreMode::Append => BinaryRequest::append(op.key, op.data),
        StoreMode::Prepend => BinaryRequest::prepend(op.key, op.data),
        StoreMode::Cas(cas) => BinaryRequest::set(op.key, op.data, op.flags, op.exptime).cas(cas),
    }
}

pub(crate) fn store(conn: &mut Connection, op: &Store<'_>) -> Result<()> {
    execute(conn, &store_request(op))?.check()
}

/// Send every request, then read one reply per request in order.
fn pipeline<'a>(
    conn: &mut Connection,
    requests: impl Iterator<Item = BinaryRequest<'a>>,
) -> Result<Vec<Result<()>>> {
    let mut wire = Vec::new();
    let mut count = 0;
    for (i, request) in requests.enumerate() {
        request.opaque(opaque(i)).encode_into(&mut wire);
        count += 1;
    }
    conn.send(&wire)?;

    let mut outcomes = Vec::with_capacity(count);
    let mut previous = None;
    for _ in 0..count {
        let frame = read(conn)?;
        check_opaque(frame.opaque, previous, count)?;
        if frame.opaque as usize != outcomes.len() {
            return Err(Error::Protocol(format!(
                "missing reply for request {}",
                outcomes.len()
            )));
        }
        previous = Some(frame.opaque);
        outcomes.push(frame.check());
    }
    Ok(outcomes)
}

pub(crate) fn store_many(conn: &mut Connection, ops: &[Store<'_>]) -> Result<Vec<Result<()>>> {
    pipeline(conn, ops.iter().map(store_request))
}

// -- Key commands ------------------------------------------------------------

pub(crate) fn delete(conn: &mut Connection, key: &[u8]) -> Result<()> {
    execute(conn, &BinaryRequest::delete(key))?.check()
}

pub(crate) fn delete_many(conn: &mut Connection, keys: &[&[u8]]) -> Result<Vec<Result<()>>> {
    pipeline(conn, keys.iter().map(|key| BinaryRequest::delete(key)))
}

pub(crate) fn touch(conn: &mut Connection, key: &[u8], exptime: u32) -> Result<()> {
    execute(conn, &BinaryRequest::touch(key, exptime))?.check()
}

pub(crate) fn counter(conn: &mut Connection, key: &[u8], delta: u64, increment: bool) -> Result<u64> {
    let opcode = if increment {
        Opcode::Increment
    } else {
        Opcode::Decrement
    };
    let frame = execute(
        conn,
        &BinaryRequest::counter(opcode, key, delta, 0, NO_AUTO_CREATE),
    )?;
    frame.check()?;
    frame
        .counter
        .ok_or_else(|| Error::Protocol("counter value is not 8 bytes".into()))
}

// -- Server commands ---------------------------------------------------------

/// Stat replies arrive one per frame, ending with an empty key.
pub(crate) fn stats(conn: &mut Connection, group: Option<&str>) -> Result<Vec<(String, String)>> {
    send(conn, &BinaryRequest::stat(group.map(str::as_bytes)))?;
    let mut stats = Vec::new();
    loop {
        let frame = read(conn)?;
        if frame.opcode != Opcode::Stat {
            return Err(Error::Protocol(format!(
                "unexpected {:?} reply inside stats",
                frame.opcode
            )));
        }
        frame.check()?;
        if frame.key.is_empty() {
            return Ok(stats);
        }
        stats.push((
            String::from_utf8_lossy(&frame.key).into_owned(),
            String::from_utf8_lossy(&frame.value).into_owned(),
        ));
    }
}

pub(crate) fn version(conn: &mut Connection) -> Result<String> {
    let frame = execute(conn, &BinaryRequest::version())?;
    frame.check()?;
    Ok(String::from_utf8_lossy(&frame.value).into_owned())
}

pub(crate) fn flush(conn: &mut Connection, delay: u32) -> Result<()> {
    execute(conn, &BinaryRequest::flush(delay))?.check()
}

pub(crate) fn verbosity(conn: &mut Connection, level: u32) -> Result<()> {
    execute(conn, &BinaryRequest::verbosity(level))?.check()
}
