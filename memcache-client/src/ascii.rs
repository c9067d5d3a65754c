//! ASCII protocol driver.
//!
//! Each function encodes with [`protocol_memcache::Request`], sends, and
//! classifies the parsed [`Response`]. Error lines surface as
//! [`Error::Protocol`] carrying the raw line.

use std::collections::HashMap;

use bytes::Bytes;
use protocol_memcache::{ReplyKind, Request, Response, StoreCommand, Value};
use tracing::debug;

use crate::connection::{Connection, Item, Store, StoreMode};
use crate::error::{Error, Result};

fn execute(conn: &mut Connection, request: &Request<'_>) -> Result<Response> {
    conn.send(&request.to_vec())?;
    read(conn, request.reply_kind())
}

fn read(conn: &mut Connection, kind: ReplyKind) -> Result<Response> {
    let response = conn.receive(|data| Response::parse_reply(kind, data))?;
    check_error(&response)?;
    Ok(response)
}

fn check_error(response: &Response) -> Result<()> {
    match response.error_line() {
        Some(line) => Err(Error::Protocol(line)),
        None => Ok(()),
    }
}

fn unexpected(what: &str, response: &Response) -> Error {
    Error::Protocol(format!("unexpected reply to {what}: {response:?}"))
}

// -- Retrieval ---------------------------------------------------------------

/// Send a retrieval command and collect its `VALUE` blocks.
fn retrieve(conn: &mut Connection, request: &Request<'_>, what: &str) -> Result<Vec<Value>> {
    conn.send(&request.to_vec())?;
    let response = conn.receive_values()?;
    check_error(&response)?;
    match response {
        Response::Values(values) => Ok(values),
        other => Err(unexpected(what, &other)),
    }
}

fn item(value: Value) -> Item {
    Item {
        flags: value.flags,
        data: Bytes::from(value.data),
        cas: value.cas.unwrap_or(0),
    }
}

pub(crate) fn get_multi(
    conn: &mut Connection,
    keys: &[&[u8]],
    with_cas: bool,
) -> Result<Vec<Option<Item>>> {
    let values = retrieve(conn, &Request::get_multi(keys, with_cas), "get")?;

    let mut positions: HashMap<&[u8], Vec<usize>> = HashMap::with_capacity(keys.len());
    for (i, key) in keys.iter().enumerate() {
        positions.entry(*key).or_default().push(i);
    }

    let mut items = vec![None; keys.len()];
    for value in values {
        let Some(slots) = positions.get(value.key.as_slice()) else {
            debug!(peer = %conn.peer(), "ignoring value for unrequested key");
            continue;
        };
        let item = item(value);
        for &slot in slots {
            items[slot] = Some(item.clone());
        }
    }
    Ok(items)
}

/// `gat`/`gats` for a single key.
pub(crate) fn get_and_touch(
    conn: &mut Connection,
    key: &[u8],
    exptime: u32,
    with_cas: bool,
) -> Result<Option<Item>> {
    let values = retrieve(conn, &Request::gat(exptime, &[key], with_cas), "gat")?;
    Ok(values.into_iter().find(|value| value.key == key).map(item))
}

// -- Storage -----------------------------------------------------------------

fn store_request<'a>(op: &Store<'a>) -> Request<'a> {
    let command = match op.mode {
        StoreMode::Cas(cas_unique) => {
            return Request::Cas {
                key: op.key,
                value: op.data,
                flags: op.flags,
                exptime: op.exptime,
                cas_unique,
            };
        }
        StoreMode::Set => StoreCommand::Set,
        StoreMode::Add => StoreCommand::Add,
        StoreMode::Replace => StoreCommand::Replace,
        StoreMode::Append => StoreCommand::Append,
        StoreMode::Prepend => StoreCommand::Prepend,
    };
    Request::Store {
        command,
        key: op.key,
        value: op.data,
        flags: op.flags,
        exptime: op.exptime,
    }
}

fn store_outcome(mode: StoreMode, response: &Response) -> Result<()> {
    match (mode, response) {
        (_, Response::Stored) => Ok(()),
        (StoreMode::Add, Response::NotStored) => Err(Error::Exists),
        (StoreMode::Cas(_), Response::Exists) => Err(Error::Exists),
        (StoreMode::Cas(_), Response::NotFound) => Err(Error::NotFound),
        _ => Err(Error::NotStored),
    }
}

pub(crate) fn store(conn: &mut Connection, op: &Store<'_>) -> Result<()> {
    let response = execute(conn, &store_request(op))?;
    store_outcome(op.mode, &response)
}

pub(crate) fn store_many(conn: &mut Connection, ops: &[Store<'_>]) -> Result<Vec<Result<()>>> {
    let mut wire = Vec::new();
    for op in ops {
        wire.extend_from_slice(&store_request(op).to_vec());
    }
    conn.send(&wire)?;

    let mut outcomes = Vec::with_capacity(ops.len());
    for op in ops {
        let response = conn.receive(|data| Response::parse_reply(ReplyKind::Line, data))?;
        outcomes.push(check_error(&response).and_then(|()| store_outcome(op.mode, &response)));
    }
    Ok(outcomes)
}

// -- Key commands ------------------------------------------------------------

fn delete_outcome(response: &Response) -> Result<()> {
    match response {
        Response::Deleted => Ok(()),
        Response::NotFound => Err(Error::NotFound),
        other => Err(unexpected("delete", other)),
    }
}

pub(crate) fn delete(conn: &mut Connection, key: &[u8]) -> Result<()> {
    let response = execute(conn, &Request::delete(key))?;
    delete_outcome(&response)
}

pub(crate) fn delete_many(conn: &mut Connection, keys: &[&[u8]]) -> Result<Vec<Result<()>>> {
    let mut wire = Vec::new();
    for key in keys {
        wire.extend_from_slice(&Request::delete(key).to_vec());
    }
    conn.send(&wire)?;

    let mut outcomes = Vec::with_capacity(keys.len());
    for _ in keys {
        let response = conn.receive(|data| Response::parse_reply(ReplyKind::Line, data))?;
        outcomes.push(check_error(&response).and_then(|()| delete_outcome(&response)));
    }
    Ok(outcomes)
}

pub(crate) fn touch(conn: &mut Connection, key: &[u8], exptime: u32) -> Result<()> {
    match execute(conn, &Request::touch(key, exptime))? {
        Response::Touched => Ok(()),
        Response::NotFound => Err(Error::NotFound),
        other => Err(unexpected("touch", &other)),
    }
}

pub(crate) fn counter(conn: &mut Connection, key: &[u8], delta: u64, increment: bool) -> Result<u64> {
    let request = if increment {
        Request::incr(key, delta)
    } else {
        Request::decr(key, delta)
    };
    match execute(conn, &request)? {
        Response::Numeric(n) => Ok(n),
        Response::NotFound => Err(Error::NotFound),
        other => Err(unexpected("incr/decr", &other)),
    }
}

// -- Server commands ---------------------------------------------------------

pub(crate) fn stats(conn: &mut Connection, group: Option<&str>) -> Result<Vec<(String, String)>> {
    match execute(conn, &Request::stats(group.map(str::as_bytes)))? {
        Response::Stats(stats) => Ok(stats),
        other => Err(unexpected("stats", &other)),
    }
}

pub(crate) fn version(conn: &mut Connection) -> Result<String> {
    match execute(conn, &Request::Version)? {
        Response::Version(v) => Ok(String::from_utf8_lossy(&v).into_owned()),
        other => Err(unexpected("version", &other)),
    }
}

fn expect_ok(conn: &mut Connection, request: &Request<'_>, what: &str) -> Result<()> {
    match execute(conn, request)? {
        Response::Ok => Ok(()),
        other => Err(unexpected(what, &other)),
    }
}

pub(crate) fn flush(conn: &mut Connection, delay: u32) -> Result<()> {
    expect_ok(conn, &Request::flush_all(delay), "flush_all")
}

pub(crate) fn verbosity(conn: &mut Connection, level: u32) -> Result<()> {
    expect_ok(conn, &Request::Verbosity { level }, "verbosity")
}

// -- Key enumeration ---------------------------------------------------------

/// Slab classes holding items, with their item counts, from `stats items`.
pub(crate) fn slabs(conn: &mut Connection) -> Result<Vec<(u32, u32)>> {
    let mut slabs = Vec::new();
    for (name, value) in stats(conn, Some("items"))? {
        // items:<slab>:number <count>
        let mut parts = name.split(':');
        let (Some("items"), Some(slab), Some("number")) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if let (Ok(slab), Ok(count)) = (slab.parse(), value.trim().parse()) {
            slabs.push((slab, count));
        }
    }
    Ok(slabs)
}

/// Keys from `stats cachedump` for every populated slab.
pub(crate) fn cachedump_keys(conn: &mut Connection) -> Result<Vec<Vec<u8>>> {
    let mut keys = Vec::new();
    for (slab, limit) in slabs(conn)? {
        match execute(conn, &Request::CacheDump { slab, limit })? {
            Response::Keys(found) => keys.extend(found),
            Response::Stats(_) => {}
            other => return Err(unexpected("stats cachedump", &other)),
        }
    }
    Ok(keys)
}

/// Keys from `lru_crawler metadump all`.
pub(crate) fn metadump_keys(conn: &mut Connection) -> Result<Vec<Vec<u8>>> {
    match execute(conn, &Request::MetaDump)? {
        Response::Keys(keys) => Ok(keys),
        Response::Stats(_) => Ok(Vec::new()),
        other => Err(unexpected("lru_crawler metadump", &other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_outcomes() {
        assert_eq!(store_outcome(StoreMode::Set, &Response::Stored), Ok(()));
        assert_eq!(
            store_outcome(StoreMode::Add, &Response::NotStored),
            Err(Error::Exists)
        );
        assert_eq!(
            store_outcome(StoreMode::Replace, &Response::NotStored),
            Err(Error::NotStored)
        );
        assert_eq!(
            store_outcome(StoreMode::Cas(7), &Response::Exists),
            Err(Error::Exists)
        );
        assert_eq!(
            store_outcome(StoreMode::Cas(7), &Response::NotFound),
            Err(Error::NotFound)
        );
        assert_eq!(
            store_outcome(StoreMode::Append, &Response::NotStored),
            Err(Error::NotStored)
        );
    }

    #[test]
    fn test_store_request_forms() {
        let op = Store {
            mode: StoreMode::Cas(99),
            key: b"k",
            data: b"v",
            flags: 1,
            exptime: 5,
        };
        assert_eq!(store_request(&op).to_vec(), b"cas k 1 5 1 99\r\nv\r\n");
        let op = Store {
            mode: StoreMode::Prepend,
            ..op
        };
        assert_eq!(store_request(&op).to_vec(), b"prepend k 1 5 1\r\nv\r\n");
    }

    #[test]
    fn test_error_lines_are_protocol_errors() {
        let err = check_error(&Response::ServerError(b"out of memory".to_vec())).unwrap_err();
        assert_eq!(err, Error::Protocol("SERVER_ERROR out of memory".into()));
        assert!(check_error(&Response::Stored).is_ok());
    }
}
