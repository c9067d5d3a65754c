//! Server pool facade.
//!
//! [`ShardedClient`] owns the server pool and a [`Router`] mirroring it.
//! Every key-based operation resolves its owner through the router and runs
//! on that node's connection; `*_by_key` variants route by a separate
//! steering key so related entries can share a server. Batches group keys
//! by owner and serve distinct owners concurrently on scoped threads.
//!
//! # Example
//!
//! ```no_run
//! use memcache_client::{Config, ShardedClient};
//!
//! let mut client = ShardedClient::new(Config::default()).unwrap();
//! client.add_server("127.0.0.1", 11211, 1, true).unwrap();
//! client.add_server("127.0.0.1", 11212, 1, true).unwrap();
//!
//! client.set("greeting", "hello", 0).unwrap();
//! let value = client.get("greeting").unwrap();
//! assert_eq!(value.unwrap().as_str(), Some("hello"));
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use hashring::Router;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::ValueCodec;
use crate::config::{ClientOption, Config, Protocol};
use crate::connection::{Connection, Item, Store, StoreMode};
use crate::error::{Error, Result, ResultCode};
use crate::node::{ConnectOpts, Node};
use crate::sasl::Credentials;
use crate::value::{TypeTag, Value};
use crate::ascii;

/// Longest key memcached accepts, prefix included.
pub const MAX_KEY_LEN: usize = 250;

/// Expiry given to copies written to a key's new owner during migration.
pub const BRIDGE_TTL: u32 = 30;

/// Version reported for servers that could not be asked.
const UNKNOWN_VERSION: &str = "255.255.255";

// -- Public records ----------------------------------------------------------

/// A server in the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl ServerInfo {
    fn of(node: &Node) -> Self {
        Self {
            host: node.host().to_string(),
            port: node.port(),
            weight: node.weight(),
        }
    }

    /// `"host:port:weight"`.
    pub fn identity(&self) -> String {
        Node::identity_of(&self.host, self.port, self.weight)
    }
}

/// A record produced by a multi-get.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub key: String,
    pub value: Value,
    /// Present when the fetch asked for CAS tokens.
    pub cas: Option<u64>,
}

/// Outcome of moving keys after a topology change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Keys enumerated before the change.
    pub examined: usize,
    /// Keys copied to their new owner and removed from the old one.
    pub moved: usize,
    /// Keys whose owner changed but could not be copied.
    pub failed: usize,
    /// Payload bytes copied.
    pub bytes: usize,
}

/// Work assigned to one owner: `(position in the caller's list, wire key)`.
type Batch = Vec<(usize, Vec<u8>)>;

// -- Client ------------------------------------------------------------------

/// A memcache client over a pool of servers.
///
/// Data operations take `&self`; topology and option changes take
/// `&mut self`. Every public operation updates [`result_code`] and
/// [`result_message`].
///
/// [`result_code`]: Self::result_code
/// [`result_message`]: Self::result_message
pub struct ShardedClient {
    config: Config,
    codec: ValueCodec,
    credentials: Option<Credentials>,
    servers: BTreeMap<String, Node>,
    router: Box<dyn Router>,
    pending: Mutex<VecDeque<Fetched>>,
    last: Mutex<(ResultCode, String)>,
}

impl ShardedClient {
    /// Create a client with an empty server pool.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let codec = ValueCodec::new(&config)?;
        let router = config.distribution.router(config.hash);
        Ok(Self {
            config,
            codec,
            credentials: None,
            servers: BTreeMap::new(),
            router,
            pending: Mutex::new(VecDeque::new()),
            last: Mutex::new((ResultCode::Success, ResultCode::Success.to_string())),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -- Result tracking -----------------------------------------------------

    /// Code of the most recent operation.
    pub fn result_code(&self) -> ResultCode {
        self.last.lock().0
    }

    /// Message of the most recent operation.
    pub fn result_message(&self) -> String {
        self.last.lock().1.clone()
    }

    fn set_result(&self, code: ResultCode, message: impl Into<String>) {
        *self.last.lock() = (code, message.into());
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.set_result(ResultCode::Success, ResultCode::Success.as_str()),
            Err(e) => self.set_result(e.code(), e.to_string()),
        }
        result
    }

    /// Record a lookup, treating `None` as a miss.
    fn record_lookup<T>(&self, result: Result<Option<T>>) -> Result<Option<T>> {
        if let Ok(None) = result {
            self.set_result(ResultCode::NotFound, ResultCode::NotFound.as_str());
            return result;
        }
        self.record(result)
    }

    /// Misses do not count as batch errors.
    fn record_batch<T>(&self, outcomes: &[(String, Result<T>)]) {
        let failed = outcomes
            .iter()
            .any(|(_, r)| matches!(r, Err(e) if *e != Error::NotFound));
        if failed {
            self.set_result(ResultCode::SomeErrors, ResultCode::SomeErrors.as_str());
        } else {
            self.set_result(ResultCode::Success, ResultCode::Success.as_str());
        }
    }

    // -- Routing -------------------------------------------------------------

    fn opts(&self) -> ConnectOpts<'_> {
        ConnectOpts {
            config: &self.config,
            credentials: self.credentials.as_ref(),
        }
    }

    /// Prefix `key` and check it is acceptable on the wire.
    fn wire_key(&self, key: &str) -> Result<Vec<u8>> {
        let mut wire = Vec::with_capacity(self.config.prefix_key.len() + key.len());
        wire.extend_from_slice(self.config.prefix_key.as_bytes());
        wire.extend_from_slice(key.as_bytes());
        validate_key(&wire)?;
        Ok(wire)
    }

    fn owner(&self, routing_key: &str) -> Result<&str> {
        if routing_key.is_empty() {
            return Err(Error::BadKey("empty key".into()));
        }
        Ok(self.router.lookup(routing_key.as_bytes())?)
    }

    fn node(&self, identity: &str) -> Result<&Node> {
        self.servers
            .get(identity)
            .ok_or_else(|| Error::Configuration(format!("router target {identity} has no server")))
    }

    fn route(&self, routing_key: &str) -> Result<&Node> {
        self.node(self.owner(routing_key)?)
    }

    /// Group keys by owner. Keys that cannot be routed come back separately.
    fn plan(&self, server_key: Option<&str>, keys: &[&str]) -> (Vec<(&str, Batch)>, Vec<(usize, Error)>) {
        let mut groups: BTreeMap<&str, Batch> = BTreeMap::new();
        let mut rejected = Vec::new();
        for (i, &key) in keys.iter().enumerate() {
            let routed = self
                .wire_key(key)
                .and_then(|wire| Ok((self.owner(server_key.unwrap_or(key))?, wire)));
            match routed {
                Ok((owner, wire)) => groups.entry(owner).or_default().push((i, wire)),
                Err(e) => rejected.push((i, e)),
            }
        }
        (groups.into_iter().collect(), rejected)
    }

    /// Run one job per owner, concurrently when there is more than one.
    fn fan_out<J, R, F>(jobs: Vec<J>, work: F) -> Vec<R>
    where
        J: Send,
        R: Send,
        F: Fn(J) -> R + Sync,
    {
        if jobs.len() <= 1 {
            return jobs.into_iter().map(work).collect();
        }
        let work = &work;
        std::thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|job| scope.spawn(move || work(job)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }

    // -- Topology ------------------------------------------------------------

    /// Add a server.
    ///
    /// With `init` the server joins without touching existing data. Without
    /// it, keys whose owner changes are copied over from their old owner.
    pub fn add_server(
        &mut self,
        host: &str,
        port: u16,
        weight: u32,
        init: bool,
    ) -> Result<MigrationReport> {
        let result = self.try_add_server(host, port, weight, init);
        self.record(result)
    }

    fn try_add_server(
        &mut self,
        host: &str,
        port: u16,
        weight: u32,
        init: bool,
    ) -> Result<MigrationReport> {
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(Error::InvalidArgument(format!("invalid host {host:?}")));
        }
        if port == 0 {
            return Err(Error::InvalidArgument("port must be non-zero".into()));
        }
        let node = Node::new(host, port, weight);
        if self.servers.contains_key(node.identity()) {
            return Ok(MigrationReport::default());
        }

        let snapshot = if init { Vec::new() } else { self.snapshot() };
        info!(server = node.identity(), "adding server");
        self.router.add_target(node.identity(), node.weight());
        self.servers.insert(node.identity().to_string(), node);

        if init {
            return Ok(MigrationReport::default());
        }
        Ok(self.relocate(snapshot, None))
    }

    /// Add several servers without migration.
    ///
    /// Every server is attempted; on partial failure the last result is
    /// `Failure` and the first error is returned.
    pub fn add_servers(&mut self, servers: &[(&str, u16, u32)]) -> Result<()> {
        let mut first_err = None;
        for &(host, port, weight) in servers {
            if let Err(e) = self.try_add_server(host, port, weight, true) {
                warn!(host, port, error = %e, "could not add server");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => self.record(Ok(())),
            Some(e) => {
                self.set_result(ResultCode::Failure, "one or more servers could not be added");
                Err(e)
            }
        }
    }

    /// Remove a server, moving its keys to their new owners.
    pub fn remove_server(&mut self, host: &str, port: u16, weight: u32) -> Result<MigrationReport> {
        let result = self.try_remove_server(host, port, weight);
        self.record(result)
    }

    fn try_remove_server(&mut self, host: &str, port: u16, weight: u32) -> Result<MigrationReport> {
        let identity = Node::identity_of(host, port, weight);
        if !self.servers.contains_key(&identity) {
            return Err(Error::NotFound);
        }

        let snapshot = self.snapshot();
        info!(server = %identity, "removing server");
        self.router.remove_target(&identity)?;
        let Some(retired) = self.servers.remove(&identity) else {
            return Err(Error::NotFound);
        };
        let report = self.relocate(snapshot, Some(&retired));
        retired.disconnect();
        Ok(report)
    }

    /// Disconnect and forget every server.
    pub fn reset_server_list(&mut self) {
        for node in self.servers.values() {
            node.disconnect();
        }
        self.servers.clear();
        self.router = self.config.distribution.router(self.config.hash);
        info!("server list reset");
        self.record(Ok(()));
    }

    /// Servers in router insertion order.
    pub fn server_list(&self) -> Vec<ServerInfo> {
        self.router
            .targets()
            .into_iter()
            .filter_map(|identity| self.servers.get(identity))
            .map(ServerInfo::of)
            .collect()
    }

    /// The server `key` routes to.
    pub fn server_by_key(&self, key: &str) -> Result<ServerInfo> {
        let result = self.route(key).map(ServerInfo::of);
        self.record(result)
    }

    /// Current owner of every enumerable key.
    fn snapshot(&self) -> Vec<(String, String)> {
        self.enumerate_keys()
            .into_iter()
            .filter_map(|key| {
                let owner = self.owner(&key).ok()?.to_string();
                Some((key, owner))
            })
            .collect()
    }

    /// Copy keys whose owner changed to the new owner, then delete the old
    /// copy. `retired` is a node already removed from the pool.
    fn relocate(&self, snapshot: Vec<(String, String)>, retired: Option<&Node>) -> MigrationReport {
        let mut report = MigrationReport::default();
        for (key, previous) in snapshot {
            report.examined += 1;
            let moved = self.owner(&key).and_then(|current| {
                if current == previous {
                    return Ok(None);
                }
                let from = match retired {
                    Some(node) if node.identity() == previous => node,
                    _ => self.node(&previous)?,
                };
                self.move_key(&key, from, self.node(current)?)
            });
            match moved {
                Ok(Some(bytes)) => {
                    report.moved += 1;
                    report.bytes += bytes;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "could not migrate key");
                    report.failed += 1;
                }
            }
        }
        info!(
            examined = report.examined,
            moved = report.moved,
            failed = report.failed,
            bytes = report.bytes,
            "migration finished"
        );
        report
    }

    /// Raw-read from `from`, add to `to` with the bridging TTL, and delete
    /// from `from` once the add succeeded. Returns the bytes moved, or
    /// `None` if the key vanished meanwhile.
    fn move_key(&self, key: &str, from: &Node, to: &Node) -> Result<Option<usize>> {
        let opts = self.opts();
        let wire = self.wire_key(key)?;
        let Some(item) = from
            .with_conn(&opts, |c| c.get_multi(&[wire.as_slice()], false))?
            .into_iter()
            .flatten()
            .next()
        else {
            return Ok(None);
        };

        to.with_conn(&opts, |c| {
            c.store(&Store {
                mode: StoreMode::Add,
                key: &wire,
                data: &item.data[..],
                flags: item.flags,
                exptime: BRIDGE_TTL,
            })
        })?;
        if let Err(e) = from.with_conn(&opts, |c| c.delete(&wire)) {
            warn!(key, server = from.identity(), error = %e, "migrated key left behind on previous owner");
        }
        debug!(key, from = from.identity(), to = to.identity(), "key migrated");
        Ok(Some(item.data.len()))
    }

    // -- Retrieval -----------------------------------------------------------

    fn fetch_one(&self, server_key: &str, key: &str, with_cas: bool) -> Result<Option<(Value, u64)>> {
        let wire = self.wire_key(key)?;
        let node = self.route(server_key)?;
        let item = node
            .with_conn(&self.opts(), |c| c.get_multi(&[wire.as_slice()], with_cas))?
            .into_iter()
            .flatten()
            .next();
        match item {
            Some(item) => Ok(Some((self.codec.decode(item.flags, &item.data)?, item.cas))),
            None => Ok(None),
        }
    }

    /// Fetch a value; `None` on a miss.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.get_by_key(key, key)
    }

    pub fn get_by_key(&self, server_key: &str, key: &str) -> Result<Option<Value>> {
        let result = self
            .fetch_one(server_key, key, false)
            .map(|hit| hit.map(|(value, _)| value));
        self.record_lookup(result)
    }

    /// Fetch a value with its CAS token.
    pub fn get_with_cas(&self, key: &str) -> Result<Option<(Value, u64)>> {
        self.get_with_cas_by_key(key, key)
    }

    pub fn get_with_cas_by_key(&self, server_key: &str, key: &str) -> Result<Option<(Value, u64)>> {
        let result = self.fetch_one(server_key, key, true);
        self.record_lookup(result)
    }

    fn touch_one(&self, server_key: &str, key: &str, exptime: u32, with_cas: bool) -> Result<Option<(Value, u64)>> {
        let wire = self.wire_key(key)?;
        let node = self.route(server_key)?;
        match node.with_conn(&self.opts(), |c| c.get_and_touch(&wire, exptime, with_cas))? {
            Some(item) => Ok(Some((self.codec.decode(item.flags, &item.data)?, item.cas))),
            None => Ok(None),
        }
    }

    /// Fetch a value and reset its expiry in one round trip; `None` on a miss.
    pub fn get_and_touch(&self, key: &str, exptime: u32) -> Result<Option<Value>> {
        self.get_and_touch_by_key(key, key, exptime)
    }

    pub fn get_and_touch_by_key(&self, server_key: &str, key: &str, exptime: u32) -> Result<Option<Value>> {
        let result = self
            .touch_one(server_key, key, exptime, false)
            .map(|hit| hit.map(|(value, _)| value));
        self.record_lookup(result)
    }

    /// [`get_and_touch`](Self::get_and_touch) returning the CAS token too.
    pub fn get_and_touch_with_cas(&self, key: &str, exptime: u32) -> Result<Option<(Value, u64)>> {
        self.get_and_touch_with_cas_by_key(key, key, exptime)
    }

    pub fn get_and_touch_with_cas_by_key(
        &self,
        server_key: &str,
        key: &str,
        exptime: u32,
    ) -> Result<Option<(Value, u64)>> {
        let result = self.touch_one(server_key, key, exptime, true);
        self.record_lookup(result)
    }

    /// Read-through fetch: on a miss `loader` is asked for the value, and a
    /// value it returns is stored without expiry.
    pub fn get_or_fetch(
        &self,
        key: &str,
        loader: impl FnOnce(&str) -> Option<Value>,
    ) -> Result<Option<Value>> {
        self.get_or_fetch_by_key(key, key, loader)
    }

    pub fn get_or_fetch_by_key(
        &self,
        server_key: &str,
        key: &str,
        loader: impl FnOnce(&str) -> Option<Value>,
    ) -> Result<Option<Value>> {
        let result = match self.fetch_one(server_key, key, false) {
            Ok(Some((value, _))) => Ok(Some(value)),
            Ok(None) => match loader(key) {
                Some(value) => self
                    .store_value(server_key, key, StoreMode::Set, &value, 0)
                    .map(|()| Some(value)),
                None => Ok(None),
            },
            Err(e) => Err(e),
        };
        self.record_lookup(result)
    }

    fn fetch_many(&self, server_key: Option<&str>, keys: &[&str], with_cas: bool) -> Vec<(String, Result<Fetched>)> {
        let mut outcomes: Vec<Result<Fetched>> = keys.iter().map(|_| Err(Error::NotFound)).collect();
        let (groups, rejected) = self.plan(server_key, keys);
        for (i, e) in rejected {
            outcomes[i] = Err(e);
        }

        let opts = self.opts();
        let done = Self::fan_out(groups, |(identity, batch)| {
            let result = {
                let wire: Vec<&[u8]> = batch.iter().map(|(_, k)| k.as_slice()).collect();
                self.node(identity)
                    .and_then(|node| node.with_conn(&opts, |c| c.get_multi(&wire, with_cas)))
            };
            (identity, batch, result)
        });

        for (identity, batch, result) in done {
            match result {
                Ok(items) => {
                    for ((i, _), item) in batch.into_iter().zip(items) {
                        if let Some(item) = item {
                            outcomes[i] = self.to_fetched(keys[i], item, with_cas);
                        }
                    }
                }
                Err(e) => {
                    warn!(server = identity, keys = batch.len(), error = %e, "multi-get failed on server");
                    for (i, _) in batch {
                        outcomes[i] = Err(e.clone());
                    }
                }
            }
        }

        keys.iter()
            .map(|k| k.to_string())
            .zip(outcomes)
            .collect()
    }

    fn to_fetched(&self, key: &str, item: Item, with_cas: bool) -> Result<Fetched> {
        Ok(Fetched {
            key: key.to_string(),
            value: self.codec.decode(item.flags, &item.data)?,
            cas: with_cas.then_some(item.cas),
        })
    }

    /// Fetch many keys. Results follow the input order; a miss is
    /// `Err(Error::NotFound)`.
    pub fn get_multi(&self, keys: &[&str]) -> Vec<(String, Result<Value>)> {
        self.get_multi_inner(None, keys)
    }

    /// Fetch many keys, all from the server `server_key` routes to.
    pub fn get_multi_by_key(&self, server_key: &str, keys: &[&str]) -> Vec<(String, Result<Value>)> {
        self.get_multi_inner(Some(server_key), keys)
    }

    fn get_multi_inner(&self, server_key: Option<&str>, keys: &[&str]) -> Vec<(String, Result<Value>)> {
        let outcomes: Vec<_> = self
            .fetch_many(server_key, keys, false)
            .into_iter()
            .map(|(key, r)| (key, r.map(|f| f.value)))
            .collect();
        self.record_batch(&outcomes);
        outcomes
    }

    // -- Deferred fetch ------------------------------------------------------

    /// Multi-get whose hits are queued for [`fetch`](Self::fetch).
    ///
    /// Records still queued from an earlier call are discarded.
    pub fn get_delayed(&self, keys: &[&str], with_cas: bool) -> Result<()> {
        self.delayed(None, keys, with_cas, None)
    }

    pub fn get_delayed_by_key(&self, server_key: &str, keys: &[&str], with_cas: bool) -> Result<()> {
        self.delayed(Some(server_key), keys, with_cas, None)
    }

    /// Multi-get that hands every hit to `callback` instead of queuing it.
    pub fn get_delayed_with(
        &self,
        keys: &[&str],
        with_cas: bool,
        mut callback: impl FnMut(Fetched),
    ) -> Result<()> {
        self.delayed(None, keys, with_cas, Some(&mut callback))
    }

    pub fn get_delayed_with_by_key(
        &self,
        server_key: &str,
        keys: &[&str],
        with_cas: bool,
        mut callback: impl FnMut(Fetched),
    ) -> Result<()> {
        self.delayed(Some(server_key), keys, with_cas, Some(&mut callback))
    }

    fn delayed(
        &self,
        server_key: Option<&str>,
        keys: &[&str],
        with_cas: bool,
        callback: Option<&mut dyn FnMut(Fetched)>,
    ) -> Result<()> {
        self.pending.lock().clear();
        if self.servers.is_empty() {
            return self.record(Err(Error::NoServers));
        }

        let outcomes = self.fetch_many(server_key, keys, with_cas);
        self.record_batch(&outcomes);
        let hits = outcomes.into_iter().filter_map(|(_, r)| r.ok());
        match callback {
            Some(callback) => hits.for_each(callback),
            None => *self.pending.lock() = hits.collect(),
        }
        Ok(())
    }

    /// Next queued record; `None` (result `End`) when drained.
    pub fn fetch(&self) -> Option<Fetched> {
        let next = self.pending.lock().pop_front();
        match &next {
            Some(_) => self.set_result(ResultCode::Success, ResultCode::Success.as_str()),
            None => self.set_result(ResultCode::End, ResultCode::End.as_str()),
        }
        next
    }

    /// Drain every queued record.
    pub fn fetch_all(&self) -> Vec<Fetched> {
        let all: Vec<Fetched> = self.pending.lock().drain(..).collect();
        if all.is_empty() {
            self.set_result(ResultCode::End, ResultCode::End.as_str());
        } else {
            self.set_result(ResultCode::Success, ResultCode::Success.as_str());
        }
        all
    }

    // -- Storage -------------------------------------------------------------

    fn store_raw(
        &self,
        server_key: &str,
        key: &str,
        mode: StoreMode,
        data: &[u8],
        flags: u32,
        exptime: u32,
    ) -> Result<()> {
        let wire = self.wire_key(key)?;
        let node = self.route(server_key)?;
        node.with_conn(&self.opts(), |c| {
            c.store(&Store {
                mode,
                key: &wire,
                data,
                flags,
                exptime,
            })
        })
    }

    fn store_value(
        &self,
        server_key: &str,
        key: &str,
        mode: StoreMode,
        value: &Value,
        exptime: u32,
    ) -> Result<()> {
        let encoded = self.codec.encode(value)?;
        self.store_raw(server_key, key, mode, &encoded.data, encoded.flags, exptime)
    }

    /// Store unconditionally.
    pub fn set(&self, key: &str, value: impl Into<Value>, exptime: u32) -> Result<()> {
        self.set_by_key(key, key, value, exptime)
    }

    pub fn set_by_key(
        &self,
        server_key: &str,
        key: &str,
        value: impl Into<Value>,
        exptime: u32,
    ) -> Result<()> {
        let result = self.store_value(server_key, key, StoreMode::Set, &value.into(), exptime);
        self.record(result)
    }

    /// Store only if absent; `Err(Error::Exists)` otherwise.
    pub fn add(&self, key: &str, value: impl Into<Value>, exptime: u32) -> Result<()> {
        self.add_by_key(key, key, value, exptime)
    }

    pub fn add_by_key(
        &self,
        server_key: &str,
        key: &str,
        value: impl Into<Value>,
        exptime: u32,
    ) -> Result<()> {
        let result = self.store_value(server_key, key, StoreMode::Add, &value.into(), exptime);
        self.record(result)
    }

    /// Store only if present.
    pub fn replace(&self, key: &str, value: impl Into<Value>, exptime: u32) -> Result<()> {
        self.replace_by_key(key, key, value, exptime)
    }

    pub fn replace_by_key(
        &self,
        server_key: &str,
        key: &str,
        value: impl Into<Value>,
        exptime: u32,
    ) -> Result<()> {
        let result = self.store_value(server_key, key, StoreMode::Replace, &value.into(), exptime);
        self.record(result)
    }

    /// Append raw bytes to an existing value; flags are left untouched.
    pub fn append(&self, key: &str, data: &[u8]) -> Result<()> {
        self.append_by_key(key, key, data)
    }

    pub fn append_by_key(&self, server_key: &str, key: &str, data: &[u8]) -> Result<()> {
        let result = self.store_raw(server_key, key, StoreMode::Append, data, 0, 0);
        self.record(result)
    }

    /// Prepend raw bytes to an existing value; flags are left untouched.
    pub fn prepend(&self, key: &str, data: &[u8]) -> Result<()> {
        self.prepend_by_key(key, key, data)
    }

    pub fn prepend_by_key(&self, server_key: &str, key: &str, data: &[u8]) -> Result<()> {
        let result = self.store_raw(server_key, key, StoreMode::Prepend, data, 0, 0);
        self.record(result)
    }

    /// Store only if the item's CAS token still equals `cas`.
    pub fn cas(&self, cas: u64, key: &str, value: impl Into<Value>, exptime: u32) -> Result<()> {
        self.cas_by_key(cas, key, key, value, exptime)
    }

    pub fn cas_by_key(
        &self,
        cas: u64,
        server_key: &str,
        key: &str,
        value: impl Into<Value>,
        exptime: u32,
    ) -> Result<()> {
        let result = self.store_value(server_key, key, StoreMode::Cas(cas), &value.into(), exptime);
        self.record(result)
    }

    /// Store many values. Results follow the input order.
    pub fn set_multi(&self, items: &[(&str, Value)], exptime: u32) -> Vec<(String, Result<()>)> {
        self.set_multi_inner(None, items, exptime)
    }

    pub fn set_multi_by_key(
        &self,
        server_key: &str,
        items: &[(&str, Value)],
        exptime: u32,
    ) -> Vec<(String, Result<()>)> {
        self.set_multi_inner(Some(server_key), items, exptime)
    }

    fn set_multi_inner(
        &self,
        server_key: Option<&str>,
        items: &[(&str, Value)],
        exptime: u32,
    ) -> Vec<(String, Result<()>)> {
        let keys: Vec<&str> = items.iter().map(|(k, _)| *k).collect();
        let encoded: Vec<_> = items.iter().map(|(_, v)| self.codec.encode(v)).collect();
        let mut outcomes: Vec<Result<()>> = encoded
            .iter()
            .map(|e| e.as_ref().map(|_| ()).map_err(Clone::clone))
            .collect();

        let (groups, rejected) = self.plan(server_key, &keys);
        for (i, e) in rejected {
            outcomes[i] = Err(e);
        }
        let groups: Vec<(&str, Batch)> = groups
            .into_iter()
            .map(|(owner, batch)| {
                let batch = batch.into_iter().filter(|(i, _)| encoded[*i].is_ok()).collect();
                (owner, batch)
            })
            .filter(|(_, batch): &(&str, Batch)| !batch.is_empty())
            .collect();

        let opts = self.opts();
        let done = Self::fan_out(groups, |(identity, batch)| {
            let result = {
                let ops: Vec<Store<'_>> = batch
                    .iter()
                    .filter_map(|(i, wire)| {
                        let enc = encoded[*i].as_ref().ok()?;
                        Some(Store {
                            mode: StoreMode::Set,
                            key: wire.as_slice(),
                            data: enc.data.as_slice(),
                            flags: enc.flags,
                            exptime,
                        })
                    })
                    .collect();
                self.node(identity)
                    .and_then(|node| node.with_conn(&opts, |c| c.store_many(&ops)))
            };
            (identity, batch, result)
        });
        self.apply_batch(&mut outcomes, done, "multi-set");

        let outcomes: Vec<_> = keys.iter().map(|k| k.to_string()).zip(outcomes).collect();
        self.record_batch(&outcomes);
        outcomes
    }

    /// Spread per-owner pipeline results back to their positions.
    fn apply_batch(
        &self,
        outcomes: &mut [Result<()>],
        done: Vec<(&str, Batch, Result<Vec<Result<()>>>)>,
        what: &str,
    ) {
        for (identity, batch, result) in done {
            match result {
                Ok(replies) => {
                    for ((i, _), reply) in batch.into_iter().zip(replies) {
                        outcomes[i] = reply;
                    }
                }
                Err(e) => {
                    warn!(server = identity, keys = batch.len(), error = %e, "{what} failed on server");
                    for (i, _) in batch {
                        outcomes[i] = Err(e.clone());
                    }
                }
            }
        }
    }

    // -- Key commands --------------------------------------------------------

    /// Reset the expiry of an existing item.
    pub fn touch(&self, key: &str, exptime: u32) -> Result<()> {
        self.touch_by_key(key, key, exptime)
    }

    pub fn touch_by_key(&self, server_key: &str, key: &str, exptime: u32) -> Result<()> {
        let result = self.wire_key(key).and_then(|wire| {
            self.route(server_key)?
                .with_conn(&self.opts(), |c| c.touch(&wire, exptime))
        });
        self.record(result)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.delete_by_key(key, key)
    }

    pub fn delete_by_key(&self, server_key: &str, key: &str) -> Result<()> {
        let result = self.wire_key(key).and_then(|wire| {
            self.route(server_key)?
                .with_conn(&self.opts(), |c| c.delete(&wire))
        });
        self.record(result)
    }

    /// Delete many keys. Results follow the input order.
    pub fn delete_multi(&self, keys: &[&str]) -> Vec<(String, Result<()>)> {
        self.delete_multi_inner(None, keys)
    }

    pub fn delete_multi_by_key(&self, server_key: &str, keys: &[&str]) -> Vec<(String, Result<()>)> {
        self.delete_multi_inner(Some(server_key), keys)
    }

    fn delete_multi_inner(&self, server_key: Option<&str>, keys: &[&str]) -> Vec<(String, Result<()>)> {
        let mut outcomes: Vec<Result<()>> = keys.iter().map(|_| Ok(())).collect();
        let (groups, rejected) = self.plan(server_key, keys);
        for (i, e) in rejected {
            outcomes[i] = Err(e);
        }

        let opts = self.opts();
        let done = Self::fan_out(groups, |(identity, batch)| {
            let result = {
                let wire: Vec<&[u8]> = batch.iter().map(|(_, k)| k.as_slice()).collect();
                self.node(identity)
                    .and_then(|node| node.with_conn(&opts, |c| c.delete_many(&wire)))
            };
            (identity, batch, result)
        });
        self.apply_batch(&mut outcomes, done, "multi-delete");

        let outcomes: Vec<_> = keys.iter().map(|k| k.to_string()).zip(outcomes).collect();
        self.record_batch(&outcomes);
        outcomes
    }

    /// Add `offset` to a counter. An absent counter is created with
    /// `initial` (and `exptime`) and `initial` is returned.
    ///
    /// Creation is a separate `add`, so it is not atomic with concurrent
    /// callers.
    pub fn increment(&self, key: &str, offset: u64, initial: u64, exptime: u32) -> Result<u64> {
        self.increment_by_key(key, key, offset, initial, exptime)
    }

    pub fn increment_by_key(
        &self,
        server_key: &str,
        key: &str,
        offset: u64,
        initial: u64,
        exptime: u32,
    ) -> Result<u64> {
        let result = self.counter(server_key, key, offset, initial, exptime, true);
        self.record(result)
    }

    /// Subtract `offset` from a counter, flooring at zero. An absent counter
    /// is created with `initial`.
    pub fn decrement(&self, key: &str, offset: u64, initial: u64, exptime: u32) -> Result<u64> {
        self.decrement_by_key(key, key, offset, initial, exptime)
    }

    pub fn decrement_by_key(
        &self,
        server_key: &str,
        key: &str,
        offset: u64,
        initial: u64,
        exptime: u32,
    ) -> Result<u64> {
        let result = self.counter(server_key, key, offset, initial, exptime, false);
        self.record(result)
    }

    fn counter(
        &self,
        server_key: &str,
        key: &str,
        offset: u64,
        initial: u64,
        exptime: u32,
        increment: bool,
    ) -> Result<u64> {
        let wire = self.wire_key(key)?;
        let node = self.route(server_key)?;
        let opts = self.opts();
        match node.with_conn(&opts, |c| c.counter(&wire, offset, increment)) {
            Err(Error::NotFound) => {}
            other => return other,
        }

        let digits = initial.to_string();
        let created = node.with_conn(&opts, |c| {
            c.store(&Store {
                mode: StoreMode::Add,
                key: &wire,
                data: digits.as_bytes(),
                flags: TypeTag::Int.bit(),
                exptime,
            })
        });
        match created {
            Ok(()) => Ok(initial),
            // another client created it first
            Err(Error::Exists) => node.with_conn(&opts, |c| c.counter(&wire, offset, increment)),
            Err(e) => Err(e),
        }
    }

    // -- Server commands -----------------------------------------------------

    /// Invalidate every item. Server *i* (in identity order) gets
    /// `delay + 2·i` seconds so the pool does not empty all at once.
    pub fn flush(&self, delay: u32) -> Result<()> {
        if self.servers.is_empty() {
            return self.record(Err(Error::NoServers));
        }
        let opts = self.opts();
        let mut first_err = None;
        for (i, node) in self.servers.values().enumerate() {
            let node_delay = delay.saturating_add(2 * i as u32);
            if let Err(e) = node.with_conn(&opts, |c| c.flush(node_delay)) {
                warn!(server = node.identity(), error = %e, "flush failed");
                first_err.get_or_insert(e);
            }
        }
        self.record(first_err.map_or(Ok(()), Err))
    }

    /// Set the server log verbosity on every server.
    pub fn verbosity(&self, level: u32) -> Result<()> {
        if self.servers.is_empty() {
            return self.record(Err(Error::NoServers));
        }
        let opts = self.opts();
        let mut first_err = None;
        for node in self.servers.values() {
            if let Err(e) = node.with_conn(&opts, |c| c.verbosity(level)) {
                warn!(server = node.identity(), error = %e, "verbosity failed");
                first_err.get_or_insert(e);
            }
        }
        self.record(first_err.map_or(Ok(()), Err))
    }

    /// Statistics per `host:port`. Unreachable servers are left out and the
    /// last result becomes `SomeErrors`.
    pub fn stats(&self) -> BTreeMap<String, Vec<(String, String)>> {
        self.stats_group(None)
    }

    /// A named statistics group (`items`, `slabs`, ...) per `host:port`.
    pub fn stats_group(&self, group: Option<&str>) -> BTreeMap<String, Vec<(String, String)>> {
        let opts = self.opts();
        let mut all = BTreeMap::new();
        let mut failed = false;
        for node in self.servers.values() {
            match node.with_conn(&opts, |c| c.stats(group)) {
                Ok(stats) => {
                    all.insert(node.address(), stats);
                }
                Err(e) => {
                    warn!(server = node.identity(), error = %e, "stats failed");
                    failed = true;
                }
            }
        }
        if failed {
            self.set_result(ResultCode::SomeErrors, ResultCode::SomeErrors.as_str());
        } else {
            self.set_result(ResultCode::Success, ResultCode::Success.as_str());
        }
        all
    }

    /// Server version per `host:port`; `"255.255.255"` for servers that
    /// could not be asked.
    pub fn version(&self) -> BTreeMap<String, String> {
        let opts = self.opts();
        let mut failed = false;
        let versions = self
            .servers
            .values()
            .map(|node| {
                let version = node.with_conn(&opts, Connection::version).unwrap_or_else(|e| {
                    warn!(server = node.identity(), error = %e, "version failed");
                    failed = true;
                    UNKNOWN_VERSION.to_string()
                });
                (node.address(), version)
            })
            .collect();
        if failed {
            self.set_result(ResultCode::SomeErrors, ResultCode::SomeErrors.as_str());
        } else {
            self.set_result(ResultCode::Success, ResultCode::Success.as_str());
        }
        versions
    }

    /// Best-effort list of stored keys, prefix stripped.
    ///
    /// Uses `stats cachedump` and the LRU crawler's metadump over a
    /// short-lived ASCII connection to each server. A server or source that
    /// fails contributes no keys.
    pub fn all_keys(&self) -> Vec<String> {
        let keys = self.enumerate_keys();
        self.set_result(ResultCode::Success, ResultCode::Success.as_str());
        keys
    }

    fn enumerate_keys(&self) -> Vec<String> {
        let mut found: BTreeSet<Vec<u8>> = BTreeSet::new();
        for node in self.servers.values() {
            let mut conn = match node.side_channel(&self.config) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(server = node.identity(), error = %e, "key enumeration skipped");
                    continue;
                }
            };
            match ascii::cachedump_keys(&mut conn) {
                Ok(keys) => found.extend(keys),
                Err(e) => warn!(server = node.identity(), error = %e, "cachedump failed"),
            }
            match ascii::metadump_keys(&mut conn) {
                Ok(keys) => found.extend(keys),
                Err(e) => warn!(server = node.identity(), error = %e, "metadump failed"),
            }
            conn.quit();
        }

        let prefix = self.config.prefix_key.as_bytes();
        found
            .into_iter()
            .filter_map(|wire| {
                let key = wire.strip_prefix(prefix)?;
                (!key.is_empty()).then(|| String::from_utf8_lossy(key).into_owned())
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    // -- Settings ------------------------------------------------------------

    /// Change one option.
    ///
    /// Hash or distribution changes rebuild the router over the current pool
    /// without migrating data. Protocol, timeout, no-delay and SASL changes
    /// close open connections.
    pub fn set_option(&mut self, option: ClientOption) -> Result<()> {
        let result = self.try_set_option(option);
        self.record(result)
    }

    fn try_set_option(&mut self, option: ClientOption) -> Result<()> {
        let mut next = self.config.clone();
        next.apply(option.clone())?;
        let codec = ValueCodec::new(&next)?;

        if option.rebuilds_router() {
            let mut router = next.distribution.router(next.hash);
            for identity in self.router.targets() {
                if let Some(node) = self.servers.get(identity) {
                    router.add_target(identity, node.weight());
                }
            }
            self.router = router;
            info!(hash = next.hash.as_str(), distribution = ?next.distribution, "router rebuilt");
        }
        if option.resets_connections() {
            for node in self.servers.values() {
                node.reset();
            }
        }

        self.config = next;
        self.codec = codec;
        self.warn_ignored_sasl();
        Ok(())
    }

    /// Set SASL credentials. Requires the binary protocol.
    pub fn set_sasl_auth_data(&mut self, username: &str, password: &str) -> Result<()> {
        if self.config.protocol != Protocol::Binary {
            return self.record(Err(Error::Configuration(
                "SASL authentication requires the binary protocol".into(),
            )));
        }
        self.credentials = Some(Credentials::new(username, password));
        for node in self.servers.values() {
            node.reset();
        }
        self.warn_ignored_sasl();
        self.record(Ok(()))
    }

    fn warn_ignored_sasl(&self) {
        match (&self.credentials, self.config.sasl_mechanism) {
            (Some(_), None) => warn!("SASL credentials set without a mechanism; authentication disabled"),
            (None, Some(mechanism)) => {
                warn!(mechanism = mechanism.as_str(), "SASL mechanism set without credentials; authentication disabled")
            }
            (Some(_), Some(_)) if self.config.protocol != Protocol::Binary => {
                warn!("SASL is only used with the binary protocol; authentication disabled")
            }
            _ => {}
        }
    }

    /// Close every connection. They reopen on the next operation.
    pub fn quit(&self) {
        for node in self.servers.values() {
            node.disconnect();
        }
        self.record(Ok(()));
    }
}

impl Drop for ShardedClient {
    fn drop(&mut self) {
        for node in self.servers.values() {
            node.disconnect();
        }
    }
}

/// Keys are 1..=250 bytes without whitespace or control characters.
fn validate_key(wire: &[u8]) -> Result<()> {
    if wire.is_empty() || wire.len() > MAX_KEY_LEN {
        return Err(Error::BadKey(format!(
            "key length {} outside 1..={MAX_KEY_LEN}",
            wire.len()
        )));
    }
    if wire
        .iter()
        .any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
    {
        return Err(Error::BadKey(
            String::from_utf8_lossy(wire).into_owned(),
        ));
    }
    Ok(())
}
