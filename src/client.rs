//! Multi-connection I/O core: connection map, multiplexing read loop,
//! heartbeat auto-reply, error classification, reconnection, discovery.
//!
//! Grounded in `channel/mod.rs` (the `Channel` trait / `ConnectionState`
//! shape), `channel/action_cable.rs` (the exponential-backoff reconnect
//! loop), and `relay/connection.rs` (async connect + `tokio::select!`
//! orchestration), resolved against `original_source/nsq/client.py` for the
//! exact `read()`/`checkConnections` pass semantics.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;

use crate::codec::{self, Frame};
use crate::config::ClientConfig;
use crate::connection::{Connection, IdentifyOptions};
use crate::discovery::DiscoverySource;
use crate::error::{NsqError, Result, ServerErrorKind};

pub type ConnKey = (String, u16);
pub type SharedConnection = Arc<Mutex<Connection>>;

/// A frame surfaced to the caller, tagged with its originating connection so
/// message acknowledgement can route back through the right `Connection`.
#[derive(Debug, Clone)]
pub struct SurfacedFrame {
    pub key: ConnKey,
    pub frame: Frame,
}

/// Hooks a specialization (namely `Consumer`) installs on `added`/`removed`
/// events, per spec §4.4 "Add/remove semantics". The default is a no-op,
/// used by a bare publish-only `Client`.
#[async_trait]
pub trait ClientHooks: Send + Sync {
    async fn on_added(&self, key: &ConnKey, conn: &SharedConnection);
    async fn on_removed(&self, key: &ConnKey);
}

pub struct NoopHooks;

#[async_trait]
impl ClientHooks for NoopHooks {
    async fn on_added(&self, _key: &ConnKey, _conn: &SharedConnection) {}
    async fn on_removed(&self, _key: &ConnKey) {}
}

/// Owns a set of `Connection`s keyed by `(host, port)` and runs the
/// multiplexing read loop, error classification, and reconnection.
pub struct Client {
    config: ClientConfig,
    connections: Arc<RwLock<HashMap<ConnKey, SharedConnection>>>,
    discovery: Vec<Arc<dyn DiscoverySource>>,
    topic: Option<String>,
    hooks: Arc<dyn ClientHooks>,
}

impl Client {
    pub fn new(config: ClientConfig, discovery: Vec<Arc<dyn DiscoverySource>>, topic: Option<String>) -> Self {
        Self {
            config,
            connections: Arc::new(RwLock::new(HashMap::new())),
            discovery,
            topic,
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ClientHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Snapshot of all entries currently in the connection map. Lock-free
    /// after this call returns — callers operate on the clones, never while
    /// holding the map lock (spec §9 Design Note: concurrent map access).
    pub async fn snapshot(&self) -> Vec<(ConnKey, SharedConnection)> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn get(&self, key: &ConnKey) -> Option<SharedConnection> {
        self.connections.read().await.get(key).cloned()
    }

    /// Inserts a new `Connection` under `(host, port)` and connects it
    /// eagerly, mirroring the original client's connect-in-constructor
    /// behavior. Returns `None` if one already exists for that key (spec
    /// §4.4: "returns the inserted Connection or null if a Connection for
    /// that key already exists").
    ///
    /// `on_added` fires only after a successful connect: firing it against a
    /// still-`Disconnected` connection would queue bytes (e.g. a Consumer's
    /// `SUB`/`RDY`) ahead of the MAGIC/IDENTIFY handshake the next
    /// `maybe_reconnect` pass writes, corrupting the wire order. A failed
    /// initial connect leaves the entry in the map for `check_connections`'s
    /// `maybe_reconnect` to retry on the normal backoff schedule.
    pub async fn add(&self, host: &str, port: u16) -> Result<Option<SharedConnection>> {
        let key = (host.to_string(), port);
        {
            let map = self.connections.read().await;
            if map.contains_key(&key) {
                return Ok(None);
            }
        }
        let conn = Connection::new(host, port, IdentifyOptions::default(), self.config.auth_secret.clone())?;
        let shared = Arc::new(Mutex::new(conn));
        {
            let mut map = self.connections.write().await;
            if map.contains_key(&key) {
                return Ok(None);
            }
            map.insert(key.clone(), shared.clone());
        }

        let connect_timeout = self.config.connect_timeout;
        let connected = {
            let mut c = shared.lock().await;
            c.connect(connect_timeout).await
        };
        match connected {
            Ok(()) => self.hooks.on_added(&key, &shared).await,
            Err(e) => log::warn!("{host}:{port} initial connect failed: {e}"),
        }
        Ok(Some(shared))
    }

    /// Removes and closes the connection for `key`, if present. Swallows
    /// close errors (close never fails) and is safe to call on an already
    /// absent key.
    pub async fn remove(&self, key: &ConnKey) {
        let removed = self.connections.write().await.remove(key);
        if let Some(conn) = removed {
            conn.lock().await.close().await;
        }
        self.hooks.on_removed(key).await;
    }

    /// Attempts `connect` on a Disconnected connection whose `AttemptCounter`
    /// permits it.
    async fn maybe_reconnect(&self, key: &ConnKey, conn: &SharedConnection) {
        let mut c = conn.lock().await;
        if c.is_ready() {
            return;
        }
        if !c.attempts.ready() {
            return;
        }
        let connect_timeout = self.config.connect_timeout;
        match c.connect(connect_timeout).await {
            Ok(()) => {
                log::info!("{} connected", *c);
                drop(c);
                self.hooks.on_added(key, conn).await;
            }
            Err(e) => {
                log::warn!("{} reconnect failed: {e}", *c);
            }
        }
    }

    /// Invoked periodically (and at startup): rediscovers via configured
    /// lookup sources and static addresses, creating new connections and
    /// reconnecting closed ones; reconnects connections idle past the
    /// heartbeat-stale threshold.
    pub async fn check_connections(&self) {
        let mut wanted: Vec<ConnKey> = self
            .config
            .nsqd_tcp_addresses
            .iter()
            .cloned()
            .collect();

        if !self.discovery.is_empty() {
            if let Some(topic) = &self.topic {
                for source in &self.discovery {
                    match source.lookup(topic).await {
                        Ok(producers) => {
                            wanted.extend(producers.into_iter().map(|p| (p.host, p.tcp_port)));
                        }
                        Err(e) => {
                            log::warn!("discovery source failed for topic {topic}: {e}");
                        }
                    }
                }
            }
        }

        for (host, port) in wanted {
            let key = (host.clone(), port);
            let existing = self.get(&key).await;
            match existing {
                None => {
                    if let Err(e) = self.add(&host, port).await {
                        log::warn!("failed to add connection {host}:{port}: {e}");
                    }
                }
                Some(conn) => self.maybe_reconnect(&key, &conn).await,
            }
        }

        let stale_threshold = self.config.heartbeat_stale_threshold();
        for (key, conn) in self.snapshot().await {
            let is_stale = {
                let c = conn.lock().await;
                c.is_ready() && c.last_recv().elapsed() >= stale_threshold
            };
            if is_stale {
                log::warn!("{}:{} idle past heartbeat threshold, reconnecting", key.0, key.1);
                conn.lock().await.close().await;
                self.maybe_reconnect(&key, &conn).await;
            }
        }
    }

    /// One pass of the multiplexing loop (spec §4.4): flush pending bytes on
    /// every live connection, read available frames, auto-reply to
    /// heartbeats, classify and act on errors, and return the surfaced
    /// frames. Never panics or propagates I/O errors; offending connections
    /// are closed and removed instead.
    pub async fn read_once(&self) -> Vec<SurfacedFrame> {
        let snapshot = self.snapshot().await;
        if snapshot.is_empty() {
            tokio::time::sleep(self.config.timeout).await;
            return Vec::new();
        }

        let mut joinset = JoinSet::new();
        for (key, conn) in snapshot {
            let timeout = self.config.timeout;
            joinset.spawn(async move {
                {
                    let mut c = conn.lock().await;
                    if c.has_pending() {
                        let _ = c.flush().await;
                    }
                }
                let outcome = tokio::time::timeout(timeout, async {
                    let mut c = conn.lock().await;
                    c.read().await
                })
                .await;
                (key, outcome)
            });
        }

        let mut surfaced = Vec::new();
        let mut to_close = Vec::new();
        while let Some(joined) = joinset.join_next().await {
            let (key, outcome) = match joined {
                Ok(v) => v,
                Err(_) => continue,
            };
            let frames = match outcome {
                Err(_elapsed) => continue,
                Ok(Err(_io_err)) => {
                    to_close.push(key);
                    continue;
                }
                Ok(Ok(frames)) => frames,
            };

            for frame in frames {
                if frame.is_heartbeat() {
                    if let Some(conn) = self.get(&key).await {
                        let mut c = conn.lock().await;
                        c.nop();
                        let _ = c.flush().await;
                    }
                    continue;
                }
                if let Frame::Error(ref payload) = frame {
                    let (code, _reason) = codec::split_error_payload(payload);
                    if ServerErrorKind::from_code(&code).is_fatal() {
                        to_close.push(key.clone());
                    }
                }
                surfaced.push(SurfacedFrame { key: key.clone(), frame });
            }
        }

        for key in to_close {
            self.remove(&key).await;
        }
        surfaced
    }

    async fn pick_ready_key(&self) -> Option<ConnKey> {
        let map = self.connections.read().await;
        let mut rng = rand::rng();
        let mut candidates = Vec::new();
        for (key, conn) in map.iter() {
            if conn.try_lock().map(|c| c.is_ready()).unwrap_or(false) {
                candidates.push(key.clone());
            }
        }
        candidates.into_iter().choose(&mut rng)
    }

    /// Picks one live connection uniformly at random, sends `PUB`, and
    /// blocks until a response arrives on that connection.
    pub async fn publish(&self, topic: &str, body: &[u8]) -> Result<Frame> {
        self.publish_command(codec::publish(topic, body)).await
    }

    /// Picks one live connection uniformly at random, sends `MPUB`, and
    /// blocks until a response arrives on that connection.
    pub async fn mpub(&self, topic: &str, bodies: &[&[u8]]) -> Result<Frame> {
        self.publish_command(codec::mpub(topic, bodies)).await
    }

    async fn publish_command(&self, command: Vec<u8>) -> Result<Frame> {
        let key = self.pick_ready_key().await.ok_or(NsqError::NoConnections)?;
        let conn = self.get(&key).await.ok_or(NsqError::NoConnections)?;
        {
            let mut c = conn.lock().await;
            c.send(&command);
            while c.has_pending() {
                c.flush().await?;
            }
        }
        loop {
            let frames = self.read_once().await;
            if let Some(sf) = frames.into_iter().find(|sf| sf.key == key) {
                return Ok(sf.frame);
            }
            if self.get(&key).await.is_none() {
                return Err(NsqError::NoConnections);
            }
        }
    }

    /// Closes and removes every connection. Idempotent.
    pub async fn close(&self) {
        let keys: Vec<ConnKey> = self.connections.read().await.keys().cloned().collect();
        for key in keys {
            self.remove(&key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_rejects_duplicate_key() {
        let client = Client::new(ClientConfig::default(), Vec::new(), None);
        let first = client.add("localhost", 4150).await.unwrap();
        assert!(first.is_some());
        let second = client.add("localhost", 4150).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn remove_is_safe_on_absent_key() {
        let client = Client::new(ClientConfig::default(), Vec::new(), None);
        client.remove(&("localhost".to_string(), 4150)).await;
    }

    #[tokio::test]
    async fn read_once_on_empty_map_sleeps_and_returns_empty() {
        let mut config = ClientConfig::default();
        config.timeout = std::time::Duration::from_millis(5);
        let client = Client::new(config, Vec::new(), None);
        let frames = client.read_once().await;
        assert!(frames.is_empty());
    }

    struct MarkerHooks;

    #[async_trait]
    impl ClientHooks for MarkerHooks {
        async fn on_added(&self, _key: &ConnKey, conn: &SharedConnection) {
            let mut c = conn.lock().await;
            c.send(b"PING\n");
            let _ = c.flush().await;
        }
        async fn on_removed(&self, _key: &ConnKey) {}
    }

    /// Regression test for a bug where `add()` fired `on_added` against a
    /// still-`Disconnected` connection, letting a hook's bytes queue ahead of
    /// MAGIC/IDENTIFY and corrupt the wire order on the connect that followed.
    #[tokio::test(flavor = "multi_thread")]
    async fn add_connects_before_firing_on_added_hook() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut magic = [0u8; 4];
            stream.read_exact(&mut magic).await.unwrap();
            assert_eq!(&magic, b"  V2", "MAGIC must be the first bytes written");

            let mut verb = Vec::new();
            loop {
                let mut b = [0u8; 1];
                stream.read_exact(&mut b).await.unwrap();
                verb.push(b[0]);
                if b[0] == b'\n' {
                    break;
                }
            }
            assert_eq!(&verb, b"IDENTIFY\n");

            let mut len_bytes = [0u8; 4];
            stream.read_exact(&mut len_bytes).await.unwrap();
            let len = i32::from_be_bytes(len_bytes) as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await.unwrap();

            let mut resp = Vec::new();
            resp.extend_from_slice(&((b"OK".len() as i32) + 4).to_be_bytes());
            resp.extend_from_slice(&0i32.to_be_bytes());
            resp.extend_from_slice(b"OK");
            stream.write_all(&resp).await.unwrap();

            // The hook's marker must arrive after the handshake completes,
            // never interleaved ahead of MAGIC/IDENTIFY.
            let mut marker = Vec::new();
            loop {
                let mut b = [0u8; 1];
                stream.read_exact(&mut b).await.unwrap();
                if b[0] == b'\n' {
                    break;
                }
                marker.push(b[0]);
            }
            assert_eq!(marker, b"PING");
        });

        let client = Client::new(ClientConfig::default(), Vec::new(), None).with_hooks(Arc::new(MarkerHooks));
        let conn = client.add("127.0.0.1", port).await.unwrap().unwrap();
        assert!(conn.lock().await.is_ready());
        server.await.unwrap();
    }
}
