//! Per-connection state machine: connect, IDENTIFY negotiation, optional
//! TLS/auth upgrade, RDY accounting, and the send/flush/read operations.
//!
//! Grounded in `broker/connection.rs` (background reader + typed
//! request/response shape) and `relay/connection.rs` (async connect +
//! `tokio::select!` read loop), resolved against `original_source/nsq/connection.py`
//! for the IDENTIFY negotiation order and `original_source/nsq/sockets/tls.py`
//! for the want-read/want-write flush-retry contract.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::backoff::AttemptCounter;
use crate::codec::{self, Frame};
use crate::error::{NsqError, Result};

/// Lifecycle states, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Identifying,
    Ready,
    Closed,
}

/// Caller-supplied IDENTIFY options. Fields left `None` fall back to the
/// connection's computed defaults (hostname/FQDN/user-agent).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentifyOptions {
    pub short_id: Option<String>,
    pub long_id: Option<String>,
    #[serde(default = "default_true")]
    pub feature_negotiation: bool,
    pub user_agent: Option<String>,
    pub tls_v1: bool,
    pub snappy: bool,
    pub deflate: bool,
    pub deflate_level: Option<i32>,
    pub max_rdy_count: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl IdentifyOptions {
    /// Validates client-side feature combinations that must fail before any
    /// socket is opened (spec §4.3 "Unsupported features").
    pub fn validate(&self, transform_available: bool) -> Result<()> {
        if self.snappy && self.deflate {
            return Err(NsqError::UnsupportedFeature("snappy and deflate requested simultaneously"));
        }
        if self.tls_v1 && !transform_available {
            return Err(NsqError::UnsupportedFeature("tls_v1"));
        }
        if (self.snappy || self.deflate) && !transform_available {
            return Err(NsqError::UnsupportedFeature("snappy/deflate"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct IdentifyResponse {
    max_rdy_count: Option<u32>,
    tls_v1: Option<bool>,
    auth_required: Option<bool>,
}

/// Outcome of a single write attempt against the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// `n` bytes were accepted by the transport.
    Written(usize),
    /// The transport can't accept more right now (SSL_ERROR_WANT_READ/WRITE
    /// equivalent); the caller must re-offer the same buffer next time.
    WouldBlock,
}

/// Pluggable secure/compressed wrap of an established byte stream. TLS and
/// compression implementations are external collaborators (spec §1); this
/// crate only defines the contract and a plain passthrough.
#[async_trait]
pub trait StreamTransform: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<FlushOutcome>;
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Raw OS socket descriptor backing this transform, if any. Used only by
    /// `Connection`'s `Display` impl; a transform with no underlying fd (or
    /// on a platform without one) returns `None`.
    fn raw_fd(&self) -> Option<i32> {
        None
    }
}

/// Direct, unwrapped `TcpStream` transform — the default when no TLS/compression
/// upgrade is negotiated.
pub struct PlainTransform(pub TcpStream);

#[async_trait]
impl StreamTransform for PlainTransform {
    async fn write(&mut self, buf: &[u8]) -> Result<FlushOutcome> {
        let n = self.0.write(buf).await?;
        Ok(FlushOutcome::Written(n))
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.0.read(buf).await?;
        Ok(n)
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<i32> {
        use std::os::unix::io::AsRawFd;
        Some(self.0.as_raw_fd())
    }
}

/// One TCP endpoint to an nsqd broker.
pub struct Connection {
    host: String,
    port: u16,
    transform: Box<dyn StreamTransform>,
    decoder: codec::FrameDecoder,
    pending: BytesMut,
    read_buf: Vec<u8>,
    state: ConnectionState,
    max_rdy_count: Option<u32>,
    ready: u32,
    last_ready_sent: u32,
    pub attempts: AttemptCounter,
    identify_options: IdentifyOptions,
    auth_secret: Option<Vec<u8>>,
    last_recv: Instant,
}

impl Connection {
    /// Constructs a not-yet-connected `Connection`, validating the requested
    /// feature set up front (spec §4.3: construction-time failure, never
    /// deferred).
    pub fn new(
        host: impl Into<String>,
        port: u16,
        identify_options: IdentifyOptions,
        auth_secret: Option<Vec<u8>>,
    ) -> Result<Self> {
        // Neither TLS nor compression transforms are bundled (external
        // collaborators per spec §1), so any request for them fails now.
        identify_options.validate(false)?;
        Ok(Self {
            host: host.into(),
            port,
            transform: Box::new(NullTransform),
            decoder: codec::FrameDecoder::new(),
            pending: BytesMut::new(),
            read_buf: vec![0u8; 64 * 1024],
            state: ConnectionState::Disconnected,
            max_rdy_count: None,
            ready: 0,
            last_ready_sent: 0,
            attempts: AttemptCounter::default_reconnect(),
            identify_options,
            auth_secret,
            last_recv: Instant::now(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn max_rdy_count(&self) -> Option<u32> {
        self.max_rdy_count
    }

    pub fn current_ready(&self) -> u32 {
        self.ready
    }

    pub fn last_ready_sent(&self) -> u32 {
        self.last_ready_sent
    }

    pub fn last_recv(&self) -> Instant {
        self.last_recv
    }

    /// The live socket's raw fd, if this connection is backed by one right
    /// now (spec §4.3 string representation).
    pub fn raw_fd(&self) -> Option<i32> {
        self.transform.raw_fd()
    }

    /// Connects, sends MAGIC + IDENTIFY, and processes the response,
    /// bounded by `connect_timeout`. On any failure the connection reverts
    /// to `Disconnected` and the attempt is recorded.
    pub async fn connect(&mut self, connect_timeout: Duration) -> Result<()> {
        match self.try_connect(connect_timeout).await {
            Ok(()) => {
                self.attempts.success();
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                self.attempts.failed();
                Err(e)
            }
        }
    }

    async fn try_connect(&mut self, connect_timeout: Duration) -> Result<()> {
        self.state = ConnectionState::Connecting;
        let addr = (self.host.as_str(), self.port);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NsqError::Timeout)??;
        stream.set_nodelay(true).ok();
        self.transform = Box::new(PlainTransform(stream));

        self.state = ConnectionState::Identifying;
        self.write_raw(crate::constants::MAGIC_V2).await?;

        let body = self.identify_body()?;
        self.write_raw(&codec::identify(&body)).await?;

        let frame = tokio::time::timeout(connect_timeout, self.read_one_frame())
            .await
            .map_err(|_| NsqError::Timeout)??;

        let response = match frame {
            Frame::Response(payload) => payload,
            Frame::Error(payload) => {
                let (code, reason) = codec::split_error_payload(&payload);
                return Err(NsqError::Protocol {
                    kind: crate::error::ServerErrorKind::from_code(&code),
                    reason,
                });
            }
            Frame::Message(_) => {
                return Err(NsqError::Decode("expected IDENTIFY response, got MESSAGE".into()))
            }
        };

        if let Ok(identify_response) = serde_json::from_slice::<IdentifyResponse>(&response) {
            if let Some(max_rdy) = identify_response.max_rdy_count {
                self.max_rdy_count = Some(max_rdy);
            }
            if self.identify_options.tls_v1 {
                if identify_response.tls_v1 != Some(true) {
                    return Err(NsqError::UnsupportedFeature("tls_v1 not negotiated by server"));
                }
                // The actual TLS upgrade is performed by an external
                // StreamTransform supplied via `Connection::upgrade`; this
                // core only enforces the negotiation contract.
            }
            if identify_response.auth_required == Some(true) {
                match &self.auth_secret {
                    None => return Err(NsqError::UnsupportedFeature("AUTH required but no secret configured")),
                    Some(secret) => {
                        if !self.identify_options.tls_v1 {
                            log::warn!(
                                "{self} sending AUTH secret over a plaintext connection"
                            );
                        }
                        let secret = secret.clone();
                        self.write_raw(&codec::auth(&secret)).await?;
                        let _ = tokio::time::timeout(connect_timeout, self.read_one_frame()).await;
                    }
                }
            }
        }
        // Else: server didn't advertise feature negotiation; treat the
        // response as an opaque OK and proceed with defaults.

        self.state = ConnectionState::Ready;
        self.last_recv = Instant::now();
        Ok(())
    }

    fn identify_body(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        struct Wire<'a> {
            short_id: &'a str,
            long_id: &'a str,
            feature_negotiation: bool,
            user_agent: &'a str,
            tls_v1: bool,
            snappy: bool,
            deflate: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            deflate_level: Option<i32>,
            #[serde(skip_serializing_if = "Option::is_none")]
            max_rdy_count: Option<u32>,
        }
        let host_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let short_id = self.identify_options.short_id.as_deref().unwrap_or(&host_name);
        let long_id = self.identify_options.long_id.as_deref().unwrap_or(&host_name);
        let default_ua = crate::constants::user_agent();
        let user_agent = self.identify_options.user_agent.as_deref().unwrap_or(&default_ua);
        let wire = Wire {
            short_id,
            long_id,
            feature_negotiation: self.identify_options.feature_negotiation,
            user_agent,
            tls_v1: self.identify_options.tls_v1,
            snappy: self.identify_options.snappy,
            deflate: self.identify_options.deflate,
            deflate_level: self.identify_options.deflate_level,
            max_rdy_count: self.identify_options.max_rdy_count,
        };
        serde_json::to_vec(&wire).map_err(|e| NsqError::Decode(e.to_string()))
    }

    /// Best-effort close: flushes pending bytes, drops the transport, resets
    /// state. Idempotent; never fails.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let _ = self.flush().await;
        self.transform = Box::new(NullTransform);
        self.state = ConnectionState::Closed;
        self.pending.clear();
        self.max_rdy_count = None;
        self.ready = 0;
        self.last_ready_sent = 0;
    }

    /// Enqueues a fully framed command for the next `flush`.
    pub fn send(&mut self, command: &[u8]) {
        self.pending.extend_from_slice(command);
    }

    /// True if there are unflushed outbound bytes.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.send(bytes);
        while !self.pending.is_empty() {
            self.flush().await?;
        }
        Ok(())
    }

    /// Attempts a single write of the pending buffer. On `WouldBlock`, the
    /// buffer is left byte-identical for the next call (spec §4.3 secure
    /// transport flush contract).
    pub async fn flush(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        match self.transform.write(&self.pending).await? {
            FlushOutcome::WouldBlock => Ok(0),
            FlushOutcome::Written(n) => {
                self.pending.advance(n);
                Ok(n)
            }
        }
    }

    async fn read_one_frame(&mut self) -> Result<Frame> {
        loop {
            let frames = self.decoder.decode_all()?;
            if let Some(frame) = frames.into_iter().next() {
                return Ok(frame);
            }
            let n = self.transform.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(NsqError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }

    /// Reads any currently-available bytes, returning zero or more decoded
    /// frames. Each MESSAGE frame decrements `ready` by one.
    pub async fn read(&mut self) -> Result<Vec<Frame>> {
        let n = self.transform.read(&mut self.read_buf).await?;
        if n == 0 {
            return Err(NsqError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }
        self.decoder.extend(&self.read_buf[..n]);
        let frames = self.decoder.decode_all()?;
        for frame in &frames {
            if matches!(frame, Frame::Message(_)) {
                self.ready = self.ready.saturating_sub(1);
            }
        }
        self.last_recv = Instant::now();
        Ok(frames)
    }

    pub fn fin(&mut self, id: &str) {
        self.send(&codec::fin(id));
    }

    pub fn req(&mut self, id: &str, timeout: Duration) {
        self.send(&codec::req(id, timeout.as_millis() as u64));
    }

    pub fn touch(&mut self, id: &str) {
        self.send(&codec::touch(id));
    }

    pub fn nop(&mut self) {
        self.send(&codec::nop());
    }

    /// Sends `RDY n`, storing both `ready` and `last_ready_sent`. Callers
    /// must already have clamped `n` to `max_rdy_count`.
    pub fn rdy(&mut self, n: u32) {
        self.send(&codec::rdy(n));
        self.ready = n;
        self.last_ready_sent = n;
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_ready() { "alive" } else { "dead" };
        match self.raw_fd() {
            Some(fd) => write!(f, "<Connection {}:{} ({status} on FD {fd})>", self.host, self.port),
            None => write!(f, "<Connection {}:{} ({status} on FD none)>", self.host, self.port),
        }
    }
}

/// Placeholder transform for a not-yet-connected or closed `Connection`.
struct NullTransform;

#[async_trait]
impl StreamTransform for NullTransform {
    async fn write(&mut self, _buf: &[u8]) -> Result<FlushOutcome> {
        Err(NsqError::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "connection is not established",
        )))
    }

    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(NsqError::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "connection is not established",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct MockTransform {
        would_block_once: bool,
        written: Arc<Mutex<Vec<u8>>>,
    }

    #[async_trait]
    impl StreamTransform for MockTransform {
        async fn write(&mut self, buf: &[u8]) -> Result<FlushOutcome> {
            if self.would_block_once {
                self.would_block_once = false;
                return Ok(FlushOutcome::WouldBlock);
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(FlushOutcome::Written(buf.len()))
        }

        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn validate_rejects_simultaneous_snappy_and_deflate() {
        let opts = IdentifyOptions {
            snappy: true,
            deflate: true,
            ..Default::default()
        };
        assert!(opts.validate(true).is_err());
    }

    #[test]
    fn validate_rejects_tls_without_transform() {
        let opts = IdentifyOptions {
            tls_v1: true,
            ..Default::default()
        };
        assert!(opts.validate(false).is_err());
        assert!(opts.validate(true).is_ok());
    }

    #[test]
    fn display_format_matches_spec() {
        let conn = Connection::new("nsqd1.example.com", 4150, IdentifyOptions::default(), None).unwrap();
        assert_eq!(conn.to_string(), "<Connection nsqd1.example.com:4150 (dead on FD none)>");
    }

    #[tokio::test]
    async fn flush_retains_identical_buffer_on_would_block() {
        let mut conn = Connection::new("localhost", 4150, IdentifyOptions::default(), None).unwrap();
        let written = Arc::new(Mutex::new(Vec::new()));
        conn.transform = Box::new(MockTransform {
            would_block_once: true,
            written: written.clone(),
        });
        conn.send(b"123");
        let n = conn.flush().await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(&conn.pending[..], b"123");
        assert!(written.lock().unwrap().is_empty());

        let n = conn.flush().await.unwrap();
        assert_eq!(n, 3);
        assert!(conn.pending.is_empty());
        assert_eq!(&written.lock().unwrap()[..], b"123");
    }

    #[tokio::test]
    async fn rdy_updates_ready_and_last_ready_sent() {
        let mut conn = Connection::new("localhost", 4150, IdentifyOptions::default(), None).unwrap();
        conn.rdy(5);
        assert_eq!(conn.current_ready(), 5);
        assert_eq!(conn.last_ready_sent(), 5);
    }
}
