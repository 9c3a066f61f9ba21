//! Crate-wide constants for the NSQ client.
//!
//! Mirrors the original `nsq/constants.py` verb and frame-type bytes, grouped
//! by domain the way the teacher's `constants.rs` groups timeouts and
//! identity strings.

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// User-Agent advertised in IDENTIFY unless the caller overrides it.
pub fn user_agent() -> String {
    format!("nsq-client-rs/{}", env!("CARGO_PKG_VERSION"))
}

// ============================================================================
// Wire protocol
// ============================================================================

/// Sent once immediately after TCP connect, before any command.
pub const MAGIC_V2: &[u8] = b"  V2";

/// Command terminator.
pub const NL: u8 = b'\n';

/// Heartbeat payload on a RESPONSE frame.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Maximum frame payload size accepted by the decoder (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

// ============================================================================
// Timeouts & polling
// ============================================================================

/// Default I/O-readiness wait per `Client::read` pass.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_millis(100);

/// Default budget for MAGIC + IDENTIFY + response during `connect`.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Nominal broker heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A connection idle beyond this multiple of the heartbeat interval is
/// considered stale and is reconnected. Kept configurable (spec open
/// question) but defaulting to the observed `2x`.
pub const DEFAULT_HEARTBEAT_STALE_FACTOR: u32 = 2;

/// Default requeue delay used by the scoped message-acknowledgement helper
/// when the caller's handler panics or returns an error.
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(60);

/// Default max-in-flight budget for a Consumer.
pub const DEFAULT_MAX_IN_FLIGHT: u32 = 200;

/// Reconnect-ready re-check cadence used by `PeriodicChecker` when the
/// caller doesn't specify one explicitly.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
