//! Public error type for the NSQ client.
//!
//! Hand-written enum with manual `Display`/`Error` impls, matching
//! `channel::ChannelError` in the teacher crate rather than reaching for
//! `thiserror`. `anyhow` is reserved for the demo binary's top-level error
//! handling (`src/bin/nsq_demo.rs`); the library itself never exposes it.

use std::fmt;

/// The ten server error codes from spec §6/§7, classified fatal vs. non-fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    Invalid,
    BadBody,
    BadTopic,
    BadChannel,
    BadMessage,
    PubFailed,
    MpubFailed,
    FinFailed,
    ReqFailed,
    TouchFailed,
    /// A code the client doesn't recognize. Treated as fatal (safer default).
    Unknown,
}

impl ServerErrorKind {
    /// Parse the leading `CODE` token of an ERROR frame payload.
    pub fn from_code(code: &str) -> Self {
        match code {
            "E_INVALID" => Self::Invalid,
            "E_BAD_BODY" => Self::BadBody,
            "E_BAD_TOPIC" => Self::BadTopic,
            "E_BAD_CHANNEL" => Self::BadChannel,
            "E_BAD_MESSAGE" => Self::BadMessage,
            "E_PUB_FAILED" => Self::PubFailed,
            "E_MPUB_FAILED" => Self::MpubFailed,
            "E_FIN_FAILED" => Self::FinFailed,
            "E_REQ_FAILED" => Self::ReqFailed,
            "E_TOUCH_FAILED" => Self::TouchFailed,
            _ => Self::Unknown,
        }
    }

    /// Non-fatal errors (FIN_FAILED, REQ_FAILED, TOUCH_FAILED) keep the
    /// connection alive; everything else closes it.
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::FinFailed | Self::ReqFailed | Self::TouchFailed)
    }
}

impl fmt::Display for ServerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::Invalid => "E_INVALID",
            Self::BadBody => "E_BAD_BODY",
            Self::BadTopic => "E_BAD_TOPIC",
            Self::BadChannel => "E_BAD_CHANNEL",
            Self::BadMessage => "E_BAD_MESSAGE",
            Self::PubFailed => "E_PUB_FAILED",
            Self::MpubFailed => "E_MPUB_FAILED",
            Self::FinFailed => "E_FIN_FAILED",
            Self::ReqFailed => "E_REQ_FAILED",
            Self::TouchFailed => "E_TOUCH_FAILED",
            Self::Unknown => "E_UNKNOWN",
        };
        write!(f, "{code}")
    }
}

/// Errors surfaced by the NSQ client's public API.
#[derive(Debug)]
pub enum NsqError {
    /// Underlying socket I/O failed.
    Io(std::io::Error),
    /// A readiness wait, connect, or IDENTIFY round-trip exceeded its budget.
    Timeout,
    /// The broker sent an ERROR frame.
    Protocol {
        kind: ServerErrorKind,
        reason: String,
    },
    /// A caller-requested feature (TLS, snappy, deflate, or AUTH) isn't
    /// available on this build or wasn't negotiated by the server.
    UnsupportedFeature(&'static str),
    /// A frame could not be decoded.
    Decode(String),
    /// `ReadinessCoordinator` was asked to distribute RDY across more live
    /// connections than `maxInFlight` allows. The design explicitly leaves
    /// starvation-style rotation unimplemented (spec §4.5, §9 open question).
    TooManyConnections { live: usize, max_in_flight: u32 },
    /// No live connection was available to satisfy `pub`/`mpub`.
    NoConnections,
}

impl fmt::Display for NsqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Protocol { kind, reason } => {
                if reason.is_empty() {
                    write!(f, "server error: {kind}")
                } else {
                    write!(f, "server error: {kind} {reason}")
                }
            }
            Self::UnsupportedFeature(feature) => {
                write!(f, "unsupported feature requested: {feature}")
            }
            Self::Decode(msg) => write!(f, "frame decode error: {msg}"),
            Self::TooManyConnections { live, max_in_flight } => write!(
                f,
                "{live} live connections exceed maxInFlight={max_in_flight}; \
                 rotating RDY distribution is not implemented"
            ),
            Self::NoConnections => write!(f, "no live connection available"),
        }
    }
}

impl std::error::Error for NsqError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NsqError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Convenience alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, NsqError>;
