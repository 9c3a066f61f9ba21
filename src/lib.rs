//! Multi-connection client library for the NSQ distributed messaging system.
//!
//! Publishes to topics on one or more nsqd brokers, and/or consumes a
//! topic/channel pair across a dynamically discovered broker fleet:
//! wire-protocol framing, per-connection lifecycle and IDENTIFY negotiation,
//! multi-connection I/O with heartbeat handling and bounded-backoff
//! reconnection, and even RDY-budget distribution across live subscriptions.
//!
//! Message persistence, broker-side logic, transactional publishing, and
//! cross-broker ordering are out of scope — see each module for the
//! boundary of what this crate owns versus what it treats as an external
//! collaborator (HTTP discovery, TLS, compression).

pub mod backoff;
pub mod checker;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod constants;
pub mod consumer;
pub mod discovery;
pub mod error;

pub use backoff::{AttemptCounter, Backoff, SuccessPolicy};
pub use checker::PeriodicChecker;
pub use client::{Client, ClientHooks};
pub use codec::{Frame, Message};
pub use config::{ClientConfig, ConsumerConfig};
pub use connection::{Connection, ConnectionState, IdentifyOptions};
pub use consumer::{Consumer, ScopedMessage};
pub use discovery::{DiscoverySource, LookupdSource, Producer};
pub use error::{NsqError, Result, ServerErrorKind};
