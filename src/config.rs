//! Client/Consumer configuration.
//!
//! Grounded in the teacher's `config.rs`: a `serde`-derived struct with a
//! `Default` impl and builder-style construction mirroring
//! `ActionCableChannel::builder()`. Unlike the teacher's `Config`, this has
//! no on-disk persistence — a client library has no config directory to
//! save into, so `load`/`save`/`config_dir` have no counterpart here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{AttemptCounter, Backoff};
use crate::connection::IdentifyOptions;
use crate::constants::{
    DEFAULT_CHECK_INTERVAL, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_HEARTBEAT_STALE_FACTOR, DEFAULT_IO_TIMEOUT, DEFAULT_MAX_IN_FLIGHT,
    DEFAULT_REQUEUE_DELAY,
};

/// Configuration shared by both publish-only and consuming clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub nsqd_tcp_addresses: Vec<(String, u16)>,
    pub lookupd_http_addresses: Vec<String>,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    pub heartbeat_stale_factor: u32,
    #[serde(with = "duration_millis")]
    pub check_interval: Duration,
    pub identify_options: IdentifyOptions,
    pub auth_secret: Option<Vec<u8>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            nsqd_tcp_addresses: Vec::new(),
            lookupd_http_addresses: Vec::new(),
            timeout: DEFAULT_IO_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_stale_factor: DEFAULT_HEARTBEAT_STALE_FACTOR,
            check_interval: DEFAULT_CHECK_INTERVAL,
            identify_options: IdentifyOptions::default(),
            auth_secret: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nsqd_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.nsqd_tcp_addresses.push((host.into(), port));
        self
    }

    pub fn with_lookupd_address(mut self, url: impl Into<String>) -> Self {
        self.lookupd_http_addresses.push(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_auth_secret(mut self, secret: Vec<u8>) -> Self {
        self.auth_secret = Some(secret);
        self
    }

    pub fn with_identify_options(mut self, options: IdentifyOptions) -> Self {
        self.identify_options = options;
        self
    }

    /// Builds a fresh reconnect `AttemptCounter` using the default backoff
    /// schedule (spec §4.2): `Clamped(Exponential(2,8), max=60s)`, resetting.
    pub fn new_attempt_counter(&self) -> AttemptCounter {
        AttemptCounter::default_reconnect()
    }

    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff::default_reconnect()
    }

    /// A connection idle longer than this is considered stale (spec §4.4 /
    /// §9 open question: hard-coded 2x in the original, made configurable
    /// here but defaulting to the observed value).
    pub fn heartbeat_stale_threshold(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_stale_factor
    }
}

/// Consumer-specific configuration: topic/channel identity and the
/// max-in-flight RDY budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub client: ClientConfig,
    pub topic: String,
    pub channel: String,
    pub max_in_flight: u32,
    #[serde(with = "duration_millis")]
    pub requeue_delay: Duration,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            client: ClientConfig::default(),
            topic: topic.into(),
            channel: channel.into(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }

    pub fn with_client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    pub fn with_max_in_flight(mut self, n: u32) -> Self {
        self.max_in_flight = n;
        self
    }

    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.timeout, Duration::from_millis(100));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(1));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_stale_threshold(), Duration::from_secs(60));
    }

    #[test]
    fn consumer_default_max_in_flight_is_two_hundred() {
        let cfg = ConsumerConfig::new("orders", "billing");
        assert_eq!(cfg.max_in_flight, 200);
    }

    #[test]
    fn builder_chains_overrides() {
        let cfg = ClientConfig::new()
            .with_nsqd_address("nsqd1", 4150)
            .with_timeout(Duration::from_millis(250));
        assert_eq!(cfg.nsqd_tcp_addresses, vec![("nsqd1".to_string(), 4150)]);
        assert_eq!(cfg.timeout, Duration::from_millis(250));
    }
}
