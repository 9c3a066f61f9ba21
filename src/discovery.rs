//! Discovery source contract: given a topic, yields the current set of
//! broker `(host, port)` producers.
//!
//! Grounded in `original_source/nsq/http/nsqlookupd.py`: the original exposes
//! a much wider HTTP surface (`ping`, `info`, `topics`, `channels`, `nodes`,
//! topic/channel management, `tombstone_topic_producer`, `debug`). Per spec
//! §1 ("HTTP administrative clients... treated as a Discovery Source") and
//! §6 ("core ignores all other fields"), this crate exposes only `lookup`;
//! the rest of that surface is a deliberately out-of-scope Non-goal, not an
//! oversight.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{NsqError, Result};

/// A broker endpoint as returned by a discovery source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Producer {
    pub host: String,
    pub tcp_port: u16,
}

/// Given a topic, yields the current set of broker producers. Implemented
/// externally to the core (spec §1); this crate ships one HTTP-backed
/// implementation (`LookupdSource`) against nsqlookupd's `/lookup` endpoint.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn lookup(&self, topic: &str) -> Result<Vec<Producer>>;
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    producers: Vec<RawProducer>,
}

/// Only `broadcast_address` and `tcp_port` are read; every other field the
/// real nsqlookupd response carries (`remote_address`, `hostname`,
/// `http_port`, version tags, …) is ignored, matching the original client's
/// behavior (spec §9 open question: preserve, don't widen).
#[derive(Debug, Deserialize)]
struct RawProducer {
    broadcast_address: String,
    tcp_port: u16,
}

/// Queries one or more `nsqlookupd` HTTP endpoints for the producers of a topic.
pub struct LookupdSource {
    client: reqwest::Client,
    addresses: Vec<String>,
}

impl LookupdSource {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            addresses,
        }
    }
}

#[async_trait]
impl DiscoverySource for LookupdSource {
    async fn lookup(&self, topic: &str) -> Result<Vec<Producer>> {
        let mut producers = Vec::new();
        for base in &self.addresses {
            let url = format!("{base}/lookup?topic={topic}");
            let result: std::result::Result<LookupResponse, _> = async {
                let resp = self.client.get(&url).send().await?;
                resp.json::<LookupResponse>().await
            }
            .await;
            match result {
                Ok(parsed) => {
                    producers.extend(parsed.producers.into_iter().map(|p| Producer {
                        host: p.broadcast_address,
                        tcp_port: p.tcp_port,
                    }));
                }
                Err(e) => {
                    // Per-source failures are logged and ignored (spec §4.4
                    // checkConnections: "ignoring per-source failures").
                    log::warn!("lookupd query to {url} failed: {e}");
                }
            }
        }
        if producers.is_empty() && self.addresses.is_empty() {
            return Err(NsqError::NoConnections);
        }
        Ok(producers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn lookup_parses_producers_and_ignores_extra_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/lookup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "producers": [
                    {
                        "broadcast_address": "nsqd1.example.com",
                        "hostname": "nsqd1",
                        "remote_address": "10.0.0.1:4150",
                        "tcp_port": 4150,
                        "http_port": 4151
                    }
                ]
            })))
            .mount(&server)
            .await;

        let source = LookupdSource::new(vec![server.uri()]);
        let producers = source.lookup("orders").await.unwrap();
        assert_eq!(
            producers,
            vec![Producer {
                host: "nsqd1.example.com".to_string(),
                tcp_port: 4150,
            }]
        );
    }

    #[tokio::test]
    async fn per_source_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/lookup"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let source = LookupdSource::new(vec![server.uri()]);
        let producers = source.lookup("orders").await.unwrap();
        assert!(producers.is_empty());
    }
}
