//! Consumer: specializes `Client` for a topic/channel, owns RDY
//! distribution, and surfaces an ordered-per-connection stream of messages.
//!
//! Grounded in `original_source/nsq/reader.py` for the subscribe-on-add and
//! redistribute-on-pressure behavior, and in `original_source/nsq/util.py::distribute`
//! for the even-partition RDY formula (spec §4.5), transliterated directly
//! rather than reinvented.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::client::{Client, ClientHooks, ConnKey, SharedConnection};
use crate::codec::{self, Frame, Message};
use crate::config::ConsumerConfig;
use crate::discovery::DiscoverySource;
use crate::error::{NsqError, Result};

/// Evenly partitions `total` across `n` buckets: bucket `i` receives
/// `floor((i+1)*total/n) - floor(i*total/n)`. Max and min differ by at most
/// one. Direct transliteration of `nsq/util.py::distribute`.
pub fn distribute_rdy(total: u32, n: usize) -> Vec<u32> {
    if n == 0 {
        return Vec::new();
    }
    let n64 = n as u64;
    let total64 = total as u64;
    (0..n as u64)
        .map(|i| {
            let start = (i * total64) / n64;
            let stop = ((i + 1) * total64) / n64;
            (stop - start) as u32
        })
        .collect()
}

struct ConsumerHooks {
    topic: String,
    channel: String,
    dirty: Arc<AtomicBool>,
}

#[async_trait]
impl ClientHooks for ConsumerHooks {
    async fn on_added(&self, _key: &ConnKey, conn: &SharedConnection) {
        let mut c = conn.lock().await;
        c.send(&codec::sub(&self.topic, &self.channel));
        c.rdy(1);
        while c.has_pending() {
            if c.flush().await.is_err() {
                break;
            }
        }
        self.dirty.store(true, Ordering::SeqCst);
    }

    async fn on_removed(&self, _key: &ConnKey) {
        self.dirty.store(true, Ordering::SeqCst);
    }
}

/// A message handle scoped to its originating connection. `fin`/`req`
/// guarantee exactly one effective acknowledgement (first call wins); if
/// neither is called before the handle is dropped, it requeues best-effort
/// on drop with the configured delay, modeling the "REQ on exception" path
/// of a scoped context manager (spec §9 Design Note).
pub struct ScopedMessage {
    message: Message,
    conn: SharedConnection,
    requeue_delay: Duration,
    acked: Arc<AtomicBool>,
}

impl ScopedMessage {
    fn new(message: Message, conn: SharedConnection, requeue_delay: Duration) -> Self {
        Self {
            message,
            conn,
            requeue_delay,
            acked: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn id(&self) -> String {
        self.message.id_str()
    }

    /// Acknowledges successful processing.
    pub async fn fin(&self) {
        if self.acked.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut c = self.conn.lock().await;
        c.fin(&self.message.id_str());
        let _ = c.flush().await;
    }

    /// Requeues the message with the configured delay.
    pub async fn req(&self) {
        if self.acked.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut c = self.conn.lock().await;
        c.req(&self.message.id_str(), self.requeue_delay);
        let _ = c.flush().await;
    }

    /// Extends the broker-side processing timeout. May be called any number
    /// of times before a terminal `fin`/`req`.
    pub async fn touch(&self) {
        let mut c = self.conn.lock().await;
        c.touch(&self.message.id_str());
        let _ = c.flush().await;
    }
}

impl Drop for ScopedMessage {
    fn drop(&mut self) {
        if self.acked.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!(
            "message {} dropped without fin/req; requeuing best-effort",
            self.message.id_str()
        );
        let conn = self.conn.clone();
        let id = self.message.id_str();
        let delay = self.requeue_delay;
        tokio::spawn(async move {
            let mut c = conn.lock().await;
            c.req(&id, delay);
            let _ = c.flush().await;
        });
    }
}

/// Specializes `Client` for a topic/channel subscription: issues `SUB` on
/// every new/reconnected connection, owns the RDY distribution, and yields
/// decoded messages.
pub struct Consumer {
    client: Arc<Client>,
    max_in_flight: u32,
    requeue_delay: Duration,
    dirty: Arc<AtomicBool>,
    queue: Mutex<VecDeque<ScopedMessage>>,
}

impl Consumer {
    pub fn new(config: ConsumerConfig, discovery: Vec<Arc<dyn DiscoverySource>>) -> Self {
        let dirty = Arc::new(AtomicBool::new(true));
        let hooks = Arc::new(ConsumerHooks {
            topic: config.topic.clone(),
            channel: config.channel.clone(),
            dirty: dirty.clone(),
        });
        let client = Arc::new(
            Client::new(config.client, discovery, Some(config.topic)).with_hooks(hooks),
        );
        Self {
            client,
            max_in_flight: config.max_in_flight,
            requeue_delay: config.requeue_delay,
            dirty,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub async fn check_connections(&self) {
        self.client.check_connections().await;
    }

    /// True if RDY should be redistributed: membership changed since the
    /// last check, or any live connection has drained to a quarter of its
    /// last-sent RDY (spec §4.5 "needsDistributeReady").
    async fn needs_distribute_ready(&self) -> bool {
        if self.dirty.swap(false, Ordering::SeqCst) {
            return true;
        }
        for (_, conn) in self.client.snapshot().await {
            let c = conn.lock().await;
            if c.is_ready() && c.last_ready_sent() > 0 {
                let threshold = 0.25 * c.last_ready_sent() as f64;
                if (c.current_ready() as f64) <= threshold {
                    return true;
                }
            }
        }
        false
    }

    /// Evenly repartitions `maxInFlight` across live connections and sends
    /// `RDY` on each, clamped to that connection's `max_rdy_count`.
    async fn distribute_ready(&self) -> Result<()> {
        let live: Vec<(ConnKey, SharedConnection)> = {
            let mut out = Vec::new();
            for (key, conn) in self.client.snapshot().await {
                if conn.lock().await.is_ready() {
                    out.push((key, conn));
                }
            }
            out
        };
        if live.is_empty() {
            return Ok(());
        }
        if live.len() > self.max_in_flight as usize {
            return Err(NsqError::TooManyConnections {
                live: live.len(),
                max_in_flight: self.max_in_flight,
            });
        }
        let shares = distribute_rdy(self.max_in_flight, live.len());
        for ((_key, conn), share) in live.into_iter().zip(shares) {
            let mut c = conn.lock().await;
            let clamped = match c.max_rdy_count() {
                Some(max) => share.min(max),
                None => share,
            };
            c.rdy(clamped);
            let _ = c.flush().await;
        }
        Ok(())
    }

    /// Blocks until the next message arrives on any live connection,
    /// redistributing RDY whenever membership or pressure demands it.
    /// Responses and errors are consumed internally (heartbeats and errors
    /// already handled by `Client::read_once`); only `MESSAGE` frames are
    /// yielded, matching spec §4.5 iteration semantics. Must be paired with
    /// a running `PeriodicChecker` driving `check_connections`.
    pub async fn next_message(&self) -> Option<ScopedMessage> {
        loop {
            if let Some(msg) = self.queue.lock().await.pop_front() {
                return Some(msg);
            }

            let frames = self.client.read_once().await;
            let mut saw_message = false;
            for surfaced in frames {
                if let Frame::Message(message) = surfaced.frame {
                    saw_message = true;
                    if let Some(conn) = self.client.get(&surfaced.key).await {
                        let scoped = ScopedMessage::new(message, conn, self.requeue_delay);
                        self.queue.lock().await.push_back(scoped);
                    }
                }
            }

            if self.needs_distribute_ready().await {
                if let Err(e) = self.distribute_ready().await {
                    log::error!("RDY redistribution skipped: {e}");
                }
            }

            if saw_message {
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distributes_ten_across_three_as_three_three_four() {
        assert_eq!(distribute_rdy(10, 3), vec![3, 3, 4]);
    }

    #[test]
    fn distributes_ten_across_two_as_five_five() {
        assert_eq!(distribute_rdy(10, 2), vec![5, 5]);
    }

    #[test]
    fn distributes_across_one_as_total() {
        assert_eq!(distribute_rdy(200, 1), vec![200]);
    }

    #[test]
    fn max_and_min_share_differ_by_at_most_one() {
        let shares = distribute_rdy(17, 5);
        let max = *shares.iter().max().unwrap();
        let min = *shares.iter().min().unwrap();
        assert!(max - min <= 1);
        assert_eq!(shares.iter().sum::<u32>(), 17);
    }

    #[test]
    fn zero_connections_yields_empty() {
        assert_eq!(distribute_rdy(10, 0), Vec::<u32>::new());
    }
}
