//! Stoppable periodic worker driving `Client::check_connections`.
//!
//! Grounded in `original_source/nsq/checker.py::PeriodicThread` for the
//! "schedule accounts for elapsed callback time" behavior, and in the
//! teacher's `channel/action_cable.rs::run_connection_loop` for the
//! `tokio::select!`-between-timer-and-shutdown-channel shape.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A running periodic worker. Dropping this without calling `stop` leaves
/// the background task running; call `stop` for a clean, idempotent shutdown.
pub struct PeriodicChecker {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicChecker {
    /// Spawns a task that invokes `callback` every `interval`, accounting for
    /// how long the previous invocation took (`next_fire = interval - elapsed`,
    /// floored at zero) so jitter doesn't accumulate unbounded.
    pub fn spawn<F, Fut>(interval: Duration, mut callback: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let _log_on_exit = scopeguard::guard((), |_| {
                log::debug!("periodic checker task exiting");
            });
            loop {
                let started = Instant::now();
                tokio::select! {
                    _ = &mut stop_rx => {
                        return;
                    }
                    _ = callback() => {}
                }
                let elapsed = started.elapsed();
                let wait = interval.saturating_sub(elapsed);
                tokio::select! {
                    _ = &mut stop_rx => {
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        });
        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Unblocks the worker's current wait and stops it. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PeriodicChecker {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}
