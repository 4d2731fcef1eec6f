//! Single-flight coalescing of identical in-flight queries
//!
//! The first arrival for a fingerprint becomes the leader and performs the
//! upstream fetch; every later arrival registers a one-shot delivery
//! channel on the leader's entry and waits. The leader ends the flight by
//! publishing the outcome to all waiters, or aborting to close their
//! channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::cache::QueryKey;

/// How long a follower waits for the leader's broadcast.
pub const FOLLOWER_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the stale-flight sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct Flight {
    waiters: Mutex<Vec<oneshot::Sender<Message>>>,
}

/// Role handed to a caller entering a flight.
pub enum FlightRole {
    /// First arrival for the key. Performs the upstream fetch and must end
    /// the flight with `publish` or `abort`.
    Leader,
    /// Later arrival. Awaits the leader's broadcast on this channel; a
    /// closed channel signals the leader aborted.
    Follower(oneshot::Receiver<Message>),
}

/// Registry of in-flight upstream fetches, keyed by query fingerprint.
///
/// At most one leader exists per fingerprint at any instant. The registry
/// lock guards only map access; waiter delivery happens outside it.
#[derive(Default)]
pub struct Coalescer {
    pending: Mutex<HashMap<QueryKey, Arc<Flight>>>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the flight for a key, becoming the leader if none exists.
    pub fn begin(&self, key: &QueryKey) -> FlightRole {
        let mut pending = self.pending.lock().unwrap();
        if let Some(flight) = pending.get(key) {
            let (tx, rx) = oneshot::channel();
            flight.waiters.lock().unwrap().push(tx);
            return FlightRole::Follower(rx);
        }
        pending.insert(
            key.clone(),
            Arc::new(Flight {
                waiters: Mutex::new(Vec::new()),
            }),
        );
        FlightRole::Leader
    }

    /// Leader only: remove the flight and deliver one clone of the reply to
    /// every waiter. Waiters stamp their own ID and question afterwards.
    pub fn publish(&self, key: &QueryKey, resp: &Message) {
        let flight = match self.remove(key) {
            Some(flight) => flight,
            None => return,
        };
        let waiters = std::mem::take(&mut *flight.waiters.lock().unwrap());
        for waiter in waiters {
            // A waiter that timed out and went away is not an error.
            let _ = waiter.send(resp.clone());
        }
    }

    /// Leader only: remove the flight and close every waiter channel,
    /// signalling failure.
    pub fn abort(&self, key: &QueryKey) {
        if let Some(flight) = self.remove(key) {
            flight.waiters.lock().unwrap().clear();
        }
    }

    fn remove(&self, key: &QueryKey) -> Option<Arc<Flight>> {
        self.pending.lock().unwrap().remove(key)
    }

    /// Remove flights whose waiter list is empty, left behind by
    /// pathological interleavings. Returns how many were dropped.
    pub fn sweep_stale(&self) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let before = pending.len();
        pending.retain(|_, flight| !flight.waiters.lock().unwrap().is_empty());
        before - pending.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Spawn the periodic stale-flight sweeper; stops when the shutdown
    /// signal fires.
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + SWEEP_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let swept = self.sweep_stale();
                        if swept > 0 {
                            debug!(swept, "removed stale coalesced flights");
                        }
                    }
                }
            }
        });
    }
}
