//! Event Broadcast
//!
//! Fan-out of round events to every connected observer. Each event gets a
//! sequence number when it is published; observers see events in sequence
//! order, at most once. An observer that falls behind is told how many
//! events it missed and has to ask for a fresh snapshot.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::round::events::RoundEvent;

/// Default per-observer backlog.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A published event with its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Position in the global event stream, starting at 1.
    pub seq: u64,
    /// The event.
    #[serde(flatten)]
    pub event: RoundEvent,
}

/// What an observer receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    /// Next event in order.
    Event(EventEnvelope),
    /// Events were dropped; the observer must resync from a snapshot.
    Lagged(u64),
}

/// Publisher side.
#[derive(Debug)]
pub struct BroadcastChannel {
    tx: broadcast::Sender<EventEnvelope>,
    seq: Mutex<u64>,
}

impl BroadcastChannel {
    /// Channel with a per-observer backlog of `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, seq: Mutex::new(0) }
    }

    /// Publish an event. Returns its sequence number.
    ///
    /// Having no observers is not an error.
    pub fn publish(&self, event: RoundEvent) -> u64 {
        // Hold the counter while sending so seq order matches delivery order.
        let mut seq = self.seq.lock().unwrap_or_else(PoisonError::into_inner);
        *seq += 1;
        let envelope = EventEnvelope { seq: *seq, event };
        match self.tx.send(envelope) {
            Ok(n) => trace!(seq = *seq, observers = n, "event published"),
            Err(_) => trace!(seq = *seq, "event published with no observers"),
        }
        *seq
    }

    /// Sequence number of the last published event.
    pub fn last_seq(&self) -> u64 {
        *self.seq.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start observing from the next published event.
    pub fn subscribe(&self) -> Observer {
        Observer { rx: self.tx.subscribe() }
    }

    /// Number of live observers.
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Subscriber side.
#[derive(Debug)]
pub struct Observer {
    rx: broadcast::Receiver<EventEnvelope>,
}

impl Observer {
    /// Wait for the next event. `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<Observed> {
        match self.rx.recv().await {
            Ok(envelope) => Some(Observed::Event(envelope)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "observer lagged");
                Some(Observed::Lagged(missed))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
