//! Fan-out hub for server output.
//!
//! Keeps the most recent lines in a ring buffer so late subscribers get some context, and
//! pushes new lines to every live subscriber through a bounded queue. A full queue drops
//! the newest line for that subscriber only; publishing never waits on a reader.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

pub const DEFAULT_BUFFER_LINES: usize = 500;
pub const SUBSCRIBER_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    pub at: OffsetDateTime,
}

struct Hub {
    buffer: VecDeque<LogLine>,
    capacity: usize,
    subscribers: HashMap<u64, mpsc::Sender<LogLine>>,
    next_id: u64,
}

#[derive(Clone)]
pub struct LogBroadcaster {
    hub: Arc<Mutex<Hub>>,
    queue: usize,
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_LINES)
    }
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self::with_queue(capacity, SUBSCRIBER_QUEUE)
    }

    pub fn with_queue(capacity: usize, queue: usize) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                buffer: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                subscribers: HashMap::new(),
                next_id: 0,
            })),
            queue: queue.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, text: impl Into<String>) {
        let line = LogLine {
            text: text.into(),
            at: OffsetDateTime::now_utc(),
        };
        let mut hub = self.lock();
        if hub.buffer.len() == hub.capacity {
            hub.buffer.pop_front();
        }
        hub.buffer.push_back(line.clone());

        hub.subscribers.retain(|id, tx| match tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(subscriber = id, "subscriber queue full, line dropped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = id, "subscriber gone");
                false
            }
        });
    }

    /// Registers a subscriber. The buffered lines are captured under the same lock that
    /// registers the queue, so replay and live delivery neither overlap nor leave a gap.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue);
        let mut hub = self.lock();
        let id = hub.next_id;
        hub.next_id += 1;
        hub.subscribers.insert(id, tx);
        let replay = hub.buffer.clone();
        debug!(subscriber = id, replay = replay.len(), "log subscriber added");
        Subscription {
            id,
            replay,
            rx,
            hub: self.clone(),
        }
    }

    /// Idempotent.
    pub fn unsubscribe(&self, id: u64) {
        if self.lock().subscribers.remove(&id).is_some() {
            debug!(subscriber = id, "log subscriber removed");
        }
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lock().buffer.iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// A live subscription; dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    replay: VecDeque<LogLine>,
    rx: mpsc::Receiver<LogLine>,
    hub: LogBroadcaster,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Buffered lines first, then live ones. `None` once the broadcaster dropped this
    /// subscriber.
    pub async fn recv(&mut self) -> Option<LogLine> {
        if let Some(line) = self.replay.pop_front() {
            return Some(line);
        }
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<LogLine> {
        self.replay.pop_front().or_else(|| self.rx.try_recv().ok())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
