//! The hand-off point between the Consumer and the (opaque, externally
//! owned) execution pool (§5, §6).
//!
//! This deliberately isn't a plain `mpsc` channel: `clear()` must be callable
//! from the producer side (the
//! Consumer, on `on_close`/restart) and `put` must be non-blocking with an
//! explicit over-capacity error rather than awaiting channel space, neither
//! of which the `tokio::sync::mpsc` API offers from a shared `&self`.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::broker::Broker;
use crate::error::{Error, ErrorKind};
use crate::protocol::ReceivedTask;

/// A FIFO of decoded, ready-to-run tasks. `None` capacity means unbounded --
/// the QoS budget (§4.4) is the real backpressure mechanism, so most
/// deployments never need a separate bound here.
pub struct ReadyQueue<B: Broker> {
    items: Mutex<VecDeque<ReceivedTask<B>>>,
    capacity: Option<usize>,
    notify: Notify,
}

impl<B: Broker> ReadyQueue<B> {
    pub fn new(capacity: Option<usize>) -> Self {
        ReadyQueue {
            items: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue `task`. Non-blocking: returns an error instead of waiting when
    /// the queue is at capacity (§6).
    pub async fn put(&self, task: ReceivedTask<B>) -> Result<(), Error> {
        let mut items = self.items.lock().await;
        if let Some(capacity) = self.capacity {
            if items.len() >= capacity {
                return Err(Error::from(ErrorKind::ChannelError(
                    "ready queue is at capacity".into(),
                )));
            }
        }
        items.push_back(task);
        drop(items);
        self.notify.notify_one();
        Ok(())
    }

    /// Remove and return the oldest task, if any. The execution pool is
    /// opaque to this crate (§6); this is the drain point a concrete pool
    /// embedding would poll, and what the scenario tests use to assert
    /// ordering.
    pub async fn pop(&self) -> Option<ReceivedTask<B>> {
        self.items.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every pending task without running it (§3: cleared, not
    /// destroyed, across a restart or on `on_close`).
    pub async fn clear(&self) {
        self.items.lock().await.clear();
    }
}
