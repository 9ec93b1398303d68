//! QoS/prefetch management (§4.4, §9).
//!
//! Grounded on the Python `QoS` class: prefetch changes are accumulated as a
//! pending delta and only sent to the broker on `flush` or an explicit
//! `set`, so a burst of task completions collapses into a single
//! `basic_qos` round trip instead of one per task.

use std::sync::atomic::{AtomicI64, AtomicU16, Ordering};

use crate::broker::Broker;
use crate::error::Error;

/// Tracks the prefetch count the event loop wants the broker to have,
/// independent of whatever it currently does.
pub struct Qos {
    value: AtomicU16,
    pending_delta: AtomicI64,
}

impl Qos {
    pub fn new(initial: u16) -> Self {
        Qos {
            value: AtomicU16::new(initial),
            pending_delta: AtomicI64::new(0),
        }
    }

    /// The last value set on the broker (not counting unflushed deltas).
    pub fn value(&self) -> u16 {
        self.value.load(Ordering::SeqCst)
    }

    /// Record `n` more in-flight slots without talking to the broker yet
    /// (§4.4: "prefetch increments/decrements are applied eventually, not
    /// synchronously with every delivery").
    pub fn increment_eventually(&self, n: u16) {
        self.pending_delta.fetch_add(n as i64, Ordering::SeqCst);
    }

    /// Record `n` fewer in-flight slots without talking to the broker yet.
    /// Never lets the eventual value underflow past zero.
    pub fn decrement_eventually(&self, n: u16) {
        let current = self.value.load(Ordering::SeqCst) as i64;
        let floor = -current;
        let mut pending = self.pending_delta.load(Ordering::SeqCst);
        loop {
            let next = (pending - n as i64).max(floor);
            match self.pending_delta.compare_exchange(
                pending,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => pending = actual,
            }
        }
    }

    /// Set the prefetch count immediately, clearing any unflushed delta.
    pub async fn set<B: Broker>(&self, broker: &B, n: u16) -> Result<(), Error> {
        broker.set_prefetch_count(n).await?;
        self.value.store(n, Ordering::SeqCst);
        self.pending_delta.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Apply any accumulated delta to the broker and fold it into `value`.
    pub async fn flush<B: Broker>(&self, broker: &B) -> Result<(), Error> {
        let delta = self.pending_delta.swap(0, Ordering::SeqCst);
        if delta == 0 {
            return Ok(());
        }
        let current = self.value.load(Ordering::SeqCst) as i64;
        let next = (current + delta).max(0) as u16;
        broker.set_prefetch_count(next).await?;
        self.value.store(next, Ordering::SeqCst);
        Ok(())
    }
}
