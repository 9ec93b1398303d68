//! The ETA priority timer (§4.5, §6): an in-process schedule of future
//! callbacks, serviced by the event loop on every tick.
//!
//! Grounded on `celery.utils.timer2`'s `apply_at`/`clear` surface referenced
//! by the Python consumer, and on the `tokio::time::sleep_until`-driven
//! deadline queue in the `nolus-protocol-oracle-price-feeder` supervisor
//! example.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::time::Duration;

/// An item scheduled to fire at `deadline`, paired with a coarse tiebreak
/// priority (§5: "priority is a coarse tiebreak" between equal deadlines).
struct Entry<T> {
    deadline: DateTime<Utc>,
    priority: u8,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.priority == other.priority && self.seq == other.seq
    }
}
impl<T> Eq for Entry<T> {}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // `BinaryHeap` is a max-heap; reverse the deadline/priority/seq
        // comparisons so the earliest, highest-priority, earliest-inserted
        // entry sorts highest (pops first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// A priority-ordered schedule of future callbacks. `T` is whatever payload
/// the caller wants back once an entry's deadline has passed;
/// `consumer::dispatch`'s ETA path uses `ReceivedTask<B>`.
pub struct Timer<T> {
    heap: Mutex<BinaryHeap<Entry<T>>>,
    next_seq: Mutex<u64>,
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Timer {
            heap: Mutex::new(BinaryHeap::new()),
            next_seq: Mutex::new(0),
        }
    }
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `item` to fire at `deadline` with the given coarse priority
    /// (lower value sorts earlier among equal deadlines; §4.5 schedules ETA
    /// tasks at priority 6).
    pub fn apply_at(&self, deadline: DateTime<Utc>, priority: u8, item: T) {
        let mut next_seq = self.next_seq.lock().unwrap_or_else(|e| e.into_inner());
        let seq = *next_seq;
        *next_seq += 1;
        drop(next_seq);
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        heap.push(Entry { deadline, priority, seq, item });
    }

    /// Remove every scheduled entry (§3: the timer is *cleared*, not
    /// destroyed, on `on_close`).
    pub fn clear(&self) {
        self.heap.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The deadline of the next entry to fire, if any.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peek()
            .map(|e| e.deadline)
    }

    /// Pop and return every entry whose deadline has already passed.
    pub fn drain_due(&self) -> Vec<T> {
        let now = Utc::now();
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        while let Some(top) = heap.peek() {
            if top.deadline > now {
                break;
            }
            due.push(heap.pop().unwrap().item);
        }
        due
    }

    /// How long the event loop should sleep before the next entry is due,
    /// for use alongside the delivery stream in a `tokio::select!`.
    pub fn sleep_duration(&self) -> Option<Duration> {
        self.next_deadline().map(|deadline| {
            let now = Utc::now();
            if deadline <= now {
                Duration::from_secs(0)
            } else {
                (deadline - now)
                    .to_std()
                    .unwrap_or_else(|_| Duration::from_secs(0))
            }
        })
    }
}
