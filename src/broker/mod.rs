//! The `Broker` trait: everything the consumer core needs from a live
//! connection to a message broker, without committing to a concrete
//! transport. `amqp` is the one concrete backend shipped here; a test-only
//! in-memory mock lives behind `#[cfg(test)]` in `mock` and backs the
//! scenario tests in `consumer::tests`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde_json::Value;

use crate::error::Error;
use crate::protocol::{Message, TryIntoMessage};

pub mod amqp;
#[cfg(test)]
pub mod mock;

/// Called on every failed connection attempt while retrying (§4.2). Reports
/// the broker URI, the error, and the delay before the next attempt -- or a
/// failover marker when the connection is about to try an alternate host
/// instead of waiting out a backoff (§9: "a discriminated log field, not a
/// template-string choice").
pub trait ConnectErrorHandler: Send + Sync {
    fn on_error(&self, uri: &str, error: &Error, next_attempt: NextAttempt);
}

/// What happens after a failed connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextAttempt {
    /// Retry the same host after sleeping `delay`.
    Backoff { delay: Duration },
    /// Retry immediately against a different, already-known alternate host.
    Failover,
}

/// A no-op error handler for callers that don't care to observe retries.
pub struct NoopErrorHandler;
impl ConnectErrorHandler for NoopErrorHandler {
    fn on_error(&self, _uri: &str, _error: &Error, _next_attempt: NextAttempt) {}
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// A single broker delivery, as handed back by `consume`.
    type Delivery: TryIntoMessage + Clone + Send + Sync;
    /// The error a delivery stream can fail with.
    type DeliveryError: Into<Error> + Send;
    /// The stream of deliveries for one queue.
    type Consumer: Stream<Item = Result<Self::Delivery, Self::DeliveryError>> + Send + Unpin;

    /// Open a connection, retrying according to `max_retries` (`None` =
    /// unbounded) and reporting each failure to `on_error`. `should_stop` is
    /// polled between attempts so a termination signal can break the retry
    /// loop promptly (§4.2).
    async fn ensure_connection(
        &self,
        on_error: &(dyn ConnectErrorHandler),
        max_retries: Option<u32>,
        should_stop: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<(), Error>;

    /// Open a connection once, with no retry.
    async fn connect(&self) -> Result<(), Error>;

    /// The broker URI this connection targets, for diagnostics and retry logs.
    fn as_uri(&self) -> String;

    /// Connection info for the `info` introspection surface (§6). The caller
    /// is responsible for stripping sensitive keys (`Consumer::info` does
    /// this, matching the Python source stripping `password` one level up
    /// rather than baking the redaction into every broker backend).
    fn info(&self) -> HashMap<String, Value>;

    /// Subscribe to a queue, returning the stream of deliveries.
    async fn consume(&self, queue: &str) -> Result<Self::Consumer, Error>;

    /// True if this broker is currently consuming from `queue` (§4.3 dynamic
    /// add/cancel idempotence).
    fn consuming_from(&self, queue: &str) -> bool;

    /// Start consuming from a newly-added queue.
    async fn add_queue(&self, queue: &str) -> Result<(), Error>;

    /// Cancel the subscription for `queue`.
    async fn cancel_by_queue(&self, queue: &str) -> Result<(), Error>;

    /// Send a message to a queue.
    async fn send(&self, message: &Message, queue: &str) -> Result<(), Error>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery: Self::Delivery) -> Result<(), Error>;

    /// Reject a delivery, swallowing any connection/channel error (§4.3
    /// "reject-with-logging": those will be re-raised by the event loop on
    /// its own terms instead).
    async fn reject(&self, delivery: Self::Delivery) -> Result<(), Error> {
        match self.reject_inner(delivery).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_broker_error() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// The actual reject call; overridden per backend, wrapped by the
    /// default `reject` above so every backend gets the same
    /// swallow-broker-errors behavior for free.
    async fn reject_inner(&self, delivery: Self::Delivery) -> Result<(), Error>;

    /// Requeue a delivery for retry, optionally with a new `eta` (used by the
    /// tracer's `ErrorKind::Retry` path in `app::Celery::try_handle_delivery`).
    /// `None` means retry as soon as possible.
    async fn retry(&self, delivery: Self::Delivery, eta: Option<DateTime<Utc>>)
        -> Result<(), Error>;

    /// Set the broker-advertised prefetch count outright (flush point for
    /// `Qos::increment_eventually`/`decrement_eventually`, §4.4).
    async fn set_prefetch_count(&self, count: u16) -> Result<(), Error>;

    /// Bump the advertised prefetch count up by one, for an ETA task that
    /// needs to reserve a slot without yet executing (used directly by the
    /// simple, unsupervised `app::Celery::consume` loop; the supervised
    /// `Consumer` instead goes through `Qos::increment_eventually`, which
    /// batches deltas and flushes via `set_prefetch_count`).
    async fn increase_prefetch_count(&self) -> Result<(), Error>;

    /// The inverse of `increase_prefetch_count`, called once the ETA task
    /// actually executes.
    async fn decrease_prefetch_count(&self) -> Result<(), Error>;

    /// Exercise the connection (send a heartbeat frame). No-op for brokers
    /// that don't use heartbeats.
    async fn heartbeat(&self) -> Result<(), Error> {
        Ok(())
    }
}
