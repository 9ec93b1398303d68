//! An in-memory `Broker` used by the scenario tests under `consumer::tests`
//! (§8) and by the classifier unit tests in `consumer::dispatch`. Not part
//! of the public API -- compiled only under `#[cfg(test)]` (see the
//! `#[cfg(test)] pub mod mock;` declaration in `broker::mod`).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{Broker, ConnectErrorHandler, NextAttempt};
use crate::error::{Error, ErrorKind};
use crate::protocol::{Message, TryIntoMessage};

#[derive(Clone, Debug)]
pub struct MockDelivery {
    pub id: u64,
    pub raw_data: Vec<u8>,
}

impl TryIntoMessage for MockDelivery {
    fn try_into_message(&self) -> Result<Message, Error> {
        let body: Value = serde_json::from_slice(&self.raw_data)?;
        let task = body
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Ok(Message::builder(&task, self.raw_data.clone()).build())
    }
}

#[derive(Debug)]
pub struct MockDeliveryError(pub String);

impl From<MockDeliveryError> for Error {
    fn from(e: MockDeliveryError) -> Error {
        Error::from(ErrorKind::ChannelError(e.0))
    }
}

/// A channel-backed stream of deliveries for one queue; `MockBroker::push`
/// feeds it directly, with no serialization or network round-trip.
pub struct MockConsumer {
    rx: UnboundedReceiver<MockDelivery>,
}

impl Stream for MockConsumer {
    type Item = Result<MockDelivery, MockDeliveryError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx).map(|opt| opt.map(Ok))
    }
}

#[derive(Default)]
struct Inner {
    senders: HashMap<String, UnboundedSender<MockDelivery>>,
    acked: Vec<u64>,
    rejected: Vec<u64>,
    retried: Vec<(u64, Option<DateTime<Utc>>)>,
    sent: Vec<(String, Vec<u8>)>,
    prefetch_count: u16,
    connect_failures_remaining: u32,
}

/// `connect`/`ensure_connection` succeed immediately unless primed with
/// `fail_next_connections`, exercising the connection-storm/restart scenario
/// (§8 scenario 5) without a real broker.
pub struct MockBroker {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        MockBroker {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish a raw body to `queue`. Panics if nothing is consuming from
    /// `queue` yet: tests must call `consume()` before `push`, matching the
    /// ordering a real broker enforces.
    pub fn push(&self, queue: &str, raw_data: Vec<u8>) -> MockDelivery {
        let delivery = MockDelivery { id: self.alloc_id(), raw_data };
        let inner = self.lock();
        let sender = inner
            .senders
            .get(queue)
            .unwrap_or_else(|| panic!("no consumer registered for queue {}", queue));
        sender.send(delivery.clone()).expect("consumer stream dropped");
        delivery
    }

    /// Build a standalone delivery without enqueueing it, for classifier unit
    /// tests that call `DispatchHandlers::classify` directly.
    pub fn push_raw(&self, raw_data: Vec<u8>) -> MockDelivery {
        MockDelivery { id: self.alloc_id(), raw_data }
    }

    pub fn acked_count(&self) -> usize {
        self.lock().acked.len()
    }

    pub fn rejected_count(&self) -> usize {
        self.lock().rejected.len()
    }

    pub fn retried_count(&self) -> usize {
        self.lock().retried.len()
    }

    pub fn prefetch_count(&self) -> u16 {
        self.lock().prefetch_count
    }

    pub fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }

    pub fn fail_next_connections(&self, n: u32) {
        self.lock().connect_failures_remaining = n;
    }
}

#[async_trait]
impl Broker for MockBroker {
    type Delivery = MockDelivery;
    type DeliveryError = MockDeliveryError;
    type Consumer = MockConsumer;

    async fn ensure_connection(
        &self,
        on_error: &(dyn ConnectErrorHandler),
        max_retries: Option<u32>,
        should_stop: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<(), Error> {
        let mut attempts = 0;
        loop {
            if should_stop() {
                return Err(Error::from(ErrorKind::ForcedShutdown));
            }
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    if let Some(max) = max_retries {
                        if attempts >= max {
                            return Err(e);
                        }
                    }
                    on_error.on_error(
                        &self.as_uri(),
                        &e,
                        NextAttempt::Backoff { delay: Duration::from_millis(1) },
                    );
                }
            }
        }
    }

    async fn connect(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.connect_failures_remaining > 0 {
            inner.connect_failures_remaining -= 1;
            return Err(Error::from(ErrorKind::ConnectionError(
                "mock connection failure".into(),
            )));
        }
        Ok(())
    }

    fn as_uri(&self) -> String {
        "mock://localhost".to_string()
    }

    fn info(&self) -> HashMap<String, Value> {
        let mut info = HashMap::new();
        info.insert("uri".to_string(), Value::String(self.as_uri()));
        info
    }

    async fn consume(&self, queue: &str) -> Result<Self::Consumer, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().senders.insert(queue.to_string(), tx);
        Ok(MockConsumer { rx })
    }

    fn consuming_from(&self, queue: &str) -> bool {
        self.lock().senders.contains_key(queue)
    }

    async fn add_queue(&self, queue: &str) -> Result<(), Error> {
        self.consume(queue).await.map(|_| ())
    }

    async fn cancel_by_queue(&self, queue: &str) -> Result<(), Error> {
        self.lock().senders.remove(queue);
        Ok(())
    }

    async fn send(&self, message: &Message, queue: &str) -> Result<(), Error> {
        self.lock()
            .sent
            .push((queue.to_string(), message.raw_data.clone()));
        Ok(())
    }

    async fn ack(&self, delivery: Self::Delivery) -> Result<(), Error> {
        self.lock().acked.push(delivery.id);
        Ok(())
    }

    async fn reject_inner(&self, delivery: Self::Delivery) -> Result<(), Error> {
        self.lock().rejected.push(delivery.id);
        Ok(())
    }

    async fn retry(
        &self,
        delivery: Self::Delivery,
        eta: Option<DateTime<Utc>>,
    ) -> Result<(), Error> {
        self.lock().retried.push((delivery.id, eta));
        Ok(())
    }

    async fn set_prefetch_count(&self, count: u16) -> Result<(), Error> {
        self.lock().prefetch_count = count;
        Ok(())
    }

    async fn increase_prefetch_count(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.prefetch_count = inner.prefetch_count.saturating_add(1);
        Ok(())
    }

    async fn decrease_prefetch_count(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.prefetch_count = inner.prefetch_count.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_consume_round_trips_a_delivery() {
        let broker = MockBroker::new();
        let mut consumer = broker.consume("celery").await.unwrap();
        broker.push("celery", b"{}".to_vec());
        let delivery = futures::StreamExt::next(&mut consumer).await.unwrap().unwrap();
        assert_eq!(delivery.raw_data, b"{}".to_vec());
    }

    #[tokio::test]
    async fn connect_fails_the_primed_number_of_times() {
        let broker = MockBroker::new();
        broker.fail_next_connections(2);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
    }

    #[tokio::test]
    async fn ack_and_reject_are_recorded() {
        let broker = MockBroker::new();
        let d1 = broker.push_raw(b"{}".to_vec());
        let d2 = broker.push_raw(b"{}".to_vec());
        broker.ack(d1).await.unwrap();
        broker.reject(d2).await.unwrap();
        assert_eq!(broker.acked_count(), 1);
        assert_eq!(broker.rejected_count(), 1);
    }
}
