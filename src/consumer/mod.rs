//! The supervised Consumer (§2-§5, §9): a boot-step-driven wrapper around a
//! [`Broker`] that owns the connection lifecycle, the QoS/prefetch budget,
//! the ETA timer, and the dispatch pipeline, restarting the whole stack
//! transparently on a recoverable broker fault.
//!
//! This lives alongside, not in place of, `app::Celery`'s simpler
//! unsupervised `consume()` loop: `Celery` is the send/register/trace
//! surface a task author talks to; `Consumer` is the supervisory core a
//! worker binary drives, parameterised by the same `Broker` trait. The two
//! keep independent task registries on purpose (§9's resolution of the
//! "one registry or two" open question) -- `Consumer::register_task` only
//! needs a task's *name* to build a dispatch strategy, while `Celery`'s
//! registry needs the concrete `Task` type to build a tracer. A worker
//! binary that wants both registers with each independently (see
//! `demos/worker.rs`).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::{error, info};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Notify};

use crate::broker::Broker;
use crate::config::Config;
use crate::error::Error;
use crate::events::{task_received_fields, EventDispatcher, NullEventDispatcher};
use crate::protocol::ReceivedTask;

pub mod dispatch;
pub mod loops;
pub mod namespace;
pub mod qos;
pub mod ready_queue;
pub mod steps;
pub mod strategy;
pub mod timer;

use dispatch::DispatchHandlers;
use loops::{asynloop, synloop};
pub use loops::EventLoop;
use namespace::{BootStep, Namespace};
use qos::Qos;
use ready_queue::ReadyQueue;
use steps::{ConnectionStep, EventsStep, HeartbeatStep, QosStep, TaskConsumerStep};
use strategy::{update_strategies, Strategy};
use timer::Timer;

/// Shared state every boot step and the event loop read or mutate. Held
/// behind an `Arc` so boot steps (owned by the `Namespace`) and the
/// `Consumer` itself can both reach it without each step carrying its own
/// back-reference to the `Consumer` (§9's resolution: a flat context struct
/// instead of a self-referential `Namespace<Consumer<B>>`).
pub struct StepContext<B: Broker> {
    pub broker: Arc<B>,
    pub config: Config,
    pub hostname: String,
    pub default_queue: String,
    pub queues: Mutex<HashSet<String>>,
    pub strategies: RwLock<HashMap<String, Strategy>>,
    pub task_names: std::sync::Mutex<Vec<String>>,
    pub qos: Qos,
    pub ready_queue: ReadyQueue<B>,
    pub timer: Timer<ReceivedTask<B>>,
    pub dispatch: DispatchHandlers<B>,
    pub event_dispatcher: Arc<dyn EventDispatcher>,
    pub delivery_tx: UnboundedSender<Result<B::Delivery, Error>>,
    pub should_stop: AtomicBool,
    pub shutdown_notify: Notify,
    pub reserved: AtomicU64,
}

impl<B: Broker + 'static> StepContext<B> {
    /// Subscribe to `queue` if not already subscribed, forwarding its
    /// deliveries into the shared channel the event loop reads from (§4.3
    /// "dynamic add": idempotent on an already-consumed queue).
    pub async fn add_task_queue(&self, queue: &str) -> Result<(), Error> {
        let mut queues = self.queues.lock().await;
        if queues.contains(queue) {
            return Ok(());
        }
        let stream = self.broker.consume(queue).await?;
        queues.insert(queue.to_string());
        drop(queues);

        let tx = self.delivery_tx.clone();
        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = stream;
            while let Some(item) = stream.next().await {
                let mapped = item.map_err(Into::into);
                if tx.send(mapped).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    /// Cancel the broker-side subscription for `queue` and drop it from the
    /// registered set (§4.3 "dynamic cancel").
    pub async fn cancel_task_queue(&self, queue: &str) -> Result<(), Error> {
        let mut queues = self.queues.lock().await;
        if queues.remove(queue) {
            self.broker.cancel_by_queue(queue).await?;
        }
        Ok(())
    }
}

/// The system hostname, falling back to `"unknown"` if detection fails
/// (§3's `hostname` field).
fn detect_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Builds a [`Consumer`], mirroring `app::CeleryBuilder`'s shape: a plain
/// config struct assembled through chained setters, consumed by `build()`.
/// The one thing `Consumer::new` can't express directly is extra boot steps
/// (§6's `consumer_boot_steps` knob) -- steps appended here run after the
/// built-in set, in the order added.
pub struct ConsumerBuilder<B: Broker + 'static> {
    broker: Arc<B>,
    default_queue: String,
    config: Config,
    event_loop: EventLoop,
    event_dispatcher: Arc<dyn EventDispatcher>,
    extra_steps: Vec<Box<dyn BootStep<StepContext<B>>>>,
}

impl<B: Broker + 'static> ConsumerBuilder<B> {
    pub fn new(broker: Arc<B>, default_queue: &str) -> Self {
        ConsumerBuilder {
            broker,
            default_queue: default_queue.to_string(),
            config: Config::default(),
            event_loop: EventLoop::Async,
            event_dispatcher: Arc::new(NullEventDispatcher),
            extra_steps: Vec::new(),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn event_loop(mut self, event_loop: EventLoop) -> Self {
        self.event_loop = event_loop;
        self
    }

    pub fn event_dispatcher(mut self, event_dispatcher: Arc<dyn EventDispatcher>) -> Self {
        self.event_dispatcher = event_dispatcher;
        self
    }

    /// Append a user-defined boot step, run after the built-in set in the
    /// order added (§6 `consumer_boot_steps`, §9 step-graph design).
    pub fn extra_step(mut self, step: Box<dyn BootStep<StepContext<B>>>) -> Self {
        self.extra_steps.push(step);
        self
    }

    pub fn build(self) -> Consumer<B> {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let initial_prefetch = self.config.initial_prefetch_count();
        let dispatch = DispatchHandlers::new(self.broker.clone());

        let ctx = Arc::new(StepContext {
            broker: self.broker,
            config: self.config,
            hostname: detect_hostname(),
            default_queue: self.default_queue,
            queues: Mutex::new(HashSet::new()),
            strategies: RwLock::new(HashMap::new()),
            task_names: std::sync::Mutex::new(Vec::new()),
            qos: Qos::new(initial_prefetch),
            ready_queue: ReadyQueue::new(None),
            timer: Timer::new(),
            dispatch,
            event_dispatcher: self.event_dispatcher,
            delivery_tx,
            should_stop: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            reserved: AtomicU64::new(0),
        });

        let mut steps: Vec<Box<dyn BootStep<StepContext<B>>>> = vec![
            Box::new(ConnectionStep::new()),
            Box::new(QosStep::new()),
            Box::new(TaskConsumerStep::new()),
            Box::new(EventsStep::new()),
            Box::new(HeartbeatStep::new()),
        ];
        steps.extend(self.extra_steps);

        Consumer {
            ctx,
            namespace: Mutex::new(Namespace::new(steps)),
            delivery_rx: Mutex::new(delivery_rx),
            event_loop: self.event_loop,
        }
    }
}

/// The boot-step-supervised consumer. `B` must be `'static` since boot steps
/// and the delivery forwarder tasks are spawned onto the `tokio` runtime.
pub struct Consumer<B: Broker + 'static> {
    ctx: Arc<StepContext<B>>,
    namespace: Mutex<Namespace<StepContext<B>>>,
    delivery_rx: Mutex<UnboundedReceiver<Result<B::Delivery, Error>>>,
    event_loop: EventLoop,
}

impl<B: Broker + 'static> Consumer<B> {
    /// Get a [`ConsumerBuilder`] for configuring extra boot steps, a custom
    /// event dispatcher, or anything else beyond what `new` takes directly.
    pub fn builder(broker: Arc<B>, default_queue: &str) -> ConsumerBuilder<B> {
        ConsumerBuilder::new(broker, default_queue)
    }

    /// Build a consumer with the built-in boot-step set (connection, QoS,
    /// task-consumer, events, heartbeat -- in that dependency order, §9) and
    /// no extra steps.
    pub fn new(broker: Arc<B>, default_queue: &str, config: Config, event_loop: EventLoop) -> Self {
        ConsumerBuilder::new(broker, default_queue).config(config).event_loop(event_loop).build()
    }

    /// Shorthand for a consumer with a non-default event dispatcher but no
    /// extra boot steps.
    pub fn with_event_dispatcher(
        broker: Arc<B>,
        default_queue: &str,
        config: Config,
        event_loop: EventLoop,
        event_dispatcher: Arc<dyn EventDispatcher>,
    ) -> Self {
        ConsumerBuilder::new(broker, default_queue)
            .config(config)
            .event_loop(event_loop)
            .event_dispatcher(event_dispatcher)
            .build()
    }

    /// Register a task name so the dispatch pipeline accepts it (§4.7).
    /// Independent of `app::Celery::register_task` -- see the module doc.
    pub fn register_task(&self, name: &str) -> Result<(), Error> {
        let mut names = self
            .ctx
            .task_names
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        let rebuilt = update_strategies(&names);
        drop(names);
        *self
            .ctx
            .strategies
            .write()
            .unwrap_or_else(|e| e.into_inner()) = rebuilt;
        Ok(())
    }

    /// Run until the Consumer's lifecycle state becomes `Close` (§4.1). The
    /// only method that blocks.
    pub async fn start(&self) -> Result<(), Error> {
        loop {
            if self.ctx.should_stop.load(Ordering::SeqCst) {
                self.namespace.lock().await.shutdown(&self.ctx).await?;
                self.on_close().await;
                return Ok(());
            }

            self.namespace.lock().await.start(&self.ctx).await?;

            let mut rx = self.delivery_rx.lock().await;
            let result = match self.event_loop {
                EventLoop::Async => asynloop(&self.ctx, &mut rx).await,
                EventLoop::Sync => synloop(&self.ctx, &mut rx).await,
            };
            drop(rx);

            match result {
                Ok(()) => {
                    self.namespace.lock().await.shutdown(&self.ctx).await?;
                    self.on_close().await;
                    return Ok(());
                }
                Err(e) if e.is_broker_error() => {
                    error!("Connection to broker lost: {}. Trying to re-establish the connection...", e);
                    self.restart().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop every pending ready-queue task and timer entry without running
    /// them (§3, §4.1, §7 "on_close: Clear internal queues"). Runs once the
    /// namespace has reached `Close` -- unlike `restart`, a terminal close
    /// has no later event-loop iteration left to drain them.
    async fn on_close(&self) {
        self.ctx.ready_queue.clear().await;
        self.ctx.timer.clear();
    }

    /// Stop then restart every boot step, without affecting `strategies`,
    /// `ready_queue`, `timer`, or `qos` (§4.1 restart semantics).
    pub async fn restart(&self) -> Result<(), Error> {
        let mut ns = self.namespace.lock().await;
        ns.stop(&self.ctx).await?;
        ns.start(&self.ctx).await
    }

    /// Pause every boot step without signalling the supervisory loop to
    /// exit. Callers that want `start()` to return should use `shutdown`.
    pub async fn stop(&self) -> Result<(), Error> {
        self.namespace.lock().await.stop(&self.ctx).await
    }

    /// Request a cooperative shutdown (§5 "maybe_shutdown"): the running
    /// event loop notices at its next tick, returns, and `start()` performs
    /// the namespace's two-phase teardown before returning `Ok(())`.
    pub fn shutdown(&self) {
        self.ctx.should_stop.store(true, Ordering::SeqCst);
        self.ctx.shutdown_notify.notify_waiters();
    }

    /// `{ "broker": <info-without-password>, "prefetch_count": <qos.value>,
    /// "hostname": <consumer's hostname> }` (§6).
    pub fn info(&self) -> HashMap<String, Value> {
        let mut broker_info = self.ctx.broker.info();
        broker_info.remove("password");

        let mut info = HashMap::new();
        info.insert(
            "broker".to_string(),
            Value::Object(broker_info.into_iter().collect()),
        );
        info.insert(
            "prefetch_count".to_string(),
            Value::from(self.ctx.qos.value()),
        );
        info.insert(
            "hostname".to_string(),
            Value::String(self.ctx.hostname.clone()),
        );
        info
    }

    /// The consumer's identity string (§3 `hostname`).
    pub fn hostname(&self) -> &str {
        &self.ctx.hostname
    }

    pub fn ready_queue(&self) -> &ReadyQueue<B> {
        &self.ctx.ready_queue
    }
}

/// Route a decoded, registered task to either immediate execution or
/// deferred scheduling (§4.5).
pub async fn on_task<B: Broker + 'static>(
    ctx: &StepContext<B>,
    task: ReceivedTask<B>,
) -> Result<(), Error> {
    if task.revoked() {
        return Ok(());
    }

    info!("Got task from broker: {}", task);

    if ctx.event_dispatcher.enabled() {
        let fields = task_received_fields(
            &task.id,
            &task.name,
            &task.args,
            &task.kwargs,
            task.retries,
            task.eta.as_ref(),
            task.expires.as_ref(),
        );
        ctx.event_dispatcher.send("task-received", fields);
    }

    if let Some(eta) = task.eta {
        if eta.timestamp_nanos_opt().is_none() {
            error!(
                "Could not convert eta {} to a timestamp for task {}",
                eta,
                task.safe_info()
            );
            task.acknowledge().await?;
            return Ok(());
        }
        ctx.qos.increment_eventually(1);
        ctx.timer.apply_at(eta, 6, task);
        return Ok(());
    }

    ctx.reserved.fetch_add(1, Ordering::SeqCst);
    ctx.ready_queue.put(task).await
}

/// Timer callback for a task whose ETA has now passed (§4.5).
pub async fn apply_eta_task<B: Broker + 'static>(
    ctx: &StepContext<B>,
    task: ReceivedTask<B>,
) -> Result<(), Error> {
    ctx.reserved.fetch_add(1, Ordering::SeqCst);
    ctx.ready_queue.put(task).await?;
    ctx.qos.decrement_eventually(1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    /// Poll `condition` until it's true, failing the test if it never is
    /// within a generous bound -- the supervised `start()` loop does its
    /// work on a spawned task, so tests observe it by polling shared state
    /// rather than by hand.
    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    fn consumer(broker: Arc<MockBroker>) -> Arc<Consumer<MockBroker>> {
        Arc::new(Consumer::new(broker, "celery", Config::default(), EventLoop::Sync))
    }

    #[tokio::test]
    async fn starts_and_shuts_down_cleanly() {
        let broker = Arc::new(MockBroker::new());
        let consumer = consumer(broker.clone());

        let handle = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start().await }
        });
        wait_until(|| broker.consuming_from("celery")).await;

        consumer.shutdown();
        handle.await.unwrap().unwrap();

        assert!(!broker.consuming_from("celery"));
    }

    #[tokio::test]
    async fn a_well_formed_task_reaches_the_ready_queue() {
        let broker = Arc::new(MockBroker::new());
        let consumer = consumer(broker.clone());
        consumer.register_task("tasks.add").unwrap();

        let handle = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start().await }
        });
        wait_until(|| broker.consuming_from("celery")).await;

        let raw = serde_json::to_vec(&serde_json::json!({
            "task": "tasks.add", "args": [2, 3], "kwargs": {},
        }))
        .unwrap();
        broker.push("celery", raw);

        let task = {
            let mut popped = None;
            for _ in 0..200 {
                if let Some(task) = consumer.ready_queue().pop().await {
                    popped = Some(task);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            popped.expect("task should have reached the ready queue")
        };
        assert_eq!(task.name, "tasks.add");

        consumer.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn an_eta_task_is_deferred_then_lands_on_the_ready_queue() {
        let broker = Arc::new(MockBroker::new());
        let consumer = consumer(broker.clone());
        consumer.register_task("tasks.add").unwrap();

        let handle = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start().await }
        });
        wait_until(|| broker.consuming_from("celery")).await;

        let eta = (Utc::now() + ChronoDuration::milliseconds(20)).to_rfc3339();
        let raw = serde_json::to_vec(&serde_json::json!({
            "task": "tasks.add", "args": [], "kwargs": {}, "eta": eta,
        }))
        .unwrap();
        broker.push("celery", raw);

        // Immediately after arrival the task is scheduled, not ready yet.
        assert!(consumer.ready_queue().pop().await.is_none());

        let baseline = consumer.ctx.qos.value();
        wait_until(|| consumer.ctx.qos.value() == baseline + 1).await;

        let mut popped = None;
        for _ in 0..400 {
            if let Some(task) = consumer.ready_queue().pop().await {
                popped = Some(task);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(popped.expect("eta task should eventually fire").name, "tasks.add");

        wait_until(|| consumer.ctx.qos.value() == baseline).await;

        consumer.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_clears_the_ready_queue_and_timer() {
        let broker = Arc::new(MockBroker::new());
        let consumer = consumer(broker.clone());
        consumer.register_task("tasks.add").unwrap();

        let handle = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start().await }
        });
        wait_until(|| broker.consuming_from("celery")).await;

        // One task that will land on the ready queue, one ETA task that
        // stays on the timer -- both should be dropped, not run, on close.
        let ready_raw = serde_json::to_vec(&serde_json::json!({
            "task": "tasks.add", "args": [], "kwargs": {},
        }))
        .unwrap();
        broker.push("celery", ready_raw);
        for _ in 0..200 {
            if consumer.ready_queue().len().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(consumer.ready_queue().len().await > 0);

        let far_eta = (Utc::now() + ChronoDuration::seconds(60)).to_rfc3339();
        let eta_raw = serde_json::to_vec(&serde_json::json!({
            "task": "tasks.add", "args": [], "kwargs": {}, "eta": far_eta,
        }))
        .unwrap();
        broker.push("celery", eta_raw);
        wait_until(|| consumer.ctx.timer.len() > 0).await;

        consumer.shutdown();
        handle.await.unwrap().unwrap();

        assert!(consumer.ready_queue().is_empty().await);
        assert_eq!(consumer.ctx.timer.len(), 0);
    }

    #[tokio::test]
    async fn restarts_past_a_connection_storm() {
        let broker = Arc::new(MockBroker::new());
        broker.fail_next_connections(2);
        let config = Config {
            broker_connection_retry: true,
            broker_connection_max_retries: Some(5),
            ..Config::default()
        };
        let consumer = Arc::new(Consumer::new(broker.clone(), "celery", config, EventLoop::Sync));

        let handle = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start().await }
        });
        wait_until(|| broker.consuming_from("celery")).await;

        consumer.shutdown();
        handle.await.unwrap().unwrap();
    }
}
