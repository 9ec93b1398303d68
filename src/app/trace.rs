//! Builds a tracer for a registered task out of a decoded `Message`.
//!
//! Grounded on the Python `celery.app.trace.build_tracer` factory: given a
//! task type and a decoded message, produce something that deserializes the
//! message body, runs the task, and reports `Pending`/`Finished` status back
//! to the `consume()` loop via `TaskEvent` so it can track in-flight work for
//! warm shutdown.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{Error, ErrorKind};
use crate::protocol::{Message, MessageBody};
use crate::task::Task;

use super::{TaskEvent, TaskOptions, TaskStatus};

/// A type-erased, already-deserialized task ready to run and report back.
#[async_trait]
pub trait TracerTrait: Send {
    /// True if the task carries a future `eta` and needs a reserved prefetch
    /// slot rather than immediate-execution accounting.
    fn is_delayed(&self) -> bool;

    /// Run the task, reporting task events as it goes.
    async fn trace(&mut self) -> Result<(), Error>;

    /// The timestamp to retry at, if `trace` failed with `ErrorKind::Retry`.
    fn retry_eta(&self) -> Option<DateTime<Utc>>;
}

struct Tracer<T: Task> {
    task: T,
    options: TaskOptions,
    message: Message,
    event_tx: UnboundedSender<TaskEvent>,
    retry_eta: Option<DateTime<Utc>>,
}

#[async_trait]
impl<T: Task> TracerTrait for Tracer<T> {
    fn is_delayed(&self) -> bool {
        self.message.headers.eta.is_some()
    }

    async fn trace(&mut self) -> Result<(), Error> {
        let _ = self.event_tx.send(TaskEvent::new(TaskStatus::Pending));
        info!("Executing task {}[{}]", T::NAME, self.message.headers.id);

        let result = self.task.run().await;

        let _ = self.event_tx.send(TaskEvent::new(TaskStatus::Finished));

        match result {
            Ok(_) => {
                info!("Task {}[{}] succeeded", T::NAME, self.message.headers.id);
                Ok(())
            }
            Err(e) if matches!(e.kind(), ErrorKind::Retry) => {
                let retries = self.message.headers.retries;
                if let Some(max) = self.options.max_retries {
                    if retries as usize >= max {
                        error!(
                            "Task {}[{}] exceeded max retries ({})",
                            T::NAME,
                            self.message.headers.id,
                            max
                        );
                        return Err(e);
                    }
                }
                self.retry_eta = Some(next_retry_eta(&self.options, retries));
                Err(e)
            }
            Err(e) => {
                error!("Task {}[{}] failed: {}", T::NAME, self.message.headers.id, e);
                Err(e)
            }
        }
    }

    fn retry_eta(&self) -> Option<DateTime<Utc>> {
        self.retry_eta
    }
}

/// Linear backoff bounded by `[min_retry_delay, max_retry_delay]`, keyed off
/// the number of retries already attempted.
fn next_retry_eta(options: &TaskOptions, retries: u32) -> DateTime<Utc> {
    let min = options.min_retry_delay as i64;
    let max = options.max_retry_delay.max(options.min_retry_delay) as i64;
    let delay = (min + retries as i64).min(max).max(0);
    Utc::now() + chrono::Duration::seconds(delay)
}

pub type TraceBuilder = Box<
    dyn Fn(
            Message,
            TaskOptions,
            UnboundedSender<TaskEvent>,
        ) -> Result<Box<dyn TracerTrait>, Error>
        + Send
        + Sync,
>;

/// Deserialize `message`'s body into `T` and wrap it in a `Tracer<T>`.
pub fn build_tracer<T: Task>(
    message: Message,
    options: TaskOptions,
    event_tx: UnboundedSender<TaskEvent>,
) -> Result<Box<dyn TracerTrait>, Error> {
    let body: MessageBody<T> = serde_json::from_slice(&message.raw_data)?;
    Ok(Box::new(Tracer {
        task: body.0,
        options,
        message,
        event_tx,
        retry_eta: None,
    }))
}
