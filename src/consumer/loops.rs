//! The two event-loop variants (§4.6): an asynchronous, `tokio::select!`
//! driven loop and a synchronous drain loop, chosen at construction time and
//! both servicing the same `StepContext`.
//!
//! Both loop bodies own nothing that the boot steps don't already share
//! through `StepContext`; the only thing private to the loop call itself is
//! the delivery receiver, since only one task may `.recv()` from it at a time.

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use log::error;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::broker::Broker;
use crate::error::Error;

use super::{apply_eta_task, on_task, StepContext};

/// Which event-loop variant a `Consumer` was built with (§9: "a tagged
/// variant chosen at construction" rather than a runtime branch on whether a
/// hub happens to be present).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventLoop {
    /// A hub-driven loop multiplexing the delivery stream, a heartbeat
    /// interval, and the ETA timer's next deadline in one `select!`.
    Async,
    /// A plain drain loop for embeddings without a reactor, or for tests
    /// that want deterministic, non-interleaved polling.
    Sync,
}

/// Run the async event loop until a broker error, a channel disconnect, or a
/// cooperative shutdown signal. Returns `Ok(())` only on cooperative
/// shutdown; everything else is an `Err` for `Consumer::start` to classify.
pub async fn asynloop<B: Broker + 'static>(
    ctx: &StepContext<B>,
    rx: &mut UnboundedReceiver<Result<B::Delivery, Error>>,
) -> Result<(), Error> {
    let heartbeat_period = if ctx.config.broker_heartbeat == 0 {
        Duration::from_secs(60 * 60 * 24)
    } else {
        Duration::from_secs(ctx.config.broker_heartbeat as u64)
    };
    let mut heartbeat = tokio::time::interval(heartbeat_period);
    heartbeat.tick().await; // first tick fires immediately; consume it up front

    loop {
        if ctx.should_stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        let timer_wait = ctx
            .timer
            .sleep_duration()
            .unwrap_or_else(|| Duration::from_secs(1));

        tokio::select! {
            _ = ctx.shutdown_notify.notified() => {
                return Ok(());
            }
            maybe_delivery = rx.next() => {
                match maybe_delivery {
                    Some(delivery_result) => dispatch_one(ctx, delivery_result).await?,
                    None => return Err(channel_closed()),
                }
            }
            _ = heartbeat.tick() => {
                ctx.broker.heartbeat().await?;
            }
            _ = tokio::time::sleep(timer_wait) => {}
        }

        service_timer(ctx).await?;
        ctx.qos.flush(ctx.broker.as_ref()).await?;
    }
}

/// Run the synchronous drain loop: repeated non-blocking reads off the same
/// delivery channel, with the timer serviced between every read (§4.6).
pub async fn synloop<B: Broker + 'static>(
    ctx: &StepContext<B>,
    rx: &mut UnboundedReceiver<Result<B::Delivery, Error>>,
) -> Result<(), Error> {
    loop {
        if ctx.should_stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        match rx.next().now_or_never() {
            Some(Some(delivery_result)) => dispatch_one(ctx, delivery_result).await?,
            Some(None) => return Err(channel_closed()),
            None => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        service_timer(ctx).await?;
        ctx.qos.flush(ctx.broker.as_ref()).await?;
    }
}

/// Hand one delivery result to the dispatch pipeline, then to `on_task`.
async fn dispatch_one<B: Broker + 'static>(
    ctx: &StepContext<B>,
    delivery_result: Result<B::Delivery, Error>,
) -> Result<(), Error> {
    let delivery = delivery_result?;
    let strategies = ctx.strategies.read().map_err(|_| crate::error::ErrorKind::SyncError)?.clone();
    if let Some(task) = ctx.dispatch.classify(delivery, &strategies).await? {
        on_task(ctx, task).await?;
    }
    Ok(())
}

/// Pop every due ETA entry off the timer and hand it to `apply_eta_task`.
async fn service_timer<B: Broker + 'static>(ctx: &StepContext<B>) -> Result<(), Error> {
    for task in ctx.timer.drain_due() {
        if let Err(e) = apply_eta_task(ctx, task).await {
            error!("failed to move due ETA task onto the ready queue: {}", e);
        }
    }
    Ok(())
}

fn channel_closed() -> Error {
    Error::from(crate::error::ErrorKind::ChannelError(
        "delivery channel closed unexpectedly".into(),
    ))
}
