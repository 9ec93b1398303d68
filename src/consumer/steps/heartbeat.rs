//! The heartbeat boot step: periodically exercises the broker connection so
//! a silently-dropped socket surfaces as a connection error promptly instead
//! of waiting for the next delivery or publish attempt.

use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::task::JoinHandle;

use crate::broker::Broker;
use crate::error::Error;

use crate::consumer::namespace::BootStep;
use crate::consumer::StepContext;

pub struct HeartbeatStep {
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatStep {
    pub fn new() -> Self {
        HeartbeatStep { handle: std::sync::Mutex::new(None) }
    }
}

#[async_trait]
impl<B: Broker + 'static> BootStep<StepContext<B>> for HeartbeatStep {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn start(&self, ctx: &StepContext<B>) -> Result<(), Error> {
        if ctx.config.broker_heartbeat == 0 {
            return Ok(());
        }
        let broker = ctx.broker.clone();
        let period = Duration::from_secs(ctx.config.broker_heartbeat as u64);

        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = broker.heartbeat().await {
                    warn!("heartbeat failed: {}", e);
                    return;
                }
            }
        });

        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(join);
        Ok(())
    }

    async fn stop(&self, _ctx: &StepContext<B>) -> Result<(), Error> {
        if let Some(join) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            join.abort();
        }
        Ok(())
    }
}
