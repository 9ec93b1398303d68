//! The task-consumer boot step (§4.3): subscribes to the configured default
//! queue and forwards its deliveries into the shared channel the event loop
//! reads from. Delayed on shutdown (§4.1) since in-flight deliveries placed
//! on the ready queue or the timer should still get a chance to run.

use async_trait::async_trait;

use crate::broker::Broker;
use crate::error::Error;

use crate::consumer::namespace::BootStep;
use crate::consumer::StepContext;

pub struct TaskConsumerStep;

impl TaskConsumerStep {
    pub fn new() -> Self {
        TaskConsumerStep
    }
}

#[async_trait]
impl<B: Broker + 'static> BootStep<StepContext<B>> for TaskConsumerStep {
    fn name(&self) -> &str {
        "task-consumer"
    }

    fn delay_shutdown(&self) -> bool {
        true
    }

    async fn start(&self, ctx: &StepContext<B>) -> Result<(), Error> {
        let queue = ctx.default_queue.clone();
        ctx.add_task_queue(&queue).await
    }

    async fn stop(&self, ctx: &StepContext<B>) -> Result<(), Error> {
        let queues: Vec<String> = ctx.queues.lock().await.iter().cloned().collect();
        for queue in queues {
            ctx.cancel_task_queue(&queue).await?;
        }
        Ok(())
    }
}
