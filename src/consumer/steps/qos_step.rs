//! The QoS boot step (§4.4): pushes the computed initial prefetch count to
//! the broker as soon as a connection exists.

use async_trait::async_trait;

use crate::broker::Broker;
use crate::error::Error;

use crate::consumer::namespace::BootStep;
use crate::consumer::StepContext;

pub struct QosStep;

impl QosStep {
    pub fn new() -> Self {
        QosStep
    }
}

#[async_trait]
impl<B: Broker + 'static> BootStep<StepContext<B>> for QosStep {
    fn name(&self) -> &str {
        "qos"
    }

    async fn start(&self, ctx: &StepContext<B>) -> Result<(), Error> {
        let initial = ctx.config.initial_prefetch_count();
        ctx.qos.set(ctx.broker.as_ref(), initial).await
    }
}
