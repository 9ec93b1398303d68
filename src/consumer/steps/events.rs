//! The events boot step: a placeholder lifecycle hook confirming the
//! configured event dispatcher's state at boot. The dispatcher itself has no
//! start/stop lifecycle of its own (§6: only `enabled`/`send` are specified,
//! the sink is an external collaborator) -- this step exists so the boot
//! order and restart/shutdown logging stay uniform across every step.

use async_trait::async_trait;
use log::info;

use crate::broker::Broker;
use crate::error::Error;

use crate::consumer::namespace::BootStep;
use crate::consumer::StepContext;

pub struct EventsStep;

impl EventsStep {
    pub fn new() -> Self {
        EventsStep
    }
}

#[async_trait]
impl<B: Broker + 'static> BootStep<StepContext<B>> for EventsStep {
    fn name(&self) -> &str {
        "events"
    }

    async fn start(&self, ctx: &StepContext<B>) -> Result<(), Error> {
        info!(
            "Event dispatcher ready (enabled={})",
            ctx.event_dispatcher.enabled()
        );
        Ok(())
    }
}
