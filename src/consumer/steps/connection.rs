//! The connection boot step (§4.2): produces a live broker connection,
//! retrying with backoff (or failing over) until connected or the retry
//! budget is exhausted.

use std::sync::atomic::Ordering;

use async_trait::async_trait;
use log::error;

use crate::broker::{Broker, ConnectErrorHandler, NextAttempt};
use crate::error::Error;

use crate::consumer::namespace::BootStep;
use crate::consumer::StepContext;

/// Logs each retry attempt per §4.2: the target URI, the error, and either a
/// backoff countdown or a failover notice.
struct LoggingErrorHandler;

impl ConnectErrorHandler for LoggingErrorHandler {
    fn on_error(&self, uri: &str, error: &Error, next_attempt: NextAttempt) {
        match next_attempt {
            NextAttempt::Backoff { delay } => error!(
                "Consumer: broker connection to {} failed: {}. Trying again in {:.1}s.",
                uri,
                error,
                delay.as_secs_f64()
            ),
            NextAttempt::Failover => error!(
                "Consumer: broker connection to {} failed: {}. Retrying against an alternate host.",
                uri, error
            ),
        }
    }
}

pub struct ConnectionStep;

impl ConnectionStep {
    pub fn new() -> Self {
        ConnectionStep
    }
}

#[async_trait]
impl<B: Broker + 'static> BootStep<StepContext<B>> for ConnectionStep {
    fn name(&self) -> &str {
        "connection"
    }

    async fn start(&self, ctx: &StepContext<B>) -> Result<(), Error> {
        if !ctx.config.broker_connection_retry {
            return ctx.broker.connect().await;
        }

        let should_stop = || ctx.should_stop.load(Ordering::SeqCst);
        ctx.broker
            .ensure_connection(
                &LoggingErrorHandler,
                ctx.config.broker_connection_max_retries,
                &should_stop,
            )
            .await
    }
}
