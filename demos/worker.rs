//! A worker binary driving the supervised `Consumer` against a real AMQP
//! broker, with a `producer` subcommand for sending it a handful of tasks.
//!
//! Run a broker locally, then:
//!
//! ```sh
//! cargo run --example worker -- consumer
//! cargo run --example worker -- producer
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use exitfailure::ExitFailure;
use serde::{Deserialize, Serialize};
use structopt::StructOpt;

use consumer_core::broker::amqp::AmqpBroker;
use consumer_core::consumer::{Consumer, EventLoop};
use consumer_core::{Celery, Config, Error, Task};

#[derive(Debug, StructOpt)]
#[structopt(name = "worker")]
struct Opt {
    #[structopt(subcommand)]
    cmd: Command,

    /// Broker connection string.
    #[structopt(long, env = "AMQP_ADDR", default_value = "amqp://127.0.0.1:5672/%2f")]
    broker_uri: String,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Run the supervised consumer, processing tasks off the default queue.
    Consumer,
    /// Send a handful of `add` tasks to the default queue and exit.
    Producer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Add {
    x: i32,
    y: i32,
}

#[async_trait]
impl Task for Add {
    const NAME: &'static str = "worker.add";
    type Returns = i32;

    async fn run(&self) -> Result<Self::Returns, Error> {
        Ok(self.x + self.y)
    }
}

#[tokio::main]
async fn main() -> Result<(), ExitFailure> {
    env_logger::init();
    let opt = Opt::from_args();

    match opt.cmd {
        Command::Producer => run_producer(&opt.broker_uri).await?,
        Command::Consumer => run_consumer(&opt.broker_uri).await?,
    }

    Ok(())
}

async fn run_producer(broker_uri: &str) -> Result<(), Error> {
    let broker = AmqpBroker::new(broker_uri, 0);
    let app = Celery::new("worker-demo", broker);

    for (x, y) in [(1, 1), (2, 3), (5, 8)] {
        app.send_task(Add { x, y }, "celery").await?;
    }
    Ok(())
}

async fn run_consumer(broker_uri: &str) -> Result<(), Error> {
    let broker = Arc::new(AmqpBroker::new(broker_uri, 30));
    let config = Config::default().apply_env_overrides();
    let consumer = Arc::new(Consumer::new(broker, "celery", config, EventLoop::Async));
    consumer.register_task(Add::NAME)?;

    let shutdown = tokio::spawn({
        let consumer = consumer.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            consumer.shutdown();
        }
    });

    consumer.start().await?;
    shutdown.abort();
    Ok(())
}
