//! The `Task` trait implemented by user task types.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;

/// A unit of work that can be sent to and executed by a worker.
///
/// Task types are ordinary structs whose fields are the task's arguments;
/// `#[derive(Serialize, Deserialize)]` gives them the wire representation,
/// and `impl Task` gives them a name and an execution body.
#[async_trait]
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The unique, stable name this task is registered and dispatched under.
    const NAME: &'static str;

    /// What running this task produces.
    type Returns: Send + Sync + 'static;

    /// Execute the task.
    async fn run(&self) -> Result<Self::Returns, Error>;

    /// Per-task override of the app's default task timeout, in seconds.
    fn timeout(&self) -> Option<usize> {
        None
    }

    /// Per-task override of the app's default maximum retry count.
    fn max_retries(&self) -> Option<usize> {
        None
    }

    /// Per-task override of the app's default minimum retry delay, in seconds.
    fn min_retry_delay(&self) -> Option<usize> {
        None
    }

    /// Per-task override of the app's default maximum retry delay, in seconds.
    fn max_retry_delay(&self) -> Option<usize> {
        None
    }
}
