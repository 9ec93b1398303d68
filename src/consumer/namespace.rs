//! The boot-step lifecycle graph (§2, §4.1, §9).
//!
//! Grounded on the Python `bootsteps.Namespace`/`StartStopStep`'s two-phase
//! shutdown, generalized per REDESIGN FLAGS §9 into an explicit, statically
//! ordered `Vec<Box<dyn BootStep<P>>>` that returns typed artifacts through
//! `P`'s own fields rather than the original's dynamic attribute-based
//! component graph.

use async_trait::async_trait;

use crate::error::Error;

/// The Consumer's overall lifecycle state (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Start,
    Stop,
    Close,
}

/// A single unit in the boot-step graph. `P` is whatever context object each
/// lifecycle method is handed -- `consumer::StepContext<B>` for the built-in
/// steps -- matching the Python steps' `step.start(parent)` signature rather
/// than each step holding its own back-reference.
#[async_trait]
pub trait BootStep<P: Send + Sync>: Send + Sync {
    /// A human-readable name, used in restart/shutdown logging.
    fn name(&self) -> &str;

    /// If true, this step's `shutdown` runs in shutdown's second phase,
    /// after every non-delayed step has already shut down (§4.1, §9): it
    /// needs to drain in-flight work before releasing its resources.
    fn delay_shutdown(&self) -> bool {
        false
    }

    async fn start(&self, parent: &P) -> Result<(), Error>;

    async fn stop(&self, parent: &P) -> Result<(), Error> {
        let _ = parent;
        Ok(())
    }

    /// Defaults to `stop`; steps with resources that only need releasing at
    /// the very end (not on every restart) override this separately.
    async fn shutdown(&self, parent: &P) -> Result<(), Error> {
        self.stop(parent).await
    }
}

/// An ordered set of boot steps plus the lifecycle state they're driven
/// through. Order is the caller's responsibility: the built-in step set is
/// registered in dependency order by `Consumer::new` (REDESIGN FLAGS §9
/// treats this as a fixed `Vec` rather than a dynamically topologically
/// sorted graph, since the built-in steps have a fixed, known dependency
/// chain: connection before qos before task-consumer).
pub struct Namespace<P: Send + Sync> {
    steps: Vec<Box<dyn BootStep<P>>>,
    state: LifecycleState,
}

impl<P: Send + Sync> Namespace<P> {
    pub fn new(steps: Vec<Box<dyn BootStep<P>>>) -> Self {
        Namespace { steps, state: LifecycleState::Init }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Start every step in order (§4.1 step 2).
    pub async fn start(&mut self, parent: &P) -> Result<(), Error> {
        for step in &self.steps {
            step.start(parent).await?;
        }
        self.state = LifecycleState::Start;
        Ok(())
    }

    /// Stop every step in reverse order without closing the namespace: a
    /// resumable pause used by `restart` and by `Consumer::stop`, per
    /// SPEC_FULL.md §9's resolution of `stop()` vs `shutdown()`.
    pub async fn stop(&mut self, parent: &P) -> Result<(), Error> {
        for step in self.steps.iter().rev() {
            step.stop(parent).await?;
        }
        self.state = LifecycleState::Stop;
        Ok(())
    }

    /// Two-phase terminal teardown (§4.1, §8 scenario 6): non-delayed steps
    /// shut down first, in reverse dependency order; steps that requested
    /// `delay_shutdown` shut down last, after every non-delayed step.
    pub async fn shutdown(&mut self, parent: &P) -> Result<(), Error> {
        let (delayed, immediate): (Vec<_>, Vec<_>) =
            self.steps.iter().rev().partition(|s| s.delay_shutdown());
        for step in immediate {
            step.shutdown(parent).await?;
        }
        for step in delayed {
            step.shutdown(parent).await?;
        }
        self.state = LifecycleState::Close;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingStep {
        label: &'static str,
        delay: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl BootStep<()> for RecordingStep {
        fn name(&self) -> &str {
            self.label
        }

        fn delay_shutdown(&self) -> bool {
            self.delay
        }

        async fn start(&self, _parent: &()) -> Result<(), Error> {
            self.log.lock().unwrap().push(self.label);
            Ok(())
        }

        async fn shutdown(&self, _parent: &()) -> Result<(), Error> {
            self.log.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delayed_step_shuts_down_strictly_after_non_delayed_steps() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn BootStep<()>>> = vec![
            Box::new(RecordingStep { label: "connection", delay: false, log: log.clone() }),
            Box::new(RecordingStep { label: "task-consumer", delay: true, log: log.clone() }),
            Box::new(RecordingStep { label: "qos", delay: false, log: log.clone() }),
        ];
        let mut ns = Namespace::new(steps);
        ns.start(&()).await.unwrap();
        log.lock().unwrap().clear();

        ns.shutdown(&()).await.unwrap();

        let recorded = log.lock().unwrap().clone();
        assert_eq!(recorded.last(), Some(&"task-consumer"));
        assert_eq!(ns.state(), LifecycleState::Close);
    }

    #[tokio::test]
    async fn start_runs_in_declared_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn BootStep<()>>> = vec![
            Box::new(RecordingStep { label: "first", delay: false, log: log.clone() }),
            Box::new(RecordingStep { label: "second", delay: false, log: log.clone() }),
        ];
        let mut ns = Namespace::new(steps);
        ns.start(&()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(ns.state(), LifecycleState::Start);
    }
}
