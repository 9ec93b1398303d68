//! Per-task-name routing strategies (§4.3, §4.7).
//!
//! Grounded on the Python `update_strategies`/`Task.start_strategy`: each
//! registered task gets an entry in the strategies table, rebuilt on every
//! boot and restart. Real per-task argument *type* validation is deferred to
//! the execution pool deserializing the task's concrete type (out of scope
//! here, §1 Non-goals); a strategy only owns the envelope-level shape check
//! common to every task (§4.3 step 3, `validate_args_kwargs`).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Error;
use crate::protocol::validate_args_kwargs;

/// A per-task-name check run once the envelope names a registered task.
pub type Strategy = Arc<dyn Fn(&Value, &Value) -> Result<(), Error> + Send + Sync>;

/// The strategy shared by every registered task: validate that `args`/
/// `kwargs` have protocol-conforming shapes.
pub fn default_strategy() -> Strategy {
    Arc::new(|args, kwargs| validate_args_kwargs(args, kwargs))
}

/// Rebuild the strategies table from the set of registered task names
/// (§4.7). Runs at every boot and restart since a strategy may close over
/// connection-dependent state in richer embeddings than this one.
pub fn update_strategies(task_names: &[String]) -> HashMap<String, Strategy> {
    task_names
        .iter()
        .map(|name| (name.clone(), default_strategy()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_strategies_covers_every_registered_name() {
        let names = vec!["tasks.add".to_string(), "tasks.mul".to_string()];
        let strategies = update_strategies(&names);
        assert_eq!(strategies.len(), 2);
        assert!(strategies.contains_key("tasks.add"));
        assert!(strategies.contains_key("tasks.mul"));
    }

    #[test]
    fn default_strategy_rejects_malformed_args() {
        let strategy = default_strategy();
        let err = strategy(&serde_json::json!({"a": 1}), &serde_json::json!({})).unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::InvalidTaskError(_)));
    }
}
