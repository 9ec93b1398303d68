//! The `task-received` event dispatcher surface (§4.5, §6).
//!
//! The real event-reporting sink (e.g. broker-backed event exchange, a
//! metrics pipe) is an external collaborator; this module only specifies the
//! `enabled`/`send` surface the consumer needs, plus a no-op default so a
//! worker that doesn't care about events pays nothing for it.

use std::collections::HashMap;

use serde_json::Value;

/// Sends lifecycle events about tasks as they move through the consumer.
pub trait EventDispatcher: Send + Sync {
    /// If `false`, the consumer skips building event payloads entirely.
    fn enabled(&self) -> bool;

    /// Send a named event with the given fields.
    fn send(&self, event: &str, fields: HashMap<String, Value>);
}

/// The default dispatcher: always disabled, so `send` is never invoked.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventDispatcher;

impl EventDispatcher for NullEventDispatcher {
    fn enabled(&self) -> bool {
        false
    }

    fn send(&self, _event: &str, _fields: HashMap<String, Value>) {}
}

/// Build the field map for a `task-received` event (§4.5 step 3).
pub fn task_received_fields(
    uuid: &uuid::Uuid,
    name: &str,
    args: &Value,
    kwargs: &Value,
    retries: u32,
    eta: Option<&chrono::DateTime<chrono::Utc>>,
    expires: Option<&chrono::DateTime<chrono::Utc>>,
) -> HashMap<String, Value> {
    let mut fields = HashMap::new();
    fields.insert("uuid".to_string(), Value::String(uuid.to_string()));
    fields.insert("name".to_string(), Value::String(name.to_string()));
    fields.insert("args".to_string(), args.clone());
    fields.insert("kwargs".to_string(), kwargs.clone());
    fields.insert("retries".to_string(), Value::from(retries));
    fields.insert(
        "eta".to_string(),
        eta.map(|t| Value::String(t.to_rfc3339()))
            .unwrap_or(Value::Null),
    );
    fields.insert(
        "expires".to_string(),
        expires
            .map(|t| Value::String(t.to_rfc3339()))
            .unwrap_or(Value::Null),
    );
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_dispatcher_is_disabled() {
        let d = NullEventDispatcher;
        assert!(!d.enabled());
    }

    #[test]
    fn task_received_fields_null_eta_and_expires() {
        let uuid = uuid::Uuid::new_v4();
        let fields = task_received_fields(
            &uuid,
            "add",
            &serde_json::json!([2, 3]),
            &serde_json::json!({}),
            0,
            None,
            None,
        );
        assert_eq!(fields.get("eta"), Some(&Value::Null));
        assert_eq!(fields.get("expires"), Some(&Value::Null));
        assert_eq!(fields.get("name"), Some(&Value::String("add".into())));
    }
}
