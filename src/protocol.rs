//! Wire-level message types and the decoded task record handed to the
//! dispatch path.
//!
//! The exact byte-level encoding of a task message is an external contract
//! owned by whatever serializer the application configures; what lives here
//! is just enough structure for the consumer to route a delivery without
//! caring how any particular broker backend represents it on the wire.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::{Error, ErrorKind};
use crate::task::Task;

/// Headers carried alongside a task message body, independent of content type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub id: Uuid,
    pub task: String,
    pub eta: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub retries: u32,
}

/// Content-type/encoding metadata, mirrored back to the broker as message
/// properties.
#[derive(Clone, Debug)]
pub struct MessageProperties {
    pub content_type: &'static str,
    pub content_encoding: &'static str,
}

impl Default for MessageProperties {
    fn default() -> Self {
        MessageProperties {
            content_type: "application/json",
            content_encoding: "utf-8",
        }
    }
}

/// A fully-built message ready to hand to a [`Broker`](crate::broker::Broker).
///
/// `args`/`kwargs` are only populated for inbound messages (i.e. ones built
/// by [`TryIntoMessage`] out of a delivery) -- they're the raw, not-yet-type-
/// checked JSON values the dispatch path's invalid-task check (§4.3 step 4)
/// validates before a [`ReceivedTask`] is built from them.
#[derive(Clone, Debug)]
pub struct Message {
    pub headers: MessageHeaders,
    pub properties: MessageProperties,
    pub raw_data: Vec<u8>,
    pub args: Value,
    pub kwargs: Value,
}

impl Message {
    pub fn builder(task_name: &str, raw_data: Vec<u8>) -> MessageBuilder {
        MessageBuilder {
            task: task_name.to_string(),
            eta: None,
            expires: None,
            raw_data,
        }
    }
}

pub struct MessageBuilder {
    task: String,
    eta: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
    raw_data: Vec<u8>,
}

impl MessageBuilder {
    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn build(self) -> Message {
        Message {
            headers: MessageHeaders {
                id: Uuid::new_v4(),
                task: self.task,
                eta: self.eta,
                expires: self.expires,
                retries: 0,
            },
            properties: MessageProperties::default(),
            raw_data: self.raw_data,
            args: Value::Null,
            kwargs: Value::Null,
        }
    }
}

/// The JSON envelope a [`Task`](crate::task::Task) is serialized into before
/// being attached to a [`Message`].
#[derive(Serialize, Deserialize)]
pub struct MessageBody<T>(pub T);

impl<T: Task> MessageBody<T> {
    pub fn new(task: T) -> Self {
        MessageBody(task)
    }
}

/// Converts a broker-specific delivery into a [`Message`]. Implemented by
/// each broker backend's delivery type.
pub trait TryIntoMessage {
    fn try_into_message(&self) -> Result<Message, Error>;
}

/// A decoded, registered task, on its way from the broker to either the ready
/// queue or the ETA timer.
///
/// Carries the fields the dispatch path and `on_task` need (`id`, `name`,
/// `args`, `kwargs`, `eta`, `expires`, retry count) plus enough of the
/// originating broker delivery to `acknowledge()` itself later, since
/// whichever sink it ends up on (ready queue or timer) is responsible for
/// acking it after execution, not the consumer.
pub struct ReceivedTask<B: Broker> {
    pub id: Uuid,
    pub name: String,
    pub args: Value,
    pub kwargs: Value,
    pub eta: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub retries: u32,
    revoked: bool,
    broker: Arc<B>,
    delivery: B::Delivery,
}

impl<B: Broker> ReceivedTask<B> {
    pub fn new(
        message: &Message,
        args: Value,
        kwargs: Value,
        revoked: bool,
        broker: Arc<B>,
        delivery: B::Delivery,
    ) -> Self {
        ReceivedTask {
            id: message.headers.id,
            name: message.headers.task.clone(),
            args,
            kwargs,
            eta: message.headers.eta,
            expires: message.headers.expires,
            retries: message.headers.retries,
            revoked,
            broker,
            delivery,
        }
    }

    /// True if this task was revoked before being picked up; `on_task` drops
    /// these silently rather than placing them anywhere.
    pub fn revoked(&self) -> bool {
        self.revoked
    }

    /// Acknowledge the underlying broker delivery.
    pub async fn acknowledge(&self) -> Result<(), Error> {
        self.broker.ack(self.delivery.clone()).await
    }

    /// A redacted view safe to include in error-level logs.
    pub fn safe_info(&self) -> String {
        format!(
            "<Task {}[{}] eta={:?} retries={}>",
            self.name, self.id, self.eta, self.retries
        )
    }
}

impl<B: Broker> fmt::Display for ReceivedTask<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}[{}] args={} kwargs={}",
            self.name, self.id, self.args, self.kwargs
        )
    }
}

/// Decode raw bytes as JSON. A failure here is a decode error (§4.3 step 1,
/// §7): the body could not be parsed with the configured codec at all, so
/// `on_decode_error` acks the message to break any poison-message loop.
pub fn decode_json(raw_data: &[u8]) -> Result<Value, Error> {
    serde_json::from_slice(raw_data)
        .map_err(|e| Error::from(ErrorKind::DecodeError(e.to_string())))
}

/// Recognize a decoded JSON value as a task-message envelope and pull out its
/// headers plus the raw (not yet type-checked) `args`/`kwargs`.
///
/// Anything that doesn't even look like a task message -- not an object, or
/// missing a `task` name -- is an unknown message (§4.3 step 4 /
/// "Wrong destination?!?" in the original), not a decode error: the bytes
/// parsed fine as JSON, they just aren't ours.
pub fn extract_envelope(body: &Value) -> Result<(MessageHeaders, Value, Value), Error> {
    let obj = body
        .as_object()
        .ok_or_else(|| Error::from(ErrorKind::UnknownMessageError))?;
    let task = obj
        .get("task")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::from(ErrorKind::UnknownMessageError))?
        .to_string();
    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);
    let eta = obj
        .get("eta")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let expires = obj
        .get("expires")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let retries = obj
        .get("retries")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let args = obj.get("args").cloned().unwrap_or(Value::Null);
    let kwargs = obj.get("kwargs").cloned().unwrap_or(Value::Null);
    Ok((
        MessageHeaders { id, task, eta, expires, retries },
        args,
        kwargs,
    ))
}

/// Validate that `args`/`kwargs` have the shapes the task message protocol
/// requires, treating a mismatch as an invalid task (§4.3 step 3) rather than
/// a decode error or an unknown message -- the envelope was recognizable, its
/// payload just isn't well-formed.
pub fn validate_args_kwargs(args: &Value, kwargs: &Value) -> Result<(), Error> {
    if !matches!(args, Value::Array(_) | Value::Null) {
        return Err(Error::from(ErrorKind::InvalidTaskError(
            "task args is not a JSON array".into(),
        )));
    }
    if !matches!(kwargs, Value::Object(_) | Value::Null) {
        return Err(Error::from(ErrorKind::InvalidTaskError(
            "task kwargs is not a JSON object".into(),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_json_rejects_garbage_bytes() {
        let err = decode_json(b"not json").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::DecodeError(_)));
    }

    #[test]
    fn extract_envelope_rejects_non_object() {
        let body: Value = serde_json::json!([1, 2, 3]);
        let err = extract_envelope(&body).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnknownMessageError));
    }

    #[test]
    fn extract_envelope_rejects_missing_task_name() {
        let body: Value = serde_json::json!({"args": [], "kwargs": {}});
        let err = extract_envelope(&body).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnknownMessageError));
    }

    #[test]
    fn extract_envelope_accepts_well_formed_body() {
        let body: Value = serde_json::json!({
            "task": "tasks.add",
            "args": [2, 3],
            "kwargs": {},
            "retries": 1,
        });
        let (headers, args, kwargs) = extract_envelope(&body).unwrap();
        assert_eq!(headers.task, "tasks.add");
        assert_eq!(headers.retries, 1);
        assert_eq!(args, serde_json::json!([2, 3]));
        assert_eq!(kwargs, serde_json::json!({}));
    }

    #[test]
    fn validate_args_kwargs_rejects_non_array_args() {
        let err = validate_args_kwargs(&serde_json::json!({"a": 1}), &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidTaskError(_)));
    }

    #[test]
    fn validate_args_kwargs_rejects_non_object_kwargs() {
        let err =
            validate_args_kwargs(&serde_json::json!([]), &serde_json::json!([1])).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidTaskError(_)));
    }

    #[test]
    fn validate_args_kwargs_accepts_nulls_as_defaults() {
        validate_args_kwargs(&Value::Null, &Value::Null).unwrap();
    }
}
