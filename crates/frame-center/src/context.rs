//! A live JavaScript execution context and the handles it returns.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use cdp_channel::protocol::{EvaluateResult, RemoteObject};
use cdp_channel::CdpChannel;
use wheelhouse_core_types::{CoreError, CoreErrorKind, ExecutionContextId};

/// Protocol error messages that mean the context raced away under us rather
/// than a real failure. Wait primitives retry on these.
const CONTEXT_GONE_MARKERS: &[&str] = &[
    "Cannot find context with specified id",
    "Execution context was destroyed",
    "Inspected target navigated or closed",
];

/// Protocol error messages that mean the value cannot be represented, which
/// callers observe as an undefined result rather than an error.
const UNDEFINED_RESULT_MARKERS: &[&str] = &[
    "Object reference chain is too long",
    "Object couldn't be returned by value",
];

#[derive(Clone)]
pub struct ExecutionContext {
    channel: Arc<dyn CdpChannel>,
    id: ExecutionContextId,
}

impl ExecutionContext {
    pub fn new(channel: Arc<dyn CdpChannel>, id: ExecutionContextId) -> Self {
        Self { channel, id }
    }

    pub fn id(&self) -> ExecutionContextId {
        self.id
    }

    /// Evaluate an expression and return its JSON value. Unrepresentable
    /// results (cycles, overly deep reference chains, NaN) come back as
    /// `null`.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, CoreError> {
        let params = json!({
            "expression": expression,
            "contextId": self.id.0,
            "returnByValue": true,
            "awaitPromise": true,
        });
        let raw = match self.channel.send("Runtime.evaluate", params).await {
            Ok(raw) => raw,
            Err(err) => return Err(translate_protocol_error(err)),
        };
        let decoded: EvaluateResult = serde_json::from_value(raw)
            .map_err(|err| CoreError::new(CoreErrorKind::Internal).with_hint(err.to_string()))?;
        if let Some(details) = decoded.exception_details {
            return Err(CoreError::new(CoreErrorKind::Internal)
                .with_hint(format!("evaluation failed: {}", details.render())));
        }
        Ok(value_from_remote(&decoded.result))
    }

    /// Evaluate and keep the result in the browser as a remote handle.
    pub async fn evaluate_handle(&self, expression: &str) -> Result<RemoteHandle, CoreError> {
        let params = json!({
            "expression": expression,
            "contextId": self.id.0,
            "returnByValue": false,
            "awaitPromise": true,
        });
        let raw = match self.channel.send("Runtime.evaluate", params).await {
            Ok(raw) => raw,
            Err(err) => return Err(translate_protocol_error(err)),
        };
        let decoded: EvaluateResult = serde_json::from_value(raw)
            .map_err(|err| CoreError::new(CoreErrorKind::Internal).with_hint(err.to_string()))?;
        if let Some(details) = decoded.exception_details {
            return Err(CoreError::new(CoreErrorKind::Internal)
                .with_hint(format!("evaluation failed: {}", details.render())));
        }
        Ok(RemoteHandle::new(Arc::clone(&self.channel), decoded.result))
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext").field("id", &self.id.0).finish()
    }
}

/// Map a protocol-level send failure onto the error taxonomy: context
/// teardown races become retriable [`CoreErrorKind::ContextDestroyed`].
pub(crate) fn translate_protocol_error(err: CoreError) -> CoreError {
    let hint = err.hint.as_deref().unwrap_or_default();
    if CONTEXT_GONE_MARKERS.iter().any(|marker| hint.contains(marker)) {
        return CoreError::new(CoreErrorKind::ContextDestroyed)
            .with_hint(hint.to_string())
            .retriable(true);
    }
    err
}

/// Extract a JSON value from a remote object, mirroring how undefined and
/// unserializable values surface to callers.
pub(crate) fn value_from_remote(object: &RemoteObject) -> Value {
    if let Some(unserializable) = &object.unserializable_value {
        debug!(
            target: "frame-center",
            value = %unserializable,
            "unserializable evaluation result surfaced as null"
        );
        return Value::Null;
    }
    object.value.clone().unwrap_or(Value::Null)
}

/// Is this send failure one of the unrepresentable-result class, to be
/// reported as an undefined value instead of an error.
pub(crate) fn is_undefined_result_error(err: &CoreError) -> bool {
    let hint = err.hint.as_deref().unwrap_or_default();
    UNDEFINED_RESULT_MARKERS.iter().any(|marker| hint.contains(marker))
}

/// Reference to an object kept alive in the browser. Releasing is
/// best-effort; failures after the page is gone are logged only.
pub struct RemoteHandle {
    channel: Arc<dyn CdpChannel>,
    object_id: Option<String>,
    value: Option<Value>,
    description: Option<String>,
    released: AtomicBool,
}

impl RemoteHandle {
    fn new(channel: Arc<dyn CdpChannel>, remote: RemoteObject) -> Self {
        Self {
            channel,
            object_id: remote.object_id,
            value: remote.value,
            description: remote.description,
            released: AtomicBool::new(false),
        }
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }

    /// Primitive value when the result was representable by value.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(object_id) = &self.object_id else {
            return;
        };
        if let Err(err) = self
            .channel
            .send("Runtime.releaseObject", json!({ "objectId": object_id }))
            .await
        {
            debug!(target: "frame-center", %err, "releaseObject failed; ignoring");
        }
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("object_id", &self.object_id)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_channel::StubChannel;

    #[tokio::test]
    async fn evaluate_returns_by_value() {
        let channel = Arc::new(StubChannel::new());
        channel.queue_result(
            "Runtime.evaluate",
            Ok(json!({ "result": { "type": "number", "value": 7 } })),
        );
        let ctx = ExecutionContext::new(channel.clone(), ExecutionContextId(1));
        let value = ctx.evaluate("3 + 4").await.expect("evaluate");
        assert_eq!(value, json!(7));
        let sent = channel.commands_for("Runtime.evaluate");
        assert_eq!(sent[0].params["contextId"], json!(1));
        assert_eq!(sent[0].params["returnByValue"], json!(true));
    }

    #[tokio::test]
    async fn context_teardown_is_translated_retriable() {
        let channel = Arc::new(StubChannel::new());
        channel.queue_result(
            "Runtime.evaluate",
            Err(CoreError::new(CoreErrorKind::CdpIo)
                .with_hint("cdp error -32000: Execution context was destroyed.")),
        );
        let ctx = ExecutionContext::new(channel, ExecutionContextId(2));
        let err = ctx.evaluate("1").await.expect_err("translated");
        assert!(err.is_context_destroyed());
        assert!(err.retriable);
    }

    #[tokio::test]
    async fn js_exceptions_surface_with_description() {
        let channel = Arc::new(StubChannel::new());
        channel.queue_result(
            "Runtime.evaluate",
            Ok(json!({
                "result": { "type": "undefined" },
                "exceptionDetails": {
                    "text": "Uncaught",
                    "exception": { "type": "object", "description": "Error: boom" },
                },
            })),
        );
        let ctx = ExecutionContext::new(channel, ExecutionContextId(3));
        let err = ctx.evaluate("throw new Error('boom')").await.expect_err("raised");
        assert!(err.to_string().contains("Error: boom"));
    }

    #[tokio::test]
    async fn release_is_best_effort() {
        let channel = Arc::new(StubChannel::new());
        channel.queue_result(
            "Runtime.evaluate",
            Ok(json!({ "result": { "type": "object", "objectId": "obj-1" } })),
        );
        let ctx = ExecutionContext::new(channel.clone(), ExecutionContextId(4));
        let handle = ctx.evaluate_handle("({})").await.expect("handle");
        assert_eq!(handle.object_id(), Some("obj-1"));

        channel.queue_result(
            "Runtime.releaseObject",
            Err(CoreError::new(CoreErrorKind::CdpIo).with_hint("target closed")),
        );
        handle.release().await;
        handle.release().await;
        // second release is a no-op
        assert_eq!(channel.commands_for("Runtime.releaseObject").len(), 1);
    }
}
