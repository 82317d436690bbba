//! In-memory channel used by unit and scenario tests.
//!
//! Commands are recorded and answered from scripted results (default: empty
//! object), and tests inject protocol events directly. Mirrors how the
//! production transport behaves: replies resolve out of band, events fan out
//! to every subscriber in emission order.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use wheelhouse_core_types::{CoreError, CoreErrorKind};

use crate::{CdpChannel, ProtocolEvent};

/// One command observed by the stub.
#[derive(Clone, Debug)]
pub struct SentCommand {
    pub method: String,
    pub params: Value,
}

pub struct StubChannel {
    events_tx: broadcast::Sender<ProtocolEvent>,
    sent: Mutex<Vec<SentCommand>>,
    scripted: Mutex<HashMap<String, VecDeque<Result<Value, CoreError>>>>,
    closed: CancellationToken,
}

impl StubChannel {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(512);
        Self {
            events_tx,
            sent: Mutex::new(Vec::new()),
            scripted: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a one-shot reply for `method`; consumed FIFO. Methods without a
    /// queued reply answer with an empty object.
    pub fn queue_result(&self, method: &str, result: Result<Value, CoreError>) {
        self.scripted
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(result);
    }

    /// Inject a protocol event as if decoded off the wire.
    pub fn emit(&self, method: &str, params: Value) {
        let _ = self.events_tx.send(ProtocolEvent {
            method: method.to_string(),
            params,
            session_id: None,
        });
    }

    /// Drop the connection: future sends fail and the closed token fires.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().clone()
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent.lock().iter().map(|cmd| cmd.method.clone()).collect()
    }

    /// Commands recorded for one method, in send order.
    pub fn commands_for(&self, method: &str) -> Vec<SentCommand> {
        self.sent
            .lock()
            .iter()
            .filter(|cmd| cmd.method == method)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }
}

impl Default for StubChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CdpChannel for StubChannel {
    async fn send(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        if self.closed.is_cancelled() {
            return Err(CoreError::new(CoreErrorKind::CdpIo).with_hint("channel closed"));
        }
        debug!(target: "cdp-channel", method, "stub send");
        self.sent.lock().push(SentCommand {
            method: method.to_string(),
            params,
        });
        let scripted = self.scripted.lock().get_mut(method).and_then(VecDeque::pop_front);
        match scripted {
            Some(result) => result,
            None => Ok(json!({})),
        }
    }

    fn events(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events_tx.subscribe()
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_commands_and_answers_scripted_results() {
        let stub = StubChannel::new();
        stub.queue_result("Network.getResponseBody", Ok(json!({ "body": "aGk=", "base64Encoded": true })));

        let first = stub
            .send("Network.getResponseBody", json!({ "requestId": "r-1" }))
            .await
            .expect("scripted reply");
        assert_eq!(first["base64Encoded"], json!(true));

        let fallback = stub.send("Network.enable", json!({})).await.expect("default reply");
        assert_eq!(fallback, json!({}));

        assert_eq!(stub.sent_methods(), vec!["Network.getResponseBody", "Network.enable"]);
    }

    #[tokio::test]
    async fn closed_channel_rejects_sends() {
        let stub = StubChannel::new();
        stub.close();
        let err = stub.send("Page.navigate", json!({})).await.expect_err("rejected");
        assert_eq!(err.kind, CoreErrorKind::CdpIo);
        assert!(!stub.is_connected());
    }

    #[tokio::test]
    async fn events_fan_out_in_order() {
        let stub = StubChannel::new();
        let mut rx = stub.events();
        stub.emit("Page.lifecycleEvent", json!({ "frameId": "f", "name": "load" }));
        stub.emit("Network.loadingFinished", json!({ "requestId": "r" }));
        assert_eq!(rx.recv().await.expect("first").method, "Page.lifecycleEvent");
        assert_eq!(rx.recv().await.expect("second").method, "Network.loadingFinished");
    }
}
