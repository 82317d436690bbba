//! Abstract DevTools-protocol channel.
//!
//! The physical transport (WebSocket connection, command/response
//! multiplexing, browser process management) lives outside this workspace.
//! Coordinators consume it through [`CdpChannel`]: a pipelined
//! `send(method, params)` future plus a subscription to decoded protocol
//! events. [`StubChannel`] is the in-memory implementation used by tests and
//! by callers that need a disconnected channel.

pub mod protocol;
pub mod stub;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use wheelhouse_core_types::CoreError;

pub use stub::StubChannel;

/// One decoded protocol event as delivered by the transport: a method name,
/// its structured payload, and the originating session when the transport
/// multiplexes several targets.
#[derive(Clone, Debug)]
pub struct ProtocolEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Minimal capability surface the coordinators require from the transport.
///
/// `send` must reject on transport-level disconnect and support being called
/// again before an earlier reply arrives. Events for one connection are
/// delivered in arrival order; no ordering is guaranteed between different
/// protocol domains.
#[async_trait]
pub trait CdpChannel: Send + Sync {
    async fn send(&self, method: &str, params: Value) -> Result<Value, CoreError>;

    fn events(&self) -> broadcast::Receiver<ProtocolEvent>;

    /// Token cancelled when the underlying connection drops. Watchers treat
    /// cancellation as a navigation-fatal termination.
    fn closed(&self) -> CancellationToken;

    fn is_connected(&self) -> bool;
}
