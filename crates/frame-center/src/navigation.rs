//! Navigation entry points: issue a navigation (or adopt one already in
//! flight) and race its lifecycle tracker against termination and the
//! deadline.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use cdp_channel::CdpChannel;
use network_center::{NetworkCoordinator, ResponseRecord};
use wheelhouse_core_types::{CoreError, CoreErrorKind, FrameId};

use crate::lifecycle::{LifecycleTracker, WaitUntil};
use crate::tree::FrameTree;

#[derive(Clone, Debug)]
pub struct NavigationOptions {
    pub wait_until: Vec<WaitUntil>,
    /// Zero disables the deadline.
    pub timeout: Duration,
    pub referrer: Option<String>,
}

impl Default for NavigationOptions {
    fn default() -> Self {
        Self {
            wait_until: vec![WaitUntil::Load],
            timeout: Duration::from_secs(30),
            referrer: None,
        }
    }
}

/// Navigate `frame_id` to `url` and wait for the requested milestones.
/// Resolves to the main-resource response, or `None` for same-document
/// navigations.
pub(crate) async fn navigate(
    channel: &Arc<dyn CdpChannel>,
    tree: &Arc<FrameTree>,
    network: &Arc<NetworkCoordinator>,
    frame_id: &FrameId,
    url: &str,
    options: NavigationOptions,
) -> Result<Option<Arc<ResponseRecord>>, CoreError> {
    let tracker = LifecycleTracker::start(
        Arc::clone(tree),
        network.bus(),
        channel.closed(),
        frame_id.clone(),
        &options.wait_until,
    )?;
    let timeout_ms = options.timeout.as_millis() as u64;
    let description = format!("navigating to {url}");

    let mut params = json!({ "url": url, "frameId": frame_id.0 });
    if let Some(referrer) = &options.referrer {
        params["referrer"] = json!(referrer);
    }

    let deadline = sleep_or_forever(options.timeout);
    tokio::pin!(deadline);

    let nav_result = tokio::select! {
        result = channel.send("Page.navigate", params) => result?,
        err = tracker.terminated() => return Err(err),
        _ = &mut deadline => return Err(CoreError::timeout(description, timeout_ms)),
    };
    if let Some(error_text) = nav_result.get("errorText").and_then(Value::as_str) {
        if !error_text.is_empty() {
            return Err(CoreError::new(CoreErrorKind::CdpIo)
                .with_hint(format!("{error_text} at {url}")));
        }
    }

    tokio::select! {
        err = tracker.terminated() => Err(err),
        _ = &mut deadline => Err(CoreError::timeout(description, timeout_ms)),
        _ = tracker.same_document_complete() => Ok(tracker.navigation_response()),
        _ = tracker.new_document_complete() => Ok(tracker.navigation_response()),
    }
}

/// Wait for a navigation someone else initiated (link click, script).
pub(crate) async fn wait_for_navigation(
    channel: &Arc<dyn CdpChannel>,
    tree: &Arc<FrameTree>,
    network: &Arc<NetworkCoordinator>,
    frame_id: &FrameId,
    options: NavigationOptions,
) -> Result<Option<Arc<ResponseRecord>>, CoreError> {
    let tracker = LifecycleTracker::start(
        Arc::clone(tree),
        network.bus(),
        channel.closed(),
        frame_id.clone(),
        &options.wait_until,
    )?;
    let timeout_ms = options.timeout.as_millis() as u64;

    let deadline = sleep_or_forever(options.timeout);
    tokio::pin!(deadline);

    tokio::select! {
        err = tracker.terminated() => Err(err),
        _ = &mut deadline => Err(CoreError::timeout("waiting for navigation", timeout_ms)),
        _ = tracker.same_document_complete() => Ok(tracker.navigation_response()),
        _ = tracker.new_document_complete() => Ok(tracker.navigation_response()),
    }
}

async fn sleep_or_forever(timeout: Duration) {
    if timeout.is_zero() {
        futures::future::pending::<()>().await;
    } else {
        tokio::time::sleep(timeout).await;
    }
}
