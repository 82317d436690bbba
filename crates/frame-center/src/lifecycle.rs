//! Navigation completion state machine.
//!
//! One tracker watches one navigation attempt: it re-evaluates the expected
//! milestone set over the watched frame's subtree on every relevant event,
//! distinguishes same-document from new-document completion via the loader
//! id captured at creation, and terminates on watched-frame detach or
//! connection loss. Timeouts are a race the caller runs, not a cancellation.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use network_center::{NetworkEvent, RequestRecord, ResponseRecord};
use wheelhouse_core_types::{CoreError, CoreErrorKind, FrameId, LoaderId};
use wheelhouse_event_bus::Bus;

use crate::tree::{FrameEvent, FrameTree};

/// Milestones a navigation can be asked to wait for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitUntil {
    Load,
    DomContentLoaded,
    NetworkIdle,
    NetworkAlmostIdle,
}

impl WaitUntil {
    /// The protocol lifecycle event name backing this milestone.
    pub fn milestone(&self) -> &'static str {
        match self {
            WaitUntil::Load => "load",
            WaitUntil::DomContentLoaded => "DOMContentLoaded",
            WaitUntil::NetworkIdle => "networkIdle",
            WaitUntil::NetworkAlmostIdle => "networkAlmostIdle",
        }
    }

    pub fn parse(option: &str) -> Result<Self, CoreError> {
        match option {
            "load" => Ok(WaitUntil::Load),
            "domcontentloaded" => Ok(WaitUntil::DomContentLoaded),
            "networkidle0" => Ok(WaitUntil::NetworkIdle),
            "networkidle2" => Ok(WaitUntil::NetworkAlmostIdle),
            other => Err(CoreError::new(CoreErrorKind::Internal)
                .with_hint(format!("unknown waitUntil option `{other}`"))),
        }
    }
}

struct TrackerInner {
    tree: Arc<FrameTree>,
    frame_id: FrameId,
    expected: Vec<&'static str>,
    initial_loader_id: LoaderId,
    same_document_seen: Mutex<bool>,
    navigation_request: Mutex<Option<Arc<RequestRecord>>>,
    lifecycle_tx: watch::Sender<bool>,
    same_document_tx: watch::Sender<bool>,
    new_document_tx: watch::Sender<bool>,
    terminated_tx: watch::Sender<Option<CoreError>>,
}

pub struct LifecycleTracker {
    inner: Arc<TrackerInner>,
    listener: JoinHandle<()>,
}

impl LifecycleTracker {
    /// Start watching `frame_id`. The frame's current loader id is captured
    /// now; its change (or a same-document notification) is what separates
    /// "milestones reached" from "navigation committed".
    pub fn start(
        tree: Arc<FrameTree>,
        network_bus: Arc<Bus<NetworkEvent>>,
        connection_closed: CancellationToken,
        frame_id: FrameId,
        wait_until: &[WaitUntil],
    ) -> Result<Self, CoreError> {
        let frame = tree.frame(&frame_id).ok_or_else(|| {
            CoreError::new(CoreErrorKind::FrameDetached)
                .with_hint(format!("frame {frame_id} is not part of the tree"))
        })?;

        let mut expected: Vec<&'static str> =
            wait_until.iter().map(WaitUntil::milestone).collect();
        if expected.is_empty() {
            expected.push(WaitUntil::Load.milestone());
        }

        let inner = Arc::new(TrackerInner {
            initial_loader_id: frame.loader_id(),
            tree: Arc::clone(&tree),
            frame_id,
            expected,
            same_document_seen: Mutex::new(false),
            navigation_request: Mutex::new(None),
            lifecycle_tx: watch::channel(false).0,
            same_document_tx: watch::channel(false).0,
            new_document_tx: watch::channel(false).0,
            terminated_tx: watch::channel(None).0,
        });

        // Subscribe before the initial check so nothing published after
        // creation is missed.
        let frame_rx = tree.events();
        let network_rx = network_bus.subscribe();
        let listener = tokio::spawn(TrackerInner::listen(
            Arc::clone(&inner),
            frame_rx,
            network_rx,
            connection_closed,
        ));

        Ok(Self { inner, listener })
    }

    /// Resolved once every expected milestone is present across the watched
    /// subtree. Idempotent; only the first satisfaction matters.
    pub async fn lifecycle_reached(&self) {
        let mut rx = self.inner.lifecycle_tx.subscribe();
        let _ = rx.wait_for(|reached| *reached).await;
    }

    pub async fn same_document_complete(&self) {
        let mut rx = self.inner.same_document_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub async fn new_document_complete(&self) {
        let mut rx = self.inner.new_document_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Resolves with the terminating error: watched-frame detach or
    /// connection loss. Pre-empts lifecycle completion.
    pub async fn terminated(&self) -> CoreError {
        let mut rx = self.inner.terminated_tx.subscribe();
        let result = match rx.wait_for(|err| err.is_some()).await {
            Ok(guard) => guard
                .clone()
                .unwrap_or_else(|| CoreError::new(CoreErrorKind::Internal)),
            Err(_) => CoreError::new(CoreErrorKind::Internal).with_hint("tracker dropped"),
        };
        result
    }

    /// The response of the captured navigation request for the watched
    /// frame, or `None` (same-anchor navigation, no main resource). A
    /// redirect continuation supersedes its predecessor, so this follows
    /// the logical navigation to its final response.
    pub fn navigation_response(&self) -> Option<Arc<ResponseRecord>> {
        self.inner
            .navigation_request
            .lock()
            .as_ref()
            .and_then(|request| request.response())
    }

    pub fn navigation_request(&self) -> Option<Arc<RequestRecord>> {
        self.inner.navigation_request.lock().clone()
    }
}

impl Drop for LifecycleTracker {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl TrackerInner {
    async fn listen(
        self: Arc<Self>,
        mut frame_rx: broadcast::Receiver<FrameEvent>,
        mut network_rx: broadcast::Receiver<NetworkEvent>,
        connection_closed: CancellationToken,
    ) {
        // the milestone set may already be satisfied (e.g. waiting on an
        // already-loaded frame)
        self.check_lifecycle_complete();
        loop {
            tokio::select! {
                _ = connection_closed.cancelled() => {
                    self.terminate(
                        CoreError::new(CoreErrorKind::CdpIo)
                            .with_hint("navigation failed because the connection closed"),
                    );
                    return;
                }
                event = frame_rx.recv() => match event {
                    Ok(event) => {
                        if self.on_frame_event(event) {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(target: "frame-center", skipped, "tracker lagged; rechecking");
                        self.check_lifecycle_complete();
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                event = network_rx.recv() => match event {
                    Ok(NetworkEvent::Request(request)) => self.on_request(request),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {}
                },
            }
        }
    }

    /// Returns true when the tracker reached a terminal state.
    fn on_frame_event(&self, event: FrameEvent) -> bool {
        match event {
            FrameEvent::Lifecycle { .. } | FrameEvent::Navigated(_) => {
                self.check_lifecycle_complete();
            }
            FrameEvent::NavigatedWithinDocument(frame) => {
                if frame == self.frame_id {
                    *self.same_document_seen.lock() = true;
                }
                self.check_lifecycle_complete();
            }
            FrameEvent::Detached(frame) => {
                if frame == self.frame_id {
                    self.terminate(
                        CoreError::new(CoreErrorKind::FrameDetached)
                            .with_hint("navigating frame was detached"),
                    );
                    return true;
                }
                // a removed subtree could have been gating completion
                self.check_lifecycle_complete();
            }
            FrameEvent::Attached(_) => {}
        }
        false
    }

    fn on_request(&self, request: Arc<RequestRecord>) {
        if !request.is_navigation_request() {
            return;
        }
        if request.frame_id() != Some(&self.frame_id) {
            return;
        }
        // latest navigation request wins (redirect continuations replace
        // their predecessor)
        *self.navigation_request.lock() = Some(request);
    }

    fn check_lifecycle_complete(&self) {
        if !self
            .tree
            .subtree_lifecycle_reached(&self.frame_id, &self.expected)
        {
            return;
        }
        self.lifecycle_tx.send_replace(true);

        let Some(frame) = self.tree.frame(&self.frame_id) else {
            return;
        };
        let loader_changed = frame.loader_id() != self.initial_loader_id;
        let same_document = *self.same_document_seen.lock();
        // milestones alone do not mean the navigation committed a new
        // document or a same-document change
        if !loader_changed && !same_document {
            return;
        }
        if same_document {
            self.same_document_tx.send_replace(true);
        }
        if loader_changed {
            self.new_document_tx.send_replace(true);
        }
    }

    fn terminate(&self, error: CoreError) {
        self.terminated_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(error);
                true
            } else {
                false
            }
        });
    }
}
