//! Single dispatch task feeding the frame tree and the network coordinator
//! from one channel subscription.
//!
//! Protocol events for a connection are processed strictly in arrival
//! order; the two coordinators never see events reordered relative to the
//! wire. Unknown methods are dropped with a debug log.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cdp_channel::{CdpChannel, ProtocolEvent};
use network_center::{NetworkCoordinator, ResponseRecord};
use wheelhouse_core_types::{CoreError, FrameId};

use crate::navigation::{self, NavigationOptions};
use crate::tree::FrameTree;

pub struct AutomationHub {
    channel: Arc<dyn CdpChannel>,
    tree: Arc<FrameTree>,
    network: Arc<NetworkCoordinator>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AutomationHub {
    pub fn new(channel: Arc<dyn CdpChannel>, ignore_certificate_errors: bool) -> Arc<Self> {
        let tree = FrameTree::new(Arc::clone(&channel));
        let network = NetworkCoordinator::new(Arc::clone(&channel), ignore_certificate_errors);
        Arc::new(Self {
            channel,
            tree,
            network,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn frame_tree(&self) -> Arc<FrameTree> {
        Arc::clone(&self.tree)
    }

    pub fn network(&self) -> Arc<NetworkCoordinator> {
        Arc::clone(&self.network)
    }

    pub fn channel(&self) -> Arc<dyn CdpChannel> {
        Arc::clone(&self.channel)
    }

    /// Initialize both coordinators and start the dispatch loop. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<(), CoreError> {
        {
            let tasks = self.tasks.lock();
            if !tasks.is_empty() {
                return Ok(());
            }
        }
        self.network.initialize().await?;
        self.tree.initialize().await?;
        // subscribe before spawning so nothing emitted after start() returns
        // can be missed
        let events = self.channel.events();
        let task = tokio::spawn(Self::event_loop(Arc::clone(self), events));
        self.tasks.lock().push(task);
        info!(target: "frame-center", "automation hub started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn event_loop(
        hub: Arc<Self>,
        mut rx: tokio::sync::broadcast::Receiver<ProtocolEvent>,
    ) {
        loop {
            tokio::select! {
                _ = hub.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => hub.dispatch(&event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "frame-center", skipped, "event subscription lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!(target: "frame-center", "event loop exiting");
    }

    /// Route one event to the coordinator owning its domain.
    pub async fn dispatch(&self, event: &ProtocolEvent) {
        let result = if event.method.starts_with("Network.") || event.method.starts_with("Fetch.") {
            self.network.handle_event(event).await
        } else if event.method.starts_with("Page.") || event.method.starts_with("Runtime.") {
            self.tree.handle_event(event).await
        } else {
            debug!(target: "frame-center", method = %event.method, "unhandled protocol event");
            Ok(())
        };
        if let Err(err) = result {
            warn!(target: "frame-center", method = %event.method, %err, "event handling failed");
        }
    }

    /// Navigate a frame and wait for the requested lifecycle milestones.
    pub async fn navigate(
        &self,
        frame_id: &FrameId,
        url: &str,
        options: NavigationOptions,
    ) -> Result<Option<Arc<ResponseRecord>>, CoreError> {
        navigation::navigate(&self.channel, &self.tree, &self.network, frame_id, url, options).await
    }

    /// Wait for a navigation initiated elsewhere (script, link click).
    pub async fn wait_for_navigation(
        &self,
        frame_id: &FrameId,
        options: NavigationOptions,
    ) -> Result<Option<Arc<ResponseRecord>>, CoreError> {
        navigation::wait_for_navigation(&self.channel, &self.tree, &self.network, frame_id, options)
            .await
    }
}
