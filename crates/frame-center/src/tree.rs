//! Frame arena and protocol routing.
//!
//! The tree owns every [`Frame`] in one id-keyed table; parent/child links
//! are stored as ids, never as owning references. Protocol frame and
//! execution-context events are routed here and re-emitted as typed
//! [`FrameEvent`]s.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use cdp_channel::protocol::{
    ExecutionContextCreatedParams, ExecutionContextDestroyedParams, FrameAttachedParams,
    FrameDetachedParams, FrameNavigatedParams, FramePayload, LifecycleEventParams,
    NavigatedWithinDocumentParams,
};
use cdp_channel::{CdpChannel, ProtocolEvent};
use wheelhouse_core_types::{
    CoreError, CoreErrorKind, ExecutionContextId, FrameId, LoaderId, WorldTag,
};
use wheelhouse_event_bus::Bus;

use crate::context::ExecutionContext;
use crate::frame::Frame;

/// Name under which the isolated utility world is created in every frame.
const UTILITY_WORLD_NAME: &str = "__wheelhouse_utility_world__";

/// Typed frame events exposed to consumers and to the lifecycle tracker.
#[derive(Clone, Debug)]
pub enum FrameEvent {
    Attached(FrameId),
    Detached(FrameId),
    Navigated(FrameId),
    NavigatedWithinDocument(FrameId),
    Lifecycle {
        frame: FrameId,
        loader: LoaderId,
        name: String,
    },
}

pub struct FrameTree {
    channel: Arc<dyn CdpChannel>,
    frames: DashMap<FrameId, Arc<Frame>>,
    main_frame: Mutex<Option<FrameId>>,
    contexts: DashMap<ExecutionContextId, (FrameId, WorldTag)>,
    bus: Arc<Bus<FrameEvent>>,
}

impl FrameTree {
    pub fn new(channel: Arc<dyn CdpChannel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            frames: DashMap::new(),
            main_frame: Mutex::new(None),
            contexts: DashMap::new(),
            bus: Bus::new(512),
        })
    }

    /// Enable the page/runtime domains, adopt the existing frame tree, and
    /// bootstrap the isolated utility world in every known frame.
    pub async fn initialize(&self) -> Result<(), CoreError> {
        self.channel.send("Page.enable", json!({})).await?;
        self.channel
            .send("Page.setLifecycleEventsEnabled", json!({ "enabled": true }))
            .await?;
        let tree = self.channel.send("Page.getFrameTree", json!({})).await?;
        if let Some(root) = tree.get("frameTree") {
            self.adopt_frame_tree(root);
        }
        self.channel.send("Runtime.enable", json!({})).await?;
        self.channel
            .send(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({
                    "source": format!("//# sourceURL={UTILITY_WORLD_NAME}"),
                    "worldName": UTILITY_WORLD_NAME,
                }),
            )
            .await?;
        let known: Vec<FrameId> = self.frames.iter().map(|entry| entry.key().clone()).collect();
        for frame_id in known {
            self.create_isolated_world(&frame_id).await;
        }
        Ok(())
    }

    /// Walk a `Page.getFrameTree` result without recursion: the arena does
    /// not care about nesting depth.
    fn adopt_frame_tree(&self, root: &Value) {
        let mut pending = vec![(root.clone(), None::<FrameId>)];
        while let Some((node, parent)) = pending.pop() {
            let Ok(payload) = serde_json::from_value::<FramePayload>(
                node.get("frame").cloned().unwrap_or(Value::Null),
            ) else {
                continue;
            };
            let frame_id = FrameId(payload.id.clone());
            let frame = Frame::new(frame_id.clone(), parent.clone());
            frame.on_navigated(&payload);
            if let Some(parent_id) = &parent {
                if let Some(parent_frame) = self.frames.get(parent_id) {
                    parent_frame.add_child(frame_id.clone());
                }
            } else {
                *self.main_frame.lock() = Some(frame_id.clone());
            }
            self.frames.insert(frame_id.clone(), frame);
            if let Some(children) = node.get("childFrames").and_then(Value::as_array) {
                for child in children {
                    pending.push((child.clone(), Some(frame_id.clone())));
                }
            }
        }
    }

    async fn create_isolated_world(&self, frame_id: &FrameId) {
        // `grantUniveralAccess` is the protocol's own spelling.
        let result = self
            .channel
            .send(
                "Page.createIsolatedWorld",
                json!({
                    "frameId": frame_id.0,
                    "worldName": UTILITY_WORLD_NAME,
                    "grantUniveralAccess": true,
                }),
            )
            .await;
        if let Err(err) = result {
            debug!(target: "frame-center", frame = %frame_id, %err, "isolated world creation failed; frame likely gone");
        }
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<FrameEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> Arc<Bus<FrameEvent>> {
        Arc::clone(&self.bus)
    }

    pub fn frame(&self, id: &FrameId) -> Option<Arc<Frame>> {
        self.frames.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn main_frame(&self) -> Option<Arc<Frame>> {
        let id = self.main_frame.lock().clone()?;
        self.frame(&id)
    }

    pub fn main_frame_id(&self) -> Option<FrameId> {
        self.main_frame.lock().clone()
    }

    /// All frames, main frame first, then depth-first through children.
    pub fn frames(&self) -> Vec<Arc<Frame>> {
        let mut ordered = Vec::new();
        let Some(root) = self.main_frame_id() else {
            return ordered;
        };
        let mut pending = vec![root];
        while let Some(id) = pending.pop() {
            if let Some(frame) = self.frame(&id) {
                let mut children = frame.child_ids();
                children.reverse();
                pending.extend(children);
                ordered.push(frame);
            }
        }
        ordered
    }

    /// Does every frame of the subtree rooted at `root` carry every expected
    /// milestone for its current document load?
    pub fn subtree_lifecycle_reached(&self, root: &FrameId, expected: &[&str]) -> bool {
        let Some(frame) = self.frame(root) else {
            return false;
        };
        let mut pending = vec![frame];
        while let Some(frame) = pending.pop() {
            if !frame.has_milestones(expected) {
                return false;
            }
            for child in frame.child_ids() {
                if let Some(child_frame) = self.frame(&child) {
                    pending.push(child_frame);
                }
            }
        }
        true
    }

    /// Route one decoded protocol event. Events from other domains are
    /// ignored.
    pub async fn handle_event(&self, event: &ProtocolEvent) -> Result<(), CoreError> {
        match event.method.as_str() {
            "Page.frameAttached" => {
                let params = decode::<FrameAttachedParams>(&event.params)?;
                self.on_frame_attached(params).await;
                Ok(())
            }
            "Page.frameNavigated" => {
                let params = decode::<FrameNavigatedParams>(&event.params)?;
                self.on_frame_navigated(params.frame);
                Ok(())
            }
            "Page.navigatedWithinDocument" => {
                let params = decode::<NavigatedWithinDocumentParams>(&event.params)?;
                self.on_navigated_within_document(params);
                Ok(())
            }
            "Page.frameDetached" => {
                let params = decode::<FrameDetachedParams>(&event.params)?;
                self.on_frame_detached(&FrameId(params.frame_id));
                Ok(())
            }
            "Page.lifecycleEvent" => {
                let params = decode::<LifecycleEventParams>(&event.params)?;
                self.on_lifecycle_event(params);
                Ok(())
            }
            "Runtime.executionContextCreated" => {
                let params = decode::<ExecutionContextCreatedParams>(&event.params)?;
                self.on_context_created(params);
                Ok(())
            }
            "Runtime.executionContextDestroyed" => {
                let params = decode::<ExecutionContextDestroyedParams>(&event.params)?;
                self.on_context_destroyed(ExecutionContextId(params.execution_context_id));
                Ok(())
            }
            "Runtime.executionContextsCleared" => {
                self.on_contexts_cleared();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_frame_attached(&self, params: FrameAttachedParams) {
        let frame_id = FrameId(params.frame_id);
        if self.frames.contains_key(&frame_id) {
            return;
        }
        let parent_id = params.parent_frame_id.map(FrameId);
        let frame = Frame::new(frame_id.clone(), parent_id.clone());
        if let Some(parent_id) = &parent_id {
            if let Some(parent) = self.frames.get(parent_id) {
                parent.add_child(frame_id.clone());
            }
        } else if self.main_frame.lock().is_none() {
            *self.main_frame.lock() = Some(frame_id.clone());
        }
        self.frames.insert(frame_id.clone(), frame);
        self.bus.publish(FrameEvent::Attached(frame_id.clone()));
        self.create_isolated_world(&frame_id).await;
    }

    fn on_frame_navigated(&self, payload: FramePayload) {
        let new_id = FrameId(payload.id.clone());
        let is_main = payload.parent_id.is_none();

        let frame = if is_main {
            let current_main = self.main_frame.lock().clone();
            match current_main {
                Some(main_id) => {
                    let frame = self.frames.get(&main_id).map(|e| Arc::clone(e.value()));
                    match frame {
                        Some(frame) => {
                            if main_id != new_id {
                                // cross-process swap keeps the Frame object,
                                // changes its identity
                                self.frames.remove(&main_id);
                                frame.set_id(new_id.clone());
                                self.frames.insert(new_id.clone(), Arc::clone(&frame));
                                *self.main_frame.lock() = Some(new_id.clone());
                            }
                            frame
                        }
                        None => self.install_main_frame(new_id.clone()),
                    }
                }
                None => self.install_main_frame(new_id.clone()),
            }
        } else {
            match self.frames.get(&new_id).map(|e| Arc::clone(e.value())) {
                Some(frame) => frame,
                None => {
                    warn!(target: "frame-center", frame = %new_id, "navigated event for unknown frame");
                    return;
                }
            }
        };

        // a committed navigation tears down the old document's subtree
        for child in frame.child_ids() {
            self.remove_subtree(&child);
        }

        frame.on_navigated(&payload);
        self.bus.publish(FrameEvent::Navigated(new_id));
    }

    fn install_main_frame(&self, id: FrameId) -> Arc<Frame> {
        let frame = Frame::new(id.clone(), None);
        self.frames.insert(id.clone(), Arc::clone(&frame));
        *self.main_frame.lock() = Some(id);
        frame
    }

    fn on_navigated_within_document(&self, params: NavigatedWithinDocumentParams) {
        let frame_id = FrameId(params.frame_id);
        if let Some(frame) = self.frame(&frame_id) {
            frame.on_navigated_within_document(&params.url);
            self.bus
                .publish(FrameEvent::NavigatedWithinDocument(frame_id));
        }
    }

    fn on_frame_detached(&self, frame_id: &FrameId) {
        self.remove_subtree(frame_id);
    }

    /// Detach a frame and everything below it, children first.
    fn remove_subtree(&self, root: &FrameId) {
        let Some(frame) = self.frame(root) else {
            return;
        };
        for child in frame.child_ids() {
            self.remove_subtree(&child);
        }
        frame.detach();
        self.frames.remove(root);
        self.contexts.retain(|_, value| &value.0 != root);
        if let Some(parent_id) = frame.parent_id() {
            if let Some(parent) = self.frame(&parent_id) {
                parent.remove_child(root);
            }
        }
        if self.main_frame.lock().as_ref() == Some(root) {
            *self.main_frame.lock() = None;
        }
        self.bus.publish(FrameEvent::Detached(root.clone()));
    }

    fn on_lifecycle_event(&self, params: LifecycleEventParams) {
        let frame_id = FrameId(params.frame_id);
        let loader = LoaderId(params.loader_id);
        if let Some(frame) = self.frame(&frame_id) {
            frame.on_lifecycle(loader.clone(), &params.name);
            self.bus.publish(FrameEvent::Lifecycle {
                frame: frame_id,
                loader,
                name: params.name,
            });
        }
    }

    fn on_context_created(&self, params: ExecutionContextCreatedParams) {
        let description = params.context;
        let Some(frame_id) = description.frame_id().map(|id| FrameId(id.to_string())) else {
            return;
        };
        let Some(frame) = self.frame(&frame_id) else {
            return;
        };
        let tag = if description.name.as_deref() == Some(UTILITY_WORLD_NAME) {
            WorldTag::Utility
        } else if description.is_default() {
            WorldTag::Main
        } else {
            return;
        };
        let context_id = ExecutionContextId(description.id);
        frame
            .world(tag)
            .set_context(Some(ExecutionContext::new(
                Arc::clone(&self.channel),
                context_id,
            )));
        self.contexts.insert(context_id, (frame_id, tag));
    }

    fn on_context_destroyed(&self, context_id: ExecutionContextId) {
        if let Some((_, (frame_id, tag))) = self.contexts.remove(&context_id) {
            if let Some(frame) = self.frame(&frame_id) {
                frame.world(tag).set_context(None);
            }
        }
    }

    fn on_contexts_cleared(&self) {
        let entries: Vec<(ExecutionContextId, (FrameId, WorldTag))> = self
            .contexts
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        self.contexts.clear();
        for (_, (frame_id, tag)) in entries {
            if let Some(frame) = self.frame(&frame_id) {
                frame.world(tag).set_context(None);
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, CoreError> {
    serde_json::from_value(params.clone())
        .map_err(|err| CoreError::new(CoreErrorKind::Internal).with_hint(err.to_string()))
}
