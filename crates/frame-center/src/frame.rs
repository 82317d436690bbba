//! Per-frame state: navigation identity, lifecycle milestones for the
//! current document load, and the two execution worlds.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use cdp_channel::protocol::FramePayload;
use wheelhouse_core_types::{FrameId, LoaderId, WorldTag};

use crate::world::ExecutionWorld;

pub struct Frame {
    id: Mutex<FrameId>,
    parent_id: Mutex<Option<FrameId>>,
    child_ids: Mutex<Vec<FrameId>>,
    url: Mutex<String>,
    name: Mutex<Option<String>>,
    loader_id: Mutex<LoaderId>,
    lifecycle: Mutex<HashSet<String>>,
    gone: CancellationToken,
    main_world: Arc<ExecutionWorld>,
    utility_world: Arc<ExecutionWorld>,
}

impl Frame {
    pub fn new(id: FrameId, parent_id: Option<FrameId>) -> Arc<Self> {
        let gone = CancellationToken::new();
        let main_world = ExecutionWorld::new(id.clone(), WorldTag::Main, gone.clone());
        let utility_world = ExecutionWorld::new(id.clone(), WorldTag::Utility, gone.clone());
        Arc::new(Self {
            id: Mutex::new(id),
            parent_id: Mutex::new(parent_id),
            child_ids: Mutex::new(Vec::new()),
            url: Mutex::new(String::new()),
            name: Mutex::new(None),
            loader_id: Mutex::new(LoaderId::default()),
            lifecycle: Mutex::new(HashSet::new()),
            gone,
            main_world,
            utility_world,
        })
    }

    pub fn id(&self) -> FrameId {
        self.id.lock().clone()
    }

    /// Identity-preserving id change on a cross-process main-frame swap.
    pub(crate) fn set_id(&self, id: FrameId) {
        *self.id.lock() = id;
    }

    pub fn parent_id(&self) -> Option<FrameId> {
        self.parent_id.lock().clone()
    }

    pub fn is_main(&self) -> bool {
        self.parent_id.lock().is_none()
    }

    pub fn child_ids(&self) -> Vec<FrameId> {
        self.child_ids.lock().clone()
    }

    pub(crate) fn add_child(&self, child: FrameId) {
        let mut children = self.child_ids.lock();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    pub(crate) fn remove_child(&self, child: &FrameId) {
        self.child_ids.lock().retain(|entry| entry != child);
    }

    pub fn url(&self) -> String {
        self.url.lock().clone()
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn loader_id(&self) -> LoaderId {
        self.loader_id.lock().clone()
    }

    /// Lifecycle milestone names observed for the current document load.
    pub fn lifecycle_events(&self) -> HashSet<String> {
        self.lifecycle.lock().clone()
    }

    /// Record a lifecycle event. An `init` event carrying a new loader id
    /// starts a fresh document load: the milestone set is cleared exactly
    /// then.
    pub(crate) fn on_lifecycle(&self, loader_id: LoaderId, name: &str) {
        if name == "init" {
            let mut current = self.loader_id.lock();
            if *current != loader_id {
                *current = loader_id;
                self.lifecycle.lock().clear();
            }
        }
        self.lifecycle.lock().insert(name.to_string());
    }

    pub fn has_milestones(&self, expected: &[&str]) -> bool {
        let observed = self.lifecycle.lock();
        expected.iter().all(|name| observed.contains(*name))
    }

    /// Apply a committed navigation.
    pub(crate) fn on_navigated(&self, payload: &FramePayload) {
        *self.url.lock() = match &payload.url_fragment {
            Some(fragment) => format!("{}{}", payload.url, fragment),
            None => payload.url.clone(),
        };
        *self.name.lock() = payload.name.clone();
        if !payload.loader_id.is_empty() {
            *self.loader_id.lock() = LoaderId(payload.loader_id.clone());
        }
    }

    /// Same-document navigation: only the URL moves.
    pub(crate) fn on_navigated_within_document(&self, url: &str) {
        *self.url.lock() = url.to_string();
    }

    pub fn main_world(&self) -> &Arc<ExecutionWorld> {
        &self.main_world
    }

    pub fn utility_world(&self) -> &Arc<ExecutionWorld> {
        &self.utility_world
    }

    pub fn world(&self, tag: WorldTag) -> &Arc<ExecutionWorld> {
        match tag {
            WorldTag::Main => &self.main_world,
            WorldTag::Utility => &self.utility_world,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.gone.is_cancelled()
    }

    /// Tear the frame down: pending and future world waiters fail fast.
    pub(crate) fn detach(&self) {
        self.main_world.set_context(None);
        self.utility_world.set_context(None);
        self.gone.cancel();
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id.lock().0)
            .field("url", &*self.url.lock())
            .field("detached", &self.gone.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_with_new_loader_clears_milestones() {
        let frame = Frame::new(FrameId("f-1".into()), None);
        frame.on_lifecycle(LoaderId("l-1".into()), "init");
        frame.on_lifecycle(LoaderId("l-1".into()), "DOMContentLoaded");
        frame.on_lifecycle(LoaderId("l-1".into()), "load");
        assert!(frame.has_milestones(&["load", "DOMContentLoaded"]));

        // duplicated init for the same loader must not wipe progress
        frame.on_lifecycle(LoaderId("l-1".into()), "init");
        assert!(frame.has_milestones(&["load"]));

        // a new loader id starts a fresh set
        frame.on_lifecycle(LoaderId("l-2".into()), "init");
        assert!(!frame.has_milestones(&["load"]));
        assert_eq!(frame.loader_id(), LoaderId("l-2".into()));
    }

    #[test]
    fn detach_is_sticky() {
        let frame = Frame::new(FrameId("f-2".into()), Some(FrameId("f-1".into())));
        assert!(!frame.is_detached());
        frame.detach();
        assert!(frame.is_detached());
        assert!(!frame.main_world().has_context());
    }
}
