//! Frame tree, navigation lifecycle tracking, and execution-world bridging.
//!
//! Frames live in an id-keyed arena owned by [`FrameTree`]; navigation
//! completion is tracked by [`LifecycleTracker`] over a declarative
//! milestone set; each frame's two JavaScript worlds are bridged by
//! [`ExecutionWorld`], which survives the browser destroying and recreating
//! contexts across navigations. [`AutomationHub`] wires both coordinators to
//! one channel subscription.

mod context;
mod frame;
mod hub;
mod lifecycle;
mod navigation;
mod tree;
mod wait;
mod world;

pub use context::{ExecutionContext, RemoteHandle};
pub use frame::Frame;
pub use hub::AutomationHub;
pub use lifecycle::{LifecycleTracker, WaitUntil};
pub use navigation::NavigationOptions;
pub use tree::{FrameEvent, FrameTree};
pub use wait::Polling;
pub use world::ExecutionWorld;
