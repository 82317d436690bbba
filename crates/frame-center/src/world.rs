//! Execution-world bridging.
//!
//! A world decouples "evaluate code in this frame" from the physical
//! lifetime of the browser's execution context, which is destroyed and
//! recreated on every cross-document navigation. Consumers suspend on the
//! context watch; a swap to a fresh context releases them and re-arms every
//! registered recurring wait task.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use wheelhouse_core_types::{CoreError, CoreErrorKind, FrameId, WorldTag};

use crate::context::{is_undefined_result_error, ExecutionContext, RemoteHandle};
use crate::wait::{run_wait_task, Polling, WaitTask};

pub struct ExecutionWorld {
    frame_id: FrameId,
    tag: WorldTag,
    /// Cancelled when the owning frame detaches; evaluations fail fast
    /// instead of waiting for a context that will never come.
    gone: CancellationToken,
    context: watch::Sender<Option<ExecutionContext>>,
    tasks: Mutex<Vec<Arc<WaitTask>>>,
}

impl ExecutionWorld {
    pub fn new(frame_id: FrameId, tag: WorldTag, gone: CancellationToken) -> Arc<Self> {
        let (context, _) = watch::channel(None);
        Arc::new(Self {
            frame_id,
            tag,
            gone,
            context,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn tag(&self) -> WorldTag {
        self.tag
    }

    pub fn frame_id(&self) -> &FrameId {
        &self.frame_id
    }

    pub fn has_context(&self) -> bool {
        self.context.borrow().is_some()
    }

    /// Install or clear the current context. A fresh context releases all
    /// pending waiters and pokes every registered wait task so it evaluates
    /// again against the new document.
    pub fn set_context(&self, context: Option<ExecutionContext>) {
        let installing = context.is_some();
        self.context.send_replace(context);
        if installing {
            let tasks: Vec<Arc<WaitTask>> = self.tasks.lock().clone();
            for task in tasks {
                task.poke();
            }
        } else {
            debug!(
                target: "frame-center",
                frame = %self.frame_id,
                world = self.tag.as_str(),
                "execution context cleared"
            );
        }
    }

    /// The current context; the sole suspension point for evaluation.
    pub async fn context(&self) -> Result<ExecutionContext, CoreError> {
        if self.gone.is_cancelled() {
            return Err(self.detached_error());
        }
        let mut rx = self.context.subscribe();
        tokio::select! {
            _ = self.gone.cancelled() => Err(self.detached_error()),
            current = rx.wait_for(|ctx| ctx.is_some()) => match current {
                Ok(guard) => guard.clone().ok_or_else(|| {
                    CoreError::new(CoreErrorKind::Internal)
                        .with_hint("context cleared while being handed out")
                }),
                Err(_) => Err(CoreError::new(CoreErrorKind::Internal)
                    .with_hint("world dropped while waiting for context")),
            },
        }
    }

    pub async fn evaluate(&self, expression: &str) -> Result<Value, CoreError> {
        let context = self.context().await?;
        match context.evaluate(expression).await {
            Err(err) if is_undefined_result_error(&err) => Ok(Value::Null),
            other => other,
        }
    }

    pub async fn evaluate_handle(&self, expression: &str) -> Result<RemoteHandle, CoreError> {
        let context = self.context().await?;
        context.evaluate_handle(expression).await
    }

    /// Wait until `predicate` evaluates truthy in this world, re-running it
    /// on every poll tick and after every context swap.
    pub async fn wait_for_function(
        self: &Arc<Self>,
        predicate: &str,
        polling: Polling,
        timeout: std::time::Duration,
    ) -> Result<Value, CoreError> {
        run_wait_task(
            Arc::clone(self),
            predicate.to_string(),
            polling,
            timeout,
            format!("waiting for function `{predicate}`"),
        )
        .await
    }

    /// Wait for a selector match (or for its disappearance when `hidden`).
    /// Resolves to a handle on the matched node, or `None` when waiting for
    /// disappearance.
    pub async fn wait_for_selector(
        self: &Arc<Self>,
        selector: &str,
        hidden: bool,
        timeout: std::time::Duration,
    ) -> Result<Option<RemoteHandle>, CoreError> {
        let quoted = serde_json::to_string(selector)
            .map_err(|err| CoreError::new(CoreErrorKind::Internal).with_hint(err.to_string()))?;
        let predicate = if hidden {
            format!("document.querySelector({quoted}) === null")
        } else {
            format!("document.querySelector({quoted}) !== null")
        };
        run_wait_task(
            Arc::clone(self),
            predicate,
            Polling::Mutation,
            timeout,
            format!("waiting for selector `{selector}`"),
        )
        .await?;
        if hidden {
            return Ok(None);
        }
        let handle = self
            .evaluate_handle(&format!("document.querySelector({quoted})"))
            .await?;
        Ok(Some(handle))
    }

    /// XPath flavor of [`wait_for_selector`](Self::wait_for_selector).
    pub async fn wait_for_xpath(
        self: &Arc<Self>,
        expression: &str,
        hidden: bool,
        timeout: std::time::Duration,
    ) -> Result<Option<RemoteHandle>, CoreError> {
        let quoted = serde_json::to_string(expression)
            .map_err(|err| CoreError::new(CoreErrorKind::Internal).with_hint(err.to_string()))?;
        let lookup = format!(
            "document.evaluate({quoted}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue"
        );
        let predicate = if hidden {
            format!("{lookup} === null")
        } else {
            format!("{lookup} !== null")
        };
        run_wait_task(
            Arc::clone(self),
            predicate,
            Polling::Mutation,
            timeout,
            format!("waiting for xpath `{expression}`"),
        )
        .await?;
        if hidden {
            return Ok(None);
        }
        let handle = self.evaluate_handle(&lookup).await?;
        Ok(Some(handle))
    }

    pub(crate) fn register_task(&self, task: Arc<WaitTask>) {
        self.tasks.lock().push(task);
    }

    pub(crate) fn unregister_task(&self, task: &Arc<WaitTask>) {
        self.tasks.lock().retain(|entry| !Arc::ptr_eq(entry, task));
    }

    pub(crate) fn detached_error(&self) -> CoreError {
        CoreError::new(CoreErrorKind::FrameDetached)
            .with_hint(format!("frame {} is detached", self.frame_id))
    }
}
