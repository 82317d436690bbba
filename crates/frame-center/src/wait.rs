//! Recurring poll tasks.
//!
//! A wait task is an explicit pending-operation record registered on its
//! world: the world visits and pokes every registered task when a fresh
//! context arrives, and the task's driver loop re-evaluates its predicate on
//! each poke or poll tick. A "context destroyed" failure from an evaluation
//! that was in flight during a swap is retried silently in the next context;
//! only an independent timeout surfaces it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use wheelhouse_core_types::{CoreError, CoreErrorKind};

use crate::world::ExecutionWorld;

/// How often a predicate is re-evaluated between context swaps.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Polling {
    /// Frame-paced: roughly every paint (16ms).
    Raf,
    /// DOM-paced: cheap cadence between swap-driven reruns.
    Mutation,
    /// Fixed interval in milliseconds.
    Interval(u64),
}

impl Polling {
    /// Parse a caller-supplied polling option. An unrecognized value is a
    /// caller-contract violation.
    pub fn parse(option: &str) -> Result<Self, CoreError> {
        match option {
            "raf" => Ok(Polling::Raf),
            "mutation" => Ok(Polling::Mutation),
            other => match other.parse::<u64>() {
                Ok(ms) if ms > 0 => Ok(Polling::Interval(ms)),
                _ => Err(CoreError::new(CoreErrorKind::BadPolling)
                    .with_hint(format!("unknown polling option `{other}`"))),
            },
        }
    }

    fn tick(&self) -> Duration {
        match self {
            Polling::Raf => Duration::from_millis(16),
            Polling::Mutation => Duration::from_millis(100),
            Polling::Interval(ms) => Duration::from_millis(*ms),
        }
    }
}

/// Pending-operation record for one recurring wait.
pub(crate) struct WaitTask {
    rerun: Notify,
}

impl WaitTask {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            rerun: Notify::new(),
        })
    }

    /// Ask the driver loop to evaluate again now (fresh context arrived).
    pub fn poke(&self) {
        self.rerun.notify_one();
    }
}

/// Drive a predicate until truthy, the timeout elapses, or the frame goes
/// away. Timeout zero disables the deadline.
pub(crate) async fn run_wait_task(
    world: Arc<ExecutionWorld>,
    predicate: String,
    polling: Polling,
    timeout: Duration,
    description: String,
) -> Result<Value, CoreError> {
    let task = WaitTask::new();
    world.register_task(Arc::clone(&task));
    let result = if timeout.is_zero() {
        poll_until_truthy(&world, &task, &predicate, polling).await
    } else {
        match tokio::time::timeout(
            timeout,
            poll_until_truthy(&world, &task, &predicate, polling),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::timeout(description, timeout.as_millis() as u64)),
        }
    };
    world.unregister_task(&task);
    result
}

async fn poll_until_truthy(
    world: &Arc<ExecutionWorld>,
    task: &Arc<WaitTask>,
    predicate: &str,
    polling: Polling,
) -> Result<Value, CoreError> {
    loop {
        // Suspends until a context exists; fails fast on frame detach.
        let context = world.context().await?;
        match context.evaluate(predicate).await {
            Ok(value) if is_truthy(&value) => return Ok(value),
            Ok(_) => {}
            Err(err) if err.is_context_destroyed() => {
                // The context was torn down while our evaluation was in
                // flight; retry against whatever context comes next.
                debug!(
                    target: "frame-center",
                    frame = %world.frame_id(),
                    "evaluation raced context teardown; retrying"
                );
                continue;
            }
            Err(err) => return Err(err),
        }
        tokio::select! {
            _ = tokio::time::sleep(polling.tick()) => {}
            _ = task.rerun.notified() => {}
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_spec_parses() {
        assert_eq!(Polling::parse("raf").expect("raf"), Polling::Raf);
        assert_eq!(Polling::parse("mutation").expect("mutation"), Polling::Mutation);
        assert_eq!(Polling::parse("250").expect("interval"), Polling::Interval(250));
    }

    #[test]
    fn invalid_polling_is_a_contract_error() {
        let err = Polling::parse("sometimes").expect_err("rejected");
        assert_eq!(err.kind, CoreErrorKind::BadPolling);
        let err = Polling::parse("0").expect_err("zero interval rejected");
        assert_eq!(err.kind, CoreErrorKind::BadPolling);
    }

    #[test]
    fn truthiness_matches_javascript() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&serde_json::json!(false)));
        assert!(!is_truthy(&serde_json::json!(0)));
        assert!(!is_truthy(&serde_json::json!("")));
        assert!(is_truthy(&serde_json::json!("x")));
        assert!(is_truthy(&serde_json::json!(3)));
        assert!(is_truthy(&serde_json::json!({})));
    }
}
