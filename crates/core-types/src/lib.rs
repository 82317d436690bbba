//! Shared identifiers and the common error type used across the wheelhouse
//! automation core.
//!
//! Every id here is a protocol-assigned string wrapped in a newtype so the
//! coordinator tables cannot mix, say, a request id with an interception id.
//! Fresh ids (`new()`) are only minted by tests and stub channels.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Protocol-assigned network request identifier.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Identifier handed out by the fetch-interception domain while a request is
/// paused. Distinct from [`RequestId`]; present only while interception is
/// active.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct InterceptionId(pub String);

impl InterceptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Identifier for one document load. Changes on cross-document navigation,
/// stable across same-document navigation.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LoaderId(pub String);

/// Protocol frame identifier.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FrameId(pub String);

impl FrameId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric id of a JavaScript execution context.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ExecutionContextId(pub i64);

/// Which isolated world of a frame a context belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum WorldTag {
    /// The page's own scripting world.
    Main,
    /// The isolated utility world injected for internal tooling scripts.
    Utility,
}

impl WorldTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorldTag::Main => "main",
            WorldTag::Utility => "utility",
        }
    }
}

/// High-level error categories surfaced by the core.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum CoreErrorKind {
    #[error("operation timed out")]
    Timeout,
    #[error("cdp i/o failure")]
    CdpIo,
    #[error("frame detached")]
    FrameDetached,
    #[error("execution context destroyed")]
    ContextDestroyed,
    #[error("invalid intercept response header")]
    InvalidHeader,
    #[error("interception misuse")]
    InterceptionMisuse,
    #[error("invalid polling option")]
    BadPolling,
    #[error("internal error")]
    Internal,
}

/// Enriched error passed between layers and out to callers.
///
/// `hint` carries the attempted operation's description for timeouts, or the
/// raw protocol message for i/o failures. `retriable` marks transient races
/// that wait primitives are expected to retry on.
#[derive(Clone, Debug)]
pub struct CoreError {
    pub kind: CoreErrorKind,
    pub hint: Option<String>,
    pub retriable: bool,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(hint) = &self.hint {
            write!(f, ": {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for CoreError {}

impl CoreError {
    pub fn new(kind: CoreErrorKind) -> Self {
        Self {
            kind,
            hint: None,
            retriable: false,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn retriable(mut self, flag: bool) -> Self {
        self.retriable = flag;
        self
    }

    /// Timeout carrying the attempted operation's description.
    pub fn timeout(what: impl Into<String>, ms: u64) -> Self {
        Self::new(CoreErrorKind::Timeout).with_hint(format!("{} after {}ms", what.into(), ms))
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == CoreErrorKind::Timeout
    }

    pub fn is_context_destroyed(&self) -> bool {
        self.kind == CoreErrorKind::ContextDestroyed
    }

    pub fn is_frame_detached(&self) -> bool {
        self.kind == CoreErrorKind::FrameDetached
    }
}

/// Header map with case-folded lowercase keys, as exposed on request and
/// response records.
pub type HeaderMap = BTreeMap<String, String>;

/// Fold a raw protocol header object into a [`HeaderMap`]. Non-string values
/// are stringified; keys are lowercased.
pub fn fold_headers(raw: &serde_json::Value) -> HeaderMap {
    let mut map = HeaderMap::new();
    if let Some(object) = raw.as_object() {
        for (key, value) in object {
            let rendered = match value.as_str() {
                Some(text) => text.to_string(),
                None => value.to_string(),
            };
            map.insert(key.to_ascii_lowercase(), rendered);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn headers_are_case_folded() {
        let raw = json!({ "Content-Type": "text/html", "X-Count": 3 });
        let map = fold_headers(&raw);
        assert_eq!(map.get("content-type").map(String::as_str), Some("text/html"));
        assert_eq!(map.get("x-count").map(String::as_str), Some("3"));
        assert!(map.get("Content-Type").is_none());
    }

    #[test]
    fn timeout_error_carries_operation() {
        let err = CoreError::timeout("waiting for selector `.late`", 500);
        assert!(err.is_timeout());
        assert!(err.to_string().contains("waiting for selector `.late`"));
        assert!(err.to_string().contains("500ms"));
    }

    #[test]
    fn ids_do_not_compare_across_types() {
        let req = RequestId("interception-1".into());
        assert_eq!(req, RequestId("interception-1".into()));
        assert_ne!(req.0, RequestId::new().0);
    }
}
