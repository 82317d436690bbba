//! One logical HTTP exchange reconstructed from protocol events, including
//! the cooperative interception decision state.
//!
//! Interception resolution is priority-ordered, not last-writer-wins: a
//! strictly higher priority wins outright, and on a tie `abort` beats
//! `respond` beats `continue`. Legacy callers that omit a priority act
//! immediately and exclusively.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use cdp_channel::protocol::RequestWillBeSentParams;
use cdp_channel::CdpChannel;
use wheelhouse_core_types::{
    CoreError, CoreErrorKind, FrameId, HeaderMap, InterceptionId, LoaderId, RequestId,
};

use crate::response::ResponseRecord;

/// Deferred interception handler registered via
/// [`RequestRecord::enqueue_intercept_action`]. Handlers run sequentially in
/// registration order so later handlers can observe side effects of earlier
/// ones.
pub type InterceptHandler = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), CoreError>> + Send>;

/// Overrides applied when continuing an intercepted request.
#[derive(Clone, Debug, Default)]
pub struct ContinueOverrides {
    pub url: Option<String>,
    pub method: Option<String>,
    pub post_data: Option<Vec<u8>>,
    pub headers: Option<HeaderMap>,
}

/// A mocked response fulfilled in place of the network fetch.
#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: i64,
    pub headers: HeaderMap,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: HeaderMap::new(),
            content_type: None,
            body: Vec::new(),
        }
    }
}

/// Network-level error reported when aborting an intercepted request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AbortReason {
    Aborted,
    AccessDenied,
    AddressUnreachable,
    BlockedByClient,
    BlockedByResponse,
    ConnectionAborted,
    ConnectionClosed,
    ConnectionFailed,
    ConnectionRefused,
    ConnectionReset,
    InternetDisconnected,
    NameNotResolved,
    TimedOut,
    Failed,
}

impl AbortReason {
    pub fn as_protocol(&self) -> &'static str {
        match self {
            AbortReason::Aborted => "Aborted",
            AbortReason::AccessDenied => "AccessDenied",
            AbortReason::AddressUnreachable => "AddressUnreachable",
            AbortReason::BlockedByClient => "BlockedByClient",
            AbortReason::BlockedByResponse => "BlockedByResponse",
            AbortReason::ConnectionAborted => "ConnectionAborted",
            AbortReason::ConnectionClosed => "ConnectionClosed",
            AbortReason::ConnectionFailed => "ConnectionFailed",
            AbortReason::ConnectionRefused => "ConnectionRefused",
            AbortReason::ConnectionReset => "ConnectionReset",
            AbortReason::InternetDisconnected => "InternetDisconnected",
            AbortReason::NameNotResolved => "NameNotResolved",
            AbortReason::TimedOut => "TimedOut",
            AbortReason::Failed => "Failed",
        }
    }
}

/// Externally visible interception resolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterceptAction {
    None,
    Continue,
    Respond,
    Abort,
    /// Interception is not enabled for this request.
    Disabled,
    /// A terminal continue/respond/abort has already been sent.
    AlreadyHandled,
}

#[derive(Debug, Default)]
struct InterceptState {
    action: Resolution,
    priority: Option<i64>,
    continue_overrides: Option<ContinueOverrides>,
    respond_with: Option<MockResponse>,
    abort_reason: Option<AbortReason>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Resolution {
    #[default]
    None,
    Continue,
    Respond,
    Abort,
}

pub struct RequestRecord {
    channel: Arc<dyn CdpChannel>,
    id: RequestId,
    interception_id: Option<InterceptionId>,
    url: String,
    method: String,
    headers: HeaderMap,
    post_data: Option<String>,
    resource_type: String,
    is_navigation: bool,
    frame_id: Option<FrameId>,
    loader_id: LoaderId,
    allow_interception: bool,
    handled: AtomicBool,
    from_memory_cache: AtomicBool,
    failure_text: Mutex<Option<String>>,
    response: Mutex<Option<Arc<ResponseRecord>>>,
    chain: Arc<Mutex<Vec<Arc<RequestRecord>>>>,
    intercept: Mutex<InterceptState>,
    handlers: Mutex<Vec<InterceptHandler>>,
}

impl RequestRecord {
    pub(crate) fn new(
        channel: Arc<dyn CdpChannel>,
        event: &RequestWillBeSentParams,
        headers: HeaderMap,
        interception_id: Option<InterceptionId>,
        allow_interception: bool,
        chain: Arc<Mutex<Vec<Arc<RequestRecord>>>>,
    ) -> Arc<Self> {
        let resource_type = event
            .resource_type
            .clone()
            .unwrap_or_else(|| "Other".to_string());
        let is_navigation = event.request_id == event.loader_id && resource_type == "Document";
        Arc::new(Self {
            channel,
            id: RequestId(event.request_id.clone()),
            interception_id,
            url: event.request.url.clone(),
            method: event.request.method.clone(),
            headers,
            post_data: event.request.post_data.clone(),
            resource_type,
            is_navigation,
            frame_id: event.frame_id.clone().map(FrameId),
            loader_id: LoaderId(event.loader_id.clone()),
            allow_interception,
            handled: AtomicBool::new(false),
            from_memory_cache: AtomicBool::new(false),
            failure_text: Mutex::new(None),
            response: Mutex::new(None),
            chain,
            intercept: Mutex::new(InterceptState::default()),
            handlers: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn interception_id(&self) -> Option<&InterceptionId> {
        self.interception_id.as_ref()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn post_data(&self) -> Option<&str> {
        self.post_data.as_deref()
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// True iff this request's id equals its loader id and its type is
    /// `Document`: the main resource of a navigation.
    pub fn is_navigation_request(&self) -> bool {
        self.is_navigation
    }

    pub fn frame_id(&self) -> Option<&FrameId> {
        self.frame_id.as_ref()
    }

    pub fn loader_id(&self) -> &LoaderId {
        &self.loader_id
    }

    pub fn failure(&self) -> Option<String> {
        self.failure_text.lock().clone()
    }

    pub fn response(&self) -> Option<Arc<ResponseRecord>> {
        self.response.lock().clone()
    }

    /// The superseded records that preceded this one within one logical
    /// navigation, in chronological order.
    pub fn redirect_chain(&self) -> Vec<Arc<RequestRecord>> {
        self.chain.lock().clone()
    }

    pub fn from_memory_cache(&self) -> bool {
        self.from_memory_cache.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_from_memory_cache(&self) {
        self.from_memory_cache.store(true, Ordering::Relaxed);
    }

    pub(crate) fn set_failure(&self, text: impl Into<String>) {
        *self.failure_text.lock() = Some(text.into());
    }

    pub(crate) fn set_response(&self, response: Arc<ResponseRecord>) {
        let mut slot = self.response.lock();
        if slot.is_some() {
            debug!(target: "network-center", request_id = %self.id.0, "response already set; ignoring");
            return;
        }
        *slot = Some(response);
    }

    pub(crate) fn shared_chain(&self) -> Arc<Mutex<Vec<Arc<RequestRecord>>>> {
        Arc::clone(&self.chain)
    }

    pub(crate) fn freeze_into_chain(self: &Arc<Self>) {
        self.chain.lock().push(Arc::clone(self));
    }

    /// Current interception resolution and its priority.
    pub fn intercept_resolution(&self) -> (InterceptAction, Option<i64>) {
        if !self.allow_interception {
            return (InterceptAction::Disabled, None);
        }
        if self.handled.load(Ordering::Acquire) {
            return (InterceptAction::AlreadyHandled, None);
        }
        let state = self.intercept.lock();
        let action = match state.action {
            Resolution::None => InterceptAction::None,
            Resolution::Continue => InterceptAction::Continue,
            Resolution::Respond => InterceptAction::Respond,
            Resolution::Abort => InterceptAction::Abort,
        };
        (action, state.priority)
    }

    /// Register a deferred interception handler. Handlers are awaited
    /// sequentially, in registration order, by
    /// [`finalize_interceptions`](Self::finalize_interceptions).
    pub fn enqueue_intercept_action(&self, handler: InterceptHandler) {
        self.handlers.lock().push(handler);
    }

    /// Continue the request, optionally with overrides. Without a priority
    /// the action is applied immediately and exclusively.
    pub async fn continue_request(
        &self,
        overrides: ContinueOverrides,
        priority: Option<i64>,
    ) -> Result<(), CoreError> {
        if self.is_data_url() {
            return Ok(());
        }
        self.check_interception_enabled()?;
        let Some(priority) = priority else {
            self.assert_not_handled()?;
            return self.apply_continue(&overrides).await;
        };
        if self.handled.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut state = self.intercept.lock();
        match state.priority {
            Some(current) if priority < current => {}
            Some(current) if priority == current => {
                // abort and respond are sticky against a later continue at
                // the same priority
                if !matches!(state.action, Resolution::Abort | Resolution::Respond) {
                    state.action = Resolution::Continue;
                    state.continue_overrides = Some(overrides);
                }
            }
            _ => {
                state.action = Resolution::Continue;
                state.priority = Some(priority);
                state.continue_overrides = Some(overrides);
            }
        }
        Ok(())
    }

    /// Fulfill the request with a mocked response.
    pub async fn respond(
        &self,
        response: MockResponse,
        priority: Option<i64>,
    ) -> Result<(), CoreError> {
        if self.is_data_url() {
            return Ok(());
        }
        self.check_interception_enabled()?;
        let Some(priority) = priority else {
            self.assert_not_handled()?;
            return self.apply_respond(&response).await;
        };
        if self.handled.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut state = self.intercept.lock();
        match state.priority {
            Some(current) if priority < current => {}
            Some(current) if priority == current => {
                if !matches!(state.action, Resolution::Abort) {
                    state.action = Resolution::Respond;
                    state.respond_with = Some(response);
                }
            }
            _ => {
                state.action = Resolution::Respond;
                state.priority = Some(priority);
                state.respond_with = Some(response);
            }
        }
        Ok(())
    }

    /// Abort the request with a network error.
    pub async fn abort(
        &self,
        reason: AbortReason,
        priority: Option<i64>,
    ) -> Result<(), CoreError> {
        if self.is_data_url() {
            return Ok(());
        }
        self.check_interception_enabled()?;
        let Some(priority) = priority else {
            self.assert_not_handled()?;
            return self.apply_abort(reason).await;
        };
        if self.handled.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut state = self.intercept.lock();
        // abort wins ties outright
        match state.priority {
            Some(current) if priority < current => {}
            _ => {
                state.action = Resolution::Abort;
                state.priority = Some(priority);
                state.abort_reason = Some(reason);
            }
        }
        Ok(())
    }

    /// Run every enqueued handler sequentially in registration order, then
    /// execute exactly one of continue/respond/abort per the accumulated
    /// resolution. Requests with no resolution are left untouched.
    pub async fn finalize_interceptions(&self) -> Result<(), CoreError> {
        loop {
            let batch: Vec<InterceptHandler> = std::mem::take(&mut *self.handlers.lock());
            if batch.is_empty() {
                break;
            }
            // a handler may enqueue further handlers; drain until quiescent
            for handler in batch {
                handler().await?;
            }
        }

        let (action, overrides, respond_with, abort_reason) = {
            let state = self.intercept.lock();
            (
                state.action,
                state.continue_overrides.clone(),
                state.respond_with.clone(),
                state.abort_reason.clone(),
            )
        };

        match action {
            Resolution::None => Ok(()),
            Resolution::Continue => self.apply_continue(&overrides.unwrap_or_default()).await,
            Resolution::Respond => self.apply_respond(&respond_with.unwrap_or_default()).await,
            Resolution::Abort => {
                self.apply_abort(abort_reason.unwrap_or(AbortReason::Failed))
                    .await
            }
        }
    }

    fn is_data_url(&self) -> bool {
        crate::is_data_url(&self.url)
    }

    fn check_interception_enabled(&self) -> Result<(), CoreError> {
        if self.allow_interception {
            Ok(())
        } else {
            Err(CoreError::new(CoreErrorKind::InterceptionMisuse)
                .with_hint("request interception is not enabled"))
        }
    }

    fn assert_not_handled(&self) -> Result<(), CoreError> {
        if self.handled.load(Ordering::Acquire) {
            Err(CoreError::new(CoreErrorKind::InterceptionMisuse)
                .with_hint("request is already handled"))
        } else {
            Ok(())
        }
    }

    fn interception_id_checked(&self) -> Result<&InterceptionId, CoreError> {
        self.interception_id.as_ref().ok_or_else(|| {
            CoreError::new(CoreErrorKind::Internal)
                .with_hint("request has no interception id; interception arrived without a paused event")
        })
    }

    async fn apply_continue(&self, overrides: &ContinueOverrides) -> Result<(), CoreError> {
        let interception_id = self.interception_id_checked()?.clone();
        self.handled.store(true, Ordering::Release);

        let mut params = json!({ "requestId": interception_id.0 });
        if let Some(url) = &overrides.url {
            params["url"] = json!(url);
        }
        if let Some(method) = &overrides.method {
            params["method"] = json!(method);
        }
        if let Some(post_data) = &overrides.post_data {
            params["postData"] = json!(BASE64.encode(post_data));
        }
        if let Some(headers) = &overrides.headers {
            params["headers"] = headers_array(headers);
        }

        match self.channel.send("Fetch.continueRequest", params).await {
            Ok(_) => Ok(()),
            Err(err) => {
                self.handled.store(false, Ordering::Release);
                self.swallow_or_rethrow(err, "continue")
            }
        }
    }

    async fn apply_respond(&self, mock: &MockResponse) -> Result<(), CoreError> {
        let interception_id = self.interception_id_checked()?.clone();
        self.handled.store(true, Ordering::Release);

        let mut headers = mock.headers.clone();
        if let Some(content_type) = &mock.content_type {
            headers.insert("content-type".to_string(), content_type.clone());
        }
        if !headers.contains_key("content-length") {
            headers.insert("content-length".to_string(), mock.body.len().to_string());
        }

        let params = json!({
            "requestId": interception_id.0,
            "responseCode": mock.status,
            "responseHeaders": headers_array(&headers),
            "body": BASE64.encode(&mock.body),
        });

        match self.channel.send("Fetch.fulfillRequest", params).await {
            Ok(_) => Ok(()),
            Err(err) => {
                self.handled.store(false, Ordering::Release);
                self.swallow_or_rethrow(err, "respond")
            }
        }
    }

    async fn apply_abort(&self, reason: AbortReason) -> Result<(), CoreError> {
        let interception_id = self.interception_id_checked()?.clone();
        self.handled.store(true, Ordering::Release);

        let params = json!({
            "requestId": interception_id.0,
            "errorReason": reason.as_protocol(),
        });

        match self.channel.send("Fetch.failRequest", params).await {
            Ok(_) => Ok(()),
            Err(err) => {
                self.handled.store(false, Ordering::Release);
                self.swallow_or_rethrow(err, "abort")
            }
        }
    }

    /// Send failures here usually mean the page navigated away or closed
    /// mid-decision; those are logged and swallowed. A malformed
    /// caller-supplied header is a contract violation and is rethrown.
    fn swallow_or_rethrow(&self, err: CoreError, during: &str) -> Result<(), CoreError> {
        let invalid_header = err
            .hint
            .as_deref()
            .map(|hint| hint.contains("Invalid header"))
            .unwrap_or(false);
        if invalid_header {
            return Err(CoreError::new(CoreErrorKind::InvalidHeader)
                .with_hint(err.hint.unwrap_or_default()));
        }
        debug!(
            target: "network-center",
            request_id = %self.id.0,
            during,
            %err,
            "interception resolve failed; request likely gone"
        );
        Ok(())
    }
}

fn headers_array(headers: &HeaderMap) -> Value {
    Value::Array(
        headers
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect(),
    )
}

impl fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRecord")
            .field("id", &self.id.0)
            .field("url", &self.url)
            .field("method", &self.method)
            .field("resource_type", &self.resource_type)
            .field("is_navigation", &self.is_navigation)
            .finish()
    }
}
