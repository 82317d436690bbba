//! Serde payloads for the protocol events and command results this core
//! consumes. Shapes follow the documented protocol schema; handlers decode
//! with `serde_json::from_value` and treat missing optional fields as absent
//! rather than failing the whole event.

use serde::Deserialize;
use serde_json::Value;

// ── Network domain ─────────────────────────────────────────────────────────

/// The `request` object embedded in `Network.requestWillBeSent` and
/// `Fetch.requestPaused`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub url: String,
    #[serde(default)]
    pub url_fragment: Option<String>,
    pub method: String,
    #[serde(default)]
    pub headers: Value,
    #[serde(default)]
    pub post_data: Option<String>,
}

/// The `response` object embedded in `Network.responseReceived` and carried
/// as `redirectResponse` on follow-up `requestWillBeSent` events.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub url: String,
    pub status: i64,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: Value,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub from_disk_cache: bool,
    #[serde(default)]
    pub from_service_worker: bool,
    #[serde(default)]
    pub remote_ip_address: Option<String>,
    #[serde(default)]
    pub remote_port: Option<i64>,
    #[serde(default)]
    pub security_state: Option<String>,
    #[serde(default)]
    pub timing: Option<Value>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestWillBeSentParams {
    pub request_id: String,
    #[serde(default)]
    pub loader_id: String,
    pub request: RequestPayload,
    #[serde(default)]
    pub redirect_response: Option<ResponsePayload>,
    /// Whether the redirect hop carried by `redirect_response` will also get
    /// an extra-info event. Absent on older browsers; treated as `false`.
    #[serde(default)]
    pub redirect_has_extra_info: bool,
    #[serde(rename = "type", default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub frame_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceivedParams {
    pub request_id: String,
    pub response: ResponsePayload,
    /// Absent on older browsers; treated as `false`.
    #[serde(default)]
    pub has_extra_info: bool,
    #[serde(rename = "type", default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub frame_id: Option<String>,
}

/// Headers-only sibling of `responseReceived`; may arrive before or after it.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceivedExtraInfoParams {
    pub request_id: String,
    #[serde(default)]
    pub headers: Value,
    #[serde(default)]
    pub status_code: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFinishedParams {
    pub request_id: String,
    #[serde(default)]
    pub encoded_data_length: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFailedParams {
    pub request_id: String,
    #[serde(default)]
    pub error_text: String,
    #[serde(default)]
    pub canceled: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestServedFromCacheParams {
    pub request_id: String,
}

// ── Fetch domain (interception) ────────────────────────────────────────────

/// `Fetch.requestPaused`. Here `request_id` is the interception id; the
/// network-domain id the pause correlates with is `network_id`, absent for
/// requests the network domain never saw.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPausedParams {
    pub request_id: String,
    pub request: RequestPayload,
    #[serde(default)]
    pub frame_id: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub response_status_code: Option<i64>,
    #[serde(default)]
    pub response_error_reason: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallenge {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub realm: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequiredParams {
    pub request_id: String,
    pub auth_challenge: AuthChallenge,
}

// ── Page domain (frames and lifecycle) ─────────────────────────────────────

/// The `frame` object carried by `Page.frameNavigated` and the frame-tree
/// getter.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePayload {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub loader_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub url_fragment: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameAttachedParams {
    pub frame_id: String,
    #[serde(default)]
    pub parent_frame_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameNavigatedParams {
    pub frame: FramePayload,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigatedWithinDocumentParams {
    pub frame_id: String,
    pub url: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameDetachedParams {
    pub frame_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEventParams {
    pub frame_id: String,
    #[serde(default)]
    pub loader_id: String,
    pub name: String,
}

// ── Runtime domain (execution contexts, evaluation) ────────────────────────

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDescription {
    pub id: i64,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Carries `frameId` and `isDefault` for page-world contexts.
    #[serde(default)]
    pub aux_data: Option<Value>,
}

impl ExecutionContextDescription {
    pub fn frame_id(&self) -> Option<&str> {
        self.aux_data.as_ref()?.get("frameId")?.as_str()
    }

    pub fn is_default(&self) -> bool {
        self.aux_data
            .as_ref()
            .and_then(|aux| aux.get("isDefault"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextCreatedParams {
    pub context: ExecutionContextDescription,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDestroyedParams {
    pub execution_context_id: i64,
}

/// `Runtime.RemoteObject` as returned by evaluate/callFunctionOn.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type", default)]
    pub object_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub unserializable_value: Option<String>,
    #[serde(default)]
    pub object_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub line_number: Option<i64>,
    #[serde(default)]
    pub column_number: Option<i64>,
    #[serde(default)]
    pub exception: Option<RemoteObject>,
}

impl ExceptionDetails {
    /// Human-readable rendering preferring the thrown value's description.
    pub fn render(&self) -> String {
        self.exception
            .as_ref()
            .and_then(|obj| obj.description.clone())
            .unwrap_or_else(|| self.text.clone())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub result: RemoteObject,
    #[serde(default)]
    pub exception_details: Option<ExceptionDetails>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResponseBodyResult {
    pub body: String,
    #[serde(default)]
    pub base64_encoded: bool,
}
