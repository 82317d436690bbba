//! One reconstructed HTTP response: metadata merged from the main response
//! event and (when present) its extra-info sibling, plus a lazily fetched
//! body behind an exactly-once resolution gate.

use std::fmt;
use std::sync::{Arc, Weak};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::{watch, OnceCell};

use cdp_channel::protocol::{
    GetResponseBodyResult, ResponsePayload, ResponseReceivedExtraInfoParams,
};
use cdp_channel::CdpChannel;
use wheelhouse_core_types::{fold_headers, CoreError, CoreErrorKind, HeaderMap, RequestId};

use crate::request::RequestRecord;

/// Resolution state of the body. Set exactly once; later resolutions are
/// ignored.
#[derive(Clone, Debug)]
enum BodyGate {
    Pending,
    /// Terminal transport signal arrived; the body may be fetched.
    Available,
    /// No body will ever be retrievable (redirect hop, failed load, cached
    /// 304, data URL).
    Unavailable(String),
}

pub struct ResponseRecord {
    channel: Arc<dyn CdpChannel>,
    request: Weak<RequestRecord>,
    request_id: RequestId,
    url: String,
    status: i64,
    status_text: String,
    headers: HeaderMap,
    mime_type: String,
    remote_address: Option<(String, i64)>,
    security_state: Option<String>,
    timing: Option<Value>,
    from_disk_cache: bool,
    from_service_worker: bool,
    gate: watch::Sender<BodyGate>,
    body: OnceCell<Result<Vec<u8>, CoreError>>,
}

impl ResponseRecord {
    pub(crate) fn new(
        channel: Arc<dyn CdpChannel>,
        request: &Arc<RequestRecord>,
        payload: &ResponsePayload,
        extra_info: Option<&ResponseReceivedExtraInfoParams>,
    ) -> Arc<Self> {
        // Extra-info headers are the raw wire headers and take precedence
        // over the (possibly filtered) headers of the main response event.
        // Status stays with the main event.
        let headers = match extra_info {
            Some(extra) => fold_headers(&extra.headers),
            None => fold_headers(&payload.headers),
        };
        let (gate, _) = watch::channel(BodyGate::Pending);
        Arc::new(Self {
            channel,
            request: Arc::downgrade(request),
            request_id: request.id().clone(),
            url: payload.url.clone(),
            status: payload.status,
            status_text: payload.status_text.clone(),
            headers,
            mime_type: payload.mime_type.clone(),
            remote_address: payload
                .remote_ip_address
                .clone()
                .map(|ip| (ip, payload.remote_port.unwrap_or(0))),
            security_state: payload.security_state.clone(),
            timing: payload.timing.clone(),
            from_disk_cache: payload.from_disk_cache,
            from_service_worker: payload.from_service_worker,
            gate,
            body: OnceCell::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> i64 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn ok(&self) -> bool {
        self.status == 0 || (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn remote_address(&self) -> Option<&(String, i64)> {
        self.remote_address.as_ref()
    }

    pub fn security_state(&self) -> Option<&str> {
        self.security_state.as_deref()
    }

    pub fn timing(&self) -> Option<&Value> {
        self.timing.as_ref()
    }

    pub fn from_service_worker(&self) -> bool {
        self.from_service_worker
    }

    /// True when served from the HTTP disk cache or the in-memory cache.
    pub fn from_cache(&self) -> bool {
        self.from_disk_cache
            || self
                .request
                .upgrade()
                .map(|request| request.from_memory_cache())
                .unwrap_or(false)
    }

    /// The request this response answers, when still alive.
    pub fn request(&self) -> Option<Arc<RequestRecord>> {
        self.request.upgrade()
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Mark the body retrievable. No-op when already resolved.
    pub(crate) fn resolve_body_available(&self) {
        self.gate.send_if_modified(|gate| match gate {
            BodyGate::Pending => {
                *gate = BodyGate::Available;
                true
            }
            _ => false,
        });
    }

    /// Mark the body permanently unavailable. No-op when already resolved.
    pub(crate) fn resolve_body_unavailable(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.gate.send_if_modified(|gate| match gate {
            BodyGate::Pending => {
                *gate = BodyGate::Unavailable(reason);
                true
            }
            _ => false,
        });
    }

    /// The response body. Suspends until loading finished or failed, then
    /// fetches the body from the browser exactly once and caches it.
    pub async fn body(&self) -> Result<Vec<u8>, CoreError> {
        let mut rx = self.gate.subscribe();
        let resolved = rx
            .wait_for(|gate| !matches!(gate, BodyGate::Pending))
            .await
            .map_err(|_| {
                CoreError::new(CoreErrorKind::Internal).with_hint("body gate dropped unresolved")
            })?
            .clone();

        if let BodyGate::Unavailable(reason) = resolved {
            return Err(CoreError::new(CoreErrorKind::Internal).with_hint(reason));
        }

        self.body
            .get_or_init(|| async {
                let result = self
                    .channel
                    .send(
                        "Network.getResponseBody",
                        json!({ "requestId": self.request_id.0 }),
                    )
                    .await?;
                let decoded: GetResponseBodyResult =
                    serde_json::from_value(result).map_err(|err| {
                        CoreError::new(CoreErrorKind::Internal).with_hint(err.to_string())
                    })?;
                if decoded.base64_encoded {
                    BASE64.decode(decoded.body.as_bytes()).map_err(|err| {
                        CoreError::new(CoreErrorKind::Internal)
                            .with_hint(format!("response body decode: {err}"))
                    })
                } else {
                    Ok(decoded.body.into_bytes())
                }
            })
            .await
            .clone()
    }

    /// Convenience UTF-8 view of [`body`](Self::body).
    pub async fn text(&self) -> Result<String, CoreError> {
        let bytes = self.body().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl fmt::Debug for ResponseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseRecord")
            .field("request_id", &self.request_id.0)
            .field("url", &self.url)
            .field("status", &self.status)
            .field("mime_type", &self.mime_type)
            .finish()
    }
}
