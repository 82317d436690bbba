//! Merges the informational network stream, the interception stream, and the
//! extra-info stream into one ordered request/response/failure event flow.
//!
//! The two protocol channels have no relative ordering guarantee, so the
//! coordinator never assumes one; whichever half of a correlation arrives
//! first is stashed and the record is only constructed when both halves are
//! present (while interception is active).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use cdp_channel::protocol::{
    AuthRequiredParams, LoadingFailedParams, LoadingFinishedParams, RequestPausedParams,
    RequestServedFromCacheParams, RequestWillBeSentParams, ResponseReceivedExtraInfoParams,
    ResponseReceivedParams, ResponsePayload,
};
use cdp_channel::{CdpChannel, ProtocolEvent};
use wheelhouse_core_types::{
    fold_headers, CoreError, CoreErrorKind, HeaderMap, InterceptionId, RequestId,
};
use wheelhouse_event_bus::Bus;

use crate::ledger::{EventLedger, PausedOutcome, QueuedEventGroup, QueuedRedirect};
use crate::request::RequestRecord;
use crate::response::ResponseRecord;
use crate::{is_data_url, NetworkEvent};

/// Credentials used to answer HTTP auth challenges.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Throughput/latency emulation parameters.
#[derive(Clone, Copy, Debug)]
pub struct NetworkConditions {
    pub download_throughput: f64,
    pub upload_throughput: f64,
    pub latency_ms: f64,
}

/// Hook invoked for every surfaced intercepted request before its
/// interception decisions are finalized. Hooks typically call
/// [`RequestRecord::enqueue_intercept_action`] or record a cooperative
/// continue/respond/abort.
pub type RequestHook = Arc<dyn Fn(&Arc<RequestRecord>) + Send + Sync>;

pub struct NetworkCoordinator {
    channel: Arc<dyn CdpChannel>,
    bus: Arc<Bus<NetworkEvent>>,
    ledger: Mutex<EventLedger>,
    ignore_certificate_errors: bool,
    user_interception: AtomicBool,
    interception_cache_safe: AtomicBool,
    protocol_interception: AtomicBool,
    user_cache_disabled: AtomicBool,
    credentials: Mutex<Option<Credentials>>,
    attempted_auth: Mutex<HashSet<InterceptionId>>,
    extra_headers: Mutex<HeaderMap>,
    offline: AtomicBool,
    conditions: Mutex<Option<NetworkConditions>>,
    request_hooks: Mutex<Vec<RequestHook>>,
}

impl NetworkCoordinator {
    pub fn new(channel: Arc<dyn CdpChannel>, ignore_certificate_errors: bool) -> Arc<Self> {
        Arc::new(Self {
            channel,
            bus: Bus::new(512),
            ledger: Mutex::new(EventLedger::new()),
            ignore_certificate_errors,
            user_interception: AtomicBool::new(false),
            interception_cache_safe: AtomicBool::new(false),
            protocol_interception: AtomicBool::new(false),
            user_cache_disabled: AtomicBool::new(false),
            credentials: Mutex::new(None),
            attempted_auth: Mutex::new(HashSet::new()),
            extra_headers: Mutex::new(HeaderMap::new()),
            offline: AtomicBool::new(false),
            conditions: Mutex::new(None),
            request_hooks: Mutex::new(Vec::new()),
        })
    }

    /// Enable the network domain. Failure here is fatal to the coordinator
    /// and is surfaced to the caller.
    pub async fn initialize(&self) -> Result<(), CoreError> {
        self.channel.send("Network.enable", json!({})).await?;
        if self.ignore_certificate_errors {
            self.channel
                .send(
                    "Security.setIgnoreCertificateErrors",
                    json!({ "ignore": true }),
                )
                .await?;
        }
        Ok(())
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<NetworkEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> Arc<Bus<NetworkEvent>> {
        Arc::clone(&self.bus)
    }

    /// Register a hook run for each surfaced intercepted request, in
    /// registration order, before interception decisions are finalized.
    pub fn add_request_hook(&self, hook: RequestHook) {
        self.request_hooks.lock().push(hook);
    }

    /// Requests observed but not yet finished or failed.
    pub fn requests_in_flight(&self) -> usize {
        self.ledger.lock().records_in_flight()
    }

    /// Toggle holding every request pending an explicit resolve action.
    /// Repeated calls with the same effective state are no-ops.
    pub async fn set_request_interception(
        &self,
        enabled: bool,
        cache_safe: bool,
    ) -> Result<(), CoreError> {
        self.user_interception.store(enabled, Ordering::Release);
        self.interception_cache_safe
            .store(cache_safe, Ordering::Release);
        self.update_protocol_interception().await
    }

    pub fn request_interception_enabled(&self) -> bool {
        self.user_interception.load(Ordering::Acquire)
    }

    /// Store credentials for HTTP auth challenges. Auth requires the fetch
    /// domain, so this flips protocol-level interception as a side effect.
    pub async fn authenticate(&self, credentials: Option<Credentials>) -> Result<(), CoreError> {
        *self.credentials.lock() = credentials;
        self.update_protocol_interception().await
    }

    pub async fn set_cache_enabled(&self, enabled: bool) -> Result<(), CoreError> {
        self.user_cache_disabled.store(!enabled, Ordering::Release);
        self.update_protocol_cache_disabled().await
    }

    /// Set headers attached to every outgoing request. Values must be ASCII;
    /// a non-ASCII value is a caller-contract violation.
    pub async fn set_extra_http_headers(&self, headers: HeaderMap) -> Result<(), CoreError> {
        for (name, value) in &headers {
            if !value.is_ascii() {
                return Err(CoreError::new(CoreErrorKind::InvalidHeader)
                    .with_hint(format!("non-ASCII value for header {name}")));
            }
        }
        let mut object = Map::new();
        for (name, value) in &headers {
            object.insert(name.clone(), Value::String(value.clone()));
        }
        *self.extra_headers.lock() = headers;
        self.channel
            .send("Network.setExtraHTTPHeaders", json!({ "headers": object }))
            .await?;
        Ok(())
    }

    pub async fn set_user_agent(&self, user_agent: &str) -> Result<(), CoreError> {
        self.channel
            .send(
                "Network.setUserAgentOverride",
                json!({ "userAgent": user_agent }),
            )
            .await?;
        Ok(())
    }

    pub async fn set_offline_mode(&self, offline: bool) -> Result<(), CoreError> {
        self.offline.store(offline, Ordering::Release);
        self.send_network_conditions().await
    }

    pub async fn emulate_network_conditions(
        &self,
        conditions: Option<NetworkConditions>,
    ) -> Result<(), CoreError> {
        *self.conditions.lock() = conditions;
        self.send_network_conditions().await
    }

    async fn send_network_conditions(&self) -> Result<(), CoreError> {
        let conditions = *self.conditions.lock();
        let offline = self.offline.load(Ordering::Acquire);
        let params = json!({
            "offline": offline,
            "latency": conditions.map(|c| c.latency_ms).unwrap_or(0.0),
            "downloadThroughput": conditions.map(|c| c.download_throughput).unwrap_or(-1.0),
            "uploadThroughput": conditions.map(|c| c.upload_throughput).unwrap_or(-1.0),
        });
        self.channel
            .send("Network.emulateNetworkConditions", params)
            .await?;
        Ok(())
    }

    async fn update_protocol_interception(&self) -> Result<(), CoreError> {
        let enabled =
            self.user_interception.load(Ordering::Acquire) || self.credentials.lock().is_some();
        if enabled == self.protocol_interception.load(Ordering::Acquire) {
            return Ok(());
        }
        self.protocol_interception.store(enabled, Ordering::Release);
        self.update_protocol_cache_disabled().await?;
        if enabled {
            self.channel
                .send(
                    "Fetch.enable",
                    json!({
                        "handleAuthRequests": true,
                        "patterns": [{ "urlPattern": "*" }],
                    }),
                )
                .await?;
        } else {
            self.channel.send("Fetch.disable", json!({})).await?;
        }
        Ok(())
    }

    async fn update_protocol_cache_disabled(&self) -> Result<(), CoreError> {
        // Interception that is not cache-safe must bypass the cache so an
        // intercepted response is never served stale around the interceptor.
        let interception_bypass = self.protocol_interception.load(Ordering::Acquire)
            && !self.interception_cache_safe.load(Ordering::Acquire);
        let cache_disabled = self.user_cache_disabled.load(Ordering::Acquire) || interception_bypass;
        self.channel
            .send(
                "Network.setCacheDisabled",
                json!({ "cacheDisabled": cache_disabled }),
            )
            .await?;
        Ok(())
    }

    /// Route one decoded protocol event. Events from other domains are
    /// ignored.
    pub async fn handle_event(&self, event: &ProtocolEvent) -> Result<(), CoreError> {
        match event.method.as_str() {
            "Network.requestWillBeSent" => {
                let params = decode::<RequestWillBeSentParams>(&event.params)?;
                self.on_request_will_be_sent(params).await
            }
            "Network.requestServedFromCache" => {
                let params = decode::<RequestServedFromCacheParams>(&event.params)?;
                self.on_request_served_from_cache(params);
                Ok(())
            }
            "Network.responseReceived" => {
                let params = decode::<ResponseReceivedParams>(&event.params)?;
                self.on_response_received(params);
                Ok(())
            }
            "Network.responseReceivedExtraInfo" => {
                let params = decode::<ResponseReceivedExtraInfoParams>(&event.params)?;
                self.on_response_received_extra_info(params).await
            }
            "Network.loadingFinished" => {
                let params = decode::<LoadingFinishedParams>(&event.params)?;
                self.on_loading_finished(params);
                Ok(())
            }
            "Network.loadingFailed" => {
                let params = decode::<LoadingFailedParams>(&event.params)?;
                self.on_loading_failed(params);
                Ok(())
            }
            "Fetch.requestPaused" => {
                let params = decode::<RequestPausedParams>(&event.params)?;
                self.on_request_paused(params).await
            }
            "Fetch.authRequired" => {
                let params = decode::<AuthRequiredParams>(&event.params)?;
                self.on_auth_required(params).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_request_will_be_sent(
        &self,
        event: RequestWillBeSentParams,
    ) -> Result<(), CoreError> {
        let intercepting =
            self.user_interception.load(Ordering::Acquire) && !is_data_url(&event.request.url);
        if intercepting {
            // The paused event may already have arrived; otherwise stash and
            // wait for it. A record must not be constructed until both id
            // halves are available while interception is active.
            let matched = self.ledger.lock().offer_will_be_sent(event);
            if let Some((will_be_sent, paused)) = matched {
                return self.surface_request(will_be_sent, Some(paused)).await;
            }
            return Ok(());
        }
        self.surface_request(event, None).await
    }

    async fn on_request_paused(&self, event: RequestPausedParams) -> Result<(), CoreError> {
        // Interception enabled only for auth: keep the page loading without
        // surfacing the pause.
        if !self.user_interception.load(Ordering::Acquire)
            && self.protocol_interception.load(Ordering::Acquire)
        {
            self.send_swallowed(
                "Fetch.continueRequest",
                json!({ "requestId": event.request_id }),
            )
            .await;
            return Ok(());
        }

        let Some(network_id) = event.network_id.clone() else {
            debug!(
                target: "network-center",
                fetch_id = %event.request_id,
                "paused request without network id; leaving to interceptors"
            );
            return Ok(());
        };

        let outcome = self
            .ledger
            .lock()
            .offer_paused(RequestId(network_id), event);
        match outcome {
            PausedOutcome::Matched(will_be_sent, paused) => {
                self.surface_request(will_be_sent, Some(paused)).await
            }
            PausedOutcome::Stashed => Ok(()),
        }
    }

    /// Construct and emit the record for a request whose id halves are
    /// complete (or for which interception is off).
    async fn surface_request(
        &self,
        event: RequestWillBeSentParams,
        paused: Option<RequestPausedParams>,
    ) -> Result<(), CoreError> {
        let request_id = RequestId(event.request_id.clone());

        let mut chain = Arc::new(Mutex::new(Vec::new()));
        if let Some(redirect_response) = event.redirect_response.clone() {
            let mut extra_info = None;
            if event.redirect_has_extra_info {
                extra_info = self.ledger.lock().pop_extra_info(&request_id);
                if extra_info.is_none() {
                    // Can't report the redirect hop without its extra info;
                    // replay this event when it arrives.
                    self.ledger
                        .lock()
                        .queue_redirect(request_id, QueuedRedirect { event, paused });
                    return Ok(());
                }
            }
            // A missing record means we attached after the chain started.
            let previous = self.ledger.lock().record(&request_id);
            if let Some(previous) = previous {
                self.complete_redirect_hop(&previous, &redirect_response, extra_info.as_ref());
                chain = previous.shared_chain();
            }
        }

        let mut headers = fold_headers(&event.request.headers);
        if let Some(paused) = &paused {
            for (name, value) in fold_headers(&paused.request.headers) {
                headers.insert(name, value);
            }
        }
        let interception_id = paused.map(|p| InterceptionId(p.request_id));
        let allow_interception = self.user_interception.load(Ordering::Acquire);

        let record = RequestRecord::new(
            Arc::clone(&self.channel),
            &event,
            headers,
            interception_id,
            allow_interception,
            chain,
        );
        self.ledger.lock().store_record(Arc::clone(&record));
        self.bus.publish(NetworkEvent::Request(Arc::clone(&record)));

        if allow_interception && record.interception_id().is_some() {
            let hooks: Vec<RequestHook> = self.request_hooks.lock().clone();
            for hook in &hooks {
                hook(&record);
            }
            match record.finalize_interceptions().await {
                Ok(()) => {}
                Err(err) if err.kind == CoreErrorKind::InvalidHeader => return Err(err),
                Err(err) => {
                    warn!(
                        target: "network-center",
                        request_id = %record.id().0,
                        %err,
                        "interception finalization failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Freeze the superseded record into the redirect chain and report its
    /// (body-unavailable) response. Runs synchronously within the event that
    /// carried the redirect so the continuation sees the full chain.
    fn complete_redirect_hop(
        &self,
        previous: &Arc<RequestRecord>,
        redirect_response: &ResponsePayload,
        extra_info: Option<&ResponseReceivedExtraInfoParams>,
    ) {
        let response = ResponseRecord::new(
            Arc::clone(&self.channel),
            previous,
            redirect_response,
            extra_info,
        );
        response.resolve_body_unavailable("response body is unavailable for redirect responses");
        previous.set_response(Arc::clone(&response));
        previous.freeze_into_chain();
        self.forget_request(previous, false);
        self.bus.publish(NetworkEvent::Response(response));
        self.bus
            .publish(NetworkEvent::RequestFinished(Arc::clone(previous)));
    }

    fn on_request_served_from_cache(&self, event: RequestServedFromCacheParams) {
        let record = self.ledger.lock().record(&RequestId(event.request_id));
        if let Some(record) = record {
            record.mark_from_memory_cache();
            self.bus
                .publish(NetworkEvent::RequestServedFromCache(record));
        }
    }

    fn on_response_received(&self, event: ResponseReceivedParams) {
        let id = RequestId(event.request_id.clone());
        let record = self.ledger.lock().record(&id);
        let Some(record) = record else {
            return;
        };

        let mut extra_info = None;
        if !record.from_memory_cache() && event.has_extra_info {
            extra_info = self.ledger.lock().pop_extra_info(&id);
            if extra_info.is_none() {
                // Hold the response (and any terminal signal that follows)
                // until the extra-info event arrives.
                self.ledger.lock().queue_group(
                    id,
                    QueuedEventGroup {
                        response: event,
                        finished: None,
                        failed: None,
                    },
                );
                return;
            }
        }
        self.emit_response(event, extra_info);
    }

    fn emit_response(
        &self,
        event: ResponseReceivedParams,
        extra_info: Option<ResponseReceivedExtraInfoParams>,
    ) {
        let record = self.ledger.lock().record(&RequestId(event.request_id.clone()));
        let Some(record) = record else {
            return;
        };
        let response = ResponseRecord::new(
            Arc::clone(&self.channel),
            &record,
            &event.response,
            extra_info.as_ref(),
        );
        record.set_response(Arc::clone(&response));
        self.bus.publish(NetworkEvent::Response(response));
    }

    async fn on_response_received_extra_info(
        &self,
        event: ResponseReceivedExtraInfoParams,
    ) -> Result<(), CoreError> {
        let id = RequestId(event.request_id.clone());

        // A redirect hop may be waiting on exactly this event.
        let queued_redirect = self.ledger.lock().take_queued_redirect(&id);
        if let Some(redirect) = queued_redirect {
            self.ledger.lock().push_extra_info(id, event);
            return self.surface_request(redirect.event, redirect.paused).await;
        }

        // Response/terminal events may have been held back for this event.
        let group = self.ledger.lock().take_group(&id);
        if let Some(group) = group {
            self.emit_response(group.response, Some(event));
            if let Some(finished) = group.finished {
                self.emit_loading_finished(finished);
            }
            if let Some(failed) = group.failed {
                self.emit_loading_failed(failed);
            }
            return Ok(());
        }

        // Nothing to pair with yet; stash for a later consumer.
        self.ledger.lock().push_extra_info(id, event);
        Ok(())
    }

    fn on_loading_finished(&self, event: LoadingFinishedParams) {
        let id = RequestId(event.request_id.clone());
        // If the response is still waiting on its extra-info event, the
        // finish notification waits with it: finishing is gated on having
        // all expected metadata, not merely the transport-level signal.
        let mut ledger = self.ledger.lock();
        if let Some(group) = ledger.group_mut(&id) {
            group.finished = Some(event);
            return;
        }
        drop(ledger);
        self.emit_loading_finished(event);
    }

    fn emit_loading_finished(&self, event: LoadingFinishedParams) {
        let record = self.ledger.lock().record(&RequestId(event.request_id.clone()));
        let Some(record) = record else {
            return;
        };
        // Some loads (data URLs, cached 304s) never produce a response
        // event; there is no body to resolve in that case.
        if let Some(response) = record.response() {
            response.resolve_body_available();
        }
        self.forget_request(&record, true);
        self.bus.publish(NetworkEvent::RequestFinished(record));
    }

    fn on_loading_failed(&self, event: LoadingFailedParams) {
        let id = RequestId(event.request_id.clone());
        let mut ledger = self.ledger.lock();
        if let Some(group) = ledger.group_mut(&id) {
            group.failed = Some(event);
            return;
        }
        drop(ledger);
        self.emit_loading_failed(event);
    }

    fn emit_loading_failed(&self, event: LoadingFailedParams) {
        let record = self.ledger.lock().record(&RequestId(event.request_id.clone()));
        let Some(record) = record else {
            return;
        };
        record.set_failure(event.error_text.clone());
        if let Some(response) = record.response() {
            response.resolve_body_unavailable(format!("request failed: {}", event.error_text));
        }
        self.forget_request(&record, true);
        self.bus.publish(NetworkEvent::RequestFailed(record));
    }

    /// Drop the record from the live map and clear its auth marker; when
    /// `and_stashes` the event stashes go too (terminal states). Redirect
    /// freezes keep the stashes so the continuation can consume them.
    fn forget_request(&self, record: &Arc<RequestRecord>, and_stashes: bool) {
        let mut ledger = self.ledger.lock();
        ledger.remove_record(record.id());
        if and_stashes {
            ledger.forget(record.id());
        }
        drop(ledger);
        if let Some(interception_id) = record.interception_id() {
            self.attempted_auth.lock().remove(interception_id);
        }
    }

    async fn on_auth_required(&self, event: AuthRequiredParams) {
        let interception_id = InterceptionId(event.request_id.clone());
        let credentials = self.credentials.lock().clone();
        let response = {
            let mut attempted = self.attempted_auth.lock();
            if attempted.contains(&interception_id) {
                "CancelAuth"
            } else if credentials.is_some() {
                attempted.insert(interception_id.clone());
                "ProvideCredentials"
            } else {
                "Default"
            }
        };

        let mut challenge_response = json!({ "response": response });
        if response == "ProvideCredentials" {
            if let Some(credentials) = &credentials {
                challenge_response["username"] = json!(credentials.username);
                challenge_response["password"] = json!(credentials.password);
            }
        }
        self.send_swallowed(
            "Fetch.continueWithAuth",
            json!({
                "requestId": event.request_id,
                "authChallengeResponse": challenge_response,
            }),
        )
        .await;
    }

    /// Commands whose failure only means the page raced away; logged, never
    /// surfaced.
    async fn send_swallowed(&self, method: &str, params: Value) {
        if let Err(err) = self.channel.send(method, params).await {
            debug!(target: "network-center", method, %err, "command failed; ignoring");
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, CoreError> {
    serde_json::from_value(params.clone())
        .map_err(|err| CoreError::new(CoreErrorKind::Internal).with_hint(err.to_string()))
}
