//! Arena-style event tables owned by the coordinator.
//!
//! Every table is keyed by the network request id and has an explicit
//! insert/remove contract, so each protocol handler reads as
//! "current state + event → new state + emitted events". The
//! will-be-sent/paused race goes through the generic [`Rendezvous`]; the
//! extra-info stream needs per-hop multiplicity (one extra-info per redirect
//! hop), so it is a queue table rather than a 1:1 rendezvous.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use cdp_channel::protocol::{
    LoadingFailedParams, LoadingFinishedParams, RequestPausedParams, RequestWillBeSentParams,
    ResponseReceivedExtraInfoParams, ResponseReceivedParams,
};
use wheelhouse_core_types::RequestId;

use crate::rendezvous::Rendezvous;
use crate::request::RequestRecord;

/// A redirect hop that arrived before the extra-info event it must pair
/// with; replayed once the extra-info shows up.
pub(crate) struct QueuedRedirect {
    pub event: RequestWillBeSentParams,
    pub paused: Option<RequestPausedParams>,
}

/// Response and terminal events held back until the expected extra-info
/// event arrives.
pub(crate) struct QueuedEventGroup {
    pub response: ResponseReceivedParams,
    pub finished: Option<LoadingFinishedParams>,
    pub failed: Option<LoadingFailedParams>,
}

pub(crate) enum PausedOutcome {
    /// Both halves present; construct the record now.
    Matched(RequestWillBeSentParams, RequestPausedParams),
    /// The will-be-sent half has not arrived yet.
    Stashed,
}

#[derive(Default)]
pub(crate) struct EventLedger {
    race: Rendezvous<RequestId, RequestWillBeSentParams, RequestPausedParams>,
    extra_info: HashMap<RequestId, VecDeque<ResponseReceivedExtraInfoParams>>,
    queued_redirects: HashMap<RequestId, VecDeque<QueuedRedirect>>,
    queued_groups: HashMap<RequestId, QueuedEventGroup>,
    records: HashMap<RequestId, Arc<RequestRecord>>,
}

impl EventLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer the informational half of the request race. Returns the
    /// completed pair when a paused event was already stashed.
    pub fn offer_will_be_sent(
        &mut self,
        event: RequestWillBeSentParams,
    ) -> Option<(RequestWillBeSentParams, RequestPausedParams)> {
        let key = RequestId(event.request_id.clone());
        self.race.offer_left(key, event)
    }

    /// Offer the interception half. A stashed will-be-sent whose URL or
    /// method no longer matches belongs to a superseded redirect hop and is
    /// dropped rather than paired.
    pub fn offer_paused(&mut self, network_id: RequestId, event: RequestPausedParams) -> PausedOutcome {
        if let Some(stashed) = self.race.peek_left(&network_id) {
            let stale = stashed.request.url != event.request.url
                || stashed.request.method != event.request.method;
            if stale {
                self.race.take_left(&network_id);
            }
        }
        match self.race.offer_right(network_id, event) {
            Some((will_be_sent, paused)) => PausedOutcome::Matched(will_be_sent, paused),
            None => PausedOutcome::Stashed,
        }
    }

    pub fn store_record(&mut self, record: Arc<RequestRecord>) {
        self.records.insert(record.id().clone(), record);
    }

    pub fn record(&self, id: &RequestId) -> Option<Arc<RequestRecord>> {
        self.records.get(id).cloned()
    }

    pub fn remove_record(&mut self, id: &RequestId) -> Option<Arc<RequestRecord>> {
        self.records.remove(id)
    }

    pub fn records_in_flight(&self) -> usize {
        self.records.len()
    }

    pub fn push_extra_info(&mut self, id: RequestId, event: ResponseReceivedExtraInfoParams) {
        self.extra_info.entry(id).or_default().push_back(event);
    }

    /// Pop the oldest unconsumed extra-info event for a request; redirect
    /// hops consume them in chronological order, one per hop.
    pub fn pop_extra_info(&mut self, id: &RequestId) -> Option<ResponseReceivedExtraInfoParams> {
        let queue = self.extra_info.get_mut(id)?;
        let event = queue.pop_front();
        if queue.is_empty() {
            self.extra_info.remove(id);
        }
        event
    }

    pub fn queue_redirect(&mut self, id: RequestId, redirect: QueuedRedirect) {
        self.queued_redirects.entry(id).or_default().push_back(redirect);
    }

    pub fn take_queued_redirect(&mut self, id: &RequestId) -> Option<QueuedRedirect> {
        let queue = self.queued_redirects.get_mut(id)?;
        let redirect = queue.pop_front();
        if queue.is_empty() {
            self.queued_redirects.remove(id);
        }
        redirect
    }

    pub fn queue_group(&mut self, id: RequestId, group: QueuedEventGroup) {
        self.queued_groups.insert(id, group);
    }

    pub fn group_mut(&mut self, id: &RequestId) -> Option<&mut QueuedEventGroup> {
        self.queued_groups.get_mut(id)
    }

    pub fn take_group(&mut self, id: &RequestId) -> Option<QueuedEventGroup> {
        self.queued_groups.remove(id)
    }

    /// Clear every stash for a request id. Called when a request reaches a
    /// terminal state; the record itself is removed separately so redirect
    /// continuations can keep the stashes alive.
    pub fn forget(&mut self, id: &RequestId) {
        self.race.forget(id);
        self.extra_info.remove(id);
        self.queued_redirects.remove(id);
        self.queued_groups.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn will_be_sent(id: &str, url: &str, method: &str) -> RequestWillBeSentParams {
        serde_json::from_value(json!({
            "requestId": id,
            "loaderId": "loader-1",
            "request": { "url": url, "method": method, "headers": {} },
        }))
        .expect("will-be-sent params")
    }

    fn paused(fetch_id: &str, network_id: &str, url: &str, method: &str) -> RequestPausedParams {
        serde_json::from_value(json!({
            "requestId": fetch_id,
            "networkId": network_id,
            "request": { "url": url, "method": method, "headers": {} },
        }))
        .expect("paused params")
    }

    #[test]
    fn either_arrival_order_matches_once() {
        let mut ledger = EventLedger::new();
        let key = RequestId("r-1".into());

        assert!(ledger
            .offer_will_be_sent(will_be_sent("r-1", "http://a.test/", "GET"))
            .is_none());
        match ledger.offer_paused(key.clone(), paused("int-1", "r-1", "http://a.test/", "GET")) {
            PausedOutcome::Matched(wbs, p) => {
                assert_eq!(wbs.request_id, "r-1");
                assert_eq!(p.request_id, "int-1");
            }
            PausedOutcome::Stashed => panic!("expected match"),
        }

        // reversed order for a second id
        let key2 = RequestId("r-2".into());
        assert!(matches!(
            ledger.offer_paused(key2, paused("int-2", "r-2", "http://b.test/", "GET")),
            PausedOutcome::Stashed
        ));
        let pair = ledger.offer_will_be_sent(will_be_sent("r-2", "http://b.test/", "GET"));
        assert!(pair.is_some());
    }

    #[test]
    fn stale_redirect_hop_is_dropped_not_paired() {
        let mut ledger = EventLedger::new();
        let key = RequestId("r-1".into());
        ledger.offer_will_be_sent(will_be_sent("r-1", "http://a.test/old", "GET"));

        // Paused for the *next* hop: URL differs, the stale stash must go.
        let outcome = ledger.offer_paused(key.clone(), paused("int-2", "r-1", "http://a.test/new", "GET"));
        assert!(matches!(outcome, PausedOutcome::Stashed));

        // The redirect's will-be-sent then pairs with the stashed pause.
        let pair = ledger.offer_will_be_sent(will_be_sent("r-1", "http://a.test/new", "GET"));
        assert!(pair.is_some());
    }

    #[test]
    fn extra_info_queue_is_fifo_per_id() {
        let mut ledger = EventLedger::new();
        let id = RequestId("r-9".into());
        for status in [301, 302] {
            let event: ResponseReceivedExtraInfoParams = serde_json::from_value(json!({
                "requestId": "r-9",
                "headers": {},
                "statusCode": status,
            }))
            .expect("extra info");
            ledger.push_extra_info(id.clone(), event);
        }
        assert_eq!(ledger.pop_extra_info(&id).expect("first").status_code, Some(301));
        assert_eq!(ledger.pop_extra_info(&id).expect("second").status_code, Some(302));
        assert!(ledger.pop_extra_info(&id).is_none());
    }

    #[test]
    fn forget_clears_stashes() {
        let mut ledger = EventLedger::new();
        let id = RequestId("r-3".into());
        ledger.offer_will_be_sent(will_be_sent("r-3", "http://a.test/", "GET"));
        ledger.push_extra_info(
            id.clone(),
            serde_json::from_value(json!({ "requestId": "r-3", "headers": {} })).expect("extra"),
        );
        ledger.forget(&id);
        assert!(ledger.pop_extra_info(&id).is_none());
        assert!(matches!(
            ledger.offer_paused(id, paused("int-3", "r-3", "http://a.test/", "GET")),
            PausedOutcome::Stashed
        ));
    }
}
