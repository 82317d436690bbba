//! Network coordination layer.
//!
//! Reconstructs logical HTTP exchanges (request, optional redirect chain,
//! response, lazily fetched body) from the raw protocol events of the
//! network, interception, and extra-info channels, which may arrive
//! interleaved and out of order relative to each other. Consumers subscribe
//! to the typed [`NetworkEvent`] bus and interact with
//! [`RequestRecord`]/[`ResponseRecord`] values.

mod coordinator;
mod ledger;
mod rendezvous;
mod request;
mod response;

use std::sync::Arc;

pub use coordinator::{Credentials, NetworkConditions, NetworkCoordinator, RequestHook};
pub use rendezvous::Rendezvous;
pub use request::{
    AbortReason, ContinueOverrides, InterceptAction, InterceptHandler, MockResponse, RequestRecord,
};
pub use response::ResponseRecord;

/// Events emitted by [`NetworkCoordinator`], in the order the underlying
/// exchange progressed.
#[derive(Clone, Debug)]
pub enum NetworkEvent {
    Request(Arc<RequestRecord>),
    RequestServedFromCache(Arc<RequestRecord>),
    Response(Arc<ResponseRecord>),
    RequestFinished(Arc<RequestRecord>),
    RequestFailed(Arc<RequestRecord>),
}

/// Interception never reaches data URLs; they are surfaced but cannot be
/// paused at the transport level.
pub(crate) fn is_data_url(raw: &str) -> bool {
    url::Url::parse(raw)
        .map(|parsed| parsed.scheme() == "data")
        .unwrap_or_else(|_| raw.starts_with("data:"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_detection() {
        assert!(is_data_url("data:text/plain,hello"));
        assert!(!is_data_url("https://example.test/data:"));
        assert!(!is_data_url("http://a.test/"));
    }
}
