//! Transport configuration.

use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use url::Url;

use crate::{DEFAULT_TIMESTAMP_PARAM, header_map::HeaderMap};

static NEXT_STAMP: AtomicU64 = AtomicU64::new(0);

/// Options for a [`PollingTransport`](crate::transport::PollingTransport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Base URI for every request.
    pub endpoint: Url,

    /// Extra query pairs, appended in order.
    pub query: Vec<(String, String)>,

    /// Headers placed in every outgoing map before the `requestHeaders`
    /// listener runs.
    pub extra_headers: HeaderMap,

    /// Whether each request URI carries a unique cache-busting value.
    pub timestamp_requests: bool,

    /// Query parameter name for the cache-busting value.
    pub timestamp_param: String,
}

impl TransportOptions {
    /// Options targeting `endpoint`, with nothing else set.
    #[must_use]
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            query: Vec::new(),
            extra_headers: HeaderMap::new(),
            timestamp_requests: false,
            timestamp_param: DEFAULT_TIMESTAMP_PARAM.to_string(),
        }
    }

    /// Append a query pair.
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Add a default header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name, value);
        self
    }

    /// Enable or disable cache-busting timestamps.
    #[must_use]
    pub const fn with_timestamp_requests(mut self, enabled: bool) -> Self {
        self.timestamp_requests = enabled;
        self
    }

    /// Set the cache-busting parameter name.
    #[must_use]
    pub fn with_timestamp_param(mut self, name: impl Into<String>) -> Self {
        self.timestamp_param = name.into();
        self
    }

    /// The URI for the next request.
    #[must_use]
    pub fn request_uri(&self) -> String {
        let mut url = self.endpoint.clone();
        if !self.query.is_empty() || self.timestamp_requests {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &self.query {
                pairs.append_pair(name, value);
            }
            if self.timestamp_requests {
                pairs.append_pair(&self.timestamp_param, &stamp());
            }
        }
        url.into()
    }
}

/// Milliseconds since the epoch plus a process-wide counter, so that two
/// requests in the same millisecond still differ.
fn stamp() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    let seq = NEXT_STAMP.fetch_add(1, Ordering::Relaxed);
    format!("{millis}-{seq}")
}
