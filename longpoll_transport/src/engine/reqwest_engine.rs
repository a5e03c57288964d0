//! [`reqwest`]-backed implementation of [`HttpEngine`].

use alloc::{
    boxed::Box,
    string::{String, ToString},
    vec::Vec,
};
use core::time::Duration;

use futures::{FutureExt, future::BoxFuture};

use super::{HttpEngine, HttpMethod, HttpRequest, HttpResponse, ResponseBody};
use crate::error::BoxError;

/// Error type for the reqwest-based engine.
#[derive(Debug, thiserror::Error)]
#[error("HTTP request failed: {0}")]
pub struct ReqwestEngineError(#[from] reqwest::Error);

/// A [`reqwest`]-backed implementation of [`HttpEngine`].
#[derive(Debug, Clone)]
pub struct ReqwestEngine {
    inner: reqwest::Client,
}

impl ReqwestEngine {
    /// Create a new reqwest-backed engine with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: reqwest::Client::new(),
        }
    }

    /// Create a new reqwest-backed engine with a custom timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

impl Default for ReqwestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpEngine for ReqwestEngine {
    type Error = ReqwestEngineError;

    fn execute(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse, Self::Error>> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };

        let mut builder = self.inner.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        async move {
            let resp = builder.send().await?;
            let status = resp.status().as_u16();

            let headers: Vec<(String, String)> = resp
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();

            let body = ResponseBody::new(async move {
                resp.bytes()
                    .await
                    .map(|b| b.to_vec())
                    .map_err(|e| Box::new(e) as BoxError)
            });

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }
        .boxed()
    }
}
