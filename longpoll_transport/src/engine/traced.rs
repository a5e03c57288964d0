//! Request/response logging layered onto an engine.
//!
//! Wrap the engine once when it is built and share the result; wrapping per
//! transport would log every exchange once per transport ever created.

use std::time::Instant;

use futures::{FutureExt, future::BoxFuture};

use super::{HttpEngine, HttpRequest, HttpResponse};

/// An [`HttpEngine`] that logs every request and its response.
#[derive(Debug, Clone)]
pub struct Traced<E> {
    inner: E,
}

impl<E> Traced<E> {
    /// Wrap `inner`.
    #[must_use]
    pub const fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<E: HttpEngine> HttpEngine for Traced<E> {
    type Error = E::Error;

    fn execute(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse, Self::Error>> {
        let method = request.method;
        let url = request.url.clone();
        tracing::info!(%method, %url, headers = ?request.headers, "sending request");

        let started = Instant::now();
        let fut = self.inner.execute(request);

        async move {
            let result = fut.await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;
            match &result {
                Ok(resp) => tracing::info!(
                    %url,
                    status = resp.status,
                    elapsed_ms,
                    headers = ?resp.headers,
                    "received response"
                ),
                Err(e) => tracing::warn!(%url, elapsed_ms, "request failed: {e}"),
            }
            result
        }
        .boxed()
    }
}
