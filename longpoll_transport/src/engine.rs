//! HTTP engine seam.
//!
//! The transport never performs I/O itself. An [`HttpEngine`] executes a
//! plain-data [`HttpRequest`] and resolves to an [`HttpResponse`] whose body
//! is read lazily, so that body-read failures are distinguishable from
//! failures to obtain a response at all.
//!
//! Engines own pooling, TLS, DNS and timeouts. Cross-cutting concerns such
//! as request logging are layered on once, when the engine is built (see
//! [`Traced`]), and the engine is then shared by every transport through an
//! `Arc`.

#[cfg(feature = "reqwest")]
pub mod reqwest_engine;
pub mod traced;

use alloc::{string::String, vec::Vec};
use core::fmt;

use futures::{FutureExt, future::BoxFuture};

use crate::error::BoxError;

#[cfg(feature = "reqwest")]
pub use reqwest_engine::{ReqwestEngine, ReqwestEngineError};
pub use traced::Traced;

/// HTTP method of a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// A poll (read cycle).
    Get,

    /// A write (send cycle).
    Post,
}

impl HttpMethod {
    /// The method token, e.g. `"GET"`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing HTTP request described as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// The HTTP method.
    pub method: HttpMethod,

    /// The absolute target URL.
    pub url: String,

    /// Request headers, in the order they should be sent.
    pub headers: Vec<(String, String)>,

    /// The request body, if any.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Look up a request header by name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A response body that has not been read yet.
pub struct ResponseBody(BoxFuture<'static, Result<Vec<u8>, BoxError>>);

impl ResponseBody {
    /// Wrap a future that reads the body.
    pub fn new<F>(read: F) -> Self
    where
        F: Future<Output = Result<Vec<u8>, BoxError>> + Send + 'static,
    {
        Self(read.boxed())
    }

    /// A body whose bytes are already in memory.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self(futures::future::ready(Ok(bytes)).boxed())
    }

    /// A body whose read fails with `err`.
    pub fn failing(err: impl Into<BoxError>) -> Self {
        let err = err.into();
        Self(futures::future::ready(Err(err)).boxed())
    }

    /// Read the whole body.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the body could not be read.
    pub async fn read(self) -> Result<Vec<u8>, BoxError> {
        self.0.await
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseBody(..)")
    }
}

/// An HTTP response whose body has not been read yet.
#[derive(Debug)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status: u16,

    /// Response headers as received; duplicates are allowed.
    pub headers: Vec<(String, String)>,

    /// The unread body.
    pub body: ResponseBody,
}

impl HttpResponse {
    /// Look up a response header by name (case-insensitive).
    ///
    /// With duplicate headers the last one wins.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The `content-type` header, if present.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Whether the status code is in the 2xx range.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// A minimal asynchronous HTTP engine.
///
/// Implementations handle the mechanics of making HTTP requests while this
/// trait exposes only what the transport needs. The returned future is
/// `'static` so it can be handed to a [`Spawn`](crate::spawn::Spawn)er and
/// driven on the engine's own worker threads.
pub trait HttpEngine: Send + Sync + 'static {
    /// The error produced when no response could be obtained.
    type Error: core::error::Error + Send + Sync + 'static;

    /// Execute `request`, resolving once the response status and headers are
    /// available.
    fn execute(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse, Self::Error>>;
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(headers: &[(&str, &str)], status: u16) -> HttpResponse {
        HttpResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            body: ResponseBody::from_bytes(Vec::new()),
        }
    }

    #[test]
    fn response_header_lookup_is_case_insensitive() {
        let resp = response(&[("Content-Type", "text/plain")], 200);
        assert_eq!(resp.content_type(), Some("text/plain"));
        assert_eq!(resp.header("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn duplicate_response_headers_last_wins() {
        let resp = response(&[("x-a", "1"), ("X-A", "2")], 200);
        assert_eq!(resp.header("x-a"), Some("2"));
    }

    #[test]
    fn success_range() {
        assert!(response(&[], 200).is_success());
        assert!(response(&[], 204).is_success());
        assert!(!response(&[], 199).is_success());
        assert!(!response(&[], 300).is_success());
        assert!(!response(&[], 500).is_success());
    }

    #[test]
    fn method_tokens() {
        assert_eq!(HttpMethod::Get.to_string(), "GET");
        assert_eq!(HttpMethod::Post.as_str(), "POST");
    }

    #[tokio::test]
    async fn failing_body_reports_error() {
        let body = ResponseBody::failing(std::io::Error::other("reset"));
        let err = body.read().await.expect_err("should fail");
        assert_eq!(err.to_string(), "reset");
    }

    #[test]
    fn request_header_lookup() {
        let req = HttpRequest {
            method: HttpMethod::Post,
            url: "http://localhost/".into(),
            headers: vec![("X-Test".into(), "1".into())],
            body: None,
        };
        assert_eq!(req.header("x-test"), Some("1"));
        assert_eq!(req.header("missing"), None);
    }
}
