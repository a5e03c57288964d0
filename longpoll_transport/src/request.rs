//! One HTTP round trip.
//!
//! A [`Request`] is a finite-state object that issues exactly one call to the
//! [`HttpEngine`] and emits exactly one terminal event sequence:
//!
//! ```text
//!            create()              response / failure
//!   Idle ───────────────► Sent ─────────────────────► CompletedSuccess ─┐
//!    │                     │                       └► CompletedError  ──┤
//!    │ abort()             │ abort()                                    ▼
//!    └─────────────────────┴──────────────────────────────────────► Cleaned
//! ```
//!
//! `requestHeaders` fires inline inside [`Request::create`]. Every other
//! event is queued on the [`EventDispatcher`]. A completion computes its
//! whole outcome first and then claims the request with an atomic
//! `Sent → Completed*` transition; [`Request::abort`] claims it with
//! `Sent → Cleaned`. Whichever claim wins decides what is observed, so a
//! completion racing an abort emits either everything or nothing.
//!
//! From the outside a request is `Sent` as soon as `create()` starts, but
//! the engine is only called once the `requestHeaders` listener has
//! returned. An abort that lands while the listener runs means the engine
//! is never called at all.

use alloc::{
    boxed::Box,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use core::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};
use std::{
    panic::{AssertUnwindSafe, catch_unwind, resume_unwind},
    sync::{Mutex, OnceLock, PoisonError},
};

use futures::{FutureExt, stream::AbortHandle};

use crate::{
    OCTET_STREAM,
    dispatcher::EventDispatcher,
    engine::{HttpEngine, HttpMethod, HttpRequest, HttpResponse},
    error::{CreateError, DecodeError, RequestError},
    header_map::HeaderMap,
    payload::Payload,
    spawn::Spawn,
};

const IDLE: u8 = 0;
const SENT: u8 = 1;
const COMPLETED_SUCCESS: u8 = 2;
const COMPLETED_ERROR: u8 = 3;
const CLEANED: u8 = 4;
/// `create()` is running the `requestHeaders` listener.
const BUILDING: u8 = 5;

/// Lifecycle state of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Constructed, not yet dispatched.
    Idle,

    /// The call has been handed to the engine.
    Sent,

    /// A response was obtained and its payload is being delivered.
    CompletedSuccess,

    /// The round trip failed and its error is being delivered.
    CompletedError,

    /// Terminal. The call handle has been released.
    Cleaned,
}

impl RequestState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            IDLE => RequestState::Idle,
            SENT | BUILDING => RequestState::Sent,
            COMPLETED_SUCCESS => RequestState::CompletedSuccess,
            COMPLETED_ERROR => RequestState::CompletedError,
            _ => RequestState::Cleaned,
        }
    }
}

/// Receives the lifecycle events of a [`Request`].
///
/// [`on_request_headers`](Self::on_request_headers) runs synchronously on
/// the thread that called [`Request::create`]. All other methods run on the
/// [`EventDispatcher`]'s event thread, never concurrently with each other.
pub trait RequestListener: Send + Sync + 'static {
    /// Inspect or modify the outgoing headers before the call is built.
    fn on_request_headers(&self, _headers: &mut HeaderMap) {}

    /// The response headers, delivered before `data` or `error`.
    fn on_response_headers(&self, _headers: &HeaderMap) {}

    /// The response payload. Always followed by [`on_success`](Self::on_success).
    fn on_data(&self, _data: Payload) {}

    /// The round trip succeeded.
    fn on_success(&self) {}

    /// The round trip failed.
    fn on_error(&self, _error: RequestError) {}

    /// The request reached its end: it completed, was aborted, or its
    /// `requestHeaders` listener panicked.
    ///
    /// Runs exactly once, inline on the thread that ended the request and
    /// after any terminal events were queued. It is not dispatched, so it
    /// runs even when the event loop has stopped.
    fn on_settled(&self) {}
}

/// What to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    /// The HTTP method.
    pub method: HttpMethod,

    /// The absolute target URI.
    pub uri: String,

    /// The binary payload. Sent only when non-empty.
    pub data: Option<Vec<u8>>,

    /// Headers placed in the outgoing map before the `requestHeaders`
    /// listener runs.
    pub headers: HeaderMap,
}

impl RequestOptions {
    /// A `GET` with no payload.
    #[must_use]
    pub fn poll(uri: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            uri: uri.into(),
            data: None,
            headers: HeaderMap::new(),
        }
    }

    /// A `POST` carrying `data`.
    #[must_use]
    pub fn write(uri: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            uri: uri.into(),
            data: Some(data),
            headers: HeaderMap::new(),
        }
    }

    /// Set the default headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

struct Inner<E, S> {
    method: HttpMethod,
    uri: String,
    data: Mutex<Option<Vec<u8>>>,
    default_headers: HeaderMap,

    engine: Arc<E>,
    spawner: S,
    dispatcher: EventDispatcher,
    listener: Arc<dyn RequestListener>,

    state: AtomicU8,

    /// Set once by `create()`; used only to cancel.
    call: OnceLock<AbortHandle>,
}

/// A single HTTP round trip.
///
/// Clones refer to the same round trip.
pub struct Request<E, S> {
    inner: Arc<Inner<E, S>>,
}

impl<E, S> Clone for Request<E, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E, S> fmt::Debug for Request<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.inner.method)
            .field("uri", &self.inner.uri)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<E, S> Request<E, S> {
    /// The HTTP method.
    #[must_use]
    pub fn method(&self) -> HttpMethod {
        self.inner.method
    }

    /// The target URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RequestState {
        RequestState::from_raw(self.inner.state.load(Ordering::Acquire))
    }

    /// Cancel the round trip.
    ///
    /// Callable in any state. Aborting an in-flight request cancels the call
    /// and guarantees that none of its remaining events are emitted.
    /// Aborting an `Idle` request makes a later [`create`](Self::create)
    /// fail. Otherwise this is a no-op; it never emits and never fails.
    pub fn abort(&self) {
        let prev = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                matches!(s, IDLE | BUILDING | SENT).then_some(CLEANED)
            });

        match prev {
            Ok(SENT) => {
                if let Some(call) = self.inner.call.get() {
                    call.abort();
                }
                tracing::debug!(uri = %self.inner.uri, "request aborted");
            }
            Ok(BUILDING) => tracing::debug!(uri = %self.inner.uri, "request aborted before send"),
            Ok(_) => tracing::debug!(uri = %self.inner.uri, "request aborted before create"),
            Err(_) => return,
        }
        self.inner.listener.on_settled();
    }
}

impl<E: HttpEngine, S: Spawn> Request<E, S> {
    /// Construct an `Idle` request.
    pub fn new(
        options: RequestOptions,
        engine: Arc<E>,
        spawner: S,
        dispatcher: EventDispatcher,
        listener: Arc<dyn RequestListener>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                method: options.method,
                uri: options.uri,
                data: Mutex::new(options.data),
                default_headers: options.headers,
                engine,
                spawner,
                dispatcher,
                listener,
                state: AtomicU8::new(IDLE),
                call: OnceLock::new(),
            }),
        }
    }

    /// Dispatch the round trip: `Idle → Sent`.
    ///
    /// The `requestHeaders` listener runs before this returns, on the
    /// calling thread; the headers it leaves in the map are sent.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError`] if the request is not `Idle`. No events are
    /// emitted in that case.
    pub fn create(&self) -> Result<(), CreateError> {
        let inner = &self.inner;
        if let Err(actual) =
            inner
                .state
                .compare_exchange(IDLE, BUILDING, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(if actual == CLEANED && inner.call.get().is_none() {
                CreateError::Aborted
            } else {
                CreateError::AlreadyCreated
            });
        }

        tracing::debug!(method = %inner.method, uri = %inner.uri, "request open");

        let mut headers = inner.default_headers.clone();
        let listener = &inner.listener;
        let built = catch_unwind(AssertUnwindSafe(|| listener.on_request_headers(&mut headers)));
        if let Err(panic) = built {
            if inner
                .state
                .compare_exchange(BUILDING, CLEANED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::error!(uri = %inner.uri, "requestHeaders listener panicked");
                listener.on_settled();
            }
            resume_unwind(panic);
        }

        if inner
            .state
            .compare_exchange(BUILDING, SENT, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(uri = %inner.uri, "aborted while building; not sent");
            return Ok(());
        }

        let body = inner
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .filter(|d| !d.is_empty());
        if body.is_some() {
            headers.insert("Content-Type", OCTET_STREAM);
        }

        tracing::debug!(
            uri = %inner.uri,
            body_len = body.as_ref().map_or(0, Vec::len),
            "sending request"
        );

        let request = HttpRequest {
            method: inner.method,
            url: inner.uri.clone(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body,
        };

        let response = inner.engine.execute(request);
        let this = self.clone();
        let call = inner.spawner.spawn(
            async move {
                let outcome = Outcome::settle(response.await).await;
                this.complete(outcome);
            }
            .boxed(),
        );

        if inner.call.set(call.clone()).is_err() {
            tracing::error!(uri = %inner.uri, "call handle already set");
        }

        // An abort that landed before the handle was stored could not cancel it.
        if inner.state.load(Ordering::Acquire) == CLEANED {
            call.abort();
        }

        Ok(())
    }

    fn complete(&self, outcome: Outcome) {
        let inner = &self.inner;
        let next = if outcome.is_success() {
            COMPLETED_SUCCESS
        } else {
            COMPLETED_ERROR
        };

        if inner
            .state
            .compare_exchange(SENT, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!(uri = %inner.uri, "completion after abort ignored");
            return;
        }

        let (headers, result) = match outcome {
            Outcome::NoResponse(err) => (None, Err(err)),
            Outcome::Responded { headers, result } => (Some(headers), result),
        };

        if let Some(headers) = headers {
            let listener = inner.listener.clone();
            inner
                .dispatcher
                .exec(move || listener.on_response_headers(&headers));
        }

        let listener = inner.listener.clone();
        match result {
            Ok(payload) => inner.dispatcher.exec(move || {
                listener.on_data(payload);
                listener.on_success();
            }),
            Err(err) => {
                tracing::debug!(uri = %inner.uri, "request failed: {err}");
                inner.dispatcher.exec(move || listener.on_error(err));
            }
        }

        inner.listener.on_settled();
        self.cleanup();
    }

    fn cleanup(&self) {
        self.inner.state.store(CLEANED, Ordering::Release);
        tracing::trace!(uri = %self.inner.uri, "request cleaned up");
    }
}

/// Everything a completion will emit, computed before the request is claimed.
enum Outcome {
    NoResponse(RequestError),
    Responded {
        headers: HeaderMap,
        result: Result<Payload, RequestError>,
    },
}

impl Outcome {
    async fn settle<F>(response: Result<HttpResponse, F>) -> Self
    where
        F: core::error::Error + Send + Sync + 'static,
    {
        let resp = match response {
            Ok(resp) => resp,
            Err(e) => return Outcome::NoResponse(RequestError::Network(Box::new(e))),
        };

        let headers: HeaderMap = resp.headers.iter().cloned().collect();

        if !resp.is_success() {
            return Outcome::Responded {
                headers,
                result: Err(RequestError::Status {
                    status: resp.status,
                }),
            };
        }

        let content_type = resp.content_type().map(str::to_string);
        let result = match resp.body.read().await {
            Ok(bytes) => Payload::decode(content_type.as_deref(), bytes).map_err(RequestError::from),
            Err(e) => Err(DecodeError::Body(e).into()),
        };

        Outcome::Responded { headers, result }
    }

    const fn is_success(&self) -> bool {
        matches!(self, Outcome::Responded { result: Ok(_), .. })
    }
}
