//! Test doubles for the engine and listener seams.

use alloc::{
    boxed::Box,
    collections::VecDeque,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::{FutureExt, channel::oneshot, future::BoxFuture};
use thiserror::Error;

use crate::{
    dispatcher::EventDispatcher,
    engine::{HttpEngine, HttpRequest, HttpResponse, ResponseBody},
    error::{ErrorKind, RequestError, TransportError},
    header_map::HeaderMap,
    payload::Payload,
    request::RequestListener,
    transport::TransportListener,
};

/// Error returned by [`MockEngine`] for scripted network failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("mock network failure: {0}")]
pub struct MockEngineError(pub String);

enum Script {
    Respond {
        status: u16,
        headers: Vec<(String, String)>,
        body: Result<Vec<u8>, String>,
    },
    Network(String),
    Held {
        gate: oneshot::Receiver<()>,
        then: Box<Script>,
    },
}

impl Script {
    fn resolve(self) -> BoxFuture<'static, Result<HttpResponse, MockEngineError>> {
        match self {
            Script::Respond {
                status,
                headers,
                body,
            } => {
                let body = match body {
                    Ok(bytes) => ResponseBody::from_bytes(bytes),
                    Err(msg) => ResponseBody::failing(std::io::Error::other(msg)),
                };
                futures::future::ready(Ok(HttpResponse {
                    status,
                    headers,
                    body,
                }))
                .boxed()
            }
            Script::Network(msg) => futures::future::ready(Err(MockEngineError(msg))).boxed(),
            Script::Held { gate, then } => async move {
                if gate.await.is_err() {
                    // Gate dropped: the call never completes.
                    futures::future::pending::<()>().await;
                }
                then.resolve().await
            }
            .boxed(),
        }
    }
}

#[derive(Default)]
struct MockState {
    script: VecDeque<Script>,
    requests: Vec<HttpRequest>,
}

/// A scripted [`HttpEngine`].
///
/// Each call consumes the next scripted outcome, in order. A call with
/// nothing scripted fails as a network error. Clones share the script and
/// the request log.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

impl core::fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockEngine")
            .field("scripted", &state.script.len())
            .field("requests", &state.requests.len())
            .finish()
    }
}

/// Releases a response scripted with [`MockEngine::hold_text`].
#[derive(Debug)]
pub struct Release(oneshot::Sender<()>);

impl Release {
    /// Let the held response complete.
    pub fn release(self) {
        let _ = self.0.send(());
    }
}

impl MockEngine {
    /// An engine with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a response with explicit headers.
    pub fn respond(&self, status: u16, headers: &[(&str, &str)], body: impl Into<Vec<u8>>) {
        self.push(Script::Respond {
            status,
            headers: owned(headers),
            body: Ok(body.into()),
        });
    }

    /// Script a response with a text body.
    pub fn respond_text(&self, status: u16, content_type: &str, body: &str) {
        self.respond(status, &[("Content-Type", content_type)], body.as_bytes());
    }

    /// Script a response with a raw body.
    pub fn respond_bytes(&self, status: u16, content_type: &str, body: Vec<u8>) {
        self.respond(status, &[("Content-Type", content_type)], body);
    }

    /// Script a response whose body read fails.
    pub fn fail_body(&self, status: u16, content_type: &str, msg: &str) {
        self.push(Script::Respond {
            status,
            headers: owned(&[("Content-Type", content_type)]),
            body: Err(msg.to_string()),
        });
    }

    /// Script a failure to obtain any response.
    pub fn fail_network(&self, msg: &str) {
        self.push(Script::Network(msg.to_string()));
    }

    /// Script a text response that completes only once released.
    ///
    /// Dropping the returned [`Release`] leaves the call pending forever.
    #[must_use]
    pub fn hold_text(&self, status: u16, content_type: &str, body: &str) -> Release {
        let (tx, gate) = oneshot::channel();
        self.push(Script::Held {
            gate,
            then: Box::new(Script::Respond {
                status,
                headers: owned(&[("Content-Type", content_type)]),
                body: Ok(body.as_bytes().to_vec()),
            }),
        });
        Release(tx)
    }

    /// Every request executed so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.lock().requests.clone()
    }

    fn push(&self, script: Script) {
        self.lock().script.push_back(script);
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HttpEngine for MockEngine {
    type Error = MockEngineError;

    fn execute(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse, Self::Error>> {
        let next = {
            let mut state = self.lock();
            state.requests.push(request);
            state.script.pop_front()
        };
        next.unwrap_or_else(|| Script::Network("nothing scripted".into()))
            .resolve()
    }
}

fn owned(headers: &[(&str, &str)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// An event observed by a [`RecordingListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `requestHeaders`.
    RequestHeaders,

    /// `responseHeaders`, lowercased names in key order.
    ResponseHeaders(Vec<(String, String)>),

    /// `data`.
    Data(Payload),

    /// `success`.
    Success,

    /// `error`.
    Error {
        /// The failure kind.
        kind: ErrorKind,

        /// [`RequestError::detail`].
        detail: String,
    },

    /// A transport-level poll error, by kind.
    PollError(ErrorKind),

    /// A transport-level write error, by kind.
    WriteError(ErrorKind),
}

impl Event {
    fn from_error(err: &RequestError) -> Self {
        Event::Error {
            kind: err.kind(),
            detail: err.detail(),
        }
    }
}

/// A listener that records every event in arrival order.
///
/// Works as both a [`RequestListener`] and a [`TransportListener`].
#[derive(Debug)]
pub struct RecordingListener {
    dispatcher: Option<EventDispatcher>,
    injected: Mutex<Vec<(String, String)>>,
    log: Mutex<Vec<(Event, bool)>>,
    terminal_tx: async_channel::Sender<()>,
    terminal_rx: async_channel::Receiver<()>,
    settled_tx: async_channel::Sender<()>,
    settled_rx: async_channel::Receiver<()>,
}

impl Default for RecordingListener {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingListener {
    /// A listener that does not track which thread events arrive on.
    #[must_use]
    pub fn new() -> Self {
        let (terminal_tx, terminal_rx) = async_channel::unbounded();
        let (settled_tx, settled_rx) = async_channel::unbounded();
        Self {
            dispatcher: None,
            injected: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            terminal_tx,
            terminal_rx,
            settled_tx,
            settled_rx,
        }
    }

    /// A listener that records whether each event ran on `dispatcher`'s
    /// event thread.
    #[must_use]
    pub fn on(dispatcher: &EventDispatcher) -> Self {
        Self {
            dispatcher: Some(dispatcher.clone()),
            ..Self::new()
        }
    }

    /// Add a header during every `requestHeaders` event.
    pub fn inject_header(&self, name: &str, value: &str) {
        lock(&self.injected).push((name.to_string(), value.to_string()));
    }

    /// Every event so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        lock(&self.log).iter().map(|(e, _)| e.clone()).collect()
    }

    /// For each event so far, whether it ran on the event thread.
    #[must_use]
    pub fn event_thread_flags(&self) -> Vec<bool> {
        lock(&self.log).iter().map(|(_, on)| *on).collect()
    }

    /// The payloads of every `data` event so far.
    #[must_use]
    pub fn data(&self) -> Vec<Payload> {
        lock(&self.log)
            .iter()
            .filter_map(|(e, _)| match e {
                Event::Data(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// The kinds of every `error` event so far.
    #[must_use]
    pub fn error_kinds(&self) -> Vec<ErrorKind> {
        lock(&self.log)
            .iter()
            .filter_map(|(e, _)| match e {
                Event::Error { kind, .. } | Event::PollError(kind) | Event::WriteError(kind) => {
                    Some(*kind)
                }
                _ => None,
            })
            .collect()
    }

    /// Wait for the next terminal event not yet waited for.
    ///
    /// As a [`RequestListener`] that is `success` or `error`; as a
    /// [`TransportListener`] it is `data` or a poll error, which end a poll.
    pub async fn wait_for_terminal(&self) {
        let _ = self.terminal_rx.recv().await;
    }

    /// Wait for the next `on_settled` call not yet waited for.
    pub async fn wait_for_settled(&self) {
        let _ = self.settled_rx.recv().await;
    }

    /// How many `on_settled` calls have not been waited for.
    #[must_use]
    pub fn unclaimed_settles(&self) -> usize {
        self.settled_rx.len()
    }

    fn record(&self, event: Event, terminal: bool) {
        let on_event_thread = self.dispatcher.as_ref().is_some_and(EventDispatcher::is_current);
        lock(&self.log).push((event, on_event_thread));
        if terminal {
            let _ = self.terminal_tx.try_send(());
        }
    }

    fn inject(&self, headers: &mut HeaderMap) {
        for (name, value) in lock(&self.injected).iter() {
            headers.insert(name, value);
        }
    }
}

impl RequestListener for RecordingListener {
    fn on_request_headers(&self, headers: &mut HeaderMap) {
        self.inject(headers);
        self.record(Event::RequestHeaders, false);
    }

    fn on_response_headers(&self, headers: &HeaderMap) {
        self.record(Event::ResponseHeaders(snapshot(headers)), false);
    }

    fn on_data(&self, data: Payload) {
        self.record(Event::Data(data), false);
    }

    fn on_success(&self) {
        self.record(Event::Success, true);
    }

    fn on_error(&self, error: RequestError) {
        self.record(Event::from_error(&error), true);
    }

    fn on_settled(&self) {
        let _ = self.settled_tx.try_send(());
    }
}

impl TransportListener for RecordingListener {
    fn on_request_headers(&self, headers: &mut HeaderMap) {
        self.inject(headers);
        self.record(Event::RequestHeaders, false);
    }

    fn on_response_headers(&self, headers: &HeaderMap) {
        self.record(Event::ResponseHeaders(snapshot(headers)), false);
    }

    fn on_data(&self, data: Payload) {
        self.record(Event::Data(data), true);
    }

    fn on_error(&self, error: TransportError) {
        let event = match &error {
            TransportError::Poll(e) => Event::PollError(e.kind()),
            TransportError::Write(e) => Event::WriteError(e.kind()),
        };
        // A write error does not end a poll.
        let terminal = matches!(error, TransportError::Poll(_));
        self.record(event, terminal);
    }
}

fn snapshot(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
