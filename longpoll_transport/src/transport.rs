//! Poll and write cycles over [`Request`]s.
//!
//! A [`PollingTransport`] keeps at most one poll outstanding and any number
//! of writes. Each Request is given a small handler value that translates
//! its lifecycle events into transport-level ones:
//!
//! | Request event     | Poll                            | Write                          |
//! |-------------------|---------------------------------|--------------------------------|
//! | `requestHeaders`  | forwarded, inline               | forwarded, inline              |
//! | `responseHeaders` | forwarded                       | forwarded                      |
//! | `data`            | slot released, then forwarded   | ignored                        |
//! | `success`         | nothing                         | `on_complete` runs             |
//! | `error`           | slot released, `Poll` error     | `Write` error, `on_complete` dropped |
//! | settled           | slot released                   | write forgotten                |
//!
//! Settling happens inline when the request ends, after its events were
//! queued, so the bookkeeping is released even if those events are never
//! delivered. The transport never retries. What happens after an error is up to the
//! [`TransportListener`].

use alloc::{
    boxed::Box,
    collections::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{
    dispatcher::EventDispatcher,
    engine::HttpEngine,
    error::{PollError, RequestError, TransportError, WriteError},
    header_map::HeaderMap,
    options::TransportOptions,
    payload::Payload,
    request::{Request, RequestListener, RequestOptions},
    spawn::Spawn,
};

type OnComplete = Box<dyn FnOnce() + Send + 'static>;

/// Receives transport-level events.
///
/// [`on_request_headers`](Self::on_request_headers) runs inline on the
/// thread that called [`PollingTransport::poll`] or
/// [`PollingTransport::write`]. Everything else runs on the event thread.
pub trait TransportListener: Send + Sync + 'static {
    /// Inspect or modify the outgoing headers of any request.
    fn on_request_headers(&self, _headers: &mut HeaderMap) {}

    /// The response headers of any request.
    fn on_response_headers(&self, _headers: &HeaderMap) {}

    /// A poll delivered a payload. The poll slot is already free, so
    /// calling [`PollingTransport::poll`] from here is allowed.
    fn on_data(&self, _data: Payload) {}

    /// A poll or write failed.
    fn on_error(&self, _error: TransportError) {}
}

struct Inner<E, S> {
    options: TransportOptions,
    engine: Arc<E>,
    spawner: S,
    dispatcher: EventDispatcher,
    listener: Arc<dyn TransportListener>,

    next_id: AtomicU64,
    poll: Mutex<Option<(u64, Request<E, S>)>>,
    writes: Mutex<BTreeMap<u64, Request<E, S>>>,
    closed: AtomicBool,
}

impl<E, S> Inner<E, S> {
    fn poll_slot(&self) -> MutexGuard<'_, Option<(u64, Request<E, S>)>> {
        self.poll.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writes(&self) -> MutexGuard<'_, BTreeMap<u64, Request<E, S>>> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_poll(&self, id: u64) {
        let mut slot = self.poll_slot();
        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
            *slot = None;
        }
    }

    fn release_write(&self, id: u64) {
        self.writes().remove(&id);
    }
}

/// A long-polling transport.
///
/// Clones share the same poll slot, writes and listener.
pub struct PollingTransport<E, S> {
    inner: Arc<Inner<E, S>>,
}

impl<E, S> Clone for PollingTransport<E, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E, S> core::fmt::Debug for PollingTransport<E, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PollingTransport")
            .field("endpoint", &self.inner.options.endpoint.as_str())
            .field("polling", &self.is_polling())
            .field("pending_writes", &self.pending_writes())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<E, S> PollingTransport<E, S> {
    /// Whether a poll is outstanding.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.inner.poll_slot().is_some()
    }

    /// The number of outstanding writes.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.inner.writes().len()
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The transport's options.
    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.inner.options
    }

    /// Abort the outstanding poll and every outstanding write.
    ///
    /// Aborted requests emit nothing and pending `on_complete` callbacks are
    /// dropped unrun. Later polls and writes fail with `Closed`. Idempotent.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let poll = inner.poll_slot().take();
        let writes: Vec<_> = core::mem::take(&mut *inner.writes()).into_values().collect();

        tracing::debug!(
            endpoint = %inner.options.endpoint,
            polling = poll.is_some(),
            writes = writes.len(),
            "closing transport"
        );

        if let Some((_, request)) = poll {
            request.abort();
        }
        for request in writes {
            request.abort();
        }
    }
}

impl<E, S> PollingTransport<E, S>
where
    E: HttpEngine,
    S: Spawn + Clone,
{
    /// Create a transport.
    ///
    /// `engine` is shared; wrap it in [`Traced`](crate::engine::Traced)
    /// once, before handing it to any transport, to log its traffic.
    pub fn new(
        options: TransportOptions,
        engine: Arc<E>,
        spawner: S,
        dispatcher: EventDispatcher,
        listener: Arc<dyn TransportListener>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                engine,
                spawner,
                dispatcher,
                listener,
                next_id: AtomicU64::new(0),
                poll: Mutex::new(None),
                writes: Mutex::new(BTreeMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Start a poll: a `GET` with no payload.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::InFlight`] if a poll is already outstanding and
    /// [`PollError::Closed`] after [`close`](Self::close). Nothing is sent
    /// in either case.
    pub fn poll(&self) -> Result<(), PollError> {
        let inner = &self.inner;
        let request = {
            let mut slot = inner.poll_slot();
            if inner.closed.load(Ordering::Acquire) {
                return Err(PollError::Closed);
            }
            if slot.is_some() {
                return Err(PollError::InFlight);
            }

            let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
            let handler = PollHandler {
                id,
                transport: Arc::downgrade(inner),
                listener: inner.listener.clone(),
            };
            let request = self.request(RequestOptions::poll(inner.options.request_uri()), handler);
            *slot = Some((id, request.clone()));
            request
        };

        tracing::debug!(uri = request.uri(), "poll");

        // A fresh request only fails to create if a concurrent close aborted it.
        request.create().map_err(|_| PollError::Closed)
    }

    /// Start a write: a `POST` carrying `data`.
    ///
    /// `on_complete` runs on the event thread once the server accepted the
    /// write. If the write fails it is dropped unrun and the listener gets a
    /// [`TransportError::Write`].
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Closed`] after [`close`](Self::close).
    pub fn write(
        &self,
        data: Vec<u8>,
        on_complete: impl FnOnce() + Send + 'static,
    ) -> Result<(), WriteError> {
        let inner = &self.inner;
        let request = {
            let mut writes = inner.writes();
            if inner.closed.load(Ordering::Acquire) {
                return Err(WriteError::Closed);
            }

            let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
            let handler = WriteHandler {
                id,
                transport: Arc::downgrade(inner),
                listener: inner.listener.clone(),
                on_complete: Mutex::new(Some(Box::new(on_complete))),
            };
            let request =
                self.request(RequestOptions::write(inner.options.request_uri(), data), handler);
            writes.insert(id, request.clone());
            request
        };

        tracing::debug!(uri = request.uri(), "write");

        request.create().map_err(|_| WriteError::Closed)
    }

    fn request(
        &self,
        options: RequestOptions,
        handler: impl RequestListener,
    ) -> Request<E, S> {
        let inner = &self.inner;
        Request::new(
            options.with_headers(inner.options.extra_headers.clone()),
            inner.engine.clone(),
            inner.spawner.clone(),
            inner.dispatcher.clone(),
            Arc::new(handler),
        )
    }
}

/// Translates the events of a poll [`Request`].
struct PollHandler<E, S> {
    id: u64,
    transport: Weak<Inner<E, S>>,
    listener: Arc<dyn TransportListener>,
}

impl<E, S> PollHandler<E, S> {
    fn release(&self) {
        if let Some(transport) = self.transport.upgrade() {
            transport.release_poll(self.id);
        }
    }
}

impl<E, S> RequestListener for PollHandler<E, S>
where
    E: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    fn on_request_headers(&self, headers: &mut HeaderMap) {
        self.listener.on_request_headers(headers);
    }

    fn on_response_headers(&self, headers: &HeaderMap) {
        self.listener.on_response_headers(headers);
    }

    fn on_data(&self, data: Payload) {
        self.release();
        self.listener.on_data(data);
    }

    fn on_error(&self, error: RequestError) {
        self.release();
        tracing::debug!("poll failed: {error}");
        self.listener.on_error(TransportError::Poll(error));
    }

    fn on_settled(&self) {
        self.release();
    }
}

/// Translates the events of a write [`Request`].
struct WriteHandler<E, S> {
    id: u64,
    transport: Weak<Inner<E, S>>,
    listener: Arc<dyn TransportListener>,
    on_complete: Mutex<Option<OnComplete>>,
}

impl<E, S> WriteHandler<E, S> {
    fn release(&self) {
        if let Some(transport) = self.transport.upgrade() {
            transport.release_write(self.id);
        }
    }

    fn take_on_complete(&self) -> Option<OnComplete> {
        self.on_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<E, S> RequestListener for WriteHandler<E, S>
where
    E: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    fn on_request_headers(&self, headers: &mut HeaderMap) {
        self.listener.on_request_headers(headers);
    }

    fn on_response_headers(&self, headers: &HeaderMap) {
        self.listener.on_response_headers(headers);
    }

    fn on_success(&self) {
        self.release();
        if let Some(on_complete) = self.take_on_complete() {
            on_complete();
        }
    }

    fn on_error(&self, error: RequestError) {
        self.release();
        drop(self.take_on_complete());
        tracing::debug!("write failed: {error}");
        self.listener.on_error(TransportError::Write(error));
    }

    fn on_settled(&self) {
        self.release();
    }
}

#[cfg(all(test, feature = "tokio"))]
mod tests {
    use super::*;
    use crate::{
        OCTET_STREAM,
        engine::HttpMethod,
        error::ErrorKind,
        spawn::TokioSpawn,
        test_utils::{Event, MockEngine, RecordingListener},
    };
    use std::sync::OnceLock;
    use testresult::TestResult;
    use url::Url;

    type Transport = PollingTransport<MockEngine, TokioSpawn>;

    #[allow(clippy::unwrap_used)]
    fn options() -> TransportOptions {
        TransportOptions::new(Url::parse("http://localhost/lp").unwrap())
    }

    fn setup_with(
        options: TransportOptions,
    ) -> (Transport, MockEngine, EventDispatcher, Arc<RecordingListener>) {
        let (dispatcher, run) = EventDispatcher::new();
        tokio::spawn(run);
        let engine = MockEngine::new();
        let listener = Arc::new(RecordingListener::on(&dispatcher));
        let transport = PollingTransport::new(
            options,
            Arc::new(engine.clone()),
            TokioSpawn,
            dispatcher.clone(),
            listener.clone(),
        );
        (transport, engine, dispatcher, listener)
    }

    fn setup() -> (Transport, MockEngine, EventDispatcher, Arc<RecordingListener>) {
        setup_with(options())
    }

    #[tokio::test]
    async fn poll_delivers_text_payload() -> TestResult {
        let (transport, engine, _dispatcher, listener) = setup();
        engine.respond_text(200, "text/plain", "42");

        transport.poll()?;
        assert!(transport.is_polling());
        listener.wait_for_terminal().await;

        let events = listener.events();
        assert_eq!(events[0], Event::RequestHeaders);
        assert!(matches!(events[1], Event::ResponseHeaders(_)));
        assert_eq!(events[2], Event::Data(Payload::Text("42".into())));
        assert_eq!(events.len(), 3);
        assert!(!transport.is_polling());

        let sent = engine.requests();
        assert_eq!(sent[0].method, HttpMethod::Get);
        assert!(sent[0].body.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn second_poll_while_outstanding_is_rejected() -> TestResult {
        let (transport, engine, _dispatcher, _listener) = setup();
        let _held = engine.hold_text(200, "text/plain", "late");

        transport.poll()?;
        assert_eq!(transport.poll(), Err(PollError::InFlight));
        assert_eq!(engine.requests().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn poll_status_error_surfaces_and_frees_slot() -> TestResult {
        let (transport, engine, _dispatcher, listener) = setup();
        engine.respond_text(500, "text/plain", "oops");

        transport.poll()?;
        listener.wait_for_terminal().await;

        assert_eq!(
            listener.events().last(),
            Some(&Event::PollError(ErrorKind::HttpStatus))
        );
        assert!(listener.data().is_empty());
        assert!(!transport.is_polling());
        Ok(())
    }

    #[tokio::test]
    async fn poll_network_error_is_not_retried() -> TestResult {
        let (transport, engine, dispatcher, listener) = setup();
        engine.fail_network("refused");

        transport.poll()?;
        listener.wait_for_terminal().await;
        dispatcher.flush().await;

        assert_eq!(listener.error_kinds(), vec![ErrorKind::NetworkFailure]);
        assert_eq!(engine.requests().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn binary_poll_payload_is_byte_exact() -> TestResult {
        let (transport, engine, _dispatcher, listener) = setup();
        engine.respond_bytes(200, OCTET_STREAM, vec![0x01, 0x02, 0xFF]);

        transport.poll()?;
        listener.wait_for_terminal().await;

        assert_eq!(listener.data(), vec![Payload::Binary(vec![0x01, 0x02, 0xFF])]);
        Ok(())
    }

    #[tokio::test]
    async fn write_posts_binary_and_completes_on_event_thread() -> TestResult {
        let (transport, engine, dispatcher, listener) = setup();
        engine.respond_text(200, "text/plain", "ok");

        let (tx, rx) = futures::channel::oneshot::channel();
        let on_thread = dispatcher.clone();
        transport.write(vec![0x01, 0x02, 0xFF], move || {
            let _ = tx.send(on_thread.is_current());
        })?;

        assert!(rx.await?);
        assert_eq!(transport.pending_writes(), 0);

        let sent = engine.requests();
        assert_eq!(sent[0].method, HttpMethod::Post);
        assert_eq!(sent[0].body.as_deref(), Some(&[0x01, 0x02, 0xFF][..]));
        assert_eq!(sent[0].header("Content-Type"), Some(OCTET_STREAM));
        assert!(listener.data().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_write_drops_on_complete() -> TestResult {
        let (transport, engine, dispatcher, listener) = setup();
        engine.respond_text(503, "text/plain", "busy");

        let (tx, rx) = futures::channel::oneshot::channel::<()>();
        transport.write(b"hello".to_vec(), move || {
            let _ = tx.send(());
        })?;

        // Dropped unrun: the sender goes away without sending.
        assert!(rx.await.is_err());
        dispatcher.flush().await;

        assert_eq!(
            listener.events().last(),
            Some(&Event::WriteError(ErrorKind::HttpStatus))
        );
        assert_eq!(transport.pending_writes(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn writes_may_overlap_with_each_other_and_a_poll() -> TestResult {
        let (transport, engine, _dispatcher, _listener) = setup();
        let _a = engine.hold_text(200, "text/plain", "a");
        let _b = engine.hold_text(200, "text/plain", "b");
        let _p = engine.hold_text(200, "text/plain", "p");

        transport.write(b"one".to_vec(), || {})?;
        transport.write(b"two".to_vec(), || {})?;
        transport.poll()?;

        assert_eq!(transport.pending_writes(), 2);
        assert!(transport.is_polling());
        Ok(())
    }

    #[tokio::test]
    async fn close_aborts_everything_and_rejects_new_work() -> TestResult {
        let (transport, engine, dispatcher, listener) = setup();
        let poll_release = engine.hold_text(200, "text/plain", "late");
        let write_release = engine.hold_text(200, "text/plain", "late");

        transport.poll()?;
        let (tx, rx) = futures::channel::oneshot::channel::<()>();
        transport.write(b"x".to_vec(), move || {
            let _ = tx.send(());
        })?;

        transport.close();
        transport.close();
        assert!(transport.is_closed());
        assert!(!transport.is_polling());
        assert_eq!(transport.pending_writes(), 0);

        poll_release.release();
        write_release.release();
        assert!(rx.await.is_err());
        tokio::time::sleep(core::time::Duration::from_millis(20)).await;
        dispatcher.flush().await;

        assert_eq!(
            listener.events(),
            vec![Event::RequestHeaders, Event::RequestHeaders]
        );
        assert_eq!(transport.poll(), Err(PollError::Closed));
        assert_eq!(transport.write(Vec::new(), || {}), Err(WriteError::Closed));
        assert_eq!(engine.requests().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn request_headers_are_injected_before_dispatch() -> TestResult {
        let opts = options()
            .with_header("X-Default", "from-options")
            .with_header("X-Override", "from-options");
        let (transport, engine, _dispatcher, listener) = setup_with(opts);
        listener.inject_header("X-Override", "from-listener");
        engine.respond_text(200, "text/plain", "ok");

        transport.poll()?;

        // Visible to the engine as soon as poll() returns.
        let sent = engine.requests();
        assert_eq!(sent[0].header("x-default"), Some("from-options"));
        assert_eq!(sent[0].header("x-override"), Some("from-listener"));
        Ok(())
    }

    #[tokio::test]
    async fn response_headers_are_forwarded() -> TestResult {
        let (transport, engine, _dispatcher, listener) = setup();
        engine.respond(200, &[("Content-Type", "text/plain"), ("X-Sid", "abc")], "ok");

        transport.poll()?;
        listener.wait_for_terminal().await;

        let Event::ResponseHeaders(headers) = &listener.events()[1] else {
            panic!("expected response headers, got {:?}", listener.events());
        };
        assert!(headers.contains(&("x-sid".to_string(), "abc".to_string())));
        Ok(())
    }

    #[tokio::test]
    async fn request_uri_carries_query() -> TestResult {
        let opts = options()
            .with_query("transport", "polling")
            .with_timestamp_requests(true);
        let (transport, engine, _dispatcher, listener) = setup_with(opts);
        engine.respond_text(200, "text/plain", "a");
        engine.respond_text(200, "text/plain", "b");

        transport.poll()?;
        listener.wait_for_terminal().await;
        transport.poll()?;
        listener.wait_for_terminal().await;

        let sent = engine.requests();
        assert!(sent[0].url.starts_with("http://localhost/lp?transport=polling&t="));
        assert_ne!(sent[0].url, sent[1].url);
        Ok(())
    }

    /// Re-polls from inside `on_data` until `limit` payloads arrived.
    struct Repoller {
        transport: OnceLock<Transport>,
        received: Mutex<Vec<Payload>>,
        limit: usize,
        done: async_channel::Sender<()>,
    }

    impl TransportListener for Repoller {
        fn on_data(&self, data: Payload) {
            let count = {
                let mut received = self.received.lock().unwrap_or_else(PoisonError::into_inner);
                received.push(data);
                received.len()
            };
            if count < self.limit {
                if let Some(transport) = self.transport.get() {
                    assert_eq!(transport.poll(), Ok(()));
                }
            } else {
                let _ = self.done.try_send(());
            }
        }
    }

    #[tokio::test]
    async fn listener_can_repoll_from_on_data() -> TestResult {
        let (dispatcher, run) = EventDispatcher::new();
        tokio::spawn(run);
        let engine = MockEngine::new();
        for body in ["1", "2", "3"] {
            engine.respond_text(200, "text/plain", body);
        }

        let (done, finished) = async_channel::bounded(1);
        let repoller = Arc::new(Repoller {
            transport: OnceLock::new(),
            received: Mutex::new(Vec::new()),
            limit: 3,
            done,
        });
        let transport = PollingTransport::new(
            options(),
            Arc::new(engine.clone()),
            TokioSpawn,
            dispatcher,
            repoller.clone(),
        );
        let _ = repoller.transport.set(transport.clone());

        transport.poll()?;
        finished.recv().await?;

        let received = repoller
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        assert_eq!(
            received,
            vec![
                Payload::Text("1".into()),
                Payload::Text("2".into()),
                Payload::Text("3".into())
            ]
        );
        assert_eq!(engine.requests().len(), 3);

        // Break the transport ↔ listener cycle.
        transport.close();
        Ok(())
    }

    async fn wait_until_idle(transport: &Transport) -> bool {
        for _ in 0..100 {
            if !transport.is_polling() && transport.pending_writes() == 0 {
                return true;
            }
            tokio::time::sleep(core::time::Duration::from_millis(1)).await;
        }
        false
    }

    #[tokio::test]
    async fn slots_free_up_even_when_event_loop_is_closed() -> TestResult {
        let (transport, engine, dispatcher, listener) = setup();
        dispatcher.close();
        engine.respond_text(200, "text/plain", "lost");
        engine.respond_text(200, "text/plain", "lost");
        engine.respond_text(200, "text/plain", "lost");

        transport.poll()?;
        transport.write(b"x".to_vec(), || {})?;
        assert!(wait_until_idle(&transport).await);

        assert_eq!(transport.poll(), Ok(()));
        assert_eq!(engine.requests().len(), 3);
        assert_eq!(
            listener.events(),
            vec![Event::RequestHeaders, Event::RequestHeaders, Event::RequestHeaders]
        );
        Ok(())
    }

    /// Panics in the first `requestHeaders` only.
    #[derive(Default)]
    struct PanicOnce {
        panicked: AtomicBool,
    }

    impl TransportListener for PanicOnce {
        fn on_request_headers(&self, _headers: &mut HeaderMap) {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("listener bug");
            }
        }
    }

    #[tokio::test]
    async fn panicking_request_headers_listener_frees_poll_slot() -> TestResult {
        let (dispatcher, run) = EventDispatcher::new();
        tokio::spawn(run);
        let engine = MockEngine::new();
        engine.respond_text(200, "text/plain", "ok");
        let transport: Transport = PollingTransport::new(
            options(),
            Arc::new(engine.clone()),
            TokioSpawn,
            dispatcher,
            Arc::new(PanicOnce::default()),
        );

        let polled = std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| transport.poll()));
        assert!(polled.is_err());
        assert!(!transport.is_polling());
        assert!(engine.requests().is_empty());

        assert_eq!(transport.poll(), Ok(()));
        assert_eq!(engine.requests().len(), 1);
        Ok(())
    }
}
