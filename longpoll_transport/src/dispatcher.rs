//! Serialized event dispatch.
//!
//! Completions arrive on whatever worker the engine's runtime happens to
//! use. The [`EventDispatcher`] funnels the resulting callbacks into a single
//! queue that one loop drains, one job at a time, in submission order:
//!
//! ```text
//! worker A ──┐
//! worker B ──┼──► [unbounded FIFO] ──► dispatch loop ──► listener callbacks
//! worker C ──┘
//! ```
//!
//! The loop is a plain future: spawn it on any executor, or use
//! [`EventDispatcher::spawn_thread`] to give it a dedicated OS thread.

use alloc::{boxed::Box, string::ToString};
use core::{
    cell::Cell,
    sync::atomic::{AtomicU64, Ordering},
};
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    thread::JoinHandle,
};

use futures::{FutureExt, channel::oneshot, future::BoxFuture};

type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    /// Id of the dispatcher whose job is running on this thread, or 0.
    static CURRENT: Cell<u64> = const { Cell::new(0) };
}

/// Handle to a single logical event thread.
///
/// Clones share the same queue and loop.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    id: u64,
    tx: async_channel::Sender<Job>,
}

impl EventDispatcher {
    /// Create a dispatcher and the loop future that drains it.
    ///
    /// The loop completes once the dispatcher is [closed](Self::close) (or
    /// every handle is dropped) and the queue has drained.
    #[must_use]
    pub fn new() -> (Self, BoxFuture<'static, ()>) {
        let id = NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = async_channel::unbounded::<Job>();

        let run = async move {
            tracing::debug!(dispatcher = id, "event loop started");
            while let Ok(job) = rx.recv().await {
                run_job(id, job);
            }
            tracing::debug!(dispatcher = id, "event loop stopped");
        }
        .boxed();

        (Self { id, tx }, run)
    }

    /// Create a dispatcher whose loop runs on a dedicated, named OS thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread could not be spawned.
    pub fn spawn_thread(name: &str) -> std::io::Result<(Self, JoinHandle<()>)> {
        let (dispatcher, run) = Self::new();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || futures::executor::block_on(run))?;
        Ok((dispatcher, handle))
    }

    /// Queue `job` to run on the event thread after every job queued before
    /// it.
    ///
    /// Jobs queued after [`close`](Self::close) are dropped.
    pub fn exec(&self, job: impl FnOnce() + Send + 'static) {
        tracing::trace!(dispatcher = self.id, "queueing event");
        if self.tx.try_send(Box::new(job)).is_err() {
            tracing::warn!(dispatcher = self.id, "event loop closed; dropping event");
        }
    }

    /// Whether the caller is running inside a job of this dispatcher.
    #[must_use]
    pub fn is_current(&self) -> bool {
        CURRENT.with(Cell::get) == self.id
    }

    /// Wait until every job queued before this call has run.
    ///
    /// Resolves immediately if the loop has stopped.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel::<()>();
        self.exec(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Stop accepting new jobs. Jobs already queued still run.
    pub fn close(&self) {
        if self.tx.close() {
            tracing::debug!(dispatcher = self.id, "event dispatcher closed");
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn run_job(id: u64, job: Job) {
    let previous = CURRENT.with(|c| c.replace(id));
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!(dispatcher = id, "event callback panicked");
    }
    CURRENT.with(|c| c.set(previous));
}
