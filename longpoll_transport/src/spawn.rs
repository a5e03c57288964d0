//! Task spawning for in-flight calls.
//!
//! The transport keeps no thread pool of its own. Each in-flight call is a
//! future handed to a [`Spawn`]er, which drives it on the runtime's workers
//! and returns an [`AbortHandle`] used to cancel it.

use futures::{future::BoxFuture, stream::AbortHandle};

/// Trait for spawning in-flight calls as background tasks.
///
/// Implement this for your runtime (e.g., tokio, async-std).
pub trait Spawn: Send + Sync + 'static {
    /// Spawn a future as a background task.
    ///
    /// The future should be driven to completion unless the returned
    /// [`AbortHandle`] is used to cancel it.
    fn spawn(&self, fut: BoxFuture<'static, ()>) -> AbortHandle;
}

/// A [`Spawn`] implementation backed by `tokio::spawn`.
///
/// Must be used from within a tokio runtime.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokioSpawn;

#[cfg(feature = "tokio")]
impl Spawn for TokioSpawn {
    fn spawn(&self, fut: BoxFuture<'static, ()>) -> AbortHandle {
        use futures::future::Abortable;

        let (handle, reg) = AbortHandle::new_pair();
        tokio::spawn(Abortable::new(fut, reg));
        handle
    }
}

/// A [`Spawn`] implementation for an explicit tokio runtime handle.
///
/// Useful when `create()` is called from threads that are not part of the
/// runtime, such as a dedicated event thread.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone)]
pub struct TokioHandleSpawn(pub tokio::runtime::Handle);

#[cfg(feature = "tokio")]
impl Spawn for TokioHandleSpawn {
    fn spawn(&self, fut: BoxFuture<'static, ()>) -> AbortHandle {
        use futures::future::Abortable;

        let (handle, reg) = AbortHandle::new_pair();
        self.0.spawn(Abortable::new(fut, reg));
        handle
    }
}
