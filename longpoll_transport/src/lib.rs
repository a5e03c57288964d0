//! # Long-Poll Transport
//!
//! The long-polling transport layer of a bidirectional messaging client.
//! Individual HTTP round trips are modelled as one-shot [`Request`]s whose
//! outcomes surface as a small set of lifecycle events, observed by the rest
//! of the client in a single deterministic order.
//!
//! # Event flow
//!
//! ```text
//! ┌──────────────────┐  create()   ┌──────────┐  execute()  ┌────────────┐
//! │ PollingTransport │ ──────────► │ Request  │ ──────────► │ HttpEngine │
//! └────────▲─────────┘             └────┬─────┘             └─────┬──────┘
//!          │                            │ requestHeaders          │
//!          │                            │ (inline, caller thread) │
//!          │                            │                         │
//!          │    ┌─────────────────┐     │   completion (worker)   │
//!          └─── │ EventDispatcher │ ◄───┴─────────────────────────┘
//!               │  (FIFO, one at  │  responseHeaders, data,
//!               │   a time)       │  success, error
//!               └─────────────────┘
//! ```
//!
//! Only `requestHeaders` runs on the caller's thread, so a listener can
//! inject headers before the call is built. Everything else is marshalled
//! through the [`EventDispatcher`], so listeners never run concurrently with
//! each other and need no locking of their own.
//!
//! # Wire conventions
//!
//! | Direction | Method | Body                                   |
//! |-----------|--------|----------------------------------------|
//! | poll      | `GET`  | none                                   |
//! | write     | `POST` | binary, `application/octet-stream`     |
//!
//! Poll responses typed `application/octet-stream` are delivered as raw
//! bytes; anything else is decoded as text.

extern crate alloc;

pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod header_map;
pub mod options;
pub mod payload;
pub mod request;
pub mod spawn;
pub mod transport;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use dispatcher::EventDispatcher;
pub use engine::{HttpEngine, HttpMethod, HttpRequest, HttpResponse, ResponseBody};
pub use error::{
    BoxError, CreateError, DecodeError, ErrorKind, PollError, RequestError, TransportError,
    WriteError,
};
pub use header_map::HeaderMap;
pub use options::TransportOptions;
pub use payload::Payload;
pub use request::{Request, RequestListener, RequestOptions, RequestState};
pub use spawn::Spawn;
#[cfg(feature = "tokio")]
pub use spawn::{TokioHandleSpawn, TokioSpawn};
pub use transport::{PollingTransport, TransportListener};

/// The opaque-binary content type.
///
/// Outgoing payloads are always labelled with it; incoming bodies carrying
/// it are delivered byte-for-byte.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Charset assumed for text bodies that do not declare one.
pub const DEFAULT_CHARSET: &str = "utf-8";

/// Default query parameter name for cache-busting timestamps.
pub const DEFAULT_TIMESTAMP_PARAM: &str = "t";
