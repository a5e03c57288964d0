//! Error types for the long-poll transport.

use alloc::{
    boxed::Box,
    string::{String, ToString},
};

use thiserror::Error;

/// A type-erased error from the HTTP engine or body reader.
pub type BoxError = Box<dyn core::error::Error + Send + Sync + 'static>;

/// The kind of a failed round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The call never produced a response.
    NetworkFailure,

    /// The server answered with a non-2xx status.
    HttpStatus,

    /// The response body could not be read or decoded.
    DecodeFailure,
}

/// The payload of a Request's `error` event.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The HTTP engine failed before any response was obtained.
    #[error("network failure: {0}")]
    Network(#[source] BoxError),

    /// The server returned a non-2xx status code.
    #[error("unexpected status {status}")]
    Status {
        /// The HTTP status code.
        status: u16,
    },

    /// The response body could not be read or decoded.
    #[error("decode failure: {0}")]
    Decode(#[from] DecodeError),
}

impl RequestError {
    /// The kind of failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            RequestError::Network(_) => ErrorKind::NetworkFailure,
            RequestError::Status { .. } => ErrorKind::HttpStatus,
            RequestError::Decode(_) => ErrorKind::DecodeFailure,
        }
    }

    /// A short detail string. For status errors this is the bare code,
    /// e.g. `"500"`.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            RequestError::Network(e) => e.to_string(),
            RequestError::Status { status } => status.to_string(),
            RequestError::Decode(e) => e.to_string(),
        }
    }
}

/// Problem while reading or decoding a response body.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Reading the body from the engine failed.
    #[error("body read failed: {0}")]
    Body(#[source] BoxError),

    /// The bytes are not valid text in the declared charset.
    #[error("body is not valid {charset}")]
    InvalidText {
        /// The charset the body was decoded with.
        charset: String,
    },

    /// The declared charset is not supported.
    #[error("unsupported charset: {0}")]
    UnsupportedCharset(String),
}

/// Misuse of [`Request::create`](crate::request::Request::create).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CreateError {
    /// The request already left the `Idle` state.
    #[error("request already created")]
    AlreadyCreated,

    /// The request was aborted before it was created.
    #[error("request aborted before create")]
    Aborted,
}

/// A poll could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PollError {
    /// A poll request is already outstanding.
    #[error("poll already in flight")]
    InFlight,

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
}

/// A write could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
}

/// A transport-level error surfaced to the [`TransportListener`].
///
/// The listener decides what happens next; the transport never retries.
///
/// [`TransportListener`]: crate::transport::TransportListener
#[derive(Debug, Error)]
pub enum TransportError {
    /// A poll round trip failed.
    #[error("poll error: {0}")]
    Poll(#[source] RequestError),

    /// A write round trip failed.
    #[error("write error: {0}")]
    Write(#[source] RequestError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_detail_is_bare_code() {
        let err = RequestError::Status { status: 500 };
        assert_eq!(err.kind(), ErrorKind::HttpStatus);
        assert_eq!(err.detail(), "500");
        assert_eq!(err.to_string(), "unexpected status 500");
    }

    #[test]
    fn decode_error_converts() {
        let err: RequestError = DecodeError::UnsupportedCharset("x-unknown".into()).into();
        assert_eq!(err.kind(), ErrorKind::DecodeFailure);
        assert_eq!(err.detail(), "unsupported charset: x-unknown");
    }

    #[test]
    fn network_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = RequestError::Network(Box::new(io));
        assert_eq!(err.kind(), ErrorKind::NetworkFailure);
        assert!(core::error::Error::source(&err).is_some());
    }

    #[test]
    fn transport_error_keeps_request_error_as_source() {
        let err = TransportError::Poll(RequestError::Status { status: 404 });
        assert_eq!(err.to_string(), "poll error: unexpected status 404");
        let source = core::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("unexpected status 404"));
    }
}
