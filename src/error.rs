//! Errors reported by client session operations.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::BoxError;

/// Client session error type.
///
/// Every composite operation reports at most one of these: the error of the
/// first step that failed. Later steps of that operation never run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Name resolution failed, or produced no candidate endpoints.
    #[error("resolve: {0}")]
    Resolve(#[source] io::Error),

    /// Every candidate endpoint refused the connection. Carries the error of
    /// the final attempt.
    #[error("connect: {0}")]
    Connect(#[source] io::Error),

    /// The TLS handshake on a secure stream failed.
    #[error("tls handshake: {0}")]
    Handshake(#[source] io::Error),

    /// Encoding or writing the outbound message failed.
    #[error("write: {0}")]
    Write(#[source] BoxError),

    /// Reading or parsing the response failed.
    #[error("read: {0}")]
    Read(#[source] BoxError),

    /// The response was read, but shutting down the write half failed.
    #[error("shutdown: {0}")]
    Shutdown(#[source] io::Error),

    /// The operation deadline expired.
    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The operation was issued against a session in the wrong state.
    #[error("misuse: {0}")]
    Misuse(#[from] Misuse),

    /// The session worker is gone and the result can never be delivered.
    #[error("session closed")]
    Closed,
}

impl Error {
    /// Whether this error was caused by the deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Whether this error is a contract violation by the caller.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Error::Misuse(_))
    }

    pub(crate) fn write<E: Into<BoxError>>(error: E) -> Self {
        Error::Write(error.into())
    }

    pub(crate) fn read<E: Into<BoxError>>(error: E) -> Self {
        Error::Read(error.into())
    }
}

/// Operational contract violations.
///
/// Accessing the wrong layer of a [`MultiStream`](crate::MultiStream) is also
/// misuse, but that one panics instead of being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Misuse {
    /// `connect` was called on a stream which is already connected.
    #[error("stream is not idle")]
    NotIdle,

    /// The operation needs a connected stream.
    #[error("stream is not connected")]
    NotConnected,

    /// A previous operation on this session failed.
    #[error("session previously failed")]
    SessionFailed,

    /// The write half was already shut down.
    #[error("write half is closed")]
    WriteClosed,
}
