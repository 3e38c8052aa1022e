//! Courier
//!
//! Client sessions over plain or TLS byte streams.
//!
//! A [`ClientSession`] owns one outbound connection. It resolves and connects,
//! writes messages, and reads responses through pluggable codecs, running every
//! operation one at a time and in the order it was issued. Each operation
//! returns a [`Completion`](session::Completion), which can either be awaited
//! or handed a callback.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;

pub mod codec;
pub mod config;
pub mod dns;
pub mod error;
pub mod info;
pub mod session;
pub mod stream;

pub use config::SessionConfig;
pub use error::{Error, Misuse};
pub use session::{ClientSession, Completion, Phase, Sent};
pub use stream::MultiStream;

/// Boxed error type used for codec and resolver failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) type BoxFuture<'a, T> = futures_util::future::BoxFuture<'a, T>;

pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
