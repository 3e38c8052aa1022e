//! Delivery of operation results.
//!
//! Each session operation runs once, inside the session worker, and sends
//! its result down a oneshot channel. [`Completion`] is the receiving end.
//! Awaiting it suspends the caller until the result arrives. Calling
//! [`Completion::then`] or [`Completion::then_on`] instead hands the result to
//! a callback spawned on a runtime of the caller's choosing.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::ready;
use pin_project::pin_project;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::Error;

/// The pending result of a session operation.
///
/// Dropping a `Completion` does not cancel the operation. It still runs in
/// its turn, and its result is discarded.
#[pin_project]
pub struct Completion<T> {
    #[pin]
    rx: oneshot::Receiver<Result<T, Error>>,
    handle: Handle,
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

impl<T> Completion<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, Error>>, handle: Handle) -> Self {
        Self { rx, handle }
    }

    /// A completion which resolves immediately with `error`.
    pub(crate) fn failed(error: Error, handle: Handle) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self::new(rx, handle)
    }
}

impl<T> Completion<T>
where
    T: Send + 'static,
{
    /// Deliver the result to `callback`, run as a task on the session's runtime.
    pub fn then<F>(self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<T, Error>) + Send + 'static,
    {
        let handle = self.handle.clone();
        self.then_on(&handle, callback)
    }

    /// Deliver the result to `callback`, run as a task on `handle`.
    ///
    /// The operation itself still runs on the session's runtime; only the
    /// callback moves.
    pub fn then_on<F>(self, handle: &Handle, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<T, Error>) + Send + 'static,
    {
        handle.spawn(async move {
            let result = self.await;
            callback(result);
        })
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().rx.poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(_) => {
                tracing::trace!("session worker dropped the operation");
                Poll::Ready(Err(Error::Closed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::error::Misuse;

    static_assertions::assert_impl_all!(Completion<()>: Send, Sync, Unpin, Future);

    #[tokio::test]
    async fn await_delivers_result() {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, Handle::current());
        tx.send(Ok(7)).unwrap();
        assert_eq!(completion.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn dropped_sender_is_closed() {
        let (tx, rx) = oneshot::channel::<Result<(), Error>>();
        drop(tx);
        let err = Completion::new(rx, Handle::current()).await.unwrap_err();
        assert!(matches!(err, Error::Closed), "{err:?}");
    }

    #[tokio::test]
    async fn callback_runs_on_session_runtime() {
        let completion =
            Completion::<()>::failed(Misuse::NotConnected.into(), Handle::current());
        let (tx, rx) = oneshot::channel();
        completion.then(move |result| {
            let _ = tx.send(result);
        });
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Misuse(Misuse::NotConnected)));
    }

    #[test]
    fn callback_runs_on_chosen_runtime() {
        let session_rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let caller_rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("caller")
            .build()
            .unwrap();

        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, session_rt.handle().clone());

        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        completion.then_on(caller_rt.handle(), move |result: Result<u8, Error>| {
            let name = thread::current().name().map(str::to_owned);
            seen_tx.send((result.unwrap(), name)).unwrap();
        });

        tx.send(Ok(3)).unwrap();
        let (value, thread) = seen_rx.recv().unwrap();
        assert_eq!(value, 3);
        assert_eq!(thread.as_deref(), Some("caller"));
    }
}
