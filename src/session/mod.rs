//! Client sessions.
//!
//! A [`ClientSession`] is a cheap, cloneable handle to one outbound
//! connection. The connection itself, along with its receive buffer, resolver
//! and phase, is owned by a worker task spawned on the session's runtime.
//! Operations are queued to that worker as they are invoked and run one at a
//! time, in invocation order, so clones of a session never interleave their
//! reads or writes.
//!
//! Every operation returns a [`Completion`]. The first step of an operation
//! to fail ends it, reports its error, and leaves the session in
//! [`Phase::Failed`]. Sessions never reconnect or retry on their own.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, Instrument as _};

use crate::codec::{read_message, write_message, Encode, Parse};
use crate::config::{ClientSessionBuilder, SessionConfig};
use crate::dns::{self, GaiResolver, Resolve};
use crate::error::{Error, Misuse};
use crate::stream::MultiStream;
use crate::BoxFuture;

mod completion;

pub use completion::Completion;

/// Where a session is in its current operation.
///
/// An operation moves forward through these phases and never back. The next
/// operation starts again from wherever the last one left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Phase {
    /// Nothing has happened yet.
    Idle,
    /// Looking up candidate endpoints.
    Resolving,
    /// Trying candidates, and completing the handshake on secure sessions.
    Connecting,
    /// Connected, with nothing in flight.
    Connected,
    /// Writing a message.
    Sending,
    /// Reading a response.
    Receiving,
    /// The write half has been shut down.
    ClosedForWrite,
    /// The last operation completed.
    Done,
    /// A step failed. Only `connect` on a session with no connection is
    /// accepted from here.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Resolving => "resolving",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Sending => "sending",
            Phase::Receiving => "receiving",
            Phase::ClosedForWrite => "closed-for-write",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything one connection needs, owned by the session worker.
struct SessionState<R> {
    stream: MultiStream,
    buffer: BytesMut,
    resolver: R,
    config: SessionConfig,
    phase: watch::Sender<Phase>,
    write_closed: bool,
}

/// A unit of work for the session worker.
type Job<R> = Box<dyn for<'a> FnOnce(&'a mut SessionState<R>) -> BoxFuture<'a, ()> + Send>;

fn job<R, F>(f: F) -> Job<R>
where
    F: for<'a> FnOnce(&'a mut SessionState<R>) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

impl<R> SessionState<R>
where
    R: Resolve,
{
    /// Run queued jobs until every handle is gone and the queue is empty.
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<Job<R>>) {
        trace!("session worker started");
        while let Some(job) = jobs.recv().await {
            job(&mut self).await;
        }
        trace!(phase = %self.phase(), "session worker finished");
    }

    fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            trace!(from = %previous, to = %phase, "phase");
        }
    }

    /// Arm the deadline around `operation` and record failure.
    async fn supervise<T, F>(&mut self, operation: F) -> Result<T, Error>
    where
        F: for<'b> FnOnce(&'b mut SessionState<R>) -> BoxFuture<'b, Result<T, Error>>,
    {
        let result = match self.config.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, operation(&mut *self)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(deadline)),
            },
            None => operation(&mut *self).await,
        };

        match &result {
            Err(error) if error.is_misuse() => {
                debug!(%error, "operation rejected");
            }
            Err(error) => {
                debug!(%error, "operation failed");
                self.set_phase(Phase::Failed);
            }
            Ok(_) => {}
        }
        result
    }

    async fn connect(&mut self, host: String, service: String) -> Result<SocketAddr, Error> {
        if self.stream.is_connected() {
            return Err(match self.phase() {
                Phase::Failed => Misuse::SessionFailed,
                _ => Misuse::NotIdle,
            }
            .into());
        }

        self.set_phase(Phase::Resolving);
        let addrs = dns::resolve(&self.resolver, &host, &service)
            .await
            .map_err(Error::Resolve)?;
        trace!(candidates = addrs.len(), "resolved");

        self.set_phase(Phase::Connecting);
        let remote = self.stream.connect(&host, &addrs, &self.config).await?;

        self.buffer.clear();
        self.write_closed = false;
        self.set_phase(Phase::Connected);
        Ok(remote)
    }

    fn check_writable(&self) -> Result<(), Misuse> {
        if self.phase() == Phase::Failed {
            Err(Misuse::SessionFailed)
        } else if !self.stream.is_connected() {
            Err(Misuse::NotConnected)
        } else if self.write_closed {
            Err(Misuse::WriteClosed)
        } else {
            Ok(())
        }
    }

    async fn write<M: Encode>(&mut self, message: M) -> Result<(), Error> {
        self.check_writable()?;

        self.set_phase(Phase::Sending);
        write_message(&mut self.stream, message).await?;

        self.set_phase(Phase::Done);
        Ok(())
    }

    async fn exchange<M, P>(&mut self, message: M, parser: &mut P) -> Result<(), Error>
    where
        M: Encode,
        P: Parse,
    {
        self.check_writable()?;

        self.set_phase(Phase::Sending);
        write_message(&mut self.stream, message).await?;

        self.set_phase(Phase::Receiving);
        read_message(&mut self.stream, &mut self.buffer, parser).await?;
        Ok(())
    }

    async fn request<M, P>(&mut self, message: M, mut parser: P) -> Result<P, Error>
    where
        M: Encode,
        P: Parse,
    {
        self.exchange(message, &mut parser).await?;
        self.set_phase(Phase::Done);
        Ok(parser)
    }

    async fn send<M, P>(&mut self, message: M, mut parser: P) -> Result<Sent<P>, Error>
    where
        M: Encode,
        P: Parse,
    {
        self.exchange(message, &mut parser).await?;

        let shutdown = match self.stream.shutdown_write().await {
            Ok(()) => {
                self.write_closed = true;
                self.set_phase(Phase::ClosedForWrite);
                self.set_phase(Phase::Done);
                Ok(())
            }
            Err(error) => {
                let error = Error::Shutdown(error);
                debug!(%error, "half-close failed after response");
                self.set_phase(Phase::Failed);
                Err(error)
            }
        };

        Ok(Sent { parser, shutdown })
    }
}

/// The outcome of [`ClientSession::send`] once the response has been read.
#[derive(Debug)]
pub struct Sent<P> {
    /// The parser, holding the response.
    pub parser: P,
    /// The result of shutting down the write half. On error the session is
    /// left in [`Phase::Failed`].
    pub shutdown: Result<(), Error>,
}

impl<P> Sent<P> {
    /// Whether the write half was shut down cleanly.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_ok()
    }

    /// Take the parser, discarding the shutdown result.
    pub fn into_parser(self) -> P {
        self.parser
    }
}

struct Shared<R> {
    jobs: mpsc::UnboundedSender<Job<R>>,
    phase: watch::Receiver<Phase>,
    handle: Handle,
    secure: bool,
}

/// A handle to one outbound connection.
///
/// Clones share the connection. Operations from any clone are queued in the
/// order they are called and run one at a time.
pub struct ClientSession<R = GaiResolver> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for ClientSession<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R> fmt::Debug for ClientSession<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("secure", &self.shared.secure)
            .field("phase", &*self.shared.phase.borrow())
            .finish()
    }
}

impl ClientSession {
    /// A plain session bound to `handle`, with default configuration.
    pub fn new(handle: &Handle) -> Self {
        Self::builder().build(handle)
    }

    /// A secure session bound to `handle`, with default configuration.
    ///
    /// The TLS layer is created now and the handshake runs during `connect`.
    pub fn new_tls(handle: &Handle, tls: Arc<rustls::ClientConfig>) -> Self {
        Self::builder().with_tls(tls).build(handle)
    }

    /// Start building a session.
    pub fn builder() -> ClientSessionBuilder {
        ClientSessionBuilder::new()
    }
}

impl<R> ClientSession<R>
where
    R: Resolve,
{
    pub(crate) fn from_parts(
        handle: &Handle,
        config: SessionConfig,
        resolver: R,
        tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        let stream = match tls {
            Some(tls) => MultiStream::new_secure(handle.clone(), tls),
            None => MultiStream::new(handle.clone()),
        };
        let secure = stream.is_secure();

        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        let state = SessionState {
            stream,
            buffer: BytesMut::with_capacity(config.read_buffer_capacity),
            resolver,
            config,
            phase: phase_tx,
            write_closed: false,
        };

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let span = tracing::trace_span!("session", secure);
        handle.spawn(state.run(jobs_rx).instrument(span));

        Self {
            shared: Arc::new(Shared {
                jobs: jobs_tx,
                phase: phase_rx,
                handle: handle.clone(),
                secure,
            }),
        }
    }

    /// Whether this session encrypts its traffic.
    pub fn is_secure(&self) -> bool {
        self.shared.secure
    }

    /// The runtime this session's operations run on.
    pub fn handle(&self) -> &Handle {
        &self.shared.handle
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        *self.shared.phase.borrow()
    }

    /// A receiver which is notified on every phase change.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.shared.phase.clone()
    }

    /// Queue `operation` behind everything already submitted.
    fn submit<T, F>(&self, span: tracing::Span, operation: F) -> Completion<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut SessionState<R>) -> BoxFuture<'a, Result<T, Error>>
            + Send
            + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued = job::<R, _>(move |state| {
            Box::pin(
                async move {
                    let result = state.supervise(operation).await;
                    if tx.send(result).is_err() {
                        trace!("completion dropped before delivery");
                    }
                }
                .instrument(span),
            )
        });

        match self.shared.jobs.send(queued) {
            Ok(()) => Completion::new(rx, self.shared.handle.clone()),
            Err(_) => Completion::failed(Error::Closed, self.shared.handle.clone()),
        }
    }

    /// Resolve `host`, connect to the first candidate which accepts, and on
    /// secure sessions complete the TLS handshake.
    ///
    /// `host` and `service` are handed to the session's resolver together.
    /// The default resolver accepts a port number or the name `http` or
    /// `https` as the service. Completes
    /// with the endpoint that accepted. If every candidate refuses, the error
    /// is that of the final attempt.
    pub fn connect(
        &self,
        host: impl Into<String>,
        service: impl Into<String>,
    ) -> Completion<SocketAddr> {
        let host = host.into();
        let service = service.into();
        let span = tracing::trace_span!("connect", %host, %service);
        self.submit(span, move |state| Box::pin(state.connect(host, service)))
    }

    /// Write `message` without reading anything back.
    pub fn write<M>(&self, message: M) -> Completion<()>
    where
        M: Encode,
    {
        let span = tracing::trace_span!("write");
        self.submit(span, move |state| Box::pin(state.write(message)))
    }

    /// Write `message`, then read the response into `parser`.
    ///
    /// The read starts only once the write has succeeded. Completes with the
    /// parser, which holds the response.
    pub fn request<M, P>(&self, message: M, parser: P) -> Completion<P>
    where
        M: Encode,
        P: Parse,
    {
        let span = tracing::trace_span!("request");
        self.submit(span, move |state| Box::pin(state.request(message, parser)))
    }

    /// Like [`ClientSession::request`], then shut down the write half.
    ///
    /// If the write or the read fails, the write half is left open and the
    /// completion carries that error. Once the response has been read the
    /// completion always carries the parser. A failed shutdown is reported
    /// in [`Sent::shutdown`] as [`Error::Shutdown`] and fails the session.
    pub fn send<M, P>(&self, message: M, parser: P) -> Completion<Sent<P>>
    where
        M: Encode,
        P: Parse,
    {
        let span = tracing::trace_span!("send");
        self.submit(span, move |state| Box::pin(state.send(message, parser)))
    }
}
