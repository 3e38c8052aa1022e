//! Transport streams which may or may not be encrypted.
//!
//! [`MultiStream`] is the byte stream used by a session. It is fixed at
//! construction to be either a [`PlainStream`] or a [`SecureStream`], and
//! dispatches [`AsyncRead`] and [`AsyncWrite`] to whichever it holds.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _, ReadBuf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;

use crate::config::SessionConfig;
use crate::dns::SocketAddrs;
use crate::error::{Error, Misuse};
use crate::info::ConnectionInfo;

pub(crate) mod tcp;
pub mod tls;

pub use tls::SecureStream;

/// An unencrypted TCP stream, unconnected until `connect` succeeds.
#[derive(Debug, Default)]
pub struct PlainStream {
    inner: Option<TcpStream>,
    info: Option<ConnectionInfo>,
}

impl PlainStream {
    /// Create an unconnected plain stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a TCP connection has been made.
    pub fn is_connected(&self) -> bool {
        self.inner.is_some()
    }

    /// Addresses of the connection.
    pub fn info(&self) -> Option<&ConnectionInfo> {
        self.info.as_ref()
    }

    /// The connected TCP stream.
    pub fn get_ref(&self) -> Option<&TcpStream> {
        self.inner.as_ref()
    }

    /// The connected TCP stream.
    pub fn get_mut(&mut self) -> Option<&mut TcpStream> {
        self.inner.as_mut()
    }

    pub(crate) async fn connect(
        &mut self,
        addrs: &SocketAddrs,
        config: &SessionConfig,
    ) -> Result<SocketAddr, Error> {
        if self.inner.is_some() {
            return Err(Misuse::NotIdle.into());
        }

        let (stream, remote) = tcp::connect(addrs, config).await?;
        self.info = ConnectionInfo::from_tcp(&stream).ok();
        self.inner = Some(stream);
        Ok(remote)
    }

    fn connected(self: Pin<&mut Self>) -> io::Result<Pin<&mut TcpStream>> {
        match self.get_mut().inner {
            Some(ref mut stream) => Ok(Pin::new(stream)),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl AsyncRead for PlainStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.connected() {
            Ok(stream) => stream.poll_read(cx, buf),
            Err(error) => Poll::Ready(Err(error)),
        }
    }
}

impl AsyncWrite for PlainStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.connected() {
            Ok(stream) => stream.poll_write(cx, buf),
            Err(error) => Poll::Ready(Err(error)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.connected() {
            Ok(stream) => stream.poll_flush(cx),
            Err(error) => Poll::Ready(Err(error)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.connected() {
            Ok(stream) => stream.poll_shutdown(cx),
            Err(error) => Poll::Ready(Err(error)),
        }
    }
}

#[derive(Debug)]
#[pin_project(project = LayerProjection)]
enum Layer {
    Plain(#[pin] PlainStream),
    Secure(#[pin] SecureStream),
}

macro_rules! dispatch_layer {
    (pin $driver:ident.$method:ident($($args:expr),*)) => {
        match $driver.project().layer.project() {
            LayerProjection::Plain(stream) => stream.$method($($args),*),
            LayerProjection::Secure(stream) => stream.$method($($args),*),
        }
    };

    ($driver:ident.$method:ident($($args:expr),*)) => {
        match &$driver.layer {
            Layer::Plain(stream) => stream.$method($($args),*),
            Layer::Secure(stream) => stream.$method($($args),*),
        }
    };
}

/// A byte stream which is either plain TCP or TLS over TCP.
///
/// The kind is chosen at construction and never changes. Code which needs
/// a specific layer should branch on [`MultiStream::is_secure`] before calling
/// [`MultiStream::plain`] or [`MultiStream::secure`].
#[derive(Debug)]
#[pin_project]
pub struct MultiStream {
    #[pin]
    layer: Layer,
    handle: Handle,
}

impl MultiStream {
    /// Create a plain stream bound to the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self {
            layer: Layer::Plain(PlainStream::new()),
            handle,
        }
    }

    /// Create a secure stream bound to the given runtime.
    ///
    /// The TLS layer is built here, once; `connect` performs the handshake.
    pub fn new_secure(handle: Handle, config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            layer: Layer::Secure(SecureStream::new(config)),
            handle,
        }
    }

    /// Whether this stream encrypts its traffic.
    pub fn is_secure(&self) -> bool {
        matches!(self.layer, Layer::Secure(_))
    }

    /// The plain layer.
    ///
    /// # Panics
    /// Panics if this is a secure stream.
    #[track_caller]
    pub fn plain(&self) -> &PlainStream {
        match &self.layer {
            Layer::Plain(stream) => stream,
            Layer::Secure(_) => panic!("MultiStream::plain called on a secure stream"),
        }
    }

    /// The plain layer.
    ///
    /// # Panics
    /// Panics if this is a secure stream.
    #[track_caller]
    pub fn plain_mut(&mut self) -> &mut PlainStream {
        match &mut self.layer {
            Layer::Plain(stream) => stream,
            Layer::Secure(_) => panic!("MultiStream::plain_mut called on a secure stream"),
        }
    }

    /// The secure layer.
    ///
    /// # Panics
    /// Panics if this is a plain stream.
    #[track_caller]
    pub fn secure(&self) -> &SecureStream {
        match &self.layer {
            Layer::Secure(stream) => stream,
            Layer::Plain(_) => panic!("MultiStream::secure called on a plain stream"),
        }
    }

    /// The secure layer.
    ///
    /// # Panics
    /// Panics if this is a plain stream.
    #[track_caller]
    pub fn secure_mut(&mut self) -> &mut SecureStream {
        match &mut self.layer {
            Layer::Secure(stream) => stream,
            Layer::Plain(_) => panic!("MultiStream::secure_mut called on a plain stream"),
        }
    }

    /// The runtime this stream is bound to.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Whether a connection has been made.
    pub fn is_connected(&self) -> bool {
        dispatch_layer!(self.is_connected())
    }

    /// Addresses of the underlying TCP connection.
    pub fn info(&self) -> Option<&ConnectionInfo> {
        dispatch_layer!(self.info())
    }

    /// Connect to the first accepting candidate, completing the TLS
    /// handshake with `host` as the server name on secure streams.
    ///
    /// A stream connects at most once; later calls fail with
    /// [`Misuse::NotIdle`].
    pub(crate) async fn connect(
        &mut self,
        host: &str,
        addrs: &SocketAddrs,
        config: &SessionConfig,
    ) -> Result<SocketAddr, Error> {
        match &mut self.layer {
            Layer::Plain(stream) => stream.connect(addrs, config).await,
            Layer::Secure(stream) => stream.connect(host, addrs, config).await,
        }
    }

    /// Shut down the write half, leaving the read half open.
    ///
    /// On secure streams this sends the TLS `close_notify` alert first.
    pub async fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

impl AsyncRead for MultiStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        dispatch_layer!(pin self.poll_read(cx, buf))
    }
}

impl AsyncWrite for MultiStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        dispatch_layer!(pin self.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        dispatch_layer!(pin self.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        dispatch_layer!(pin self.poll_shutdown(cx))
    }
}
