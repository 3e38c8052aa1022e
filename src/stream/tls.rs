//! Client-side TLS layer.
//!
//! A [`SecureStream`] is created, unconnected, together with its session. It
//! holds the TLS connector from then on; `connect` opens the TCP connection it
//! wraps and drives the handshake before any application data is written.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::{fmt, io};

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::Instrument as _;

use crate::config::SessionConfig;
use crate::dns::SocketAddrs;
use crate::error::{Error, Misuse};
use crate::info::{ConnectionInfo, TlsConnectionInfo};
use crate::DebugLiteral;

/// Get a default TLS client configuration by loading the platform's native certificates.
pub fn default_tls_config() -> ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        tracing::warn!(%error, "could not load platform certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::trace!(added, ignored, "loaded platform certificates");

    let mut cfg = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    cfg.alpn_protocols.push(b"http/1.1".to_vec());
    cfg
}

enum State {
    Idle,
    Streaming(TlsStream<TcpStream>),
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Idle => f.write_str("State::Idle"),
            State::Streaming(_) => f.write_str("State::Streaming"),
        }
    }
}

/// TLS over a TCP stream owned by this layer.
///
/// The stream only counts as connected once the handshake has completed.
pub struct SecureStream {
    connector: TlsConnector,
    state: State,
    info: Option<ConnectionInfo>,
    tls: Option<TlsConnectionInfo>,
}

impl fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureStream")
            .field("connector", &DebugLiteral("TlsConnector"))
            .field("state", &self.state)
            .field("info", &self.info)
            .field("tls", &self.tls)
            .finish()
    }
}

impl SecureStream {
    /// Create an unconnected secure stream using the given TLS configuration.
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
            state: State::Idle,
            info: None,
            tls: None,
        }
    }

    /// Whether the TLS handshake has completed.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Streaming(_))
    }

    /// Addresses of the underlying TCP connection.
    pub fn info(&self) -> Option<&ConnectionInfo> {
        self.info.as_ref()
    }

    /// TLS parameters, available once the handshake has completed.
    pub fn tls_info(&self) -> Option<&TlsConnectionInfo> {
        self.tls.as_ref()
    }

    /// The TCP stream carrying the encrypted bytes.
    pub fn get_ref(&self) -> Option<&TcpStream> {
        match &self.state {
            State::Streaming(stream) => Some(stream.get_ref().0),
            State::Idle => None,
        }
    }

    /// Connect to the first accepting candidate and complete the handshake,
    /// using `host` as the server name.
    ///
    /// Nothing is kept unless the handshake completes, so a stream whose
    /// connect failed or was abandoned part way may connect again.
    pub(crate) async fn connect(
        &mut self,
        host: &str,
        addrs: &SocketAddrs,
        config: &SessionConfig,
    ) -> Result<SocketAddr, Error> {
        if self.is_connected() {
            return Err(Misuse::NotIdle.into());
        }

        let domain = ServerName::try_from(host.to_owned()).map_err(|error| {
            Error::Handshake(io::Error::new(io::ErrorKind::InvalidInput, error))
        })?;

        let (stream, remote) = super::tcp::connect(addrs, config).await?;
        let info = ConnectionInfo::from_tcp(&stream).ok();

        let span = tracing::trace_span!("tls", server_name = %host);
        let stream = self
            .connector
            .connect(domain, stream)
            .instrument(span)
            .await
            .map_err(Error::Handshake)?;

        let tls = TlsConnectionInfo::client(host, stream.get_ref().1);
        tracing::trace!(alpn = ?tls.alpn.as_deref(), "tls handshake complete");

        self.info = info;
        self.tls = Some(tls);
        self.state = State::Streaming(stream);
        Ok(remote)
    }

    fn streaming(&mut self) -> io::Result<Pin<&mut TlsStream<TcpStream>>> {
        match self.state {
            State::Streaming(ref mut stream) => Ok(Pin::new(stream)),
            State::Idle => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl AsyncRead for SecureStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().streaming() {
            Ok(stream) => stream.poll_read(cx, buf),
            Err(error) => Poll::Ready(Err(error)),
        }
    }
}

impl AsyncWrite for SecureStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().streaming() {
            Ok(stream) => stream.poll_write(cx, buf),
            Err(error) => Poll::Ready(Err(error)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().streaming() {
            Ok(stream) => stream.poll_flush(cx),
            Err(_) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().streaming() {
            Ok(stream) => stream.poll_shutdown(cx),
            Err(error) => Poll::Ready(Err(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    use super::*;
    use crate::fixtures::tls_configs;

    #[tokio::test]
    async fn handshake_then_echo() {
        let _ = tracing_subscriber::fmt::try_init();

        let (server_config, client_config) = tls_configs();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = acceptor.accept(stream).await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut stream = SecureStream::new(client_config);
        assert!(!stream.is_connected());

        let addrs = SocketAddrs::from_iter([addr]);
        let remote = stream
            .connect("localhost", &addrs, &SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(remote, addr);
        assert!(stream.is_connected());
        assert_eq!(stream.info().unwrap().remote_addr, addr);
        assert_eq!(stream.tls_info().unwrap().server_name, "localhost");
        assert_eq!(stream.get_ref().unwrap().peer_addr().unwrap(), addr);

        stream.write_all(b"ping").await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let (server_config, client_config) = tls_configs();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _stream = acceptor.accept(stream).await.unwrap();
            std::future::pending::<()>().await;
        });

        let addrs = SocketAddrs::from_iter([addr]);
        let mut stream = SecureStream::new(client_config);
        stream
            .connect("localhost", &addrs, &SessionConfig::default())
            .await
            .unwrap();

        let err = stream
            .connect("localhost", &addrs, &SessionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Misuse(Misuse::NotIdle)), "{err:?}");
    }

    #[tokio::test]
    async fn untrusted_server_fails_handshake() {
        let (server_config, _) = tls_configs();
        let (_, other_client) = tls_configs();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = acceptor.accept(stream).await;
        });

        let addrs = SocketAddrs::from_iter([addr]);
        let mut stream = SecureStream::new(other_client);
        let err = stream
            .connect("localhost", &addrs, &SessionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)), "{err:?}");
        assert!(!stream.is_connected());
        assert!(stream.info().is_none());
        assert!(stream.tls_info().is_none());
    }

    #[tokio::test]
    async fn abandoned_handshake_leaves_stream_idle() {
        let (server_config, client_config) = tls_configs();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        // The first connection never gets a server hello. The second is
        // served properly.
        let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
        tokio::spawn(async move {
            let (_silent, _) = listener.accept().await.unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let _stream = acceptor.accept(stream).await.unwrap();
            std::future::pending::<()>().await;
        });

        let addrs = SocketAddrs::from_iter([addr]);
        let config = SessionConfig::default();
        let mut stream = SecureStream::new(client_config);

        let stalled = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            stream.connect("localhost", &addrs, &config),
        )
        .await;
        assert!(stalled.is_err());
        assert!(!stream.is_connected());
        assert!(stream.info().is_none());
        assert!(stream.get_ref().is_none());

        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        let err = stream.shutdown().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        stream.connect("localhost", &addrs, &config).await.unwrap();
        assert!(stream.is_connected());
    }
}
