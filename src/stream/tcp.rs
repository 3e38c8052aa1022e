//! TCP connection establishment.
//!
//! Candidates are attempted one at a time, in the order the resolver returned
//! them. The first one to accept wins; if none do, the error of the final
//! attempt is reported.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace, warn, Instrument};

use crate::config::SessionConfig;
use crate::dns::SocketAddrs;
use crate::error::Error;

/// Connect to the first candidate in `addrs` which accepts.
pub(crate) async fn connect(
    addrs: &SocketAddrs,
    config: &SessionConfig,
) -> Result<(TcpStream, SocketAddr), Error> {
    let mut last = None;

    for (index, address) in addrs.iter().enumerate() {
        let span = tracing::trace_span!("attempt", %address, index);
        match attempt(address, config).instrument(span).await {
            Ok(stream) => {
                trace!(%address, "tcp connected");
                return Ok((stream, *address));
            }
            Err(error) => {
                debug!(%address, %error, "connection attempt failed");
                last = Some(error);
            }
        }
    }

    Err(match last {
        Some(error) => Error::Connect(error),
        None => Error::Resolve(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no candidate endpoints",
        )),
    })
}

fn bind_local_address(
    socket: &socket2::Socket,
    dst_addr: &SocketAddr,
    config: &SessionConfig,
) -> io::Result<()> {
    match (*dst_addr, config.local_address_ipv4, config.local_address_ipv6) {
        (SocketAddr::V4(_), Some(addr), _) => {
            socket.bind(&SocketAddr::new(addr.into(), 0).into())?;
        }
        (SocketAddr::V6(_), _, Some(addr)) => {
            socket.bind(&SocketAddr::new(addr.into(), 0).into())?;
        }
        _ => {}
    }

    Ok(())
}

fn socket(addr: &SocketAddr, config: &SessionConfig) -> io::Result<TcpSocket> {
    use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

    let domain = Domain::for_address(*addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    trace!("tcp socket opened");

    let _guard = tracing::trace_span!("socket_options").entered();

    // Tokio requires O_NONBLOCK on sockets it adopts.
    socket.set_nonblocking(true)?;

    if let Some(dur) = config.keep_alive {
        let conf = TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket.set_tcp_keepalive(&conf) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }

    bind_local_address(&socket, addr, config)?;

    let socket = TcpSocket::from_std_stream(socket.into());

    if config.reuse_address {
        if let Err(e) = socket.set_reuseaddr(true) {
            warn!("tcp set_reuse_address error: {}", e);
        }
    }

    if let Some(size) = config.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_buffer_size error: {}", e);
        }
    }

    if let Some(size) = config.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_recv_buffer_size error: {}", e);
        }
    }

    Ok(socket)
}

async fn attempt(addr: &SocketAddr, config: &SessionConfig) -> io::Result<TcpStream> {
    let socket = socket(addr, config)?;
    let stream = with_timeout(config.connect_timeout, socket.connect(*addr)).await?;

    if let Err(e) = stream.set_nodelay(config.nodelay) {
        warn!("tcp set_nodelay error: {}", e);
    }

    Ok(stream)
}

async fn with_timeout<F>(timeout: Option<Duration>, connect: F) -> io::Result<TcpStream>
where
    F: std::future::Future<Output = io::Result<TcpStream>>,
{
    match timeout {
        Some(dur) => match tokio::time::timeout(dur, connect).await {
            Ok(result) => result,
            Err(elapsed) => {
                trace!(timeout = ?dur, "connection timed out");
                Err(io::Error::new(io::ErrorKind::TimedOut, elapsed))
            }
        },
        None => connect.await,
    }
}
