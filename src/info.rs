//! Connection Information

use std::io;
use std::net::SocketAddr;

/// Information about a connected transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The local address for this connection.
    pub local_addr: SocketAddr,

    /// The remote address for this connection.
    pub remote_addr: SocketAddr,
}

impl ConnectionInfo {
    pub(crate) fn from_tcp(stream: &tokio::net::TcpStream) -> io::Result<Self> {
        Ok(Self {
            local_addr: make_canonical(stream.local_addr()?),
            remote_addr: make_canonical(stream.peer_addr()?),
        })
    }

    /// The local address for this connection.
    pub fn local_addr(&self) -> &SocketAddr {
        &self.local_addr
    }

    /// The remote address for this connection.
    pub fn remote_addr(&self) -> &SocketAddr {
        &self.remote_addr
    }
}

/// Information about a TLS connection, available once the handshake is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConnectionInfo {
    /// The server name sent in the SNI extension.
    pub server_name: String,

    /// The application layer protocol negotiated for this connection.
    pub alpn: Option<String>,

    /// The negotiated TLS protocol version, e.g. `TLSv1_3`.
    pub protocol_version: Option<String>,
}

impl TlsConnectionInfo {
    pub(crate) fn client(server_name: &str, client_info: &rustls::ClientConnection) -> Self {
        let alpn = client_info
            .alpn_protocol()
            .and_then(|s| std::str::from_utf8(s).ok())
            .map(ToOwned::to_owned);

        let protocol_version = client_info
            .protocol_version()
            .map(|version| format!("{version:?}"));

        Self {
            server_name: server_name.to_owned(),
            alpn,
            protocol_version,
        }
    }
}

/// Canonicalize a socket address, converting IPv4 addresses which are
/// mapped into IPv6 addresses into standard IPv4 addresses.
pub(crate) fn make_canonical(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        std::net::IpAddr::V4(_) => addr,
        std::net::IpAddr::V6(ip) => {
            if let Some(ip) = ip.to_ipv4_mapped() {
                SocketAddr::new(std::net::IpAddr::V4(ip), addr.port())
            } else {
                addr
            }
        }
    }
}
