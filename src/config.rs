//! Session configuration.
//!
//! [`SessionConfig`] collects the socket options, deadlines and buffer sizing
//! used by a [`ClientSession`](crate::ClientSession). Sessions with non-default
//! configuration, a custom resolver, or TLS are built with
//! [`ClientSessionBuilder`].

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::dns::GaiResolver;
use crate::session::ClientSession;

/// Configuration for a client session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The timeout for each individual connection attempt.
    pub connect_timeout: Option<Duration>,

    /// Deadline armed around every session operation.
    ///
    /// When it expires, the in-flight step fails with
    /// [`Error::Timeout`](crate::Error::Timeout) and queued operations proceed.
    pub timeout: Option<Duration>,

    /// The TCP keep-alive idle time.
    pub keep_alive: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<usize>,

    /// The local IPv4 address to bind to.
    pub local_address_ipv4: Option<Ipv4Addr>,

    /// The local IPv6 address to bind to.
    pub local_address_ipv6: Option<Ipv6Addr>,

    /// Initial capacity of the session receive buffer.
    pub read_buffer_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            timeout: None,
            keep_alive: Some(Duration::from_secs(90)),
            nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
            local_address_ipv4: None,
            local_address_ipv6: None,
            read_buffer_capacity: 8 * 1024,
        }
    }
}

/// Builder for a [`ClientSession`].
#[derive(Debug)]
pub struct ClientSessionBuilder<R = GaiResolver> {
    config: SessionConfig,
    resolver: R,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl ClientSessionBuilder {
    pub(crate) fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            resolver: GaiResolver::new(),
            tls: None,
        }
    }
}

impl<R> ClientSessionBuilder<R> {
    /// Access the session configuration
    pub fn config(&mut self) -> &mut SessionConfig {
        &mut self.config
    }

    /// Set the session configuration
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the per-operation deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Make this a secure session, using the given TLS configuration.
    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Set the resolver used by `connect`.
    pub fn with_resolver<R2>(self, resolver: R2) -> ClientSessionBuilder<R2> {
        ClientSessionBuilder {
            config: self.config,
            resolver,
            tls: self.tls,
        }
    }
}

impl<R> ClientSessionBuilder<R>
where
    R: crate::dns::Resolve,
{
    /// Build the session, binding it to the given runtime.
    pub fn build(self, handle: &Handle) -> ClientSession<R> {
        ClientSession::from_parts(handle, self.config, self.resolver, self.tls)
    }
}
