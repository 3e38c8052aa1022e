//! DNS resolution utilities.
//!
//! Resolvers are [`tower::Service`]s from a [`Name`], the `(host, service)`
//! pair given to `connect`, to the ordered set of candidate [`SocketAddrs`].
//! The resolver owns the whole lookup, including turning the service into a
//! port.

use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::{fmt, io};

use futures_util::Future;
use pin_project::{pin_project, pinned_drop};
use tokio::task::JoinHandle;
use tower::ServiceExt as _;

use crate::BoxFuture;

/// An ordered set of candidate endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketAddrs(Vec<SocketAddr>);

impl SocketAddrs {
    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no candidates.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the candidates in order.
    pub fn iter(&self) -> std::slice::Iter<'_, SocketAddr> {
        self.0.iter()
    }
}

impl FromIterator<SocketAddr> for SocketAddrs {
    fn from_iter<T: IntoIterator<Item = SocketAddr>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for SocketAddrs {
    type Item = SocketAddr;
    type IntoIter = std::vec::IntoIter<SocketAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a SocketAddrs {
    type Item = &'a SocketAddr;
    type IntoIter = std::slice::Iter<'a, SocketAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The host and service to resolve.
///
/// IPv6 literals arrive without their brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name {
    host: Box<str>,
    service: Box<str>,
}

impl Name {
    /// Create a name from a host and a service.
    pub fn new(host: &str, service: &str) -> Self {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Self {
            host: host.into(),
            service: service.into(),
        }
    }

    /// The host name or address literal.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The service name or numeric port.
    pub fn service(&self) -> &str {
        &self.service
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.service)
    }
}

/// A resolver usable by a [`ClientSession`](crate::ClientSession).
///
/// Implemented for every cloneable [`tower::Service`] from a [`Name`] to
/// [`SocketAddrs`].
pub trait Resolve: Clone + Send + Sync + 'static {
    /// Resolve a name to its candidate addresses, ports included.
    fn resolve(&self, name: Name) -> BoxFuture<'static, io::Result<SocketAddrs>>;
}

impl<S> Resolve for S
where
    S: tower::Service<Name, Response = SocketAddrs, Error = io::Error>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    fn resolve(&self, name: Name) -> BoxFuture<'static, io::Result<SocketAddrs>> {
        Box::pin(self.clone().oneshot(name))
    }
}

/// Resolve `host` and `service` through `resolver`.
///
/// Fails before returning any candidate when the resolver fails or finds
/// nothing.
pub(crate) async fn resolve<R: Resolve>(
    resolver: &R,
    host: &str,
    service: &str,
) -> io::Result<SocketAddrs> {
    let name = Name::new(host, service);
    let addrs = resolver.resolve(name.clone()).await?;
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses found for {name}"),
        ));
    }
    Ok(addrs)
}

/// Map a service name or numeric port to a port number.
///
/// Only numeric ports and the names `http` and `https` are known.
pub fn parse_service(service: &str) -> io::Result<u16> {
    if let Ok(port) = service.parse::<u16>() {
        return Ok(port);
    }

    match service.to_ascii_lowercase().as_str() {
        "http" => Ok(80),
        "https" => Ok(443),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unknown service {service:?}"),
        )),
    }
}

/// GetAddrInfo based resolver.
///
/// This resolver uses the `getaddrinfo` system call to resolve
/// hostnames to IP addresses via the operating system. Services are mapped
/// to ports with [`parse_service`].
#[derive(Debug, Default, Clone)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Create a new `GaiResolver`.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl tower::Service<Name> for GaiResolver {
    type Response = SocketAddrs;
    type Error = io::Error;
    type Future = GaiFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let span = tracing::Span::current();
        GaiFuture {
            handle: tokio::task::spawn_blocking(move || {
                tracing::trace_span!(parent: &span, "getaddrinfo", %name).in_scope(|| {
                    let port = parse_service(name.service())?;
                    tracing::trace!("dns resolution starting");
                    (name.host(), port)
                        .to_socket_addrs()
                        .map(SocketAddrs::from_iter)
                })
            }),
        }
    }
}

/// Future returned by `GaiResolver` when resolving
/// via getaddrinfo in a worker thread.
#[pin_project(PinnedDrop)]
pub struct GaiFuture {
    #[pin]
    handle: JoinHandle<Result<SocketAddrs, io::Error>>,
}

impl fmt::Debug for GaiFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaiFuture").finish()
    }
}

impl Future for GaiFuture {
    type Output = Result<SocketAddrs, io::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().handle.poll(cx)) {
            Ok(Ok(addrs)) => Poll::Ready(Ok(addrs)),
            Ok(Err(error)) => Poll::Ready(Err(error)),
            Err(join_err) => {
                if join_err.is_cancelled() {
                    Poll::Ready(Err(io::Error::new(io::ErrorKind::Interrupted, join_err)))
                } else {
                    Poll::Ready(Err(io::Error::other(join_err)))
                }
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for GaiFuture {
    fn drop(self: Pin<&mut Self>) {
        self.handle.abort()
    }
}
