//! Destination connector

use super::Destination;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Destination connect errors
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("unknown host {host}: {source}")]
    UnknownHost {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("loopback destination {0} rejected")]
    Loopback(IpAddr),

    #[error("timeout connecting to {0}")]
    Timeout(SocketAddr),

    #[error("failed to connect to {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Hostname resolution
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `host` to a single address
    async fn resolve(&self, host: &str) -> io::Result<IpAddr>;
}

/// Resolver backed by the system's `getaddrinfo`; takes the first address
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        let literal = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(ip);
        }

        tokio::net::lookup_host((host, 0))
            .await?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host))
            })
    }
}

/// Fixed host table; names not in the table do not resolve
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.hosts.insert(host.into(), ip);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        self.hosts.get(host).copied().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host))
        })
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    ip.to_canonical().is_loopback()
}

/// Resolves destinations and opens outbound connections under policy
#[derive(Clone)]
pub struct Connector {
    resolver: Arc<dyn Resolver>,
    reject_loopback: bool,
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(resolver: Arc<dyn Resolver>, reject_loopback: bool, connect_timeout: Duration) -> Self {
        Self {
            resolver,
            reject_loopback,
            connect_timeout,
        }
    }

    /// Same policy, different resolver
    pub fn with_resolver(self, resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver, ..self }
    }

    pub fn rejects_loopback(&self) -> bool {
        self.reject_loopback
    }

    /// Resolve, check policy, and connect with `TCP_NODELAY`.
    ///
    /// Resolution and connect are each bounded by the connect timeout.
    pub async fn connect(
        &self,
        destination: &Destination,
    ) -> Result<(TcpStream, SocketAddr), ConnectError> {
        let unknown = |source: io::Error| ConnectError::UnknownHost {
            host: destination.host.clone(),
            source,
        };

        let ip = tokio::time::timeout(self.connect_timeout, self.resolver.resolve(&destination.host))
            .await
            .map_err(|_| unknown(io::Error::new(io::ErrorKind::TimedOut, "resolve timed out")))?
            .map_err(&unknown)?;

        if self.reject_loopback && is_loopback(ip) {
            return Err(ConnectError::Loopback(ip));
        }

        let addr = SocketAddr::new(ip, destination.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectError::Timeout(addr))?
            .map_err(|source| ConnectError::Io { addr, source })?;
        stream
            .set_nodelay(true)
            .map_err(|source| ConnectError::Io { addr, source })?;

        Ok((stream, addr))
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("reject_loopback", &self.reject_loopback)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
