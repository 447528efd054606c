//! Tunnel server
//!
//! One task per accepted connection runs the TLS handshake, the application
//! handshake, the destination connect, and the client→destination relay. A
//! second task per tunnel runs the destination→client relay.

mod connector;
mod handshake;

pub use connector::{ConnectError, Connector, Resolver, StaticResolver, SystemResolver};
pub use handshake::{authenticate, Destination, HandshakeError, Step};

use crate::config::{ServerConfig, Timeouts};
use crate::protocol::Secret;
use crate::transport::{configure_accepted, SocketHandle};
use crate::tunnel::{relay, Direction, TunnelContext};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Tunnel server
#[derive(Debug)]
pub struct Server {
    secret: Secret,
    timeouts: Timeouts,
    relay_buffer_size: usize,
    send_buffer_size: Option<u32>,
    debug: bool,
    connector: Connector,
}

impl Server {
    /// Build a server from validated configuration, resolving with the system resolver
    pub fn new(config: &ServerConfig) -> crate::Result<Self> {
        config.timeouts.validate()?;
        let timeouts = Timeouts::from(&config.timeouts);
        Ok(Self {
            secret: config.secret()?,
            timeouts,
            relay_buffer_size: config.relay_buffer_size,
            send_buffer_size: config.send_buffer_size(),
            debug: config.debug,
            connector: Connector::new(
                Arc::new(SystemResolver),
                config.reject_loopback,
                timeouts.connect,
            ),
        })
    }

    /// Replace the hostname resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.connector = self.connector.with_resolver(resolver);
        self
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Accept connections forever
    pub async fn run(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("New connection from {}", peer);
                    let server = Arc::clone(&self);
                    let acceptor = acceptor.clone();
                    tokio::spawn(guard(
                        peer,
                        server.handle_connection(stream, peer, acceptor),
                    ));
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Terminate TLS on an accepted socket, then serve it
    pub async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: TlsAcceptor,
    ) -> crate::Result<()> {
        configure_accepted(&stream, self.send_buffer_size)?;
        let client = SocketHandle::new(&stream)?;

        let tls_stream =
            match tokio::time::timeout(self.timeouts.handshake, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => tls_stream,
                Ok(Err(e)) => {
                    debug!("TLS handshake failed from {}: {}", peer, e);
                    client.abortive_close();
                    return Ok(());
                }
                Err(_) => {
                    debug!("TLS handshake timeout from {}", peer);
                    client.abortive_close();
                    return Ok(());
                }
            };

        self.serve(tls_stream, client, peer).await
    }

    /// Run handshake, destination connect, and relay on an established stream.
    ///
    /// `client` must be a handle on the socket underneath `stream`. Routine
    /// failures (bad handshakes, unreachable destinations) are logged and
    /// return `Ok`.
    pub async fn serve<S>(
        self: Arc<Self>,
        mut stream: S,
        client: SocketHandle,
        peer: SocketAddr,
    ) -> crate::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let destination =
            match authenticate(&mut stream, &self.secret, self.timeouts.handshake).await {
                Ok(destination) => destination,
                Err(e) => {
                    match e {
                        HandshakeError::BadSecret => {
                            info!("Wrong secret from {}, possibly a scan", peer)
                        }
                        HandshakeError::Timeout(Step::Hello) => {
                            debug!("Timeout during hello from {}, possible TLS failure", peer)
                        }
                        e => debug!("Handshake with {} failed: {}", peer, e),
                    }
                    client.abortive_close();
                    return Ok(());
                }
            };
        info!("Client {} requests {}", peer, destination);

        let (dest_stream, dest_addr) = match self.connector.connect(&destination).await {
            Ok(connected) => connected,
            Err(e) => {
                warn!("{}", e);
                client.abortive_close();
                return Ok(());
            }
        };

        let dest_handle = match SocketHandle::new(&dest_stream) {
            Ok(handle) => handle,
            Err(e) => {
                client.abortive_close();
                return Err(e.into());
            }
        };

        let ctx = Arc::new(TunnelContext::new(
            format!("{}/{}", destination.host, dest_addr),
            client,
            dest_handle,
            self.debug,
        ));

        let (mut client_read, mut client_write) = tokio::io::split(stream);
        let (mut dest_read, mut dest_write) = tokio::io::split(dest_stream);
        let transfer = self.timeouts.transfer;
        let buffer_size = self.relay_buffer_size;

        let peer_task = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                relay(
                    &ctx,
                    Direction::DestinationToClient,
                    &mut dest_read,
                    &mut client_write,
                    transfer,
                    buffer_size,
                )
                .await
            })
        };

        relay(
            &ctx,
            Direction::ClientToDestination,
            &mut client_read,
            &mut dest_write,
            transfer,
            buffer_size,
        )
        .await;

        match tokio::time::timeout(self.timeouts.peer_join, peer_task).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Destination relay task failed {}: {}", ctx, e),
            Err(_) => warn!("Destination relay task still alive {}", ctx),
        }
        ctx.finish();

        Ok(())
    }
}

/// Run one connection on its own task and log anything it did not handle,
/// panics included. Returns `true` if the connection ended cleanly.
async fn guard<F>(peer: SocketAddr, connection: F) -> bool
where
    F: Future<Output = crate::Result<()>> + Send + 'static,
{
    match tokio::spawn(connection).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("Unexpected failure handling {}: {}", peer, e);
            false
        }
        Err(e) if e.is_panic() => {
            error!("Connection task for {} panicked: {}", peer, e);
            false
        }
        Err(e) => {
            error!("Connection task for {} failed: {}", peer, e);
            false
        }
    }
}
