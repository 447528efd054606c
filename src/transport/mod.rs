//! Transport layer
//!
//! Provides:
//! - TLS 1.2 acceptor pinned to a single cipher suite
//! - Listener and accepted-socket options (buffer sizes, `TCP_NODELAY`)
//! - [`SocketHandle`], a second handle on a connected socket so that either
//!   relay task can close it

mod tls;

pub use tls::{build_acceptor, build_server_config, load_certs, load_private_key, pinned_provider};

use socket2::{SockRef, Socket};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::trace;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),
}

/// Backlog of the listening socket
const LISTEN_BACKLOG: u32 = 1024;

/// Bind the listening socket.
///
/// The receive buffer size is set before `listen()` so accepted sockets
/// inherit it (a window larger than 64 KB must be negotiated during SYN).
pub fn bind_listener(addr: SocketAddr, recv_buffer_size: Option<u32>) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    #[cfg(unix)]
    socket.set_reuseaddr(true)?;

    if let Some(size) = recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }

    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Apply per-connection options to an accepted socket
pub fn configure_accepted(stream: &TcpStream, send_buffer_size: Option<u32>) -> io::Result<()> {
    stream.set_nodelay(true)?;
    if let Some(size) = send_buffer_size {
        SockRef::from(stream).set_send_buffer_size(size as usize)?;
    }
    Ok(())
}

/// Owned duplicate of a connected socket's descriptor.
///
/// The stream itself is split between the two relay tasks (and may be wrapped
/// in TLS). This handle reaches the underlying socket directly, so closing
/// through it affects every other handle on the same socket.
#[derive(Debug)]
pub struct SocketHandle {
    socket: Socket,
}

impl SocketHandle {
    pub fn new(stream: &TcpStream) -> io::Result<Self> {
        let socket = SockRef::from(stream).try_clone()?;
        Ok(Self { socket })
    }

    /// Reset the connection, discarding unsent data.
    ///
    /// `SO_LINGER` 0 makes the final close emit RST instead of FIN; shutting
    /// the read side wakes any task blocked reading this socket.
    pub fn abortive_close(&self) {
        if let Err(e) = self.socket.set_linger(Some(Duration::ZERO)) {
            trace!("Setting SO_LINGER failed: {}", e);
        }
        if let Err(e) = self.socket.shutdown(Shutdown::Read) {
            trace!("Read shutdown failed: {}", e);
        }
    }

    /// Shut down both directions; queued data drains before FIN.
    pub fn orderly_close(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            trace!("Full shutdown failed: {}", e);
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok().and_then(|addr| addr.as_socket())
    }

    pub fn send_buffer_size(&self) -> io::Result<usize> {
        self.socket.send_buffer_size()
    }

    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        self.socket.recv_buffer_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_configure_accepted() {
        let (_client, server) = pair().await;
        configure_accepted(&server, Some(64 * 1024)).unwrap();
        assert!(server.nodelay().unwrap());

        let handle = SocketHandle::new(&server).unwrap();
        assert!(handle.send_buffer_size().unwrap() > 0);
        assert!(handle.recv_buffer_size().unwrap() > 0);
        assert_eq!(handle.peer_addr(), server.peer_addr().ok());
    }

    #[tokio::test]
    async fn test_orderly_close_sends_fin_after_data() {
        let (mut client, mut server) = pair().await;
        let handle = SocketHandle::new(&server).unwrap();

        server.write_all(b"last words").await.unwrap();
        handle.orderly_close();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");

        // Local reads observe EOF as well
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abortive_close_resets() {
        let (mut client, server) = pair().await;
        let handle = SocketHandle::new(&server).unwrap();

        handle.abortive_close();
        drop(server);
        drop(handle);

        let mut buf = [0u8; 8];
        let result = client.read(&mut buf).await;
        assert_eq!(
            result.map_err(|e| e.kind()),
            Err(io::ErrorKind::ConnectionReset)
        );
    }
}
