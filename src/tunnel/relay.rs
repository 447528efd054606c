//! One direction of the duplex relay

use super::TunnelContext;
use crate::protocol::CLOSE_TIMEOUT;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Relay direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Reads the client, writes the destination
    ClientToDestination,
    /// Reads the destination, writes the client
    DestinationToClient,
}

impl Direction {
    /// The opposite direction
    pub fn peer(self) -> Self {
        match self {
            Direction::ClientToDestination => Direction::DestinationToClient,
            Direction::DestinationToClient => Direction::ClientToDestination,
        }
    }

    fn source(self) -> &'static str {
        match self {
            Direction::ClientToDestination => "client",
            Direction::DestinationToClient => "destination",
        }
    }

    fn sink(self) -> &'static str {
        self.peer().source()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source(), self.sink())
    }
}

/// Why a relay loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// Source reached end of stream
    Eof,
    /// Neither direction moved data within the timeout window
    Idle,
    /// Read or write failed
    Fault,
    /// The tunnel was already closing
    Closed,
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}

/// Copy `reader` into `writer` until EOF, a fault, a dead link, or until the
/// tunnel starts closing; then run the tunnel shutdown. Unless the tunnel is
/// broken, `writer` is then shut down too (for TLS, this sends `close_notify`).
///
/// A read timeout alone does not end the loop: if the opposite direction
/// wrote within `read_timeout`, the link is busy one way only and the read is
/// retried.
pub async fn relay<R, W>(
    ctx: &TunnelContext,
    direction: Direction,
    reader: &mut R,
    writer: &mut W,
    read_timeout: Duration,
    buffer_size: usize,
) -> RelayExit
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];

    let exit = loop {
        let read = tokio::select! {
            biased;
            _ = ctx.closed() => break RelayExit::Closed,
            read = tokio::time::timeout(read_timeout, reader.read(&mut buf)) => read,
        };

        let n = match read {
            Err(_) => {
                if ctx.wrote_within(direction.peer(), read_timeout) {
                    continue;
                }
                if ctx.is_closing() {
                    break RelayExit::Closed;
                }
                info!("Read timeout on {} {}", direction.source(), ctx);
                ctx.mark_broken();
                break RelayExit::Idle;
            }
            Ok(Err(e)) => {
                if ctx.is_closing() {
                    break RelayExit::Closed;
                }
                warn!("Read error on {} {} ({})", direction.source(), ctx, e);
                ctx.mark_broken();
                break RelayExit::Fault;
            }
            Ok(Ok(0)) => {
                if ctx.is_closing() {
                    break RelayExit::Closed;
                }
                info!("End of stream on {} {}", direction.source(), ctx);
                break RelayExit::Eof;
            }
            Ok(Ok(n)) => n,
        };

        let written = tokio::select! {
            biased;
            _ = ctx.closed() => break RelayExit::Closed,
            written = write_chunk(writer, &buf[..n]) => written,
        };
        if let Err(e) = written {
            if ctx.is_closing() {
                break RelayExit::Closed;
            }
            warn!("Write error on {} {} ({})", direction.sink(), ctx, e);
            ctx.mark_broken();
            break RelayExit::Fault;
        }
        ctx.record_write(direction);

        if ctx.debug() && direction == Direction::DestinationToClient {
            ctx.log_buffer_sizes();
        }
    };

    debug!("Relay {} finished {} ({:?})", direction, ctx, exit);
    ctx.shutdown();

    if !ctx.is_broken() {
        match tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Shutdown of {} failed {} ({})", direction.sink(), ctx, e),
            Err(_) => debug!("Shutdown of {} timed out {}", direction.sink(), ctx),
        }
    }
    exit
}
