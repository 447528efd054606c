//! Shared state of one relay session

use super::Direction;
use crate::transport::SocketHandle;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

/// Shared state between the two relay directions of a tunnel.
///
/// Each write timestamp has a single writer and is read by the other
/// direction with relaxed ordering. The `closing` transition runs under the
/// lock of a watch channel, which also wakes any task waiting in [`closed`].
///
/// [`closed`]: TunnelContext::closed
pub struct TunnelContext {
    label: String,
    client: SocketHandle,
    destination: SocketHandle,
    debug: bool,
    epoch: Instant,
    /// Milliseconds since `epoch` plus one; zero means never written
    last_write_to_client: AtomicU64,
    last_write_to_destination: AtomicU64,
    broken: AtomicBool,
    closing: watch::Sender<bool>,
}

impl TunnelContext {
    pub fn new(
        label: impl Into<String>,
        client: SocketHandle,
        destination: SocketHandle,
        debug: bool,
    ) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            label: label.into(),
            client,
            destination,
            debug,
            epoch: Instant::now(),
            last_write_to_client: AtomicU64::new(0),
            last_write_to_destination: AtomicU64::new(0),
            broken: AtomicBool::new(false),
            closing,
        }
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// Timestamp slot written by `direction`
    fn write_slot(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::ClientToDestination => &self.last_write_to_destination,
            Direction::DestinationToClient => &self.last_write_to_client,
        }
    }

    /// Record a successful write by `direction`
    pub fn record_write(&self, direction: Direction) {
        self.write_slot(direction).store(self.now_ms(), Ordering::Relaxed);
    }

    /// Whether `direction` wrote anything within the last `window`
    pub fn wrote_within(&self, direction: Direction, window: Duration) -> bool {
        let last = self.write_slot(direction).load(Ordering::Relaxed);
        last != 0 && self.now_ms().saturating_sub(last) < window.as_millis() as u64
    }

    /// Mark the tunnel broken. Never reset.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Resolves once the tunnel starts closing
    pub async fn closed(&self) {
        let mut rx = self.closing.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|closing| *closing).await;
    }

    /// Start closing the tunnel, once.
    ///
    /// A broken tunnel is reset on both sides. Otherwise the destination is
    /// shut down in order and the client is left for [`finish`], so that the
    /// relay writing to it can end its TLS session first. Returns `true` for
    /// the call that actually closed.
    ///
    /// [`finish`]: TunnelContext::finish
    pub fn shutdown(&self) -> bool {
        self.closing.send_if_modified(|closing| {
            if *closing {
                return false;
            }
            *closing = true;

            if self.is_broken() {
                debug!("Abortive close {}", self.label);
                self.destination.abortive_close();
                self.client.abortive_close();
            } else {
                debug!("Orderly close {}", self.label);
                self.destination.orderly_close();
            }
            true
        })
    }

    /// Complete an orderly close by shutting down the client socket.
    /// Runs after both relays are done or given up on; no-op when broken.
    pub fn finish(&self) {
        if !self.is_broken() {
            self.client.orderly_close();
        }
    }

    /// Debug instrumentation: socket buffer sizes on both ends
    pub fn log_buffer_sizes(&self) {
        let client = self
            .client
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        match (
            self.client.recv_buffer_size(),
            self.client.send_buffer_size(),
            self.destination.recv_buffer_size(),
            self.destination.send_buffer_size(),
        ) {
            (Ok(rbuf), Ok(sbuf), Ok(drbuf), Ok(dsbuf)) => info!(
                "{}, rbufsz: {}, sbufsz: {}, drbufsz: {}, dsbufsz: {}",
                client, rbuf, sbuf, drbuf, dsbuf
            ),
            _ => debug!("{}, buffer sizes unavailable", client),
        }
    }
}

impl fmt::Display for TunnelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl fmt::Debug for TunnelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelContext")
            .field("label", &self.label)
            .field("broken", &self.is_broken())
            .field("closing", &self.is_closing())
            .finish()
    }
}
