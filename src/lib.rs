//! # Smartproxy
//!
//! Server half of a secured tunneling proxy.
//!
//! A cooperating client opens a TLS connection, proves it knows the shared
//! secret, names a destination, and from then on every byte it writes is
//! relayed to that destination (and back) until one side closes or the link
//! is judged dead.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Server Layer                      │
//! │     (accept loop, handshake, destination connect)    │
//! ├─────────────────────────────────────────────────────┤
//! │                    Tunnel Layer                      │
//! │   (duplex relay, liveness heuristic, shutdown)       │
//! ├─────────────────────────────────────────────────────┤
//! │                   Protocol Layer                     │
//! │      (hello, secret, timeout, status, destination)   │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │        (TLS 1.2 listener, socket options)            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use server::Server;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] server::HandshakeError),

    #[error("Connect error: {0}")]
    Connect(#[from] server::ConnectError),

    #[error("Configuration error: {0}")]
    Config(String),
}
