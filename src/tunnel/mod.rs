//! Tunnel layer - duplex relay between client and destination
//!
//! Provides:
//! - [`TunnelContext`], the state shared by both relay directions
//! - [`relay`], one copy loop with the liveness heuristic
//! - One-shot orderly or abortive shutdown of both connections

mod context;
mod relay;

pub use context::TunnelContext;
pub use relay::{relay, Direction, RelayExit};
