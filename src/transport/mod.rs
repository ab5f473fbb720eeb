//! WebSocket transport between viewer sessions and the bridge.
//!
//! # Architecture
//!
//! ```text
//! ChannelClient ──ws──▶ Server (accept loop)
//!                          │ one task per connection
//!                          ▼
//!                       Session ──submit──▶ ProcessBridge
//!                          ▲                      │
//!                          └──── BridgeEvent ─────┘
//! ```
//!
//! A session owns exactly one connection and one cancellation token. The
//! bridge only ever sends a submission's events to the session that made it.

pub mod client;
pub mod server;
mod session;

pub use client::ChannelClient;
pub use server::Server;

/// Connection-level failures.
///
/// Logged where they happen. Reconnecting is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Failed to establish or upgrade the connection.
    ConnectionFailed(String),
    /// The connection is closed.
    Closed,
    /// A frame could not be understood.
    Protocol(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::Closed => write!(f, "Connection closed"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}
