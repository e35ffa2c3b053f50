//! Command channel between the desktop controller and the service
//!
//! A single client at a time connects to a fixed endpoint, writes JSON
//! command frames and reads one JSON reply per command. When the client goes
//! away the endpoint is recreated for the next one.

pub mod codec;
pub mod dispatch;
pub mod endpoint;
pub mod frame;
pub mod listener;
pub mod session;

pub use codec::{Command, CommandCodec, ErrorKind, Response, Status};
pub use dispatch::{CommandDispatcher, CommandHandler, HandlerRegistry};
pub use endpoint::{platform_endpoint, Endpoint, PendingConnection, PlatformEndpoint};
pub use frame::FrameAssembler;
pub use listener::{ListenerLoop, RetryPolicy};
pub use session::{ConnectionSession, SessionEnd, SessionLimits, SessionSummary};

/// Where the listener is in its per-client cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No endpoint exists
    Idle,
    /// Endpoint created, blocked in accept
    WaitingForClient,
    /// A client is being served
    Connected,
    /// The session is closing its channel
    Draining,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::WaitingForClient => write!(f, "waiting for client"),
            Self::Connected => write!(f, "connected"),
            Self::Draining => write!(f, "draining"),
        }
    }
}
