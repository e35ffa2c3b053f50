//! Configuration for the interface control service
//!
//! - [`ServiceConfig`]: endpoint address and listener tuning, loaded from JSON
//! - [`TunnelConfig`]: WireGuard `.conf` text received with a `Connect` command

mod parser;
mod service;

pub use parser::{InterfaceConfig, PeerConfig, TunnelConfig, DEFAULT_MTU};
pub use service::{ServiceConfig, DEFAULT_ADDRESS};
