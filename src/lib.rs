//! wgpipe - WireGuard interface control service
//!
//! A long-running service that takes tunnel commands from a desktop
//! controller over a single-client local IPC endpoint.
//!
//! # Features
//!
//! - Single-instance named pipe (Windows) or Unix socket endpoint, recreated
//!   after every client
//! - Brace-depth JSON framing that tolerates arbitrary chunking
//! - Pluggable command handlers with contained failures
//! - Bounded, cancellable shutdown with service state reporting
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use wgpipe::handlers::{build_registry, StagedInterface, TunnelManager};
//! use wgpipe::ipc::{platform_endpoint, CommandDispatcher, ListenerLoop};
//! use wgpipe::service::{ServiceLifecycle, TracingStatusReporter};
//! use wgpipe::config::DEFAULT_ADDRESS;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), wgpipe::ServiceError> {
//!     let manager = Arc::new(TunnelManager::new(Arc::new(StagedInterface::new())));
//!     let dispatcher = CommandDispatcher::new(build_registry(manager));
//!     let listener = ListenerLoop::new(platform_endpoint(DEFAULT_ADDRESS), dispatcher);
//!
//!     let mut service = ServiceLifecycle::new(TracingStatusReporter, Duration::from_secs(10));
//!     service.start(listener)?;
//!     service.run_until_stopped().await
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod ipc;
pub mod service;

pub use config::{ServiceConfig, TunnelConfig};
pub use error::ServiceError;
pub use service::{ServiceLifecycle, ServiceState, StatusReporter};
