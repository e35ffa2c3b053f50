//! Service settings
//!
//! Optional JSON settings file; every field has a default so an empty object
//! (or no file at all) yields the stock behaviour. Command line flags are
//! applied on top by the binary.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ipc::{RetryPolicy, SessionLimits};

/// Default endpoint address for Windows
#[cfg(windows)]
pub const DEFAULT_ADDRESS: &str = r"\\.\pipe\WireGuardInterfacePipe";

/// Default endpoint address for Unix systems
#[cfg(not(windows))]
pub const DEFAULT_ADDRESS: &str = "/var/run/wgpipe/WireGuardInterfacePipe.sock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Pipe name (Windows) or socket path (Unix)
    pub address: String,
    /// Delay between endpoint creation/accept retries
    pub retry_delay_secs: u64,
    /// Consecutive failures tolerated before the listener gives up (unbounded if unset)
    pub max_retries: Option<u32>,
    /// Bytes requested per read from the client
    pub chunk_size: usize,
    /// Largest frame accepted before the partial buffer is dropped
    pub max_frame_bytes: usize,
    /// How long a stop request waits for the worker to unwind
    pub shutdown_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            retry_delay_secs: 5,
            max_retries: None,
            chunk_size: 4096,
            max_frame_bytes: 1024 * 1024,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServiceConfig {
    /// Load settings from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse settings from JSON text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "address".to_string(),
            });
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::ParseError {
                line: 0,
                message: "chunk_size must be greater than zero".to_string(),
            });
        }
        if self.max_frame_bytes < self.chunk_size {
            return Err(ConfigError::ParseError {
                line: 0,
                message: format!(
                    "max_frame_bytes ({}) must be at least chunk_size ({})",
                    self.max_frame_bytes, self.chunk_size
                ),
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_secs(self.retry_delay_secs),
            max_retries: self.max_retries,
        }
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            chunk_size: self.chunk_size,
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
