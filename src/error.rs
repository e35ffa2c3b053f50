//! Error types for the WireGuard interface control service

use thiserror::Error;

/// Main error type for the service
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// IPC endpoint errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Service lifecycle errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Tunnel interface errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Invalid service settings: {0}")]
    InvalidSettings(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// IPC endpoint errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to create endpoint {address}: {source}")]
    CreateFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept client on {address}: {source}")]
    AcceptFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Gave up on {address} after {attempts} consecutive failures")]
    RetriesExhausted { address: String, attempts: u32 },
}

/// Fatal lifecycle errors
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("Service already started")]
    AlreadyStarted,

    #[error("Worker panicked: {reason}")]
    WorkerPanicked { reason: String },
}

/// Tunnel interface errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Tunnel already connected")]
    AlreadyConnected,

    #[error("Tunnel not connected")]
    NotConnected,

    #[error("Failed to configure interface: {reason}")]
    ConfigureFailed { reason: String },

    #[error("Failed to tear down interface: {reason}")]
    TeardownFailed { reason: String },

    #[error("Invalid tunnel config: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// Byte stream framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("unbalanced closing brace")]
    UnbalancedClose,

    #[error("unexpected byte 0x{byte:02x} outside of a JSON object")]
    UnexpectedByte { byte: u8 },

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("frame exceeds {limit} bytes")]
    Oversized { limit: usize },
}

/// Command decoding errors
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("missing Command field")]
    MissingCommand,

    #[error("unknown command: {name}")]
    UnknownCommand { name: String },
}

/// Failure reported by a command handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<TunnelError> for HandlerError {
    fn from(error: TunnelError) -> Self {
        Self::new(error.to_string())
    }
}

impl From<ConfigError> for HandlerError {
    fn from(error: ConfigError) -> Self {
        Self::new(format!("Invalid config: {}", error))
    }
}

impl ServiceError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Settings file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Transport(TransportError::CreateFailed { address, .. }) => {
                #[cfg(windows)]
                return format!(
                    "Could not create pipe {}.\n  \
                    Another instance of the service may already own it.",
                    address
                );
                #[cfg(not(windows))]
                return format!(
                    "Could not bind socket {}.\n  \
                    Check that the directory exists and is writable by the service.",
                    address
                );
            }

            Self::Transport(TransportError::RetriesExhausted { address, attempts }) => {
                format!(
                    "Endpoint {} failed {} times in a row.\n  \
                    Raise --max-retries or check for a competing listener.",
                    address, attempts
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Fatal errors
            Self::Config(_) => false,
            Self::Lifecycle(_) => false,
            Self::Transport(TransportError::RetriesExhausted { .. }) => false,

            // Recoverable errors
            Self::Transport(_) => true,
            Self::Tunnel(_) => true,

            _ => false,
        }
    }

    /// Get the service-specific exit code for this error
    pub fn exit_code(&self) -> u32 {
        match self {
            Self::Config(_) => 1,
            Self::Transport(_) => 3,
            Self::Lifecycle(_) => 4,
            Self::Tunnel(_) => 6,
            Self::System(_) => 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            ServiceError::Config(ConfigError::MissingField {
                field: "address".to_string(),
            }),
            ServiceError::Transport(TransportError::RetriesExhausted {
                address: "pipe".to_string(),
                attempts: 3,
            }),
            ServiceError::Lifecycle(LifecycleError::AlreadyStarted),
            ServiceError::Tunnel(TunnelError::NotConnected),
            ServiceError::System(std::io::Error::other("boom")),
        ];

        let mut codes: Vec<u32> = errors.iter().map(|e| e.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|&c| c != 0));
    }

    #[test]
    fn test_recoverability() {
        let accept = ServiceError::Transport(TransportError::AcceptFailed {
            address: "pipe".to_string(),
            source: std::io::Error::other("broken"),
        });
        assert!(accept.is_recoverable());

        let exhausted = ServiceError::Transport(TransportError::RetriesExhausted {
            address: "pipe".to_string(),
            attempts: 5,
        });
        assert!(!exhausted.is_recoverable());
        assert!(exhausted.user_message().contains("5 times"));
    }

    #[test]
    fn test_handler_error_from_tunnel_error() {
        let err: HandlerError = TunnelError::NotConnected.into();
        assert_eq!(err.message, "Tunnel not connected");
    }
}
