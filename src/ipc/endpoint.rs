//! Single-instance IPC endpoints
//!
//! An endpoint is created, accepts exactly one client and is then released;
//! the listener creates a fresh one for the next client. On Windows this is a
//! named pipe limited to one instance, on Unix a domain socket that is bound
//! per client and unlinked when released.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Factory for single-use endpoints at a fixed address
pub trait Endpoint: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Pending: PendingConnection<Stream = Self::Stream>;

    /// Pipe name or socket path, for logs
    fn address(&self) -> &str;

    /// Create the endpoint. Does not block.
    fn create(&self) -> io::Result<Self::Pending>;
}

/// A created endpoint waiting for its client.
///
/// Dropping it (including dropping an in-progress `accept` future) releases
/// the underlying handle.
#[async_trait]
pub trait PendingConnection: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(self) -> io::Result<Self::Stream>;
}

#[cfg(unix)]
pub use unix_socket::{PendingUnixSocket, UnixSocketEndpoint};

#[cfg(windows)]
pub use named_pipe::{NamedPipeEndpoint, PendingNamedPipe};

/// Endpoint type used by the service binary on this platform
#[cfg(unix)]
pub type PlatformEndpoint = UnixSocketEndpoint;

#[cfg(windows)]
pub type PlatformEndpoint = NamedPipeEndpoint;

pub fn platform_endpoint(address: &str) -> PlatformEndpoint {
    PlatformEndpoint::new(address)
}

#[cfg(unix)]
mod unix_socket {
    use std::io;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use tokio::net::{UnixListener, UnixStream};

    use super::{Endpoint, PendingConnection};

    pub struct UnixSocketEndpoint {
        path: PathBuf,
        address: String,
    }

    impl UnixSocketEndpoint {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            let path = path.into();
            let address = path.display().to_string();
            Self { path, address }
        }
    }

    impl Endpoint for UnixSocketEndpoint {
        type Stream = UnixStream;
        type Pending = PendingUnixSocket;

        fn address(&self) -> &str {
            &self.address
        }

        fn create(&self) -> io::Result<PendingUnixSocket> {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            // Stale socket left by a crashed run
            match std::fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!("Removed stale socket {:?}", self.path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }

            let listener = UnixListener::bind(&self.path)?;

            // The controller runs unprivileged
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o666))
                    .ok();
            }

            Ok(PendingUnixSocket {
                listener,
                path: self.path.clone(),
            })
        }
    }

    pub struct PendingUnixSocket {
        listener: UnixListener,
        path: PathBuf,
    }

    #[async_trait]
    impl PendingConnection for PendingUnixSocket {
        type Stream = UnixStream;

        async fn accept(self) -> io::Result<UnixStream> {
            let (stream, _) = self.listener.accept().await?;
            Ok(stream)
        }
    }

    impl Drop for PendingUnixSocket {
        fn drop(&mut self) {
            // No second client may connect while the first is being served
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove socket {:?}: {}", self.path, e);
                }
            }
        }
    }
}

#[cfg(windows)]
mod named_pipe {
    use std::io;

    use async_trait::async_trait;
    use tokio::net::windows::named_pipe::{NamedPipeServer, PipeMode, ServerOptions};

    use super::{Endpoint, PendingConnection};

    const PIPE_BUFFER_SIZE: u32 = 4096;

    pub struct NamedPipeEndpoint {
        name: String,
    }

    impl NamedPipeEndpoint {
        pub fn new(name: impl Into<String>) -> Self {
            Self { name: name.into() }
        }
    }

    impl Endpoint for NamedPipeEndpoint {
        type Stream = NamedPipeServer;
        type Pending = PendingNamedPipe;

        fn address(&self) -> &str {
            &self.name
        }

        fn create(&self) -> io::Result<PendingNamedPipe> {
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .max_instances(1)
                .pipe_mode(PipeMode::Byte)
                .in_buffer_size(PIPE_BUFFER_SIZE)
                .out_buffer_size(PIPE_BUFFER_SIZE)
                .reject_remote_clients(true)
                .create(&self.name)?;
            Ok(PendingNamedPipe { server })
        }
    }

    pub struct PendingNamedPipe {
        server: NamedPipeServer,
    }

    #[async_trait]
    impl PendingConnection for PendingNamedPipe {
        type Stream = NamedPipeServer;

        async fn accept(self) -> io::Result<NamedPipeServer> {
            self.server.connect().await?;
            Ok(self.server)
        }
    }
}

/// In-process endpoint for exercising the listener without an OS pipe
#[cfg(test)]
pub(crate) mod memory {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::mpsc;

    use super::{Endpoint, PendingConnection};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Failure {
        Create,
        Accept,
    }

    #[derive(Default)]
    struct Shared {
        created: AtomicUsize,
        failures: Mutex<VecDeque<Failure>>,
    }

    pub(crate) struct MemoryEndpoint {
        incoming: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>>,
        shared: Arc<Shared>,
    }

    /// Client side handle plus failure injection
    pub(crate) struct MemoryConnector {
        tx: mpsc::UnboundedSender<DuplexStream>,
        shared: Arc<Shared>,
    }

    pub(crate) fn memory_endpoint() -> (MemoryEndpoint, MemoryConnector) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        (
            MemoryEndpoint {
                incoming: Arc::new(tokio::sync::Mutex::new(rx)),
                shared: Arc::clone(&shared),
            },
            MemoryConnector { tx, shared },
        )
    }

    impl MemoryConnector {
        /// Queue a connection; it is accepted by the next waiting endpoint
        pub(crate) fn connect(&self) -> DuplexStream {
            let (client, server) = duplex(4096);
            self.tx.send(server).expect("listener dropped");
            client
        }

        pub(crate) fn fail_next(&self, failure: Failure) {
            self.shared.failures.lock().unwrap().push_back(failure);
        }

        /// Number of endpoint creation attempts so far
        pub(crate) fn created(&self) -> usize {
            self.shared.created.load(Ordering::SeqCst)
        }
    }

    impl MemoryEndpoint {
        fn take_failure(&self, kind: Failure) -> bool {
            let mut failures = self.shared.failures.lock().unwrap();
            if failures.front() == Some(&kind) {
                failures.pop_front();
                true
            } else {
                false
            }
        }
    }

    impl Endpoint for MemoryEndpoint {
        type Stream = DuplexStream;
        type Pending = PendingMemory;

        fn address(&self) -> &str {
            "memory"
        }

        fn create(&self) -> io::Result<PendingMemory> {
            self.shared.created.fetch_add(1, Ordering::SeqCst);
            if self.take_failure(Failure::Create) {
                return Err(io::Error::other("injected create failure"));
            }
            Ok(PendingMemory {
                incoming: Arc::clone(&self.incoming),
                fail_accept: self.take_failure(Failure::Accept),
            })
        }
    }

    pub(crate) struct PendingMemory {
        incoming: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>>,
        fail_accept: bool,
    }

    #[async_trait]
    impl PendingConnection for PendingMemory {
        type Stream = DuplexStream;

        async fn accept(self) -> io::Result<DuplexStream> {
            if self.fail_accept {
                return Err(io::Error::other("injected accept failure"));
            }
            let mut incoming = self.incoming.lock().await;
            incoming
                .recv()
                .await
                .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }
}
