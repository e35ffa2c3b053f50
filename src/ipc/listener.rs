//! Accept loop
//!
//! Creates the endpoint, waits for a client, serves it to completion and
//! starts over. Creation and accept failures are retried after a fixed delay
//! for as long as the service runs (or until the optional retry cap is hit).

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::codec::CommandCodec;
use super::dispatch::CommandDispatcher;
use super::endpoint::{Endpoint, PendingConnection};
use super::session::{ConnectionSession, SessionLimits};
use super::ConnectionState;
use crate::error::{ServiceError, TransportError};

/// Backoff between endpoint failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed delay before the next attempt
    pub delay: Duration,
    /// Consecutive failures tolerated; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_retries: None,
        }
    }
}

pub struct ListenerLoop<E: Endpoint> {
    endpoint: E,
    dispatcher: CommandDispatcher,
    codec: CommandCodec,
    retry: RetryPolicy,
    limits: SessionLimits,
    state: watch::Sender<ConnectionState>,
}

impl<E: Endpoint> ListenerLoop<E> {
    pub fn new(endpoint: E, dispatcher: CommandDispatcher) -> Self {
        let codec = dispatcher.codec();
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            endpoint,
            dispatcher,
            codec,
            retry: RetryPolicy::default(),
            limits: SessionLimits::default(),
            state,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn address(&self) -> &str {
        self.endpoint.address()
    }

    /// Observe connection state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Serve clients until `cancel` fires.
    ///
    /// Only returns an error when the retry cap is exhausted.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServiceError> {
        let mut failures: u32 = 0;

        while !cancel.is_cancelled() {
            self.state.send_replace(ConnectionState::Idle);

            let pending = match self.endpoint.create() {
                Ok(pending) => {
                    tracing::info!("Endpoint created: {}", self.address());
                    pending
                }
                Err(source) => {
                    let error = TransportError::CreateFailed {
                        address: self.address().to_string(),
                        source,
                    };
                    tracing::error!("{}", error);
                    if !self.backoff(&mut failures, &cancel).await? {
                        break;
                    }
                    continue;
                }
            };

            self.state.send_replace(ConnectionState::WaitingForClient);
            tracing::info!("Waiting for client connection...");

            // Dropping the accept future on stop releases the endpoint
            let accepted = tokio::select! {
                _ = cancel.cancelled() => None,
                accepted = pending.accept() => Some(accepted),
            };
            let Some(accepted) = accepted else {
                break;
            };

            match accepted {
                Ok(stream) => {
                    failures = 0;
                    self.state.send_replace(ConnectionState::Connected);
                    tracing::info!("Client connected");

                    let summary = ConnectionSession::new(
                        stream,
                        &self.codec,
                        &self.dispatcher,
                        self.limits,
                        cancel.clone(),
                    )
                    .with_state(&self.state)
                    .run()
                    .await;

                    tracing::info!(
                        "Client disconnected ({:?}, {} commands, {} rejected frames)",
                        summary.end,
                        summary.dispatched,
                        summary.rejected
                    );
                }
                Err(source) => {
                    let error = TransportError::AcceptFailed {
                        address: self.address().to_string(),
                        source,
                    };
                    tracing::error!("{}", error);
                    if !self.backoff(&mut failures, &cancel).await? {
                        break;
                    }
                }
            }
        }

        self.state.send_replace(ConnectionState::Idle);
        tracing::info!("Listener on {} exiting", self.address());
        Ok(())
    }

    /// Wait before the next attempt. Returns `false` if stop arrived meanwhile.
    async fn backoff(
        &self,
        failures: &mut u32,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        *failures += 1;
        if let Some(max) = self.retry.max_retries {
            if *failures > max {
                return Err(TransportError::RetriesExhausted {
                    address: self.address().to_string(),
                    attempts: *failures,
                }
                .into());
            }
        }

        tracing::info!(
            "Retrying in {:?} (consecutive failures: {})",
            self.retry.delay,
            failures
        );
        tokio::select! {
            _ = cancel.cancelled() => Ok(false),
            _ = tokio::time::sleep(self.retry.delay) => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::ipc::dispatch::HandlerRegistry;
    use crate::ipc::endpoint::memory::{memory_endpoint, Failure, MemoryConnector, MemoryEndpoint};
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn listener(retry: RetryPolicy) -> (ListenerLoop<MemoryEndpoint>, MemoryConnector) {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("Ping", |_| Ok(json!("pong")))
            .register_fn("Fail", |_| Err(HandlerError::new("nope")));
        let (endpoint, connector) = memory_endpoint();
        let listener = ListenerLoop::new(endpoint, CommandDispatcher::new(registry))
            .with_retry_policy(retry);
        (listener, connector)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_millis(10),
            max_retries: None,
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn request<S>(stream: &mut BufReader<S>, frame: &[u8]) -> Value
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        stream.get_mut().write_all(frame).await.unwrap();
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_serves_client_and_recreates_endpoint() {
        let (listener, connector) = listener(fast_retry());
        let state = listener.subscribe();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(listener.run(cancel.clone()));

        let mut client = BufReader::new(connector.connect());
        let reply = request(&mut client, br#"{"Command":"Ping","Payload":{}}"#).await;
        assert_eq!(reply, json!({"status": "success", "detail": "pong"}));
        drop(client);

        eventually(|| {
            connector.created() == 2 && *state.borrow() == ConnectionState::WaitingForClient
        })
        .await;

        let mut client = BufReader::new(connector.connect());
        let reply = request(&mut client, br#"{"Command":"Ping"}"#).await;
        assert_eq!(reply["detail"], json!("pong"));

        cancel.cancel();
        worker.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_unknown_command_leaves_connection_state() {
        let (listener, connector) = listener(fast_retry());
        let state = listener.subscribe();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(listener.run(cancel.clone()));

        let mut client = BufReader::new(connector.connect());
        let reply = request(&mut client, br#"{"Command":"Explode","Payload":{}}"#).await;
        assert_eq!(reply["status"], json!("error"));
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        let reply = request(&mut client, br#"{"Command":"Fail","Payload":{}}"#).await;
        assert_eq!(reply, json!({"status": "error", "detail": "nope"}));
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        cancel.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_mid_frame_resumes_waiting() {
        let (listener, connector) = listener(fast_retry());
        let state = listener.subscribe();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(listener.run(cancel.clone()));

        let mut client = connector.connect();
        client.write_all(br#"{"Command":"Pi"#).await.unwrap();
        drop(client);

        eventually(|| {
            connector.created() == 2 && *state.borrow() == ConnectionState::WaitingForClient
        })
        .await;
        assert!(!worker.is_finished());

        cancel.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_create_failures_are_retried() {
        let (listener, connector) = listener(fast_retry());
        connector.fail_next(Failure::Create);
        connector.fail_next(Failure::Create);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(listener.run(cancel.clone()));

        let mut client = BufReader::new(connector.connect());
        let reply = request(&mut client, br#"{"Command":"Ping"}"#).await;
        assert_eq!(reply["detail"], json!("pong"));
        assert_eq!(connector.created(), 3);

        cancel.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_accept_failure_is_retried() {
        let (listener, connector) = listener(fast_retry());
        connector.fail_next(Failure::Accept);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(listener.run(cancel.clone()));

        let mut client = BufReader::new(connector.connect());
        let reply = request(&mut client, br#"{"Command":"Ping"}"#).await;
        assert_eq!(reply["detail"], json!("pong"));
        assert_eq!(connector.created(), 2);

        cancel.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_retry_cap() {
        let (listener, connector) = listener(RetryPolicy {
            delay: Duration::from_millis(1),
            max_retries: Some(2),
        });
        for _ in 0..3 {
            connector.fail_next(Failure::Create);
        }

        let result = listener.run(CancellationToken::new()).await;
        match result {
            Err(ServiceError::Transport(TransportError::RetriesExhausted { attempts, .. })) => {
                assert_eq!(attempts, 3)
            }
            other => panic!("expected retries exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_while_waiting_for_client() {
        let (listener, _connector) = listener(fast_retry());
        let state = listener.subscribe();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(listener.run(cancel.clone()));

        eventually(|| *state.borrow() == ConnectionState::WaitingForClient).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("listener did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_during_backoff() {
        let (listener, connector) = listener(RetryPolicy {
            delay: Duration::from_secs(3600),
            max_retries: None,
        });
        connector.fail_next(Failure::Create);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(listener.run(cancel.clone()));

        eventually(|| connector.created() == 1).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("listener stuck in backoff")
            .unwrap()
            .unwrap();
        assert_eq!(connector.created(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_end_to_end() {
        use crate::ipc::endpoint::UnixSocketEndpoint;
        use tokio::net::UnixStream;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("wgpipe.sock");

        let mut registry = HandlerRegistry::new();
        registry.register_fn("Ping", |_| Ok(json!("pong")));
        let listener = ListenerLoop::new(
            UnixSocketEndpoint::new(&path),
            CommandDispatcher::new(registry),
        )
        .with_retry_policy(fast_retry());
        let state = listener.subscribe();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(listener.run(cancel.clone()));

        eventually(|| *state.borrow() == ConnectionState::WaitingForClient).await;

        let stream = UnixStream::connect(&path).await.unwrap();
        let mut client = BufReader::new(stream);
        // Split write: the frame arrives in two pieces
        client.get_mut().write_all(br#"{"Command":"Pi"#).await.unwrap();
        let reply = request(&mut client, br#"ng","Payload":{"s":"}"}}"#).await;
        assert_eq!(reply["detail"], json!("pong"));

        // The socket path is not connectable while a client is being served
        assert!(!path.exists());

        drop(client);
        eventually(|| path.exists()).await;

        cancel.cancel();
        worker.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
