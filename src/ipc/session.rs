//! One connected client
//!
//! Reads chunks, reassembles frames, dispatches commands strictly in arrival
//! order and writes each reply before reading further input.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::codec::{CommandCodec, Response};
use super::dispatch::CommandDispatcher;
use super::frame::FrameAssembler;
use super::ConnectionState;

/// Read and buffering limits for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Bytes requested per read
    pub chunk_size: usize,
    /// Largest frame accepted
    pub max_frame_bytes: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client closed its end
    Disconnected,
    /// Stop was signalled
    Stopped,
    ReadFailed,
    WriteFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub end: SessionEnd,
    /// Commands decoded and dispatched
    pub dispatched: u64,
    /// Frames answered with a framing or decode error
    pub rejected: u64,
}

pub struct ConnectionSession<'a, S> {
    stream: S,
    assembler: FrameAssembler,
    codec: &'a CommandCodec,
    dispatcher: &'a CommandDispatcher,
    cancel: CancellationToken,
    chunk_size: usize,
    state: Option<&'a watch::Sender<ConnectionState>>,
    dispatched: u64,
    rejected: u64,
}

impl<'a, S> ConnectionSession<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        codec: &'a CommandCodec,
        dispatcher: &'a CommandDispatcher,
        limits: SessionLimits,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            assembler: FrameAssembler::new(limits.max_frame_bytes),
            codec,
            dispatcher,
            cancel,
            chunk_size: limits.chunk_size.max(1),
            state: None,
            dispatched: 0,
            rejected: 0,
        }
    }

    /// Publish `Draining` on this channel when the session starts closing
    pub fn with_state(mut self, state: &'a watch::Sender<ConnectionState>) -> Self {
        self.state = Some(state);
        self
    }

    /// Serve the client until it disconnects or stop is signalled.
    ///
    /// Consumes the session, so the channel is closed exactly once on return.
    pub async fn run(mut self) -> SessionSummary {
        let end = self.serve().await;

        if let Some(state) = self.state {
            state.send_replace(ConnectionState::Draining);
        }
        if self.assembler.buffered() > 0 {
            tracing::debug!(
                "Dropping {} buffered bytes of an incomplete frame",
                self.assembler.buffered()
            );
        }
        self.assembler.reset();

        // Dropping the stream closes it; a graceful shutdown is skipped when stopping
        if end != SessionEnd::Stopped {
            if let Err(e) = self.stream.shutdown().await {
                tracing::debug!("Channel shutdown: {}", e);
            }
        }

        SessionSummary {
            end,
            dispatched: self.dispatched,
            rejected: self.rejected,
        }
    }

    async fn serve(&mut self) -> SessionEnd {
        let mut chunk = vec![0u8; self.chunk_size];

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Stopped,
                read = self.stream.read(&mut chunk) => read,
            };

            let n = match read {
                Ok(0) => return SessionEnd::Disconnected,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("Read error: {}", e);
                    return SessionEnd::ReadFailed;
                }
            };

            for frame in self.assembler.feed(&chunk[..n]) {
                let response = match frame {
                    Ok(bytes) => match self.codec.decode(&bytes) {
                        Ok(command) => {
                            self.dispatched += 1;
                            self.dispatcher.dispatch(command).await
                        }
                        Err(e) => {
                            tracing::warn!("Rejecting frame: {}", e);
                            self.rejected += 1;
                            Response::from(e)
                        }
                    },
                    Err(e) => {
                        tracing::warn!("Discarding malformed input: {}", e);
                        self.rejected += 1;
                        Response::from(e)
                    }
                };

                let bytes = self.codec.encode(&response);
                let written = tokio::select! {
                    _ = self.cancel.cancelled() => return SessionEnd::Stopped,
                    written = write_frame(&mut self.stream, &bytes) => written,
                };
                if let Err(e) = written {
                    tracing::warn!("Failed to write response: {}", e);
                    return SessionEnd::WriteFailed;
                }
            }
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
