//! Command dispatch
//!
//! Maps a command name to a [`CommandHandler`] and turns whatever the handler
//! does (success, failure or panic) into a [`Response`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::task::AbortOnDropHandle;

use super::codec::{Command, CommandCodec, ErrorKind, Response};
use crate::error::HandlerError;

/// Executes one kind of command
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Value) -> Result<Value, HandlerError>;
}

/// Adapter for plain closures
struct FnHandler<F>(F);

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, payload: Value) -> Result<Value, HandlerError> {
        (self.0)(payload)
    }
}

/// Name → handler table. Names match case-insensitively.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn register<H: CommandHandler>(&mut self, name: impl Into<String>, handler: H) -> &mut Self {
        let name: String = name.into();
        self.handlers.insert(name.to_ascii_lowercase(), Arc::new(handler));
        self
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(name, FnHandler(f))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Registered names, lowercased
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Runs commands against a fixed registry
#[derive(Clone)]
pub struct CommandDispatcher {
    registry: HandlerRegistry,
}

impl CommandDispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    /// Codec that accepts exactly the registered command names
    pub fn codec(&self) -> CommandCodec {
        CommandCodec::new(self.registry.names())
    }

    /// Execute a command and produce its response.
    ///
    /// Never fails: a missing handler, a handler error and a handler panic all
    /// become error responses.
    pub async fn dispatch(&self, command: Command) -> Response {
        let Some(handler) = self.registry.get(command.name()) else {
            tracing::warn!("No handler for command: {}", command.name());
            return Response::unknown_command(command.name());
        };

        let name = command.name().to_string();
        tracing::debug!("Dispatching command: {}", name);

        // Run on its own task so a panicking handler cannot take the session down.
        // The task is aborted if this future is dropped.
        let payload = command.into_payload();
        let task = tokio::spawn(async move { handler.handle(payload).await });
        let result = AbortOnDropHandle::new(task).await;

        match result {
            Ok(Ok(detail)) => {
                tracing::info!("Command '{}' succeeded", name);
                Response::success(detail)
            }
            Ok(Err(e)) => {
                tracing::warn!("Command '{}' failed: {}", name, e);
                Response::error(ErrorKind::HandlerFailed, e.message)
            }
            Err(e) => {
                tracing::error!("Command '{}' handler aborted: {}", name, e);
                Response::error(
                    ErrorKind::HandlerFailed,
                    format!("handler for {} aborted", name),
                )
            }
        }
    }
}
