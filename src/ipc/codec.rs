//! Command and response wire types
//!
//! Requests are `{"Command": <name>, "Payload": <any JSON>}`; replies are
//! `{"status": "success"|"error", "detail": <string or JSON>}` followed by a
//! newline so line-oriented clients can read them with a single call.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DecodeError, FrameError};

/// A decoded request
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    payload: Value,
}

impl Command {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
}

/// Why an error response was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The byte stream did not contain a well-formed frame
    Framing,
    /// The frame was not a valid command object
    Decode,
    /// No handler is registered for the command
    UnknownCommand,
    /// The handler ran and reported a failure
    HandlerFailed,
}

/// Reply to one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub detail: Value,
    #[serde(skip)]
    kind: Option<ErrorKind>,
}

impl Response {
    pub fn success(detail: Value) -> Self {
        Self {
            status: Status::Success,
            detail,
            kind: None,
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            detail: Value::String(message.into()),
            kind: Some(kind),
        }
    }

    pub fn unknown_command(name: &str) -> Self {
        Self::error(ErrorKind::UnknownCommand, format!("unknown command: {}", name))
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Error classification; `None` for successful responses
    pub fn kind(&self) -> Option<ErrorKind> {
        self.kind
    }
}

impl From<FrameError> for Response {
    fn from(error: FrameError) -> Self {
        Self::error(ErrorKind::Framing, format!("malformed frame: {}", error))
    }
}

impl From<DecodeError> for Response {
    fn from(error: DecodeError) -> Self {
        match error {
            DecodeError::UnknownCommand { name } => Self::unknown_command(&name),
            other => Self::error(ErrorKind::Decode, other.to_string()),
        }
    }
}

/// Translates frames to commands and responses to frames
#[derive(Debug, Clone)]
pub struct CommandCodec {
    known: BTreeSet<String>,
}

impl CommandCodec {
    /// Create a codec accepting the given command names, in any letter case
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: names
                .into_iter()
                .map(Into::<String>::into)
                .map(|name| name.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.known.contains(&name.to_ascii_lowercase())
    }

    /// Decode one frame into a command
    pub fn decode(&self, frame: &[u8]) -> Result<Command, DecodeError> {
        let value: Value = serde_json::from_slice(frame)?;
        let Value::Object(mut fields) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let name = match fields.remove("Command") {
            Some(Value::String(name)) => name,
            _ => return Err(DecodeError::MissingCommand),
        };
        if !self.is_known(&name) {
            return Err(DecodeError::UnknownCommand { name });
        }

        let payload = fields.remove("Payload").unwrap_or(Value::Null);
        Ok(Command { name, payload })
    }

    /// Encode a response as one newline-terminated frame
    pub fn encode(&self, response: &Response) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(response).unwrap_or_else(|_| {
            br#"{"status":"error","detail":"Serialization error"}"#.to_vec()
        });
        bytes.push(b'\n');
        bytes
    }
}
