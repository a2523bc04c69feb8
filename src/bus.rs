//! Message types for the client ↔ worker control links.
//!
//! Two unidirectional control links (quit signal, command/response) plus the
//! event stream, all built on flume channels. The command channel carries a
//! strict request/response alternation: exactly one command may be
//! outstanding at a time, and the next response on the channel always
//! belongs to the most recently sent command.

use flume::{Receiver, Sender};
use serde::de::Error as _;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::event::Event;

/// Operation names recognized by this layer itself. Everything else passes
/// through opaquely to the work engine.
pub const OP_GET_UI_HANDLER_NUM: &str = "getUIHandlerNum";
pub const OP_SET_FEATURES: &str = "setFeatures";
pub const OP_STATE_FORCE_SHUTDOWN: &str = "stateForceShutdown";

/// A command sent from the client to the worker.
///
/// On the wire this is the ordered list `[op, ...args]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub op: String,
    pub args: Vec<Value>,
}

impl Command {
    pub fn new(op: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            op: op.into(),
            args,
        }
    }

    /// A command with no arguments.
    pub fn bare(op: impl Into<String>) -> Self {
        Self::new(op, Vec::new())
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(1 + self.args.len()))?;
        seq.serialize_element(&self.op)?;
        for arg in &self.args {
            seq.serialize_element(arg)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut parts = Vec::<Value>::deserialize(deserializer)?;
        if parts.is_empty() {
            return Err(D::Error::invalid_length(0, &"a non-empty command list"));
        }
        let op = match parts.remove(0) {
            Value::String(op) => op,
            other => {
                return Err(D::Error::custom(format!(
                    "command name must be a string, got {other}"
                )))
            }
        };
        Ok(Self { op, args: parts })
    }
}

/// The `(result, error)` pair answering a command.
///
/// A non-null `error` signals command-level failure without tearing down the
/// channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// Messages on the quit-signal channel. The worker ignores the payload; any
/// message requests shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuitSignal {
    Quit,
}

/// Every channel endpoint, created up front by the supervisor before the
/// worker starts.
pub(crate) struct ServerChannels {
    pub command_tx: Sender<Command>,
    pub command_rx: Receiver<Command>,
    pub response_tx: Sender<Response>,
    pub response_rx: Receiver<Response>,
    pub quit_tx: Sender<QuitSignal>,
    pub quit_rx: Receiver<QuitSignal>,
    pub event_tx: Sender<Event>,
    pub event_rx: Receiver<Event>,
}

impl ServerChannels {
    pub fn new() -> Self {
        let (command_tx, command_rx) = flume::unbounded();
        let (response_tx, response_rx) = flume::unbounded();
        let (quit_tx, quit_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        Self {
            command_tx,
            command_rx,
            response_tx,
            response_rx,
            quit_tx,
            quit_rx,
            event_tx,
            event_rx,
        }
    }
}
