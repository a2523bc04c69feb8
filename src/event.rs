//! The event stream: producer sink, consumer queue, and the payload types
//! flowing worker → client.
//!
//! Events are FIFO among themselves but carry no ordering relative to
//! command/response traffic, which travels on a separate channel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local};
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ControlError;
use crate::worker::WorkerHandle;

/// Log entry severity carried over the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_level(self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

/// A log record produced inside the worker. The client consumes these
/// locally through its own logger instead of forwarding them to the
/// embedder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn info(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, target, message)
    }

    pub fn warning(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, target, message)
    }

    pub fn error(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, target, message)
    }

    /// Re-dispatch the record into the local `log` pipeline.
    pub fn emit(&self) {
        log::log!(target: self.target.as_str(), self.level.as_level(), "{}", self.message);
    }
}

/// A tagged value flowing worker → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Opaque domain event, forwarded to the embedder as-is.
    Domain(Value),
    /// Log record, consumed locally by the client's logger.
    Log(LogRecord),
    /// Periodic liveness event. Missed intervals collapse into one.
    Heartbeat { at: DateTime<Local> },
}

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);
static ACTIVE_HANDLERS: Lazy<Mutex<HashSet<u64>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Register an event handler slot, returning its id. The worker publishes
/// the id through a one-shot cell read by the client via `getUIHandlerNum`.
pub(crate) fn register_event_handler() -> u64 {
    let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed);
    ACTIVE_HANDLERS.lock().insert(id);
    id
}

pub(crate) fn unregister_event_handler(id: u64) {
    if !ACTIVE_HANDLERS.lock().remove(&id) {
        log::warn!("Attempted to unregister unknown event handler {id}");
    }
}

/// Producer side of the event stream.
///
/// Sends are best-effort: the event path must never crash a caller that sits
/// deep inside command execution or the idle loop, so every failure is
/// logged and swallowed.
#[derive(Debug)]
pub struct EventSink {
    tx: Option<Sender<Event>>,
}

impl EventSink {
    pub(crate) fn new(tx: Sender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn send(&self, event: Event) {
        match &self.tx {
            Some(tx) => {
                if let Err(err) = tx.send(event) {
                    log::warn!("Event sink dropped an event: {err}");
                }
            }
            None => log::warn!("Event sink is closed; dropping event"),
        }
    }

    /// Drop the producer side. Subsequent sends are dropped with a warning.
    pub(crate) fn close(&mut self) {
        self.tx = None;
    }
}

/// Liveness-aware consumer wrapper over the event stream.
///
/// Once the worker is confirmed dead no further events can arrive, so
/// blocking reads degrade to non-blocking ones and a drain loop gets a
/// deterministic stop: [`ControlError::WorkerLost`], a process-fatal
/// condition for the top-level driver.
pub struct EventQueue {
    rx: Receiver<Event>,
    worker: WorkerHandle,
    exited: AtomicBool,
}

impl EventQueue {
    pub(crate) fn new(rx: Receiver<Event>, worker: WorkerHandle) -> Self {
        Self {
            rx,
            worker,
            exited: AtomicBool::new(false),
        }
    }

    /// Bounded or non-blocking read. A zero timeout never blocks, under any
    /// queue state.
    pub fn wait_event(&self, timeout: Duration) -> Result<Option<Event>, ControlError> {
        if self.exited.load(Ordering::Acquire) {
            return self.get_event();
        }
        if !self.worker.is_alive() {
            return self.get_event();
        }
        if timeout.is_zero() {
            return Ok(self.rx.try_recv().ok());
        }
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    /// Non-blocking read. Losing the worker with nothing left to read is
    /// unrecoverable for the client: the error carries
    /// [`Severity::FatalProcess`](crate::error::Severity) and the driver is
    /// expected to exit with a non-zero status.
    pub fn get_event(&self) -> Result<Option<Event>, ControlError> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                if !self.worker.is_alive() {
                    self.set_exited();
                }
                if self.exited.load(Ordering::Acquire) {
                    Err(ControlError::WorkerLost)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// One-way latch: no further events are expected.
    pub fn set_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Raw non-blocking read with none of the liveness handling, for the
    /// teardown flush loop.
    pub(crate) fn drain_next(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
