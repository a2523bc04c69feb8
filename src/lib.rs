//! Kiln — coordination layer between a foreground client and a background
//! build worker.
//!
//! The crate provides the plumbing around a single client/worker pair: a
//! strict single-outstanding-request command/response channel, a decoupled
//! event stream, a cooperative scheduler running inside the worker (command
//! dispatch, heartbeat emission, caller-registered idle work), and a
//! liveness-aware shutdown protocol that tolerates a worker that has died,
//! hung, or is mid-command.
//!
//! What individual commands mean, how work is computed, and how events are
//! rendered are the embedder's business: commands pass through opaquely to
//! an injected [`WorkEngine`] and events flow back untouched, except for log
//! records, which re-enter the local `log` pipeline on the client side.
//!
//! Typical wiring:
//!
//! ```no_run
//! use kiln::{Command, ServerConfig, Supervisor};
//!
//! # fn engine() -> Box<dyn kiln::WorkEngine> { unimplemented!() }
//! let mut supervisor = Supervisor::new(ServerConfig::from_env());
//! supervisor.add_work_engine(engine()).unwrap();
//! supervisor.detach().unwrap();
//! let connection = supervisor.establish_connection(Vec::new()).unwrap();
//! let response = connection.run_command(Command::bare("buildTargets")).unwrap();
//! # let _ = response;
//! connection.terminate();
//! ```

pub mod boot;
pub mod bus;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod event;
pub mod idle;
pub mod proxy;
mod signals;
pub mod supervisor;
pub mod worker;

pub use bus::{
    Command, QuitSignal, Response, OP_GET_UI_HANDLER_NUM, OP_SET_FEATURES,
    OP_STATE_FORCE_SHUTDOWN,
};
pub use config::ServerConfig;
pub use connection::ServerConnection;
pub use engine::WorkEngine;
pub use error::{ControlError, Severity};
pub use event::{Event, EventQueue, EventSink, LogLevel, LogRecord};
pub use idle::{IdleFn, IdleFnId, IdleStatus, WakeHandle};
pub use proxy::RequestProxy;
pub use supervisor::Supervisor;
pub use worker::WorkerHandle;
