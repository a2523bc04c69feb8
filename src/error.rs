//! Error type and severity classification for the coordination layer.

use thiserror::Error;

/// How far a failure propagates.
///
/// `Retryable` failures are contained in the tick or call that produced them.
/// `FatalLocal` failures abort the current call but leave the process usable.
/// `FatalProcess` failures break the single-outstanding-request protocol,
/// which has no way to resynchronize; the embedding driver is expected to
/// exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Retryable,
    FatalLocal,
    FatalProcess,
}

/// Failures surfaced by the client/worker coordination layer.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The worker is not running; nothing was sent.
    #[error("build server is not running")]
    WorkerUnavailable,

    /// Four consecutive response-wait stages expired with no answer.
    #[error("gave up; too many tries: timeout while attempting to communicate with the build server")]
    ResponseTimeout,

    /// The worker died while a response or more events were still expected.
    #[error("lost connection to the build server")]
    WorkerLost,

    /// The connection has already been torn down.
    #[error("connection already terminated")]
    Terminated,

    /// A connection was already established for this supervisor.
    #[error("connection already established")]
    AlreadyConnected,

    /// No work engine was attached before the worker was started.
    #[error("no work engine attached to the server")]
    EngineMissing,

    /// The worker was asked to start twice.
    #[error("server already detached")]
    AlreadyDetached,

    /// The worker thread could not be spawned.
    #[error("failed to start the worker thread")]
    Spawn(#[source] std::io::Error),

    /// Marker for a failure that was already logged where it occurred.
    #[error("failure already reported")]
    Handled,

    /// Failure inside the work engine while executing a command.
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

impl ControlError {
    pub fn severity(&self) -> Severity {
        match self {
            ControlError::ResponseTimeout | ControlError::WorkerLost => Severity::FatalProcess,
            ControlError::WorkerUnavailable
            | ControlError::Terminated
            | ControlError::AlreadyConnected
            | ControlError::EngineMissing
            | ControlError::AlreadyDetached
            | ControlError::Spawn(_) => Severity::FatalLocal,
            ControlError::Handled | ControlError::Engine(_) => Severity::Retryable,
        }
    }

    /// Terminate the current process with a non-zero status.
    ///
    /// Top-level drivers route `FatalProcess` failures here; once the worker
    /// is lost mid-drain there is nothing left for the client to do.
    pub fn abort(&self) -> ! {
        log::error!("{self}");
        std::process::exit(1);
    }
}
