//! Factory that wires the channels, spawns the worker, and performs the
//! startup handshake.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use flume::{Receiver, Sender};
use serde_json::Value;

use crate::bus::{Command, QuitSignal, Response, ServerChannels, OP_SET_FEATURES};
use crate::config::ServerConfig;
use crate::connection::ServerConnection;
use crate::engine::WorkEngine;
use crate::error::ControlError;
use crate::event::{Event, EventQueue};
use crate::idle::{IdleFn, IdleFnId};
use crate::proxy::RequestProxy;
use crate::signals;
use crate::worker::{Worker, WorkerHandle};

/// Owns the server wiring: allocates every channel and queue before the
/// worker starts, spawns the worker thread, and builds the client
/// connection.
pub struct Supervisor {
    worker: Option<Worker>,
    handle: WorkerHandle,
    events: Arc<EventQueue>,
    command_tx: Option<Sender<Command>>,
    response_rx: Option<Receiver<Response>>,
    quit_tx: Option<Sender<QuitSignal>>,
    event_tx: Option<Sender<Event>>,
    handler_cell: Arc<AtomicU64>,
    connection: Option<Arc<ServerConnection>>,
}

impl Supervisor {
    /// Allocate channels, the event queue, and the worker state. Nothing
    /// runs yet.
    pub fn new(config: ServerConfig) -> Self {
        let channels = ServerChannels::new();
        let handle = WorkerHandle::new();
        let handler_cell = Arc::new(AtomicU64::new(0));
        let events = Arc::new(EventQueue::new(channels.event_rx, handle.clone()));
        let worker = Worker::new(
            channels.command_rx,
            channels.response_tx,
            channels.quit_rx,
            channels.event_tx.clone(),
            handler_cell.clone(),
            config,
        );
        Self {
            worker: Some(worker),
            handle,
            events,
            command_tx: Some(channels.command_tx),
            response_rx: Some(channels.response_rx),
            quit_tx: Some(channels.quit_tx),
            event_tx: Some(channels.event_tx),
            handler_cell,
            connection: None,
        }
    }

    /// Inject the engine that executes commands. The worker cannot start
    /// without one.
    pub fn add_work_engine(&mut self, engine: Box<dyn WorkEngine>) -> Result<(), ControlError> {
        match self.worker.as_mut() {
            Some(worker) => {
                worker.set_engine(engine);
                Ok(())
            }
            None => Err(ControlError::AlreadyDetached),
        }
    }

    /// Register an idle function. Idle functions run on the worker thread,
    /// so registration must happen before [`detach`](Self::detach).
    pub fn register_idle_function(&mut self, func: IdleFn) -> Result<IdleFnId, ControlError> {
        match self.worker.as_mut() {
            Some(worker) => Ok(worker.register_idle_function(func)),
            None => Err(ControlError::AlreadyDetached),
        }
    }

    /// Start the worker thread. Returns immediately; readiness is checked by
    /// the [`establish_connection`](Self::establish_connection) handshake.
    pub fn detach(&mut self) -> Result<(), ControlError> {
        let worker = self.worker.take().ok_or(ControlError::AlreadyDetached)?;
        if !worker.has_engine() {
            self.worker = Some(worker);
            return Err(ControlError::EngineMissing);
        }
        let handle = std::thread::Builder::new()
            .name("kiln-worker".into())
            .spawn(move || worker.run())
            .map_err(ControlError::Spawn)?;
        self.handle.attach(handle);
        Ok(())
    }

    /// Build the client connection and perform the `setFeatures` handshake,
    /// which doubles as the readiness check: the proxy blocks and retries
    /// until the worker responds or the wait escalates to a fatal timeout.
    /// Installs the Ctrl-C forwarder and the SIGTERM watcher.
    pub fn establish_connection(
        &mut self,
        featureset: Vec<Value>,
    ) -> Result<Arc<ServerConnection>, ControlError> {
        let command_tx = self.command_tx.take().ok_or(ControlError::AlreadyConnected)?;
        let response_rx = self.response_rx.take().ok_or(ControlError::AlreadyConnected)?;
        let quit_tx = self.quit_tx.take().ok_or(ControlError::AlreadyConnected)?;
        let event_tx = self.event_tx.take().ok_or(ControlError::AlreadyConnected)?;

        let (interrupt_tx, interrupt_rx) = flume::unbounded();
        let proxy = RequestProxy::new(
            command_tx,
            response_rx,
            self.handle.clone(),
            Some(interrupt_rx),
        );
        let connection = Arc::new(ServerConnection::new(
            proxy,
            self.events.clone(),
            quit_tx,
            event_tx,
            self.handle.clone(),
        ));

        let response =
            connection.run_command(Command::new(OP_SET_FEATURES, vec![Value::Array(featureset)]))?;
        if let Some(error) = response.error {
            log::error!("Unable to set the server featureset: {error}");
            return Err(ControlError::Engine(anyhow::anyhow!(error)));
        }

        signals::install_interrupt_forwarder(interrupt_tx);
        signals::install_sigterm_watcher(connection.clone());

        self.connection = Some(connection.clone());
        Ok(connection)
    }

    /// The shared event queue.
    pub fn events(&self) -> Arc<EventQueue> {
        self.events.clone()
    }

    /// Liveness/join view of the worker thread.
    pub fn worker_handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Tear the session down through the connection, if one was established.
    pub fn end_session(&self) {
        if let Some(connection) = &self.connection {
            connection.terminate();
        }
    }
}
