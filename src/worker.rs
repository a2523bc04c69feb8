//! The cooperative scheduler loop running on the worker thread.
//!
//! One tick dispatches at most one command, checks for shutdown requests,
//! runs every registered idle function, fires a due heartbeat, and blocks on
//! a multiplexed wait over the control channels plus any wake handles the
//! idle functions contributed. The worker owns all of this state for its
//! entire life; nothing here is touched from another thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvError, Selector, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::bus::{Command, QuitSignal, Response, OP_GET_UI_HANDLER_NUM, OP_STATE_FORCE_SHUTDOWN};
use crate::config::ServerConfig;
use crate::engine::WorkEngine;
use crate::error::{ControlError, Severity};
use crate::event::{register_event_handler, unregister_event_handler, Event, EventSink};
use crate::idle::{IdleEntry, IdleFn, IdleFnId, IdleStatus, WakeHandle};

/// Base delay for a tick in which no idle function expressed an opinion.
const IDLE_BASE_DELAY: Duration = Duration::from_millis(100);

/// Shared view of the worker thread used for liveness checks and joining.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WorkerHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn attach(&self, handle: JoinHandle<()>) {
        *self.inner.lock() = Some(handle);
    }

    /// Whether the worker thread is currently running. False before the
    /// worker is started and after it has been joined.
    pub fn is_alive(&self) -> bool {
        self.inner
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Wait up to `timeout` for the worker to exit, joining it once it does.
    /// Returns true once the worker is gone.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut guard = self.inner.lock();
                match guard.as_ref() {
                    None => return true,
                    Some(handle) if handle.is_finished() => {
                        let handle = guard.take().expect("handle checked above");
                        drop(guard);
                        if handle.join().is_err() {
                            log::warn!("Worker thread exited by panicking");
                        }
                        return true;
                    }
                    Some(_) => {}
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// What a multiplexed wait woke up for.
enum Wake {
    Command(Result<Command, RecvError>),
    Quit(Result<QuitSignal, RecvError>),
    Watch,
}

pub(crate) struct Worker {
    command_rx: Receiver<Command>,
    response_tx: Sender<Response>,
    quit_rx: Receiver<QuitSignal>,
    events: EventSink,
    engine: Option<Box<dyn WorkEngine>>,
    idle_fns: Vec<IdleEntry>,
    next_idle_id: u64,
    config: ServerConfig,
    heartbeat_interval: Duration,
    next_heartbeat: Instant,
    handler_cell: Arc<AtomicU64>,
    handler_id: u64,
    // A message consumed by the multiplexed wait is stashed here and picked
    // up by the next tick, preserving wake-without-consume semantics.
    pending_command: Option<Command>,
    pending_quit: bool,
    quit: bool,
}

impl Worker {
    pub(crate) fn new(
        command_rx: Receiver<Command>,
        response_tx: Sender<Response>,
        quit_rx: Receiver<QuitSignal>,
        event_tx: Sender<Event>,
        handler_cell: Arc<AtomicU64>,
        config: ServerConfig,
    ) -> Self {
        Self {
            command_rx,
            response_tx,
            quit_rx,
            events: EventSink::new(event_tx),
            engine: None,
            idle_fns: Vec::new(),
            next_idle_id: 1,
            config,
            heartbeat_interval: Duration::from_secs(1),
            next_heartbeat: Instant::now(),
            handler_cell,
            handler_id: 0,
            pending_command: None,
            pending_quit: false,
            quit: false,
        }
    }

    pub(crate) fn set_engine(&mut self, engine: Box<dyn WorkEngine>) {
        self.engine = Some(engine);
    }

    pub(crate) fn has_engine(&self) -> bool {
        self.engine.is_some()
    }

    pub(crate) fn register_idle_function(&mut self, func: IdleFn) -> IdleFnId {
        let id = IdleFnId(self.next_idle_id);
        self.next_idle_id += 1;
        self.idle_fns.push(IdleEntry { id, func });
        id
    }

    /// The worker loop. Runs until a quit signal or a fatal idle-function
    /// failure, then tears down unconditionally.
    pub(crate) fn run(mut self) {
        self.handler_id = register_event_handler();
        self.handler_cell.store(self.handler_id, Ordering::Release);
        self.heartbeat_interval = self.config.heartbeat_interval();
        self.next_heartbeat = Instant::now();
        log::debug!(
            "Worker loop starting, heartbeat every {:?}",
            self.heartbeat_interval
        );
        while !self.quit {
            self.tick();
        }
        self.teardown();
    }

    fn tick(&mut self) {
        if let Err(err) = self.poll_channels() {
            // The tick ends abnormally and the loop resumes, unless the
            // failure signals an already-handled fatal condition.
            if err.severity() == Severity::FatalProcess {
                log::error!("Fatal failure in worker tick: {err}");
                self.quit = true;
            } else {
                log::error!("Error while running command: {err}");
            }
            return;
        }
        let (next_sleep, watches) = self.idle_phase(IDLE_BASE_DELAY);
        if let Some(sleep) = next_sleep {
            self.idle_wait(sleep, &watches);
        }
    }

    /// Dispatch one pending command and check the quit channel.
    fn poll_channels(&mut self) -> Result<(), ControlError> {
        let command = match self.pending_command.take() {
            Some(command) => Some(command),
            None => match self.command_rx.try_recv() {
                Ok(command) => Some(command),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => {
                    log::warn!("Command channel closed by the client; shutting down");
                    self.quit = true;
                    None
                }
            },
        };
        if let Some(command) = command {
            let response = self.dispatch(&command)?;
            if self.response_tx.send(response).is_err() {
                log::warn!(
                    "Client went away before the response to {} could be delivered",
                    command.op
                );
            }
        }

        let quit_requested = std::mem::take(&mut self.pending_quit)
            || match self.quit_rx.try_recv() {
                Ok(_) => true,
                Err(TryRecvError::Empty) => false,
                // The sender side is gone; nobody can ask us to stop later.
                Err(TryRecvError::Disconnected) => true,
            };
        if quit_requested {
            self.quit = true;
            if let Some(engine) = self.engine.as_mut() {
                // Best-effort: a failed force-shutdown request must not keep
                // the worker alive.
                let _ = engine.run_command(&Command::bare(OP_STATE_FORCE_SHUTDOWN), &self.events);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, command: &Command) -> Result<Response, ControlError> {
        if command.op == OP_GET_UI_HANDLER_NUM {
            return Ok(Response::ok(serde_json::json!(self.handler_id)));
        }
        match self.engine.as_mut() {
            Some(engine) => engine.run_command(command, &self.events),
            None => Err(ControlError::EngineMissing),
        }
    }

    /// Run every registered idle function, fire a due heartbeat, and compute
    /// the bounded sleep for this tick. `None` means re-poll immediately.
    fn idle_phase(&mut self, base_delay: Duration) -> (Option<Duration>, Vec<WakeHandle>) {
        let mut next_sleep = Some(base_delay);
        let mut watches: Vec<WakeHandle> = Vec::new();
        let mut remove: Vec<IdleFnId> = Vec::new();

        for ix in 0..self.idle_fns.len() {
            let entry = &mut self.idle_fns[ix];
            match (entry.func)(false) {
                Ok(IdleStatus::Finished) => {
                    remove.push(entry.id);
                    next_sleep = None;
                }
                Ok(IdleStatus::Ready) => next_sleep = None,
                Ok(IdleStatus::SleepFor(delay)) => {
                    // Only meaningful while some wait is still planned.
                    if let Some(current) = next_sleep {
                        next_sleep = Some(current.min(delay));
                    }
                }
                Ok(IdleStatus::Watch(handles)) => {
                    if next_sleep.is_some() {
                        watches.extend(handles);
                    }
                }
                Err(err) => {
                    // A misbehaving idle function is fatal to the whole
                    // worker, not just to itself.
                    if !matches!(err, ControlError::Handled) {
                        log::error!("Idle function failed: {err}");
                    }
                    remove.push(entry.id);
                    self.quit = true;
                }
            }
        }
        if !remove.is_empty() {
            self.idle_fns.retain(|entry| !remove.contains(&entry.id));
        }

        let now = Instant::now();
        if now >= self.next_heartbeat {
            // Missed intervals collapse into a single event.
            self.next_heartbeat += self.heartbeat_interval;
            if self.next_heartbeat <= now {
                self.next_heartbeat = now + self.heartbeat_interval;
            }
            self.events.send(Event::Heartbeat { at: chrono::Local::now() });
        }
        if let Some(sleep) = next_sleep {
            if now + sleep > self.next_heartbeat {
                // Shorten the wait so we wake exactly at the heartbeat.
                next_sleep = Some(self.next_heartbeat - now);
            }
        }
        (next_sleep, watches)
    }

    /// Block on the multiplexed wait: command channel, quit channel, and any
    /// wake handles contributed by idle functions, bounded by `sleep`.
    fn idle_wait(&mut self, sleep: Duration, watches: &[WakeHandle]) {
        let mut selector = Selector::new()
            .recv(&self.command_rx, Wake::Command)
            .recv(&self.quit_rx, Wake::Quit);
        for watch in watches {
            selector = selector.recv(watch, |_| Wake::Watch);
        }
        match selector.wait_timeout(sleep) {
            Ok(Wake::Command(Ok(command))) => self.pending_command = Some(command),
            Ok(Wake::Command(Err(_))) => {
                log::warn!("Command channel closed by the client; shutting down");
                self.quit = true;
            }
            Ok(Wake::Quit(_)) => self.pending_quit = true,
            // An early wake is normal, whether from an idle function's wake
            // handle or from the timeout itself.
            Ok(Wake::Watch) => {}
            Err(_) => {}
        }
    }

    /// Unconditional teardown, reached exactly once from any quit path.
    fn teardown(mut self) {
        log::debug!("Worker loop stopped, tearing down");
        self.events.close();
        unregister_event_handler(self.handler_id);
        drop(self.command_rx);
        drop(self.response_tx);
        if let Some(mut engine) = self.engine.take() {
            engine.shutdown(true);
        }
        drop(self.quit_rx);
    }
}
