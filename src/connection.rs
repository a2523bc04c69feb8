//! Client-side connection lifecycle: synchronous calls after the handshake,
//! SIGTERM-triggered graceful shutdown, and teardown/draining.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::Sender;
use parking_lot::Mutex;

use crate::bus::{Command, QuitSignal, Response};
use crate::error::ControlError;
use crate::event::{Event, EventQueue};
use crate::proxy::RequestProxy;
use crate::worker::WorkerHandle;

/// Poll interval while waiting for the worker to exit.
const JOIN_POLL: Duration = Duration::from_millis(100);

/// The established client ↔ worker connection.
///
/// Owns client-side cleanup. `terminate` is idempotent: a latch guards
/// double-teardown, so calling it twice (or racing it against the SIGTERM
/// path) is safe.
pub struct ServerConnection {
    proxy: Mutex<Option<RequestProxy>>,
    events: Arc<EventQueue>,
    quit_tx: Mutex<Option<Sender<QuitSignal>>>,
    event_tx: Mutex<Option<Sender<Event>>>,
    worker: WorkerHandle,
    terminated: AtomicBool,
}

impl ServerConnection {
    pub(crate) fn new(
        proxy: RequestProxy,
        events: Arc<EventQueue>,
        quit_tx: Sender<QuitSignal>,
        event_tx: Sender<Event>,
        worker: WorkerHandle,
    ) -> Self {
        Self {
            proxy: Mutex::new(Some(proxy)),
            events,
            quit_tx: Mutex::new(Some(quit_tx)),
            event_tx: Mutex::new(Some(event_tx)),
            worker,
            terminated: AtomicBool::new(false),
        }
    }

    /// The event stream consumer.
    pub fn events(&self) -> Arc<EventQueue> {
        self.events.clone()
    }

    /// Issue a synchronous command. Fails once the connection has been
    /// terminated.
    pub fn run_command(&self, command: Command) -> Result<Response, ControlError> {
        let guard = self.proxy.lock();
        match guard.as_ref() {
            Some(proxy) => proxy.run_command(command),
            None => Err(ControlError::Terminated),
        }
    }

    /// Fetch the worker-published event handler id.
    pub fn event_handler_id(&self) -> Result<u64, ControlError> {
        let guard = self.proxy.lock();
        match guard.as_ref() {
            Some(proxy) => proxy.event_handler_id(),
            None => Err(ControlError::Terminated),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Graceful client-side shutdown: signal the worker, drain events while
    /// it winds down, then close everything. Waits for the worker to
    /// actually exit, with no overall timeout.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        // Ask the worker to stop, then close the quit channel.
        if let Some(quit_tx) = self.quit_tx.lock().take() {
            let _ = quit_tx.send(QuitSignal::Quit);
        }
        // Log records still go to the local logger while we wait.
        while self.worker.is_alive() {
            self.flush_events();
            self.worker.join_timeout(JOIN_POLL);
        }
        // Close the command channel, then the queue and its write side. The
        // retained producer clone is dropped by hand so the event channel
        // can actually disconnect.
        drop(self.proxy.lock().take());
        self.events.set_exited();
        drop(self.event_tx.lock().take());
    }

    /// Termination-signal entry point.
    pub fn sigterm_terminate(&self) {
        log::error!("UI received SIGTERM");
        self.terminate();
    }

    fn flush_events(&self) {
        while let Some(event) = self.events.drain_next() {
            if let Event::Log(record) = event {
                record.emit();
            }
        }
    }
}
