//! Client-side synchronous call wrapper implementing the timeout/retry
//! policy for command/response exchanges.

use std::time::{Duration, Instant};

use flume::{Receiver, RecvError, RecvTimeoutError, Selector, Sender};
use serde_json::Value;

use crate::bus::{Command, Response, OP_GET_UI_HANDLER_NUM};
use crate::error::ControlError;
use crate::worker::WorkerHandle;

/// Number of response-wait stages before escalation.
const RESPONSE_WAIT_STAGES: usize = 4;
/// Poll window per stage.
const STAGE_TIMEOUT: Duration = Duration::from_secs(5);

enum StageWake {
    Response(Result<Response, RecvError>),
    Interrupt(Result<(), RecvError>),
}

enum StageOutcome {
    Response(Response),
    Interrupted,
    Timeout,
    Lost,
}

/// Synchronous command/response caller.
///
/// Exactly one request may be outstanding on the channel, so an interrupt
/// delivered mid-wait is absorbed: the wait cycle restarts from its first
/// stage and the command is never resent. Commands are assumed to be
/// idempotent-or-synchronous enough that re-waiting is always sufficient.
pub struct RequestProxy {
    command_tx: Sender<Command>,
    response_rx: Receiver<Response>,
    worker: WorkerHandle,
    interrupt_rx: Option<Receiver<()>>,
    stage_timeout: Duration,
}

impl RequestProxy {
    pub(crate) fn new(
        command_tx: Sender<Command>,
        response_rx: Receiver<Response>,
        worker: WorkerHandle,
        interrupt_rx: Option<Receiver<()>>,
    ) -> Self {
        Self {
            command_tx,
            response_rx,
            worker,
            interrupt_rx,
            stage_timeout: STAGE_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Send one command and wait for its response.
    ///
    /// Waits in up to four stages; each stage timeout is logged, and after
    /// the fourth the call escalates to [`ControlError::ResponseTimeout`],
    /// which is fatal to the client process. An interrupt that has not been
    /// consumed by the time the fourth stage expires does not defer the
    /// escalation: interrupts are only consulted between waits.
    pub fn run_command(&self, command: Command) -> Result<Response, ControlError> {
        if !self.worker.is_alive() {
            return Err(ControlError::WorkerUnavailable);
        }
        self.command_tx
            .send(command)
            .map_err(|_| ControlError::WorkerUnavailable)?;

        let mut interrupts = self.interrupt_rx.as_ref();
        'cycle: loop {
            for _stage in 0..RESPONSE_WAIT_STAGES {
                match self.wait_stage(&mut interrupts) {
                    StageOutcome::Response(response) => return Ok(response),
                    StageOutcome::Interrupted => {
                        // Absorbed: the request stays outstanding and the
                        // wait cycle starts over.
                        log::debug!("Interrupt absorbed while waiting for the build server");
                        continue 'cycle;
                    }
                    StageOutcome::Timeout => {
                        log::warn!("Timeout while attempting to communicate with the build server");
                    }
                    StageOutcome::Lost => return Err(ControlError::WorkerLost),
                }
            }
            return Err(ControlError::ResponseTimeout);
        }
    }

    fn wait_stage(&self, interrupts: &mut Option<&Receiver<()>>) -> StageOutcome {
        let deadline = Instant::now() + self.stage_timeout;
        loop {
            match *interrupts {
                Some(interrupt_rx) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let woke = Selector::new()
                        .recv(&self.response_rx, StageWake::Response)
                        .recv(interrupt_rx, StageWake::Interrupt)
                        .wait_timeout(remaining);
                    match woke {
                        Ok(StageWake::Response(Ok(response))) => {
                            return StageOutcome::Response(response)
                        }
                        Ok(StageWake::Response(Err(_))) => return StageOutcome::Lost,
                        Ok(StageWake::Interrupt(Ok(()))) => return StageOutcome::Interrupted,
                        Ok(StageWake::Interrupt(Err(_))) => {
                            // The interrupt source went away; keep waiting
                            // out the rest of the stage without it.
                            *interrupts = None;
                        }
                        Err(_) => return StageOutcome::Timeout,
                    }
                }
                None => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    return match self.response_rx.recv_timeout(remaining) {
                        Ok(response) => StageOutcome::Response(response),
                        Err(RecvTimeoutError::Timeout) => StageOutcome::Timeout,
                        Err(RecvTimeoutError::Disconnected) => StageOutcome::Lost,
                    };
                }
            }
        }
    }

    /// Fetch the event-handler id the worker published at startup.
    pub fn event_handler_id(&self) -> Result<u64, ControlError> {
        let response = self.run_command(Command::bare(OP_GET_UI_HANDLER_NUM))?;
        if let Some(error) = response.error {
            log::error!("Unable to get the event handler id: {error}");
            return Err(ControlError::Engine(anyhow::anyhow!(error)));
        }
        response
            .result
            .as_ref()
            .and_then(Value::as_u64)
            .ok_or_else(|| ControlError::Engine(anyhow::anyhow!("malformed event handler id response")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alive_worker() -> (WorkerHandle, flume::Sender<()>) {
        let (keep_tx, keep_rx) = flume::unbounded::<()>();
        let handle = WorkerHandle::new();
        handle.attach(std::thread::spawn(move || {
            let _ = keep_rx.recv();
        }));
        (handle, keep_tx)
    }

    struct ProxyFixture {
        proxy: RequestProxy,
        command_rx: Receiver<Command>,
        response_tx: Sender<Response>,
        _keep: flume::Sender<()>,
    }

    fn fixture(interrupt_rx: Option<Receiver<()>>) -> ProxyFixture {
        let (command_tx, command_rx) = flume::unbounded();
        let (response_tx, response_rx) = flume::unbounded();
        let (handle, keep) = alive_worker();
        let proxy = RequestProxy::new(command_tx, response_rx, handle, interrupt_rx)
            .with_stage_timeout(Duration::from_millis(30));
        ProxyFixture {
            proxy,
            command_rx,
            response_tx,
            _keep: keep,
        }
    }

    #[test]
    fn test_returns_exactly_the_computed_response() {
        let f = fixture(None);
        let command_rx = f.command_rx.clone();
        let response_tx = f.response_tx.clone();
        let responder = std::thread::spawn(move || {
            let command = command_rx.recv().unwrap();
            response_tx
                .send(Response::ok(json!({ "echo": command.op })))
                .unwrap();
        });

        let response = f.proxy.run_command(Command::bare("ping")).unwrap();
        assert_eq!(response.result, Some(json!({ "echo": "ping" })));
        responder.join().unwrap();
    }

    #[test]
    fn test_no_send_when_worker_not_alive() {
        let (command_tx, command_rx) = flume::unbounded();
        let (_response_tx, response_rx) = flume::unbounded();
        let proxy = RequestProxy::new(command_tx, response_rx, WorkerHandle::new(), None);

        let err = proxy.run_command(Command::bare("ping")).unwrap_err();
        assert!(matches!(err, ControlError::WorkerUnavailable));
        assert!(command_rx.try_recv().is_err(), "nothing may be sent");
    }

    #[test]
    fn test_escalates_after_exactly_four_stages() {
        let f = fixture(None);
        let started = Instant::now();
        let err = f.proxy.run_command(Command::bare("ping")).unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, ControlError::ResponseTimeout));
        // Four stages of 30ms: never fewer, never more.
        assert!(elapsed >= Duration::from_millis(4 * 30));
        assert!(elapsed < Duration::from_millis(8 * 30));
    }

    #[test]
    fn test_interrupt_restarts_the_wait_cycle() {
        let (interrupt_tx, interrupt_rx) = flume::unbounded();
        let f = fixture(Some(interrupt_rx));
        interrupt_tx.send(()).unwrap();

        let started = Instant::now();
        let err = f.proxy.run_command(Command::bare("ping")).unwrap_err();
        let elapsed = started.elapsed();

        // The pending interrupt is absorbed (one cycle restart), then a full
        // four-stage cycle runs and escalation proceeds regardless.
        assert!(matches!(err, ControlError::ResponseTimeout));
        assert!(elapsed >= Duration::from_millis(4 * 30));
    }

    #[test]
    fn test_response_after_interrupt_still_delivered() {
        let (interrupt_tx, interrupt_rx) = flume::unbounded();
        let f = fixture(Some(interrupt_rx));
        let response_tx = f.response_tx.clone();
        let responder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            interrupt_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(10));
            response_tx.send(Response::ok(json!("late"))).unwrap();
        });

        let response = f.proxy.run_command(Command::bare("ping")).unwrap();
        assert_eq!(response.result, Some(json!("late")));
        responder.join().unwrap();
    }

    #[test]
    fn test_worker_death_mid_wait_is_process_fatal() {
        let f = fixture(None);
        let response_tx = f.response_tx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            drop(response_tx);
        });
        drop(f.response_tx);

        let err = f.proxy.run_command(Command::bare("ping")).unwrap_err();
        assert!(matches!(err, ControlError::WorkerLost));
        assert_eq!(err.severity(), crate::error::Severity::FatalProcess);
    }

    #[test]
    fn test_event_handler_id_decoded() {
        let f = fixture(None);
        let command_rx = f.command_rx.clone();
        let response_tx = f.response_tx.clone();
        let responder = std::thread::spawn(move || {
            let command = command_rx.recv().unwrap();
            assert_eq!(command.op, OP_GET_UI_HANDLER_NUM);
            response_tx.send(Response::ok(json!(7))).unwrap();
        });

        assert_eq!(f.proxy.event_handler_id().unwrap(), 7);
        responder.join().unwrap();
    }
}
