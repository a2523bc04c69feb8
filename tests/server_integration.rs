//! End-to-end scenarios: spawn the worker, handshake, exchange commands and
//! events, and shut down through every supported path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use kiln::{
    Command, ControlError, Event, EventSink, IdleStatus, Response, ServerConfig, Severity,
    Supervisor, WorkEngine,
};

/// Records every operation it sees and acks the handshake.
struct EchoEngine {
    ops: Arc<Mutex<Vec<String>>>,
    shutdowns: Arc<Mutex<Vec<bool>>>,
}

impl EchoEngine {
    fn new() -> (Self, Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<bool>>>) {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let shutdowns = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                ops: ops.clone(),
                shutdowns: shutdowns.clone(),
            },
            ops,
            shutdowns,
        )
    }
}

impl WorkEngine for EchoEngine {
    fn run_command(
        &mut self,
        command: &Command,
        events: &EventSink,
    ) -> Result<Response, ControlError> {
        self.ops.lock().unwrap().push(command.op.clone());
        match command.op.as_str() {
            "setFeatures" => Ok(Response::ok(json!("ack"))),
            "stateForceShutdown" => Ok(Response::ok(Value::Null)),
            "echo" => {
                events.send(Event::Domain(json!({ "echoed": command.args })));
                Ok(Response::ok(Value::Array(command.args.clone())))
            }
            other => Ok(Response::err(format!("unknown command {other}"))),
        }
    }

    fn shutdown(&mut self, force: bool) {
        self.shutdowns.lock().unwrap().push(force);
    }
}

fn started_server() -> (Supervisor, Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<bool>>>) {
    let (engine, ops, shutdowns) = EchoEngine::new();
    let mut supervisor = Supervisor::new(ServerConfig::default());
    supervisor.add_work_engine(Box::new(engine)).unwrap();
    supervisor.detach().unwrap();
    (supervisor, ops, shutdowns)
}

#[test]
fn test_handshake_and_command_roundtrip() {
    let (mut supervisor, ops, _) = started_server();
    let connection = supervisor.establish_connection(vec![json!("typed-events")]).unwrap();

    // A repeated handshake command answers (ack, null).
    let response = connection
        .run_command(Command::new("setFeatures", vec![json!([])]))
        .unwrap();
    assert_eq!(response.result, Some(json!("ack")));
    assert_eq!(response.error, None);

    let response = connection
        .run_command(Command::new("echo", vec![json!("hello")]))
        .unwrap();
    assert_eq!(response.result, Some(json!(["hello"])));
    assert_eq!(response.error, None);
    assert_eq!(ops.lock().unwrap().first().map(String::as_str), Some("setFeatures"));

    // The command emitted a domain event on the decoupled stream.
    let events = connection.events();
    let deadline = Instant::now() + Duration::from_secs(5);
    let found = loop {
        match events.wait_event(Duration::from_millis(50)).unwrap() {
            Some(Event::Domain(payload)) => break payload,
            Some(_) => continue,
            None if Instant::now() < deadline => continue,
            None => panic!("domain event never arrived"),
        }
    };
    assert_eq!(found, json!({ "echoed": ["hello"] }));

    connection.terminate();
}

#[test]
fn test_event_handler_id_matches_published_value() {
    let (mut supervisor, _, _) = started_server();
    let connection = supervisor.establish_connection(Vec::new()).unwrap();

    let id = connection.event_handler_id().unwrap();
    assert!(id > 0);
    // The id is stable across calls.
    assert_eq!(connection.event_handler_id().unwrap(), id);

    connection.terminate();
}

#[test]
fn test_terminate_joins_worker_and_is_idempotent() {
    let (mut supervisor, ops, shutdowns) = started_server();
    let connection = supervisor.establish_connection(Vec::new()).unwrap();
    let handle = supervisor.worker_handle();

    connection.terminate();
    assert!(!handle.is_alive());
    assert!(connection.is_terminated());
    // The quit path issued a best-effort force-shutdown command, and the
    // engine was finally shut down with the forced flag.
    assert!(ops.lock().unwrap().iter().any(|op| op == "stateForceShutdown"));
    assert_eq!(shutdowns.lock().unwrap().as_slice(), [true]);

    // Safe to call twice, and fast the second time.
    let started = Instant::now();
    connection.terminate();
    assert!(started.elapsed() < Duration::from_secs(1));

    // The command channel is gone.
    let err = connection.run_command(Command::bare("echo")).unwrap_err();
    assert!(matches!(err, ControlError::Terminated));
}

#[test]
fn test_end_session_delegates_to_terminate() {
    let (mut supervisor, _, _) = started_server();
    let connection = supervisor.establish_connection(Vec::new()).unwrap();
    supervisor.end_session();
    assert!(connection.is_terminated());
    assert!(!supervisor.worker_handle().is_alive());
}

#[test]
fn test_idle_function_deregisters_after_finishing() {
    let (engine, _, _) = EchoEngine::new();
    let mut supervisor = Supervisor::new(ServerConfig::default());
    supervisor.add_work_engine(Box::new(engine)).unwrap();

    let calls = Arc::new(Mutex::new(0usize));
    let calls_in = calls.clone();
    supervisor
        .register_idle_function(Box::new(move |_is_final| {
            let mut calls = calls_in.lock().unwrap();
            *calls += 1;
            if *calls <= 3 {
                Ok(IdleStatus::SleepFor(Duration::from_millis(50)))
            } else {
                Ok(IdleStatus::Finished)
            }
        }))
        .unwrap();

    supervisor.detach().unwrap();
    let connection = supervisor.establish_connection(Vec::new()).unwrap();

    // Three sleeping calls plus the final deregistering one.
    std::thread::sleep(Duration::from_secs(1));
    assert_eq!(*calls.lock().unwrap(), 4);
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(*calls.lock().unwrap(), 4, "never invoked again after deregistration");

    connection.terminate();
}

#[test]
fn test_heartbeats_arrive_at_configured_interval() {
    let (engine, _, _) = EchoEngine::new();
    let mut supervisor = Supervisor::new(ServerConfig {
        heartbeat_secs: Some("0.05".into()),
    });
    supervisor.add_work_engine(Box::new(engine)).unwrap();
    supervisor.detach().unwrap();
    let connection = supervisor.establish_connection(Vec::new()).unwrap();

    let events = connection.events();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut heartbeats = 0;
    while heartbeats < 2 && Instant::now() < deadline {
        if let Ok(Some(Event::Heartbeat { .. })) = events.wait_event(Duration::from_millis(50)) {
            heartbeats += 1;
        }
    }
    assert!(heartbeats >= 2, "expected repeated heartbeats");

    connection.terminate();
}

#[test]
fn test_wait_event_zero_timeout_is_nonblocking_end_to_end() {
    let (mut supervisor, _, _) = started_server();
    let connection = supervisor.establish_connection(Vec::new()).unwrap();
    let events = connection.events();

    let started = Instant::now();
    for _ in 0..20 {
        let _ = events.wait_event(Duration::ZERO).unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(500));

    connection.terminate();
}

#[test]
fn test_command_level_error_keeps_the_channel_usable() {
    let (mut supervisor, _, _) = started_server();
    let connection = supervisor.establish_connection(Vec::new()).unwrap();

    let response = connection.run_command(Command::bare("noSuchOp")).unwrap();
    assert!(response.is_err());

    // Strict alternation survived the failed command.
    let response = connection
        .run_command(Command::new("echo", vec![json!(1)]))
        .unwrap();
    assert_eq!(response.result, Some(json!([1])));

    connection.terminate();
}

#[test]
fn test_fatal_idle_function_kills_worker_and_drain_reports_loss() {
    let (engine, _, shutdowns) = EchoEngine::new();
    let mut supervisor = Supervisor::new(ServerConfig::default());
    supervisor.add_work_engine(Box::new(engine)).unwrap();

    let explode = Arc::new(AtomicBool::new(false));
    let explode_in = explode.clone();
    supervisor
        .register_idle_function(Box::new(move |_is_final| {
            if explode_in.load(Ordering::SeqCst) {
                Err(ControlError::Engine(anyhow::anyhow!("idle work exploded")))
            } else {
                Ok(IdleStatus::SleepFor(Duration::from_millis(10)))
            }
        }))
        .unwrap();

    supervisor.detach().unwrap();
    let connection = supervisor.establish_connection(Vec::new()).unwrap();
    let handle = supervisor.worker_handle();

    explode.store(true, Ordering::SeqCst);
    assert!(handle.join_timeout(Duration::from_secs(5)), "worker should die");
    // Even a fatal idle failure runs the unconditional teardown.
    assert_eq!(shutdowns.lock().unwrap().as_slice(), [true]);

    // Drain what is left, then hit the exit path instead of hanging.
    let events = connection.events();
    let deadline = Instant::now() + Duration::from_secs(5);
    let err = loop {
        match events.get_event() {
            Ok(Some(_)) => continue,
            Ok(None) => {
                assert!(Instant::now() < deadline, "drain never reported the dead worker");
                continue;
            }
            Err(err) => break err,
        }
    };
    assert_eq!(err.severity(), Severity::FatalProcess);

    // Blocking reads degrade to non-blocking once the loss is known.
    let started = Instant::now();
    assert!(events.wait_event(Duration::from_secs(60)).is_err());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_detach_requires_an_engine() {
    let mut supervisor = Supervisor::new(ServerConfig::default());
    let err = supervisor.detach().unwrap_err();
    assert!(matches!(err, ControlError::EngineMissing));

    // Registration is still possible, then detach succeeds.
    let (engine, _, _) = EchoEngine::new();
    supervisor.add_work_engine(Box::new(engine)).unwrap();
    supervisor.detach().unwrap();

    // Post-detach registration is refused: idle functions live inside the
    // worker.
    let err = supervisor
        .register_idle_function(Box::new(|_is_final| Ok(IdleStatus::Ready)))
        .unwrap_err();
    assert!(matches!(err, ControlError::AlreadyDetached));

    let connection = supervisor.establish_connection(Vec::new()).unwrap();
    connection.terminate();
}
