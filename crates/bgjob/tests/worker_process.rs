//! End-to-end tests against real `bgjob-worker` processes.

use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use bgjob::{JobState, Session, SessionConfig, SessionError};

fn process_session(mut config: SessionConfig) -> Session {
    config.worker.program = env!("CARGO_BIN_EXE_bgjob-worker").to_owned();
    Session::new(config).unwrap()
}

#[test]
fn round_trip_through_a_real_process() {
    let session = process_session(SessionConfig::default());
    let handle = session.launch("row 42").unwrap();
    assert_eq!(session.wait(handle).unwrap(), JobState::Stopped);
    let result = session.result(handle).unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].i64_field(0), Some(42));
    assert_eq!(result.tag, "OK 1");
}

#[test]
fn large_output_flows_through_a_small_queue() {
    let session = process_session(SessionConfig::default());
    // A 1 MiB row through an 8 KiB ring: the worker must block on
    // backpressure until the drain below makes room, so the result is
    // consumed without waiting for completion first.
    let handle = session
        .launch_with_capacity("blob 1048576", 8192)
        .unwrap();
    let result = session.result(handle).unwrap();
    assert_eq!(result.rows.len(), 1);
    let bytes = result.rows[0].bytes(0).unwrap();
    assert_eq!(bytes.len(), 1_048_576);
    assert!(bytes.iter().all(|&b| b == b'x'));
}

#[test]
fn sigint_cancels_a_real_worker() {
    let session = process_session(SessionConfig::default());
    let handle = session.launch("sleep 60000").unwrap();
    let state = session.cancel_with_grace(handle, 10_000).unwrap();
    assert_eq!(state, JobState::Canceled);
}

#[test]
fn killed_worker_reports_lost_connection() {
    let session = process_session(SessionConfig::default());
    let handle = session.launch("sleep 60000").unwrap();
    // SIGKILL gives the worker no chance to publish a terminal state.
    kill(Pid::from_raw(handle.pid), Signal::SIGKILL).unwrap();
    match session.result(handle) {
        Err(SessionError::Execution(record)) => {
            assert!(record.message.contains("lost connection"));
            assert!(record.message.contains(&handle.pid.to_string()));
        }
        other => panic!("expected an execution error, got {other:?}"),
    }
    assert_eq!(session.stats().errored, 1);
}

#[test]
fn exit_stays_observable_across_registry_refreshes() {
    let session = process_session(SessionConfig::default());
    let handle = session.launch("sleep 60000").unwrap();
    kill(Pid::from_raw(handle.pid), Signal::SIGKILL).unwrap();
    // A list() refresh reaps the worker first; the later drain must
    // still see it as stopped instead of blocking on an empty ring.
    let deadline = Instant::now() + Duration::from_secs(10);
    while session.list()[0].state == JobState::Running {
        assert!(Instant::now() < deadline, "worker exit never observed");
        std::thread::sleep(Duration::from_millis(10));
    }
    match session.result(handle) {
        Err(SessionError::Execution(record)) => {
            assert!(record.message.contains("lost connection"));
            assert!(record.message.contains(&handle.pid.to_string()));
        }
        other => panic!("expected an execution error, got {other:?}"),
    }
}
