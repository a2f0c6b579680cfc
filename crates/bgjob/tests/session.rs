//! Session lifecycle tests over the in-process thread supervisor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bgjob::testkit::ThreadSupervisor;
use bgjob::{JobHandle, JobState, Session, SessionConfig, SessionError};

fn session_with(config: SessionConfig) -> (Session, Arc<ThreadSupervisor>) {
    let supervisor = Arc::new(ThreadSupervisor::new());
    let session = Session::with_supervisor(config, supervisor.clone()).unwrap();
    (session, supervisor)
}

fn session() -> (Session, Arc<ThreadSupervisor>) {
    session_with(SessionConfig::default())
}

#[test]
fn launch_wait_and_consume_one_row() {
    let (session, _) = session();
    let handle = session.launch("row 42").unwrap();
    assert_eq!(session.wait(handle).unwrap(), JobState::Stopped);

    let result = session.result(handle).unwrap();
    assert_eq!(result.state, JobState::Stopped);
    assert_eq!(result.tag, "OK 1");
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].i64_field(0), Some(42));
    assert_eq!(result.schema.unwrap().fields[0].name, "value");
}

#[test]
fn result_stream_is_single_use() {
    let (session, _) = session();
    let handle = session.launch("row 1").unwrap();
    session.wait(handle).unwrap();
    session.result(handle).unwrap();
    assert!(matches!(
        session.result(handle),
        Err(SessionError::AlreadyConsumed { pid }) if pid == handle.pid
    ));
}

#[test]
fn run_is_launch_wait_result() {
    let (session, _) = session();
    let result = session.run("rows 10").unwrap();
    assert_eq!(result.rows.len(), 10);
    assert_eq!(result.tag, "OK 10");
    assert_eq!(result.rows[9].i64_field(0), Some(9));
}

#[test]
fn submit_takes_no_consumption_obligation() {
    let (session, _) = session();
    let handle = session.submit("row 1").unwrap();
    assert_eq!(session.wait(handle).unwrap(), JobState::Stopped);
    // Never consumed; the job is still listed and counted.
    let stats = session.stats();
    assert_eq!(stats.launched, 1);
    assert_eq!(stats.stopped, 1);
}

#[test]
fn submit_honors_an_explicit_queue_capacity() {
    let (session, _) = session();
    // A 64 KiB row through an 8 KiB ring only completes if the chosen
    // capacity is the one actually in effect for the drain below.
    let handle = session.submit_with_capacity("blob 65536", 8192).unwrap();
    let result = session.result(handle).unwrap();
    assert_eq!(result.rows[0].bytes(0).unwrap().len(), 65_536);
}

#[test]
fn failed_job_surfaces_its_error_record() {
    let (session, _) = session();
    let handle = session.launch("fail division by zero").unwrap();
    assert_eq!(session.wait(handle).unwrap(), JobState::Error);
    match session.result(handle) {
        Err(SessionError::Execution(record)) => {
            assert_eq!(record.message, "division by zero");
        }
        other => panic!("expected an execution error, got {other:?}"),
    }
    assert_eq!(session.stats().errored, 1);
}

#[test]
fn cancel_reaches_canceled_before_completion() {
    let (session, _) = session();
    let handle = session.launch("sleep 30000\nrow 1").unwrap();
    let state = session.cancel(handle).unwrap();
    assert_eq!(state, JobState::Canceled);
    // The result stream reports the cancellation as an error record.
    match session.result(handle) {
        Err(SessionError::Execution(record)) => {
            assert!(record.message.contains("user request"));
        }
        other => panic!("expected an execution error, got {other:?}"),
    }
    assert_eq!(session.stats().canceled, 1);
}

#[test]
fn cancel_after_completion_is_a_noop() {
    let (session, _) = session();
    let handle = session.launch("row 1").unwrap();
    session.wait(handle).unwrap();
    assert_eq!(session.cancel(handle).unwrap(), JobState::Stopped);
    // The finished result is still consumable.
    assert_eq!(session.result(handle).unwrap().rows.len(), 1);
}

#[test]
fn wait_timeout_returns_running_and_never_cancels() {
    let (session, _) = session();
    let handle = session.launch("sleep 400\nrow 7").unwrap();
    let state = session
        .wait_with_timeout(handle, Some(Duration::from_millis(50)))
        .unwrap();
    assert_eq!(state, JobState::Running);
    // The job was not disturbed: it still finishes and delivers.
    assert_eq!(session.wait(handle).unwrap(), JobState::Stopped);
    assert_eq!(session.result(handle).unwrap().rows[0].i64_field(0), Some(7));
}

#[test]
fn worker_ceiling_rejects_and_frees_up() {
    let (session, _) = session_with(SessionConfig {
        max_workers: 1,
        ..SessionConfig::default()
    });
    let first = session.launch("sleep 30000").unwrap();
    assert!(matches!(
        session.launch("row 1"),
        Err(SessionError::LimitExceeded { limit: 1 })
    ));
    session.cancel(first).unwrap();
    // The slot frees once the first job is terminal.
    let second = session.launch("row 1").unwrap();
    session.wait(second).unwrap();
}

#[test]
fn wrong_cookie_is_identity_mismatch_not_not_found() {
    let (session, _) = session();
    let handle = session.launch("row 1").unwrap();
    session.wait(handle).unwrap();

    let forged = JobHandle {
        pid: handle.pid,
        cookie: handle.cookie ^ 1,
    };
    assert!(matches!(
        session.result(forged),
        Err(SessionError::IdentityMismatch { pid, .. }) if pid == handle.pid
    ));
    assert!(matches!(
        session.result(JobHandle {
            pid: -1,
            cookie: handle.cookie
        }),
        Err(SessionError::NotFound { pid: -1 })
    ));
}

#[test]
fn pid_reuse_evicts_stale_entry_and_invalidates_old_handle() {
    let (session, supervisor) = session();
    let old = session.launch("row 1").unwrap();
    session.wait(old).unwrap();

    supervisor.force_next_pid(old.pid);
    let new = session.launch("row 2").unwrap();
    assert_eq!(new.pid, old.pid);
    assert_ne!(new.cookie, old.cookie);

    assert!(matches!(
        session.result(old),
        Err(SessionError::IdentityMismatch { .. })
    ));
    session.wait(new).unwrap();
    assert_eq!(session.result(new).unwrap().rows[0].i64_field(0), Some(2));
}

#[test]
fn detach_forgets_the_job_without_consuming() {
    let (session, _) = session();
    let handle = session.launch("sleep 100\nrow 5").unwrap();
    session.detach(handle).unwrap();
    assert!(matches!(
        session.result(handle),
        Err(SessionError::NotFound { .. })
    ));
    // Launched counter keeps the detached job; nothing else tracks it.
    assert_eq!(session.stats().launched, 1);
}

#[test]
fn detach_never_aborts_in_flight_work() {
    let (session, _) = session();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("committed");
    let job = format!("sleep 100\nwrite {}", marker.display());

    let handle = session.launch(&job).unwrap();
    session.detach(handle).unwrap();

    // The detached worker still reaches its commit point.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !marker.exists() {
        assert!(Instant::now() < deadline, "detached job never committed");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn teardown_stops_registered_workers_but_spares_detached_ones() {
    let (session, _) = session();
    let dir = tempfile::tempdir().unwrap();
    let spared = dir.path().join("spared");
    let stopped = dir.path().join("stopped");

    let detached = session
        .launch(&format!("sleep 300\nwrite {}", spared.display()))
        .unwrap();
    session.detach(detached).unwrap();
    let _registered = session
        .launch(&format!("sleep 300\nwrite {}", stopped.display()))
        .unwrap();
    drop(session);

    // The detached worker outlives the session and commits.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !spared.exists() {
        assert!(Instant::now() < deadline, "detached worker never committed");
        std::thread::sleep(Duration::from_millis(10));
    }
    // The registered worker was terminated before its commit point.
    std::thread::sleep(Duration::from_millis(500));
    assert!(!stopped.exists());
}

#[test]
fn cancel_before_commit_point_prevents_the_side_effect() {
    let (session, _) = session();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("committed");
    let job = format!("sleep 30000\nwrite {}", marker.display());

    let handle = session.launch(&job).unwrap();
    assert_eq!(session.cancel(handle).unwrap(), JobState::Canceled);
    std::thread::sleep(Duration::from_millis(50));
    assert!(!marker.exists());
}

#[test]
fn progress_is_readable_while_running_and_gone_after_consume() {
    let (session, _) = session();
    let handle = session
        .launch("progress 40 building index\nsleep 300\nrow 1")
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let p = session.progress(handle).unwrap();
        if p.percent == 40 {
            assert_eq!(p.message, "building index");
            break;
        }
        assert!(Instant::now() < deadline, "progress report never appeared");
        std::thread::sleep(Duration::from_millis(5));
    }

    session.wait(handle).unwrap();
    session.result(handle).unwrap();
    assert!(matches!(
        session.progress(handle),
        Err(SessionError::AlreadyConsumed { .. })
    ));
}

#[test]
fn execution_timeout_fails_the_job() {
    let (session, _) = session_with(SessionConfig {
        execution_timeout_ms: Some(50),
        ..SessionConfig::default()
    });
    let handle = session.launch("sleep 30000").unwrap();
    assert_eq!(session.wait(handle).unwrap(), JobState::Error);
    match session.result(handle) {
        Err(SessionError::Execution(record)) => {
            assert!(record.message.contains("timeout"));
            assert!(record.hint.is_some());
        }
        other => panic!("expected an execution error, got {other:?}"),
    }
}

#[test]
fn stats_aggregate_outcomes() {
    let (session, _) = session();
    let ok = session.launch("row 1").unwrap();
    session.wait(ok).unwrap();
    session.result(ok).unwrap();

    let failed = session.launch("fail nope").unwrap();
    session.wait(failed).unwrap();
    let _ = session.result(failed);

    let canceled = session.launch("sleep 30000").unwrap();
    session.cancel(canceled).unwrap();

    let stats = session.stats();
    assert_eq!(stats.launched, 3);
    assert_eq!(stats.stopped, 1);
    assert_eq!(stats.errored, 1);
    assert_eq!(stats.canceled, 1);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.max_workers, 16);
    assert!(stats.mean_duration_ms.is_some());

    let list = session.list();
    assert_eq!(list.len(), 3);
    assert_eq!(list[0].pid, ok.pid);
    assert_eq!(list[0].preview, "row 1");
    assert_eq!(list[0].completion_tag.as_deref(), Some("OK 1"));
    assert_eq!(list[1].last_error.as_deref(), Some("nope"));
}

#[test]
fn launch_guardrails() {
    let (session, _) = session();
    assert!(matches!(
        session.launch(""),
        Err(SessionError::InvalidArgument(_))
    ));
    let oversized = "x".repeat(4 * 1024 * 1024 + 1);
    assert!(matches!(
        session.launch(&oversized),
        Err(SessionError::InvalidArgument(_))
    ));
    assert_eq!(session.stats().launched, 0);
}
