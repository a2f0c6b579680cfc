//! Worker-process entry points.
//!
//! A worker's whole life: open the segment it was pointed at, attach the
//! sending queue endpoint (completing the launcher's attach handshake),
//! run the executor against the payload, emit exactly one terminal frame
//! (completion or error), publish the terminal state into the segment and
//! detach. The launcher observes all of this through the queue and the
//! segment header; there is no other channel.

use std::time::Duration;

use bgjob_core::{ErrorRecord, Frame, JobState, Segment};
use tracing::{debug, error, info};

use crate::config::ConfigSnapshot;
use crate::error::SessionError;
use crate::executor::{CancelToken, ExecError, JobContext, JobExecutor, note_cancel_signal};

extern "C" fn on_cancel_signal(_: nix::libc::c_int) {
    // Only an atomic store; anything more is not async-signal-safe.
    note_cancel_signal();
}

/// Install SIGINT/SIGTERM handlers that trip the cancellation flag.
///
/// SIGINT is the launcher's cooperative cancel; SIGTERM is the
/// escalation. Both map to the same flag: by the time SIGTERM arrives
/// the worker should already be unwinding, and a second chance to exit
/// cleanly beats dying mid-frame.
pub fn install_signal_handlers() -> Result<(), SessionError> {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

    let action = SigAction::new(
        SigHandler::Handler(on_cancel_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only performs an atomic store.
        unsafe {
            sigaction(signal, &action).map_err(|err| {
                SessionError::ResourceExhausted(format!("sigaction({signal}) failed: {err}"))
            })?;
        }
    }
    Ok(())
}

/// Run a worker process to completion: signal handlers, segment, executor.
///
/// This is the body of the `bgjob-worker` binary; embedders with their own
/// executor call it with theirs.
pub fn run_worker(segment_name: &str, executor: &dyn JobExecutor) -> Result<(), SessionError> {
    install_signal_handlers()?;
    run_worker_with_token(segment_name, executor, CancelToken::new().watching_signals())
}

/// [`run_worker`] with an externally supplied cancellation token; the
/// in-process supervisor uses this to cancel without signals.
pub fn run_worker_with_token(
    segment_name: &str,
    executor: &dyn JobExecutor,
    token: CancelToken,
) -> Result<(), SessionError> {
    let segment = Segment::open(segment_name)?;
    let sender = segment.sender()?;
    debug!(segment = segment_name, "worker attached to segment");

    let snapshot = match ConfigSnapshot::from_json(segment.config_json()) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            let record =
                ErrorRecord::message(format!("worker could not read config snapshot: {err}"));
            let _ = sender.send(&Frame::Error(record).encode());
            segment.publish_final_state(JobState::Error);
            return Ok(());
        }
    };
    let token = match snapshot.execution_timeout_ms {
        Some(ms) => token.with_deadline(Duration::from_millis(ms)),
        None => token,
    };

    let job = String::from_utf8_lossy(segment.payload()).into_owned();
    let mut ctx = JobContext::new(&sender, &segment, &token, &snapshot);

    let (frame, state) = match executor.execute(&job, &mut ctx) {
        Ok(tag) => {
            info!(segment = segment_name, %tag, "job completed");
            (Frame::Complete { tag }, JobState::Stopped)
        }
        Err(ExecError::Canceled) => {
            info!(segment = segment_name, "job canceled on request");
            (
                Frame::Error(ErrorRecord::message("canceling job due to user request")),
                JobState::Canceled,
            )
        }
        Err(ExecError::TimedOut) => {
            let ms = snapshot.execution_timeout_ms.unwrap_or_default();
            info!(segment = segment_name, timeout_ms = ms, "job timed out");
            (
                Frame::Error(ErrorRecord {
                    message: format!("canceling job after {ms}ms execution timeout"),
                    hint: Some("raise execution_timeout_ms or split the job".to_owned()),
                    ..ErrorRecord::default()
                }),
                JobState::Error,
            )
        }
        Err(ExecError::Failed(record)) => {
            error!(segment = segment_name, message = %record.message, "job failed");
            (Frame::Error(record), JobState::Error)
        }
    };

    let _ = ctx.push(&frame);
    // State is published before the sender detaches so the launcher never
    // sees end-of-stream with the cell still at "running".
    segment.publish_final_state(state);
    drop(ctx);
    drop(sender);
    Ok(())
}
