//! Session-level error taxonomy.

use bgjob_core::{ErrorRecord, QueueError, SegmentError};
use thiserror::Error;

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session's concurrent-worker ceiling is reached.
    #[error("worker limit of {limit} reached, wait for a job to finish or raise max_workers")]
    LimitExceeded {
        /// The configured ceiling.
        limit: usize,
    },

    /// The operating system refused a resource the launch needed.
    #[error("could not launch background worker: {0}")]
    ResourceExhausted(String),

    /// No registered worker with that pid.
    #[error("no background worker with pid {pid} in this session")]
    NotFound {
        /// The pid that was looked up.
        pid: i32,
    },

    /// A registered pid now belongs to a different job (pid reuse).
    #[error("worker with pid {pid} is not the one this session launched")]
    IdentityMismatch {
        /// The pid that was looked up.
        pid: i32,
        /// Cookie recorded at launch.
        expected: u64,
        /// Cookie observed on the live worker.
        observed: u64,
    },

    /// The job's result stream has already been consumed.
    #[error("result of background worker with pid {pid} has already been consumed")]
    AlreadyConsumed {
        /// The pid whose result was requested again.
        pid: i32,
    },

    /// A new launch produced a pid that collides with a live foreign entry.
    #[error("background worker pid {pid} collides with a worker owned by another user")]
    PidCollision {
        /// The colliding pid.
        pid: i32,
    },

    /// The caller may not act on this worker.
    #[error("permission denied for background worker with pid {pid}")]
    PermissionDenied {
        /// The pid the caller tried to act on.
        pid: i32,
    },

    /// The job itself failed; carries the worker's full error record.
    #[error("background job failed: {0}")]
    Execution(ErrorRecord),

    /// A caller-supplied argument is out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Shared segment setup or teardown failed.
    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// The job queue failed mid-stream.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_pid() {
        let err = SessionError::NotFound { pid: 4242 };
        assert!(err.to_string().contains("4242"));
        let err = SessionError::AlreadyConsumed { pid: 7 };
        assert!(err.to_string().contains("already been consumed"));
    }

    #[test]
    fn execution_error_carries_the_record() {
        let record = ErrorRecord {
            message: "division by zero".into(),
            hint: Some("check the denominator".into()),
            ..ErrorRecord::default()
        };
        let err = SessionError::Execution(record);
        let text = err.to_string();
        assert!(text.contains("division by zero"));
        assert!(text.contains("check the denominator"));
    }
}
