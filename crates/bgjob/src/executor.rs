//! Job execution inside the worker.
//!
//! [`JobExecutor`] is what a worker actually runs; the surrounding
//! machinery (segment, queue, signals) is identical for every executor.
//! Cancellation is cooperative: the executor polls its [`CancelToken`] at
//! whatever granularity it can afford, and the launcher escalates to
//! SIGTERM only after the grace period expires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bgjob_core::{ErrorRecord, Frame, Row, Schema, truncate_utf8};
use bgjob_core::{QueueError, QueueSender, Segment};
use tracing::debug;

use crate::config::ConfigSnapshot;

/// Set by the worker's SIGINT/SIGTERM handlers.
static CANCEL_SIGNAL: AtomicBool = AtomicBool::new(false);

/// Record a cancellation signal. Async-signal-safe.
pub(crate) fn note_cancel_signal() {
    CANCEL_SIGNAL.store(true, Ordering::Release);
}

/// Why an executor stopped without completing.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecError {
    /// A cancellation request was observed.
    Canceled,
    /// The execution deadline passed.
    TimedOut,
    /// The job itself failed.
    Failed(ErrorRecord),
}

/// Cooperative cancellation handle.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
    watch_signals: bool,
}

impl CancelToken {
    /// Token that only cancels when [`CancelToken::cancel`] is called.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: None,
            watch_signals: false,
        }
    }

    /// Add an execution deadline.
    #[must_use]
    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Also observe the process-wide cancellation signal flag.
    #[must_use]
    pub fn watching_signals(mut self) -> Self {
        self.watch_signals = true;
        self
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || (self.watch_signals && CANCEL_SIGNAL.load(Ordering::Acquire))
    }

    /// Whether the deadline, if any, has passed.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Cancellation or deadline as an [`ExecError`], for use at poll
    /// points inside executors.
    pub fn check(&self) -> Result<(), ExecError> {
        if self.is_canceled() {
            return Err(ExecError::Canceled);
        }
        if self.timed_out() {
            return Err(ExecError::TimedOut);
        }
        Ok(())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The executor's view of its job: result stream, progress reporting and
/// cancellation, with the launch-time config snapshot attached.
pub struct JobContext<'a> {
    sender: &'a QueueSender,
    segment: &'a Segment,
    token: &'a CancelToken,
    snapshot: &'a ConfigSnapshot,
    schema_sent: bool,
    rows_sent: u64,
    receiver_gone: bool,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(
        sender: &'a QueueSender,
        segment: &'a Segment,
        token: &'a CancelToken,
        snapshot: &'a ConfigSnapshot,
    ) -> Self {
        Self {
            sender,
            segment,
            token,
            snapshot,
            schema_sent: false,
            rows_sent: 0,
            receiver_gone: false,
        }
    }

    /// The config snapshot frozen at launch time.
    #[must_use]
    pub fn config(&self) -> &ConfigSnapshot {
        self.snapshot
    }

    /// Number of data rows sent so far.
    #[must_use]
    pub fn rows_sent(&self) -> u64 {
        self.rows_sent
    }

    /// Surface cancellation or timeout. Executors should call this at
    /// every convenient point; between calls they run undisturbed.
    pub fn check_cancel(&self) -> Result<(), ExecError> {
        self.token.check()
    }

    /// Describe the rows this job will produce. Must precede the first
    /// row and may be sent at most once.
    pub fn send_schema(&mut self, schema: &Schema) -> Result<(), ExecError> {
        if self.schema_sent {
            return Err(ExecError::Failed(ErrorRecord::message(
                "result schema was already sent",
            )));
        }
        self.schema_sent = true;
        self.push(&Frame::Schema(schema.clone()))
    }

    /// Send one result row.
    pub fn send_row(&mut self, row: Row) -> Result<(), ExecError> {
        if !self.schema_sent {
            return Err(ExecError::Failed(ErrorRecord::message(
                "result row sent before schema",
            )));
        }
        self.rows_sent += 1;
        self.push(&Frame::Data(row))
    }

    /// Publish a progress report. Never blocks and never fails; readable
    /// by the launcher without touching the result stream.
    pub fn report_progress(&self, percent: u32, message: &str) {
        self.segment
            .report_progress(percent, truncate_utf8(message, 120));
    }

    /// Whether the launcher has detached from the result stream. Output
    /// sent after this point is discarded; the job itself keeps running.
    #[must_use]
    pub fn receiver_gone(&self) -> bool {
        self.receiver_gone
    }

    pub(crate) fn push(&mut self, frame: &Frame) -> Result<(), ExecError> {
        if self.receiver_gone {
            return Ok(());
        }
        match self.sender.send(&frame.encode()) {
            Ok(()) => Ok(()),
            // A detached launcher discards output but does not fail the job.
            Err(QueueError::Detached) => {
                debug!("launcher detached, discarding further output");
                self.receiver_gone = true;
                Ok(())
            }
            Err(err) => Err(ExecError::Failed(ErrorRecord::message(format!(
                "result queue failed: {err}"
            )))),
        }
    }
}

/// A unit of work a worker process can run.
pub trait JobExecutor {
    /// Execute `job`, streaming output through `ctx`. Returns the
    /// completion tag on success.
    fn execute(&self, job: &str, ctx: &mut JobContext<'_>) -> Result<String, ExecError>;
}
