//! Session-local worker registry.
//!
//! Tracks every job this session has launched, keyed by worker pid. The
//! registry is pure bookkeeping: it never talks to the OS or the segment
//! itself. The session refreshes entries from supervisor and segment
//! observations and the registry records the outcome, which keeps the
//! state machine testable without processes or shared memory.

use std::collections::HashMap;

use bgjob_core::{ErrorRecord, JobHandle, JobState, QueueReceiver, Segment, truncate_utf8};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SessionError;

/// Bytes of job text kept in each entry for listings.
pub const JOB_PREVIEW_MAX: usize = 80;

/// UTF-8-safe bounded preview of a job payload.
#[must_use]
pub fn job_preview(job: &str) -> String {
    truncate_utf8(job, JOB_PREVIEW_MAX).to_owned()
}

/// One registered job.
pub struct WorkerEntry {
    /// Identity of the job (worker pid + cookie).
    pub handle: JobHandle,
    /// Launcher-side mapping of the job's segment.
    ///
    /// Dropped when the result stream is consumed; the entry itself stays
    /// so later result calls can answer `AlreadyConsumed`.
    pub segment: Option<Segment>,
    /// Receiving queue endpoint; present until the result is consumed.
    pub receiver: Option<QueueReceiver>,
    /// Current lifecycle state as last observed.
    pub state: JobState,
    /// Requesting user id recorded at launch.
    pub uid: u32,
    /// Launch time.
    pub launched_at: DateTime<Utc>,
    /// When a terminal state was first observed.
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether the single-use result stream has been consumed.
    pub consumed: bool,
    /// Completion tag from the worker, if it finished cleanly.
    pub completion_tag: Option<String>,
    /// Bounded preview of the job text, for listings.
    pub preview: String,
    /// The error record that finished the job, if it failed.
    pub last_error: Option<ErrorRecord>,
}

impl WorkerEntry {
    /// Mark the entry terminal. The first terminal observation wins.
    pub fn finish(&mut self, state: JobState, now: DateTime<Utc>) {
        if self.state.can_transition(state) {
            self.state = state;
            self.finished_at = Some(now);
        }
    }
}

/// Serializable view of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    /// Worker pid.
    pub pid: i32,
    /// Job cookie.
    pub cookie: u64,
    /// Lifecycle state.
    pub state: JobState,
    /// Launch time.
    pub launched_at: DateTime<Utc>,
    /// Terminal time, if finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether the result stream has been consumed.
    pub consumed: bool,
    /// Completion tag, if the job finished cleanly.
    pub completion_tag: Option<String>,
    /// Bounded preview of the job text.
    pub preview: String,
    /// Message of the error that finished the job, if it failed.
    pub last_error: Option<String>,
}

impl From<&WorkerEntry> for EntrySnapshot {
    fn from(entry: &WorkerEntry) -> Self {
        Self {
            pid: entry.handle.pid,
            cookie: entry.handle.cookie,
            state: entry.state,
            launched_at: entry.launched_at,
            finished_at: entry.finished_at,
            consumed: entry.consumed,
            completion_tag: entry.completion_tag.clone(),
            preview: entry.preview.clone(),
            last_error: entry.last_error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// Aggregate counters for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    /// Jobs launched over the session's lifetime.
    pub launched: u64,
    /// Jobs currently in the running state.
    pub running: usize,
    /// Jobs that finished cleanly.
    pub stopped: u64,
    /// Jobs that were canceled.
    pub canceled: u64,
    /// Jobs that failed.
    pub errored: u64,
    /// Mean wall-clock duration of finished jobs, milliseconds.
    pub mean_duration_ms: Option<f64>,
    /// The session's configured concurrency ceiling.
    pub max_workers: usize,
}

/// Pid-keyed registry of this session's jobs.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<i32, WorkerEntry>,
    launched: u64,
    stopped: u64,
    canceled: u64,
    errored: u64,
    total_duration_ms: f64,
    finished: u64,
}

impl Registry {
    /// Register a freshly launched job.
    ///
    /// A pid hit against a live entry is a collision: if the old entry
    /// belongs to the same uid it is evicted (its worker is provably gone,
    /// the OS just recycled the pid), otherwise the launch fails loudly
    /// rather than silently adopting another user's slot.
    pub fn insert(&mut self, entry: WorkerEntry) -> Result<(), SessionError> {
        let pid = entry.handle.pid;
        if let Some(existing) = self.entries.get(&pid) {
            if existing.uid != entry.uid {
                return Err(SessionError::PidCollision { pid });
            }
            self.record_eviction(pid);
        }
        self.entries.insert(pid, entry);
        self.launched += 1;
        Ok(())
    }

    fn record_eviction(&mut self, pid: i32) {
        if let Some(old) = self.entries.remove(&pid) {
            // Pid reuse implies the old worker already exited; if we never
            // observed a terminal state, count it as an error.
            if !old.state.is_terminal() {
                self.errored += 1;
            }
        }
    }

    /// Record a terminal observation and update the counters.
    pub fn finish(&mut self, pid: i32, state: JobState, now: DateTime<Utc>) {
        let Some(entry) = self.entries.get_mut(&pid) else {
            return;
        };
        if !entry.state.can_transition(state) {
            return;
        }
        entry.finish(state, now);
        match state {
            JobState::Stopped => self.stopped += 1,
            JobState::Canceled => self.canceled += 1,
            JobState::Error => self.errored += 1,
            JobState::Running => unreachable!("finish requires a terminal state"),
        }
        let duration = (now - entry.launched_at).num_milliseconds().max(0) as f64;
        self.total_duration_ms += duration;
        self.finished += 1;
    }

    /// Entry for `pid`, if registered.
    #[must_use]
    pub fn get(&self, pid: i32) -> Option<&WorkerEntry> {
        self.entries.get(&pid)
    }

    /// Mutable entry for `pid`, if registered.
    pub fn get_mut(&mut self, pid: i32) -> Option<&mut WorkerEntry> {
        self.entries.get_mut(&pid)
    }

    /// Remove `pid` from the registry entirely.
    pub fn remove(&mut self, pid: i32) -> Option<WorkerEntry> {
        self.entries.remove(&pid)
    }

    /// Number of entries currently in the running state.
    #[must_use]
    pub fn running(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == JobState::Running)
            .count()
    }

    /// Snapshots of all entries, ordered by launch time.
    #[must_use]
    pub fn list(&self) -> Vec<EntrySnapshot> {
        let mut out: Vec<EntrySnapshot> = self.entries.values().map(EntrySnapshot::from).collect();
        out.sort_by_key(|e| (e.launched_at, e.pid));
        out
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            launched: self.launched,
            running: self.running(),
            stopped: self.stopped,
            canceled: self.canceled,
            errored: self.errored,
            mean_duration_ms: (self.finished > 0)
                .then(|| self.total_duration_ms / self.finished as f64),
            max_workers: 0, // filled in by the session
        }
    }

    /// Pids of all registered entries.
    #[must_use]
    pub fn pids(&self) -> Vec<i32> {
        self.entries.keys().copied().collect()
    }
}
