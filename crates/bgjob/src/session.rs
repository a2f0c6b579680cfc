//! The session API: launch, result, cancel, wait, detach, stats.
//!
//! A [`Session`] owns everything the launcher side needs: the frozen
//! configuration, the supervisor that starts and signals worker
//! processes, and the registry of every job launched so far. All methods
//! take `&self`; the registry sits behind a mutex and the blocking parts
//! (attach handshake, result drain, waits) run without holding it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bgjob_core::{
    Backoff, ErrorRecord, Frame, JobHandle, JobState, Progress, ProtocolError, QueueError, Row,
    Schema, Segment, SegmentMeta, new_cookie,
};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{ConfigSnapshot, MAX_GRACE_MS, MAX_JOB_LEN, SessionConfig};
use crate::error::SessionError;
use crate::registry::{EntrySnapshot, Registry, SessionStats, WorkerEntry, job_preview};
use crate::supervisor::{ProcessSupervisor, WorkerState, WorkerSupervisor};

/// Grace period used by [`Session::cancel`], milliseconds.
pub const DEFAULT_GRACE_MS: u64 = 5_000;

/// Everything a consumed result stream produced.
#[derive(Debug, Clone)]
pub struct JobResult {
    /// Schema of the rows, if the job produced any output.
    pub schema: Option<Schema>,
    /// All data rows, in the order the worker sent them.
    pub rows: Vec<Row>,
    /// The worker's completion tag.
    pub tag: String,
    /// Terminal state recorded for the job.
    pub state: JobState,
}

/// A launcher session.
pub struct Session {
    config: SessionConfig,
    supervisor: Arc<dyn WorkerSupervisor>,
    registry: Mutex<Registry>,
    inflight: AtomicUsize,
    uid: u32,
    user: String,
}

impl Session {
    /// Session backed by real worker processes.
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let supervisor = Arc::new(ProcessSupervisor::new(config.worker.clone()));
        Self::with_supervisor(config, supervisor)
    }

    /// Session with a caller-supplied supervisor; tests use an
    /// in-process one so the state machine runs without forking.
    pub fn with_supervisor(
        config: SessionConfig,
        supervisor: Arc<dyn WorkerSupervisor>,
    ) -> Result<Self, SessionError> {
        config
            .validate()
            .map_err(|err| SessionError::InvalidArgument(err.to_string()))?;
        let uid = nix::unistd::getuid();
        let user = nix::unistd::User::from_uid(uid)
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_else(|| uid.to_string());
        Ok(Self {
            config,
            supervisor,
            registry: Mutex::new(Registry::default()),
            inflight: AtomicUsize::new(0),
            uid: uid.as_raw(),
            user,
        })
    }

    /// The session's frozen configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Launch `job` in a new worker process and return its handle.
    ///
    /// Returns once the worker has provably attached to the result
    /// queue; from that point the job runs independently of this call.
    pub fn launch(&self, job: &str) -> Result<JobHandle, SessionError> {
        self.launch_with_capacity(job, self.config.default_queue_capacity)
    }

    /// [`Session::launch`] with an explicit queue capacity for jobs whose
    /// output volume is known to be unusual.
    pub fn launch_with_capacity(
        &self,
        job: &str,
        queue_capacity: usize,
    ) -> Result<JobHandle, SessionError> {
        if job.is_empty() {
            return Err(SessionError::InvalidArgument(
                "job payload is empty".to_owned(),
            ));
        }
        if job.len() > MAX_JOB_LEN {
            return Err(SessionError::InvalidArgument(format!(
                "job payload is {} bytes, the limit is {MAX_JOB_LEN}",
                job.len()
            )));
        }
        let _slot = self.reserve_slot()?;

        let cookie = new_cookie();
        let name = format!("/bgjob-{}-{cookie:016x}", std::process::id());
        let snapshot = ConfigSnapshot::capture(&self.config)
            .to_json()
            .map_err(|err| {
                SessionError::ResourceExhausted(format!("could not encode config snapshot: {err}"))
            })?;
        let meta = SegmentMeta {
            cookie,
            uid: self.uid,
            user: self.user.clone(),
            target: self.config.target.clone(),
        };
        let segment = Segment::create(&name, &meta, job.as_bytes(), &snapshot, queue_capacity)?;
        let receiver = segment.receiver()?;

        let pid = self.supervisor.start(&name)?;
        match receiver.wait_for_attach(|| self.supervisor.state(pid) == WorkerState::Stopped) {
            Ok(()) => {}
            Err(QueueError::Aborted) => {
                self.supervisor.forget(pid);
                // Dropping the segment unlinks the never-claimed name.
                return Err(SessionError::ResourceExhausted(format!(
                    "worker process {pid} exited before attaching to its queue"
                )));
            }
            Err(err) => return Err(err.into()),
        }
        // The worker holds its own mapping now; freeing the name makes
        // teardown independent of launcher cleanup.
        segment.unlink_now();

        let handle = JobHandle { pid, cookie };
        let entry = WorkerEntry {
            handle,
            segment: Some(segment),
            receiver: Some(receiver),
            state: JobState::Running,
            uid: self.uid,
            launched_at: Utc::now(),
            finished_at: None,
            consumed: false,
            completion_tag: None,
            preview: job_preview(job),
            last_error: None,
        };
        {
            let mut reg = self.lock_registry();
            self.refresh_locked(&mut reg);
            if let Err(err) = reg.insert(entry) {
                drop(reg);
                let _ = self.supervisor.terminate(pid);
                self.supervisor.forget(pid);
                return Err(err);
            }
        }
        info!(%handle, queue_capacity, "launched background job");
        Ok(handle)
    }

    /// Fire-and-forget launch: same as [`Session::launch`], but the caller
    /// takes no obligation to ever consume the result. The job stays
    /// listed and its outcome still lands in the session counters.
    pub fn submit(&self, job: &str) -> Result<JobHandle, SessionError> {
        self.launch(job)
    }

    /// [`Session::submit`] with an explicit queue capacity in bytes.
    pub fn submit_with_capacity(
        &self,
        job: &str,
        queue_capacity: usize,
    ) -> Result<JobHandle, SessionError> {
        self.launch_with_capacity(job, queue_capacity)
    }

    /// Launch `job`, block until it finishes and consume its result.
    pub fn run(&self, job: &str) -> Result<JobResult, SessionError> {
        let handle = self.launch(job)?;
        self.wait(handle)?;
        self.result(handle)
    }

    /// Consume the job's result stream.
    ///
    /// Blocks until the worker has sent its terminal frame (or is lost).
    /// The stream is single-use: a second call for the same handle
    /// returns [`SessionError::AlreadyConsumed`]. A failed job surfaces
    /// as [`SessionError::Execution`] carrying the worker's error record.
    pub fn result(&self, handle: JobHandle) -> Result<JobResult, SessionError> {
        let pid = handle.pid;
        let receiver = {
            let mut reg = self.lock_registry();
            let entry = self.validate_entry(&mut reg, handle)?;
            if entry.consumed {
                return Err(SessionError::AlreadyConsumed { pid });
            }
            entry.consumed = true;
            match entry.receiver.take() {
                Some(receiver) => receiver,
                None => return Err(SessionError::AlreadyConsumed { pid }),
            }
        };

        // Abort the drain whenever the worker is no longer provably
        // alive; anything buffered in the ring is still delivered first.
        let abort = || self.supervisor.state(pid) != WorkerState::Running;
        let mut schema: Option<Schema> = None;
        let mut rows: Vec<Row> = Vec::new();
        let mut tag: Option<String> = None;
        let mut error: Option<ErrorRecord> = None;
        loop {
            let bytes = match receiver.recv_where(&abort) {
                Ok(Some(bytes)) => bytes,
                Ok(None) | Err(QueueError::Aborted) => break,
                Err(err) => {
                    error = Some(ErrorRecord::message(format!(
                        "result queue of worker process {pid} failed: {err}"
                    )));
                    break;
                }
            };
            match Frame::decode(&bytes) {
                Ok(Frame::Schema(s)) => {
                    if schema.is_some() {
                        error = Some(protocol_violation(pid, ProtocolError::DuplicateSchema));
                        break;
                    }
                    schema = Some(s);
                }
                Ok(Frame::Data(row)) => {
                    let Some(s) = &schema else {
                        error = Some(protocol_violation(pid, ProtocolError::RowBeforeSchema));
                        break;
                    };
                    if row.fields.len() != s.fields.len() {
                        error = Some(protocol_violation(
                            pid,
                            ProtocolError::FieldCount {
                                expected: s.fields.len(),
                                found: row.fields.len(),
                            },
                        ));
                        break;
                    }
                    rows.push(row);
                }
                Ok(Frame::Complete { tag: t }) => {
                    tag = Some(t);
                    break;
                }
                Ok(Frame::Error(record)) => {
                    error = Some(record);
                    break;
                }
                Err(err) => {
                    error = Some(ErrorRecord::message(format!(
                        "malformed frame from worker process {pid}: {err}"
                    )));
                    break;
                }
            }
        }
        drop(receiver);

        let now = Utc::now();
        let mut reg = self.lock_registry();
        // Classify the outcome. The segment's final-state cell
        // distinguishes a cancellation acknowledgement from a failure.
        let cell = reg
            .get(pid)
            .and_then(|e| e.segment.as_ref())
            .map(Segment::final_state);
        let (state, result) = if let Some(t) = tag {
            (JobState::Stopped, Ok(t))
        } else if let Some(record) = error {
            let state = if cell == Some(JobState::Canceled) {
                JobState::Canceled
            } else {
                JobState::Error
            };
            (state, Err(record))
        } else {
            // End of stream without a terminal frame: the worker died.
            (
                JobState::Error,
                Err(ErrorRecord::message(format!(
                    "lost connection to worker process with pid {pid}"
                ))),
            )
        };
        reg.finish(pid, state, now);
        if let Some(entry) = reg.get_mut(pid) {
            entry.segment = None;
            match &result {
                Ok(t) => entry.completion_tag = Some(t.clone()),
                Err(record) => entry.last_error = Some(record.clone()),
            }
        }
        self.supervisor.forget(pid);
        drop(reg);

        debug!(%handle, %state, rows = rows.len(), "consumed result stream");
        match result {
            Ok(tag) => Ok(JobResult {
                schema,
                rows,
                tag,
                state,
            }),
            Err(record) => Err(SessionError::Execution(record)),
        }
    }

    /// Forget a job without consuming its result. The worker keeps
    /// running; its remaining output is discarded.
    pub fn detach(&self, handle: JobHandle) -> Result<(), SessionError> {
        let mut reg = self.lock_registry();
        self.validate_entry(&mut reg, handle)?;
        reg.remove(handle.pid);
        drop(reg);
        self.supervisor.forget(handle.pid);
        info!(%handle, "detached from background job");
        Ok(())
    }

    /// Cancel with the default grace period.
    pub fn cancel(&self, handle: JobHandle) -> Result<JobState, SessionError> {
        self.cancel_with_grace(handle, DEFAULT_GRACE_MS)
    }

    /// Request cooperative cancellation, escalating after `grace_ms`.
    ///
    /// Sends SIGINT immediately; if the worker has not reached a terminal
    /// state when the grace period expires, sends SIGTERM. The grace
    /// period is clamped to one hour. Canceling an already-finished job
    /// is a no-op that reports the terminal state.
    pub fn cancel_with_grace(
        &self,
        handle: JobHandle,
        grace_ms: u64,
    ) -> Result<JobState, SessionError> {
        let grace = Duration::from_millis(grace_ms.min(MAX_GRACE_MS));
        let state = self.lookup_state(handle)?;
        if state.is_terminal() {
            return Ok(state);
        }
        let pid = handle.pid;
        info!(%handle, grace_ms = grace.as_millis() as u64, "canceling background job");
        self.supervisor.interrupt(pid)?;

        let deadline = Instant::now() + grace;
        let mut backoff = Backoff::with_max(Duration::from_millis(50));
        loop {
            let state = self.lookup_state(handle)?;
            if state.is_terminal() {
                return Ok(state);
            }
            if Instant::now() >= deadline {
                break;
            }
            backoff.snooze();
        }

        warn!(%handle, "grace period expired, escalating to SIGTERM");
        self.supervisor.terminate(pid)?;
        let deadline = Instant::now() + Duration::from_millis(500);
        let mut backoff = Backoff::with_max(Duration::from_millis(50));
        loop {
            let state = self.lookup_state(handle)?;
            if state.is_terminal() || Instant::now() >= deadline {
                return Ok(state);
            }
            backoff.snooze();
        }
    }

    /// Block until the job reaches a terminal state.
    pub fn wait(&self, handle: JobHandle) -> Result<JobState, SessionError> {
        self.wait_with_timeout(handle, None)
    }

    /// Block until the job reaches a terminal state or `timeout` passes.
    ///
    /// A timeout returns the current (still running) state; it never
    /// cancels or otherwise disturbs the job.
    pub fn wait_with_timeout(
        &self,
        handle: JobHandle,
        timeout: Option<Duration>,
    ) -> Result<JobState, SessionError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut backoff = Backoff::with_max(Duration::from_millis(50));
        loop {
            let state = self.lookup_state(handle)?;
            if state.is_terminal() {
                return Ok(state);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(state);
            }
            backoff.snooze();
        }
    }

    /// The worker's latest progress report.
    ///
    /// Readable any number of times while the job is registered and its
    /// segment is still mapped; consuming the result drops the segment.
    pub fn progress(&self, handle: JobHandle) -> Result<Progress, SessionError> {
        let mut reg = self.lock_registry();
        let entry = self.validate_entry(&mut reg, handle)?;
        match &entry.segment {
            Some(segment) => Ok(segment.progress()),
            None => Err(SessionError::AlreadyConsumed { pid: handle.pid }),
        }
    }

    /// Snapshots of every registered job, ordered by launch time.
    #[must_use]
    pub fn list(&self) -> Vec<EntrySnapshot> {
        let mut reg = self.lock_registry();
        self.refresh_locked(&mut reg);
        reg.list()
    }

    /// Aggregate counters for this session.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let mut reg = self.lock_registry();
        self.refresh_locked(&mut reg);
        let mut stats = reg.stats();
        stats.max_workers = self.config.max_workers;
        stats
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up and validate `handle`, refreshing observations first.
    fn lookup_state(&self, handle: JobHandle) -> Result<JobState, SessionError> {
        let mut reg = self.lock_registry();
        Ok(self.validate_entry(&mut reg, handle)?.state)
    }

    /// Entry for `handle` after a refresh, or the precise lookup error.
    fn validate_entry<'a>(
        &self,
        reg: &'a mut MutexGuard<'_, Registry>,
        handle: JobHandle,
    ) -> Result<&'a mut WorkerEntry, SessionError> {
        self.refresh_locked(reg);
        let pid = handle.pid;
        let entry = reg.get_mut(pid).ok_or(SessionError::NotFound { pid })?;
        if entry.handle.cookie != handle.cookie {
            return Err(SessionError::IdentityMismatch {
                pid,
                expected: entry.handle.cookie,
                observed: handle.cookie,
            });
        }
        Ok(entry)
    }

    /// Fold supervisor and segment observations into the registry.
    fn refresh_locked(&self, reg: &mut Registry) {
        let now = Utc::now();
        for pid in reg.pids() {
            let Some(entry) = reg.get(pid) else { continue };
            if entry.state.is_terminal() {
                continue;
            }
            let published = entry
                .segment
                .as_ref()
                .map(Segment::final_state)
                .filter(|s| s.is_terminal());
            if let Some(state) = published {
                reg.finish(pid, state, now);
                continue;
            }
            if self.supervisor.state(pid) == WorkerState::Stopped {
                // Process gone without publishing a terminal state.
                reg.finish(pid, JobState::Error, now);
            }
        }
    }

    /// Reserve a concurrency slot, or fail against the ceiling.
    fn reserve_slot(&self) -> Result<SlotGuard<'_>, SessionError> {
        let limit = self.config.max_workers;
        let running = {
            let mut reg = self.lock_registry();
            self.refresh_locked(&mut reg);
            reg.running()
        };
        let mut current = self.inflight.load(Ordering::Acquire);
        loop {
            if running + current >= limit {
                return Err(SessionError::LimitExceeded { limit });
            }
            match self.inflight.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(SlotGuard { session: self }),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let reg = self
            .registry
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for pid in reg.pids() {
            let still_running = reg.get(pid).is_some_and(|e| !e.state.is_terminal());
            if still_running && self.supervisor.state(pid) == WorkerState::Running {
                debug!(pid, "terminating worker at session teardown");
                let _ = self.supervisor.terminate(pid);
            }
            self.supervisor.forget(pid);
        }
    }
}

fn protocol_violation(pid: i32, err: ProtocolError) -> ErrorRecord {
    ErrorRecord::message(format!(
        "protocol violation from worker process {pid}: {err}"
    ))
}

/// In-flight launch reservation; released on drop.
struct SlotGuard<'a> {
    session: &'a Session,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.session.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}
