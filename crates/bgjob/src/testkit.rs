//! Test support: a scriptable executor and an in-process supervisor.
//!
//! [`ScriptExecutor`] interprets a tiny line-oriented job language, which
//! gives tests (and the stock `bgjob-worker` binary) deterministic jobs
//! without a real database behind them. [`ThreadSupervisor`] runs workers
//! on threads instead of processes, so every session code path except
//! actual signal delivery is exercised without forking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use bgjob_core::{ErrorRecord, Row, Schema, TypeTag};
use tracing::debug;

use crate::error::SessionError;
use crate::executor::{CancelToken, ExecError, JobContext, JobExecutor};
use crate::supervisor::{WorkerState, WorkerSupervisor};
use crate::worker::run_worker_with_token;

/// Executor for a line-oriented job script.
///
/// One command per line; blank lines and `#` comments are skipped:
///
/// ```text
/// row 42            emit one int64 row
/// text hello        emit one text row
/// rows 1000         emit int64 rows 0..1000
/// blob 65536        emit one row of that many bytes
/// sleep 250         sleep, polling for cancellation
/// write /some/path  create a marker file (an observable side effect)
/// progress 40 msg   publish a progress report
/// fail message      fail the job with this message
/// ```
///
/// The schema is fixed by the first data command.
#[derive(Debug, Default)]
pub struct ScriptExecutor;

impl ScriptExecutor {
    fn ensure_schema(
        ctx: &mut JobContext<'_>,
        sent: &mut Option<TypeTag>,
        tag: TypeTag,
    ) -> Result<(), ExecError> {
        match sent {
            Some(_) => Ok(()),
            None => {
                *sent = Some(tag);
                ctx.send_schema(&Schema::single("value", tag))
            }
        }
    }

    fn bad(line: &str, err: impl std::fmt::Display) -> ExecError {
        ExecError::Failed(ErrorRecord {
            message: format!("bad script line {line:?}: {err}"),
            hint: Some("see the ScriptExecutor docs for the command list".to_owned()),
            ..ErrorRecord::default()
        })
    }
}

impl JobExecutor for ScriptExecutor {
    fn execute(&self, job: &str, ctx: &mut JobContext<'_>) -> Result<String, ExecError> {
        let mut schema: Option<TypeTag> = None;
        for line in job.lines() {
            ctx.check_cancel()?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
            let rest = rest.trim();
            match cmd {
                "row" => {
                    let v: i64 = rest.parse().map_err(|e| Self::bad(line, e))?;
                    Self::ensure_schema(ctx, &mut schema, TypeTag::Int64)?;
                    ctx.send_row(Row::from_i64(v))?;
                }
                "text" => {
                    Self::ensure_schema(ctx, &mut schema, TypeTag::Text)?;
                    ctx.send_row(Row::from_text(rest))?;
                }
                "rows" => {
                    let n: i64 = rest.parse().map_err(|e| Self::bad(line, e))?;
                    Self::ensure_schema(ctx, &mut schema, TypeTag::Int64)?;
                    for i in 0..n {
                        if i % 64 == 0 {
                            ctx.check_cancel()?;
                        }
                        ctx.send_row(Row::from_i64(i))?;
                    }
                }
                "blob" => {
                    let n: usize = rest.parse().map_err(|e| Self::bad(line, e))?;
                    Self::ensure_schema(ctx, &mut schema, TypeTag::Bytes)?;
                    ctx.send_row(Row {
                        fields: vec![Some(vec![b'x'; n])],
                    })?;
                }
                "sleep" => {
                    let ms: u64 = rest.parse().map_err(|e| Self::bad(line, e))?;
                    let mut left = ms;
                    while left > 0 {
                        ctx.check_cancel()?;
                        let step = left.min(10);
                        std::thread::sleep(Duration::from_millis(step));
                        left -= step;
                    }
                }
                "write" => {
                    // Observable side effect, the script's "commit point".
                    std::fs::write(rest, b"done").map_err(|e| Self::bad(line, e))?;
                }
                "progress" => {
                    let (pct, msg) = rest.split_once(' ').unwrap_or((rest, ""));
                    let pct: u32 = pct.parse().map_err(|e| Self::bad(line, e))?;
                    ctx.report_progress(pct, msg);
                }
                "fail" => {
                    return Err(ExecError::Failed(ErrorRecord::message(rest)));
                }
                _ => return Err(Self::bad(line, "unknown command")),
            }
        }
        Ok(format!("OK {}", ctx.rows_sent()))
    }
}

struct ThreadWorker {
    token: CancelToken,
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Supervisor that runs workers as threads of the test process.
///
/// Pids are synthetic (starting at 100 000, well above any real child
/// this process could have) and cancellation signals become token
/// cancellations. `force_next_pid` lets pid-reuse tests pick the pid a
/// "new" worker will get.
#[derive(Default)]
pub struct ThreadSupervisor {
    next_pid: AtomicI32,
    forced: Mutex<Vec<i32>>,
    workers: Mutex<HashMap<i32, ThreadWorker>>,
}

impl ThreadSupervisor {
    /// Fresh supervisor with no workers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_pid: AtomicI32::new(100_000),
            forced: Mutex::new(Vec::new()),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next started worker claim `pid`.
    pub fn force_next_pid(&self, pid: i32) {
        self.forced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pid);
    }
}

impl WorkerSupervisor for ThreadSupervisor {
    fn start(&self, segment_name: &str) -> Result<i32, SessionError> {
        let pid = self
            .forced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| self.next_pid.fetch_add(1, Ordering::AcqRel));
        let token = CancelToken::new();
        let done = Arc::new(AtomicBool::new(false));
        let name = segment_name.to_owned();
        let thread_token = token.clone();
        let thread_done = Arc::clone(&done);
        let handle = std::thread::spawn(move || {
            if let Err(err) = run_worker_with_token(&name, &ScriptExecutor, thread_token) {
                debug!(segment = %name, %err, "thread worker failed");
            }
            thread_done.store(true, Ordering::Release);
        });
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                pid,
                ThreadWorker {
                    token,
                    done,
                    handle: Some(handle),
                },
            );
        Ok(pid)
    }

    fn state(&self, pid: i32) -> WorkerState {
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        match workers.get(&pid) {
            Some(w) if w.done.load(Ordering::Acquire) => WorkerState::Stopped,
            Some(_) => WorkerState::Running,
            None => WorkerState::Unknown,
        }
    }

    fn interrupt(&self, pid: i32) -> Result<(), SessionError> {
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(w) = workers.get(&pid) {
            w.token.cancel();
        }
        Ok(())
    }

    fn terminate(&self, pid: i32) -> Result<(), SessionError> {
        self.interrupt(pid)
    }

    fn forget(&self, pid: i32) {
        let worker = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
        if let Some(mut w) = worker {
            if w.done.load(Ordering::Acquire) {
                if let Some(handle) = w.handle.take() {
                    let _ = handle.join();
                }
            }
            // A still-running worker keeps running detached, matching
            // process semantics.
        }
    }
}

impl Drop for ThreadSupervisor {
    fn drop(&mut self) {
        let workers = self
            .workers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for w in workers.values() {
            w.token.cancel();
        }
        for w in workers.values_mut() {
            if let Some(handle) = w.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
