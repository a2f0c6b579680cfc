//! Worker process supervision.
//!
//! [`WorkerSupervisor`] is the seam between the session and the OS: it
//! starts a worker against a segment name, answers liveness queries and
//! delivers the two cancellation signals. The production implementation
//! spawns real processes; tests substitute an in-process implementation
//! so the session logic runs without forking.

use std::collections::{HashMap, HashSet};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::config::WorkerCommand;
use crate::error::SessionError;

/// Observed state of a supervised worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// The process exists and has not been reaped.
    Running,
    /// The process has exited and been reaped.
    Stopped,
    /// The supervisor has no record of this pid.
    Unknown,
}

/// Starts, polls and signals worker processes.
pub trait WorkerSupervisor: Send + Sync {
    /// Start a worker against `segment_name` and return its pid.
    fn start(&self, segment_name: &str) -> Result<i32, SessionError>;

    /// Current liveness of `pid`.
    fn state(&self, pid: i32) -> WorkerState;

    /// Ask the worker to stop cooperatively (SIGINT).
    fn interrupt(&self, pid: i32) -> Result<(), SessionError>;

    /// Force the worker down (SIGTERM).
    fn terminate(&self, pid: i32) -> Result<(), SessionError>;

    /// Drop all bookkeeping for `pid` after its entry is removed.
    fn forget(&self, pid: i32);
}

/// Supervisor backed by real child processes.
pub struct ProcessSupervisor {
    command: WorkerCommand,
    children: Mutex<HashMap<i32, Child>>,
    // Exit is a sticky observation: a reaped pid answers Stopped until
    // it is forgotten, no matter how many callers ask.
    reaped: Mutex<HashSet<i32>>,
}

impl ProcessSupervisor {
    /// Supervisor that starts workers with `command`.
    #[must_use]
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            children: Mutex::new(HashMap::new()),
            reaped: Mutex::new(HashSet::new()),
        }
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<(), SessionError> {
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => Ok(()),
            // Already gone; the caller observes that through state().
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(nix::errno::Errno::EPERM) => Err(SessionError::PermissionDenied { pid }),
            Err(err) => Err(SessionError::ResourceExhausted(format!(
                "kill({pid}, {signal}) failed: {err}"
            ))),
        }
    }
}

impl WorkerSupervisor for ProcessSupervisor {
    fn start(&self, segment_name: &str) -> Result<i32, SessionError> {
        let child = Command::new(&self.command.program)
            .args(&self.command.args)
            .arg("--segment")
            .arg(segment_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| {
                SessionError::ResourceExhausted(format!(
                    "failed to spawn {}: {err}",
                    self.command.program
                ))
            })?;
        let pid = child.id() as i32;
        debug!(pid, segment = segment_name, "spawned worker process");
        self.children
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(pid, child);
        Ok(pid)
    }

    fn state(&self, pid: i32) -> WorkerState {
        if self
            .reaped
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&pid)
        {
            return WorkerState::Stopped;
        }
        let mut children = self
            .children
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(child) = children.get_mut(&pid) else {
            return WorkerState::Unknown;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, %status, "worker process exited");
                children.remove(&pid);
                drop(children);
                self.reaped
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .insert(pid);
                WorkerState::Stopped
            }
            Ok(None) => WorkerState::Running,
            Err(err) => {
                warn!(pid, %err, "failed to poll worker process");
                WorkerState::Unknown
            }
        }
    }

    fn interrupt(&self, pid: i32) -> Result<(), SessionError> {
        self.signal(pid, Signal::SIGINT)
    }

    fn terminate(&self, pid: i32) -> Result<(), SessionError> {
        self.signal(pid, Signal::SIGTERM)
    }

    fn forget(&self, pid: i32) {
        let mut children = self
            .children
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(mut child) = children.remove(&pid) {
            // Reap if already dead; never block on a live process here.
            let _ = child.try_wait();
        }
        drop(children);
        self.reaped
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&pid);
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let mut children = self
            .children
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (pid, child) in children.iter_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                debug!(pid, "terminating leftover worker at session teardown");
                let _ = kill(Pid::from_raw(*pid), Signal::SIGTERM);
                let _ = child.wait();
            }
        }
        children.clear();
    }
}
