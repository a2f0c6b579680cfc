//! bgjob: run jobs in isolated background worker processes.
//!
//! A [`Session`] launches each job into its own worker process, connected
//! back to the launcher by a per-job POSIX shared-memory segment (see
//! `bgjob-core`). The session hands out [`JobHandle`]s — worker pid plus
//! a random cookie, so a handle can never be confused with a recycled
//! pid — and offers the full lifecycle around them: wait, cancel with
//! grace escalation, progress, single-use result consumption, detach,
//! and per-session statistics.
//!
//! ```no_run
//! use bgjob::{Session, SessionConfig};
//!
//! # fn main() -> Result<(), bgjob::SessionError> {
//! let session = Session::new(SessionConfig::default())?;
//! let handle = session.launch("rows 100")?;
//! session.wait(handle)?;
//! let result = session.result(handle)?;
//! assert_eq!(result.rows.len(), 100);
//! # Ok(())
//! # }
//! ```
//!
//! Workers run the [`executor::JobExecutor`] the binary was built with;
//! the stock `bgjob-worker` binary runs the script executor from
//! [`testkit`], and embedders provide their own via [`worker::run_worker`].

pub mod config;
pub mod error;
pub mod executor;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod testkit;
pub mod worker;

pub use bgjob_core::{ErrorRecord, JobHandle, JobState, Progress, Row, Schema, TypeTag};
pub use config::{ConfigSnapshot, SessionConfig, WorkerCommand};
pub use error::SessionError;
pub use registry::{EntrySnapshot, SessionStats};
pub use session::{JobResult, Session};
pub use supervisor::{ProcessSupervisor, WorkerState, WorkerSupervisor};
