//! bgjob-core: shared-memory transport for one launcher / one worker.
//!
//! This crate implements the wire-and-memory layer underneath the bgjob
//! session API: a per-job POSIX shared-memory segment, a bounded SPSC byte
//! queue living inside it, the framed result-stream protocol the worker
//! speaks back over that queue, and the pid+cookie identity model that
//! makes job handles survive OS pid reuse.
//!
//! # Segment layout
//!
//! One segment is created per launched job and carries four regions:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  SegmentHeader (fixed metadata, final-state + progress cell) │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Payload (job text, immutable after create)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config snapshot (JSON, immutable after create)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Bounded queue (worker → launcher result stream)             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The launcher creates and fully populates the segment before the worker
//! process exists, so every metadata and payload write happens-before the
//! worker's first read. The segment name is unlinked once the worker has
//! provably attached to the queue; from then on the kernel frees the
//! memory when the last side unmaps, which makes teardown crash-safe by
//! construction.
//!
//! # Identity
//!
//! Pids are recycled by the OS. Every launched job is therefore identified
//! by a [`JobHandle`]: the worker pid paired with a random 64-bit cookie
//! drawn from the OS entropy source at segment-creation time. Lookups
//! validate both fields; a pid match with a cookie mismatch is a distinct
//! condition from "no such job".

pub mod error;
pub mod handle;
pub mod layout;
pub mod protocol;
pub mod queue;
pub mod segment;
pub mod state;

pub use error::{ProtocolError, QueueError, SegmentError};
pub use handle::{JobHandle, new_cookie};
pub use layout::{Progress, truncate_utf8};
pub use protocol::{ErrorRecord, Frame, Row, Schema, SchemaField, TypeTag};
pub use queue::{Backoff, PeerState, QueueReceiver, QueueSender};
pub use segment::{Segment, SegmentMeta};
pub use state::JobState;

/// Smallest permitted queue capacity, in bytes.
pub const MIN_QUEUE_CAPACITY: usize = 4096;

/// Largest permitted queue capacity, in bytes (256 MiB).
pub const MAX_QUEUE_CAPACITY: usize = 256 * 1024 * 1024;

/// Default queue capacity, in bytes.
pub const DEFAULT_QUEUE_CAPACITY: usize = 65536;
