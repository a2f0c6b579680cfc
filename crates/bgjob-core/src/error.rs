//! Error types for the segment, queue and protocol layers.

use thiserror::Error;

/// Errors raised while creating, opening or tearing down a shared segment.
///
/// Allocation failures are surfaced as distinct, retriable conditions; the
/// session layer maps them to its `ResourceExhausted` taxonomy entry.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// The OS refused to allocate the shared memory object.
    #[error("could not create shared memory segment {name}: {source}")]
    Create {
        /// Segment name.
        name: String,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },

    /// The named segment could not be opened.
    #[error("could not open shared memory segment {name}: {source}")]
    Open {
        /// Segment name.
        name: String,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },

    /// The segment could not be resized to the requested length.
    #[error("could not size shared memory segment {name} to {len} bytes: {source}")]
    Resize {
        /// Segment name.
        name: String,
        /// Requested length in bytes.
        len: usize,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },

    /// Mapping the segment into the address space failed.
    #[error("could not map shared memory segment {name}: {source}")]
    Map {
        /// Segment name.
        name: String,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },

    /// The mapped object does not start with the expected magic number.
    #[error("bad magic number in shared memory segment {name}")]
    BadMagic {
        /// Segment name.
        name: String,
    },

    /// The segment was produced by an incompatible layout version.
    #[error("unsupported segment layout version {found} in {name}")]
    Version {
        /// Segment name.
        name: String,
        /// Version found in the header.
        found: u32,
    },

    /// The object is smaller than its header claims.
    #[error("shared memory segment {name} is truncated ({len} bytes, need {need})")]
    Truncated {
        /// Segment name.
        name: String,
        /// Actual object length.
        len: usize,
        /// Minimum required length.
        need: usize,
    },

    /// A region parameter exceeded its hard limit.
    #[error("segment region too large: {what} is {len} bytes, max is {max}")]
    RegionTooLarge {
        /// Which region was oversized.
        what: &'static str,
        /// Requested length.
        len: usize,
        /// Hard limit.
        max: usize,
    },
}

/// Errors raised by bounded queue operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The peer has detached; no further messages will flow.
    ///
    /// For a receiver this is the end-of-stream condition; for a sender it
    /// means the reader is gone and the message was not delivered.
    #[error("queue peer has detached")]
    Detached,

    /// A blocking operation was abandoned because the caller's abort
    /// check fired (typically: the peer process died without detaching).
    #[error("queue operation aborted")]
    Aborted,

    /// Another peer already holds this end of the queue.
    #[error("queue endpoint is already attached")]
    AlreadyAttached,

    /// The ring contents are inconsistent with the protocol.
    #[error("queue corrupted: {0}")]
    Corrupt(&'static str),
}

/// Errors raised while decoding result-stream frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame tag byte is not one of the known kinds.
    #[error("unknown frame tag {0:#04x}")]
    UnknownFrame(u8),

    /// The frame ended before its declared contents.
    #[error("truncated frame")]
    Truncated,

    /// A schema carried an unknown field type tag.
    #[error("unknown field type tag {0:#04x}")]
    UnknownTypeTag(u8),

    /// A textual field was not valid UTF-8.
    #[error("invalid utf-8 in frame field")]
    InvalidUtf8,

    /// A data frame's field count does not match the schema.
    #[error("data frame has {found} fields, schema has {expected}")]
    FieldCount {
        /// Field count declared by the schema.
        expected: usize,
        /// Field count found in the data frame.
        found: usize,
    },

    /// A data frame arrived before any schema frame.
    #[error("data frame not preceded by a schema frame")]
    RowBeforeSchema,

    /// More than one schema frame arrived on the same stream.
    #[error("multiple schema frames on one result stream")]
    DuplicateSchema,
}
