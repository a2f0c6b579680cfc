//! In-memory layout of the shared segment header.
//!
//! Everything in this module is mapped into two address spaces at once, so
//! the rules are the usual ones for cross-process memory: `#[repr(C)]`,
//! zero-initialized-is-valid, atomics for every field written after the
//! handoff, and no pointers of any kind.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Magic number identifying a bgjob segment ("BGJ1").
pub const SEGMENT_MAGIC: u32 = 0x4247_4a31;

/// Current segment layout version.
pub const LAYOUT_VERSION: u32 = 1;

/// Maximum stored length of the requesting user / target names.
pub const NAME_MAX: usize = 64;

/// Maximum stored length of a progress message.
pub const PROGRESS_MSG_MAX: usize = 120;

/// Fixed metadata at offset zero of every segment.
///
/// Written exclusively by the launcher before the worker starts, with two
/// exceptions that stay single-writer after the handoff: the final-state
/// cell and the progress cell are written by the worker and read by the
/// launcher, and the attach counter is touched by both sides on map/unmap.
#[repr(C)]
pub struct SegmentHeader {
    /// Must be [`SEGMENT_MAGIC`].
    pub magic: u32,
    /// Must be [`LAYOUT_VERSION`].
    pub version: u32,
    /// Job cookie; pairs with the worker pid to form the handle.
    pub cookie: u64,
    /// Segment creation time, milliseconds since the Unix epoch.
    pub created_at_ms: i64,
    /// Byte offset of the payload region.
    pub payload_off: u32,
    /// Payload length in bytes.
    pub payload_len: u32,
    /// Byte offset of the config-snapshot region.
    pub config_off: u32,
    /// Config snapshot length in bytes.
    pub config_len: u32,
    /// Byte offset of the queue region (header + ring).
    pub queue_off: u32,
    /// Queue ring capacity in bytes.
    pub queue_capacity: u32,
    /// Requesting user id.
    pub uid: u32,
    /// Requesting user name, NUL-padded.
    pub user: [u8; NAME_MAX],
    /// Target (database or host) name, NUL-padded.
    pub target: [u8; NAME_MAX],
    /// Number of currently mapped attachments.
    pub attach_count: AtomicU32,
    /// Terminal state published by the worker before it exits.
    ///
    /// Encodes [`crate::state::JobState`]; zero while still running.
    pub final_state: AtomicU32,
    /// Worker progress report; see [`ProgressCell`].
    pub progress: ProgressCell,
}

/// Single-writer progress report, readable without touching the queue.
///
/// A seqlock: the worker bumps `seq` to an odd value, writes percent and
/// message, then bumps it even again. Readers retry on odd or changed
/// sequence numbers. The worker is the only writer, so writes never
/// contend.
#[repr(C)]
pub struct ProgressCell {
    seq: AtomicU32,
    percent: AtomicU32,
    msg_len: AtomicU32,
    msg: UnsafeCell<[u8; PROGRESS_MSG_MAX]>,
}

// SAFETY: the message buffer is only written under the seqlock's odd
// sequence window, and readers discard anything read across a window.
unsafe impl Sync for ProgressCell {}

/// A decoded progress report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    /// Completion percentage, 0–100.
    pub percent: u32,
    /// Free-form progress message.
    pub message: String,
}

impl ProgressCell {
    /// Publish a progress report. Worker side only.
    pub fn write(&self, percent: u32, message: &str) {
        let msg = truncate_utf8(message, PROGRESS_MSG_MAX);
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        // Keeps the data stores inside the odd window.
        std::sync::atomic::fence(Ordering::Release);
        self.percent.store(percent.min(100), Ordering::Relaxed);
        self.msg_len.store(msg.len() as u32, Ordering::Relaxed);
        // The message buffer is plain bytes; racing readers are rejected by
        // the sequence check, so non-atomic byte copies are fine here.
        unsafe {
            let dst = (*self.msg.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(msg.as_ptr(), dst, msg.len());
        }
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Read the most recent progress report, retrying across torn writes.
    #[must_use]
    pub fn read(&self) -> Progress {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before % 2 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let percent = self.percent.load(Ordering::Relaxed);
            let len = (self.msg_len.load(Ordering::Relaxed) as usize).min(PROGRESS_MSG_MAX);
            let mut buf = vec![0u8; len];
            unsafe {
                let src = (*self.msg.get()).as_ptr();
                std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), len);
            }
            // Keeps the data reads above from reordering past the
            // sequence re-check.
            std::sync::atomic::fence(Ordering::Acquire);
            let after = self.seq.load(Ordering::Relaxed);
            if before == after {
                let message = String::from_utf8_lossy(&buf).into_owned();
                return Progress { percent, message };
            }
        }
    }
}

/// Copy a string into a fixed NUL-padded name field.
pub(crate) fn pack_name(s: &str) -> [u8; NAME_MAX] {
    let mut out = [0u8; NAME_MAX];
    let s = truncate_utf8(s, NAME_MAX);
    out[..s.len()].copy_from_slice(s.as_bytes());
    out
}

/// Decode a NUL-padded name field.
pub(crate) fn unpack_name(buf: &[u8; NAME_MAX]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Truncate `s` to at most `max` bytes without splitting a UTF-8 sequence.
#[must_use]
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Round `off` up to the next multiple of 8.
pub(crate) const fn align8(off: usize) -> usize {
    (off + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("hello", 3), "hel");
        // "é" is two bytes; cutting at 1 must not split it.
        assert_eq!(truncate_utf8("é", 1), "");
        assert_eq!(truncate_utf8("aé", 2), "a");
        assert_eq!(truncate_utf8("aé", 3), "aé");
    }

    #[test]
    fn name_pack_roundtrip() {
        let packed = pack_name("alice");
        assert_eq!(unpack_name(&packed), "alice");
        let long = "x".repeat(200);
        let packed = pack_name(&long);
        assert_eq!(unpack_name(&packed).len(), NAME_MAX);
    }

    #[test]
    fn progress_cell_read_after_write() {
        let cell: ProgressCell = unsafe { std::mem::zeroed() };
        assert_eq!(cell.read(), Progress::default());
        cell.write(42, "building index");
        let p = cell.read();
        assert_eq!(p.percent, 42);
        assert_eq!(p.message, "building index");
        cell.write(200, "");
        assert_eq!(cell.read().percent, 100);
    }

    #[test]
    fn progress_cell_is_consistent_under_concurrent_writes() {
        let cell: ProgressCell = unsafe { std::mem::zeroed() };
        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..=100u32 {
                    cell.write(i, &format!("step {i}"));
                }
            });
            // Every observed report must pair percent with its message;
            // a torn read would mix two writes.
            for _ in 0..10_000 {
                let p = cell.read();
                if !p.message.is_empty() {
                    assert_eq!(p.message, format!("step {}", p.percent));
                }
            }
        });
    }

    #[test]
    fn align8_rounds_up() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(13), 16);
    }
}
