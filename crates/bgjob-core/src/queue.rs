//! Bounded single-producer / single-consumer byte queue.
//!
//! The queue is a fixed-capacity ring living inside a shared segment. One
//! endpoint sends (the worker), one receives (the launcher). Messages are
//! length-prefixed; a message larger than the free space — or larger than
//! the whole ring — is written in chunks, with the writer blocking while
//! the ring is full. Blocking is a backoff sleep, never a busy spin.
//!
//! Attachment is explicit: each endpoint moves its peer cell from
//! `Absent` to `Attached`, and its `Drop` moves it to `Detached`. A
//! detached peer is observable from the other side as an end-of-stream
//! condition rather than a hang, and a queue is never reused once either
//! side has detached.

use std::any::Any;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::QueueError;

/// Magic number identifying an initialized queue region ("bq1\0").
pub(crate) const QUEUE_MAGIC: u32 = 0x6271_3100;

/// Attachment state of one queue endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PeerState {
    /// Endpoint has not attached yet.
    Absent = 0,
    /// Endpoint is attached and live.
    Attached = 1,
    /// Endpoint attached and has since gone away.
    Detached = 2,
}

impl PeerState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Attached,
            2 => Self::Detached,
            _ => Self::Absent,
        }
    }
}

/// Control block at the head of the queue region.
///
/// `head` and `tail` are free-running byte counters; `tail - head` is the
/// number of unread bytes in the ring. The receiver owns `head`, the
/// sender owns `tail`.
#[repr(C)]
pub(crate) struct QueueHeader {
    pub(crate) magic: u32,
    pub(crate) capacity: u32,
    head: AtomicU64,
    tail: AtomicU64,
    sender: AtomicU32,
    receiver: AtomicU32,
}

impl QueueHeader {
    pub(crate) fn init(&mut self, capacity: u32) {
        self.magic = QUEUE_MAGIC;
        self.capacity = capacity;
        self.head = AtomicU64::new(0);
        self.tail = AtomicU64::new(0);
        self.sender = AtomicU32::new(PeerState::Absent as u32);
        self.receiver = AtomicU32::new(PeerState::Absent as u32);
    }
}

/// Exponential backoff used by every blocking loop in this crate.
///
/// Starts with a short sleep and doubles up to a cap, which bounds CPU
/// cost for long waits while keeping latency low for short ones.
#[derive(Debug, Clone)]
pub struct Backoff {
    start: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Backoff from 50µs up to `max`.
    #[must_use]
    pub fn with_max(max: Duration) -> Self {
        let start = Duration::from_micros(50);
        Self {
            start,
            max: max.max(start),
            current: start,
        }
    }

    /// Sleep for the current interval, then double it (capped).
    pub fn snooze(&mut self) {
        std::thread::sleep(self.current);
        self.current = (self.current * 2).min(self.max);
    }

    /// Reset to the shortest interval after progress was made.
    pub fn reset(&mut self) {
        self.current = self.start;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::with_max(Duration::from_millis(2))
    }
}

/// Raw endpoint shared by sender and receiver.
///
/// `_owner` keeps the backing allocation (the segment mapping, or a heap
/// block in tests) alive for as long as the endpoint exists.
struct RawQueue {
    hdr: NonNull<QueueHeader>,
    data: NonNull<u8>,
    capacity: usize,
    _owner: Arc<dyn Any + Send + Sync>,
}

// SAFETY: the endpoint only touches the ring through atomics and
// disjoint byte ranges; ownership of an endpoint may move across threads.
unsafe impl Send for RawQueue {}

impl RawQueue {
    fn hdr(&self) -> &QueueHeader {
        // SAFETY: hdr points into the owner allocation, which _owner keeps
        // mapped for the lifetime of self.
        unsafe { self.hdr.as_ref() }
    }

    fn sender_state(&self) -> PeerState {
        PeerState::from_u32(self.hdr().sender.load(Ordering::Acquire))
    }

    fn receiver_state(&self) -> PeerState {
        PeerState::from_u32(self.hdr().receiver.load(Ordering::Acquire))
    }

    /// Copy `src` into the ring at byte position `pos` (mod capacity).
    unsafe fn ring_write(&self, pos: u64, src: &[u8]) {
        let off = (pos % self.capacity as u64) as usize;
        let first = src.len().min(self.capacity - off);
        let base = self.data.as_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(off), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(src[first..].as_ptr(), base, src.len() - first);
            }
        }
    }

    /// Copy from the ring at byte position `pos` into `dst`.
    unsafe fn ring_read(&self, pos: u64, dst: &mut [u8]) {
        let off = (pos % self.capacity as u64) as usize;
        let first = dst.len().min(self.capacity - off);
        let base = self.data.as_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(off), dst.as_mut_ptr(), first);
            if first < dst.len() {
                std::ptr::copy_nonoverlapping(base, dst[first..].as_mut_ptr(), dst.len() - first);
            }
        }
    }
}

/// Sending endpoint (worker side).
pub struct QueueSender {
    raw: RawQueue,
}

impl QueueSender {
    /// Attach as the sending endpoint. Fails if a sender ever attached.
    pub(crate) fn attach(
        hdr: NonNull<QueueHeader>,
        data: NonNull<u8>,
        capacity: usize,
        owner: Arc<dyn Any + Send + Sync>,
    ) -> Result<Self, QueueError> {
        let raw = RawQueue {
            hdr,
            data,
            capacity,
            _owner: owner,
        };
        raw.hdr()
            .sender
            .compare_exchange(
                PeerState::Absent as u32,
                PeerState::Attached as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| QueueError::AlreadyAttached)?;
        Ok(Self { raw })
    }

    /// Send one length-prefixed message, blocking while the ring is full.
    ///
    /// Returns [`QueueError::Detached`] once the receiver has gone away;
    /// data already written is then considered lost.
    pub fn send(&self, msg: &[u8]) -> Result<(), QueueError> {
        let len = (msg.len() as u32).to_le_bytes();
        self.write_all(&len)?;
        self.write_all(msg)
    }

    fn write_all(&self, mut src: &[u8]) -> Result<(), QueueError> {
        let hdr = self.raw.hdr();
        let mut backoff = Backoff::default();
        while !src.is_empty() {
            if self.raw.receiver_state() == PeerState::Detached {
                return Err(QueueError::Detached);
            }
            let head = hdr.head.load(Ordering::Acquire);
            let tail = hdr.tail.load(Ordering::Relaxed);
            let free = self.raw.capacity - (tail - head) as usize;
            if free == 0 {
                backoff.snooze();
                continue;
            }
            let n = free.min(src.len());
            // SAFETY: [tail, tail+n) is unused ring space; the receiver
            // only reads below tail.
            unsafe { self.raw.ring_write(tail, &src[..n]) };
            hdr.tail.store(tail + n as u64, Ordering::Release);
            src = &src[n..];
            backoff.reset();
        }
        Ok(())
    }
}

impl Drop for QueueSender {
    fn drop(&mut self) {
        self.raw
            .hdr()
            .sender
            .store(PeerState::Detached as u32, Ordering::Release);
    }
}

/// Receiving endpoint (launcher side).
pub struct QueueReceiver {
    raw: RawQueue,
}

/// Result of filling a buffer from the ring.
enum ReadOutcome {
    /// Buffer completely filled.
    Full,
    /// Sender detached after `0..len` bytes were available.
    Eos(usize),
}

impl QueueReceiver {
    /// Attach as the receiving endpoint. Fails if a receiver ever attached.
    pub(crate) fn attach(
        hdr: NonNull<QueueHeader>,
        data: NonNull<u8>,
        capacity: usize,
        owner: Arc<dyn Any + Send + Sync>,
    ) -> Result<Self, QueueError> {
        let raw = RawQueue {
            hdr,
            data,
            capacity,
            _owner: owner,
        };
        raw.hdr()
            .receiver
            .compare_exchange(
                PeerState::Absent as u32,
                PeerState::Attached as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| QueueError::AlreadyAttached)?;
        Ok(Self { raw })
    }

    /// Block until the sender has attached.
    ///
    /// A sender that attached and already detached counts as attached: the
    /// handshake only needs proof the worker reached the queue. `abort` is
    /// consulted while waiting so a worker that dies before attaching
    /// surfaces as an error instead of a hang.
    pub fn wait_for_attach(&self, abort: impl Fn() -> bool) -> Result<(), QueueError> {
        let mut backoff = Backoff::default();
        loop {
            if self.raw.sender_state() != PeerState::Absent {
                return Ok(());
            }
            if abort() {
                return Err(QueueError::Aborted);
            }
            backoff.snooze();
        }
    }

    /// Whether the sender has attached at some point.
    #[must_use]
    pub fn sender_seen(&self) -> bool {
        self.raw.sender_state() != PeerState::Absent
    }

    /// Receive one message, blocking while the queue is open and empty.
    ///
    /// `Ok(None)` is the clean end-of-stream: the sender detached and the
    /// ring is drained.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, QueueError> {
        self.recv_where(|| false)
    }

    /// [`recv`](Self::recv) with an abort check consulted while idle.
    ///
    /// Buffered data is always drained first; `abort` only fires when the
    /// ring is empty and the sender has not cleanly detached — the
    /// "worker died without detaching" case.
    pub fn recv_where(&self, abort: impl Fn() -> bool) -> Result<Option<Vec<u8>>, QueueError> {
        let mut len_buf = [0u8; 4];
        match self.read_exact(&mut len_buf, &abort)? {
            ReadOutcome::Eos(0) => return Ok(None),
            ReadOutcome::Eos(_) => return Err(QueueError::Corrupt("stream ended inside a length prefix")),
            ReadOutcome::Full => {}
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut msg = vec![0u8; len];
        match self.read_exact(&mut msg, &abort)? {
            ReadOutcome::Eos(_) => Err(QueueError::Corrupt("stream ended inside a message")),
            ReadOutcome::Full => Ok(Some(msg)),
        }
    }

    fn read_exact(
        &self,
        buf: &mut [u8],
        abort: &impl Fn() -> bool,
    ) -> Result<ReadOutcome, QueueError> {
        let hdr = self.raw.hdr();
        let mut filled = 0usize;
        let mut backoff = Backoff::default();
        while filled < buf.len() {
            let tail = hdr.tail.load(Ordering::Acquire);
            let head = hdr.head.load(Ordering::Relaxed);
            let avail = (tail - head) as usize;
            if avail == 0 {
                if self.raw.sender_state() == PeerState::Detached {
                    return Ok(ReadOutcome::Eos(filled));
                }
                if abort() {
                    return Err(QueueError::Aborted);
                }
                backoff.snooze();
                continue;
            }
            let n = avail.min(buf.len() - filled);
            // SAFETY: [head, head+n) holds published bytes; the sender
            // only writes at or above tail.
            unsafe { self.raw.ring_read(head, &mut buf[filled..filled + n]) };
            hdr.head.store(head + n as u64, Ordering::Release);
            filled += n;
            backoff.reset();
        }
        Ok(ReadOutcome::Full)
    }
}

impl Drop for QueueReceiver {
    fn drop(&mut self) {
        self.raw
            .hdr()
            .receiver
            .store(PeerState::Detached as u32, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Heap-backed queue pair, mirroring the segment layout without shm.
    fn pair(capacity: usize) -> (QueueSender, QueueReceiver) {
        #[repr(C)]
        struct Block {
            hdr: QueueHeader,
            data: Vec<u8>,
        }
        let mut hdr: QueueHeader = unsafe { std::mem::zeroed() };
        hdr.init(capacity as u32);
        let owner = Arc::new(Block {
            hdr,
            data: vec![0u8; capacity],
        });
        let hdr_ptr = NonNull::from(&owner.hdr);
        let data_ptr = NonNull::new(owner.data.as_ptr() as *mut u8).unwrap();
        let owner: Arc<dyn std::any::Any + Send + Sync> = owner;
        let tx = QueueSender::attach(hdr_ptr, data_ptr, capacity, owner.clone()).unwrap();
        let rx = QueueReceiver::attach(hdr_ptr, data_ptr, capacity, owner).unwrap();
        (tx, rx)
    }

    #[test]
    fn messages_arrive_in_order() {
        let (tx, rx) = pair(4096);
        tx.send(b"first").unwrap();
        tx.send(b"").unwrap();
        tx.send(b"third").unwrap();
        assert_eq!(rx.recv().unwrap().unwrap(), b"first");
        assert_eq!(rx.recv().unwrap().unwrap(), b"");
        assert_eq!(rx.recv().unwrap().unwrap(), b"third");
    }

    #[test]
    fn sender_drop_is_end_of_stream_after_drain() {
        let (tx, rx) = pair(4096);
        tx.send(b"last words").unwrap();
        drop(tx);
        assert_eq!(rx.recv().unwrap().unwrap(), b"last words");
        assert_eq!(rx.recv().unwrap(), None);
    }

    #[test]
    fn receiver_drop_fails_sends() {
        let (tx, rx) = pair(4096);
        drop(rx);
        assert_eq!(tx.send(b"into the void"), Err(QueueError::Detached));
    }

    #[test]
    fn second_sender_attach_is_rejected() {
        let (tx, _rx) = pair(4096);
        let hdr = tx.raw.hdr;
        let data = tx.raw.data;
        let owner = tx.raw._owner.clone();
        assert!(matches!(
            QueueSender::attach(hdr, data, 4096, owner),
            Err(QueueError::AlreadyAttached)
        ));
    }

    #[test]
    fn abort_check_fires_when_idle() {
        let (_tx, rx) = pair(4096);
        assert_eq!(rx.recv_where(|| true), Err(QueueError::Aborted));
    }

    #[test]
    fn message_larger_than_ring_is_chunked_through() {
        let (tx, rx) = pair(4096);
        let msg: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
        let expect = msg.clone();
        let writer = std::thread::spawn(move || tx.send(&msg));
        let got = rx.recv().unwrap().unwrap();
        writer.join().unwrap().unwrap();
        assert_eq!(got, expect);
    }

    #[test]
    fn backpressure_delivers_everything() {
        // Push ~1 MiB through rings from the minimum capacity upward; the
        // writer must block, never fail, and nothing may be lost or torn.
        for capacity in [4096usize, 64 * 1024, 1024 * 1024] {
            let (tx, rx) = pair(capacity);
            let sizes: Vec<usize> = (0..300).map(|i| 1 + (i * 37) % 10_240).collect();
            let total: usize = sizes.iter().sum();
            assert!(total > 1_000_000);
            let writer = std::thread::spawn(move || {
                for (i, size) in sizes.iter().enumerate() {
                    let body = vec![(i % 256) as u8; *size];
                    tx.send(&body).unwrap();
                }
            });
            let mut received = 0usize;
            let mut count = 0usize;
            while let Some(msg) = rx.recv().unwrap() {
                assert!(msg.iter().all(|&b| b == (count % 256) as u8));
                received += msg.len();
                count += 1;
            }
            writer.join().unwrap();
            assert_eq!(count, 300);
            assert_eq!(received, total);
        }
    }
}
