//! Per-job POSIX shared memory segments.
//!
//! The launcher creates one segment per launched job, fully populates it
//! (metadata, payload, config snapshot, queue control block) and only then
//! asks the supervisor to start a worker against it. The worker opens the
//! segment by name. Once the attach handshake has completed the launcher
//! unlinks the name, after which the kernel frees the memory when the
//! last side unmaps — teardown needs no cooperation from either process.

use std::any::Any;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::{Mode, fstat};
use tracing::debug;

use crate::error::{QueueError, SegmentError};
use crate::layout::{
    LAYOUT_VERSION, Progress, SEGMENT_MAGIC, SegmentHeader, align8, pack_name, unpack_name,
};
use crate::queue::{QUEUE_MAGIC, QueueHeader, QueueReceiver, QueueSender};
use crate::state::JobState;
use crate::{MAX_QUEUE_CAPACITY, MIN_QUEUE_CAPACITY};

/// Hard ceiling on the payload region (job text).
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Hard ceiling on the config-snapshot region.
pub const MAX_CONFIG_LEN: usize = 16 * 1024 * 1024;

/// Launcher-provided fixed metadata written into the segment header.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    /// Job cookie.
    pub cookie: u64,
    /// Requesting user id.
    pub uid: u32,
    /// Requesting user name.
    pub user: String,
    /// Target (database or host) the job runs against.
    pub target: String,
}

/// The mapping itself; shared between the segment and its queue endpoint
/// so the memory stays mapped as long as either is alive.
struct SegmentMap {
    base: NonNull<std::ffi::c_void>,
    len: usize,
    name: String,
    unlink_on_drop: AtomicBool,
}

// SAFETY: the mapping is plain shared memory; all post-handoff access
// goes through atomics or immutable regions.
unsafe impl Send for SegmentMap {}
unsafe impl Sync for SegmentMap {}

impl SegmentMap {
    fn header(&self) -> &SegmentHeader {
        // SAFETY: construction validated that the mapping is at least
        // header-sized and carries our magic.
        unsafe { &*(self.base.as_ptr() as *const SegmentHeader) }
    }

    fn bytes(&self, off: usize, len: usize) -> &[u8] {
        debug_assert!(off + len <= self.len);
        // SAFETY: offsets were validated against the mapping length at
        // construction; the regions are immutable after creation.
        unsafe { std::slice::from_raw_parts((self.base.as_ptr() as *const u8).add(off), len) }
    }
}

impl Drop for SegmentMap {
    fn drop(&mut self) {
        self.header().attach_count.fetch_sub(1, Ordering::AcqRel);
        // SAFETY: base/len describe the mapping made at construction.
        if let Err(err) = unsafe { munmap(self.base, self.len) } {
            debug!(name = %self.name, %err, "munmap failed during segment teardown");
        }
        if self.unlink_on_drop.load(Ordering::Acquire) {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}

/// A mapped per-job shared memory segment.
pub struct Segment {
    map: Arc<SegmentMap>,
}

impl Segment {
    /// Create, size and fully populate a new segment.
    ///
    /// Every allocation failure surfaces as a distinct [`SegmentError`];
    /// nothing here panics on OS refusal. The name is exclusive: a
    /// leftover object with the same name is an error, not something to
    /// silently reuse.
    pub fn create(
        name: &str,
        meta: &SegmentMeta,
        payload: &[u8],
        config_json: &[u8],
        queue_capacity: usize,
    ) -> Result<Self, SegmentError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(SegmentError::RegionTooLarge {
                what: "payload",
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        if config_json.len() > MAX_CONFIG_LEN {
            return Err(SegmentError::RegionTooLarge {
                what: "config snapshot",
                len: config_json.len(),
                max: MAX_CONFIG_LEN,
            });
        }
        if !(MIN_QUEUE_CAPACITY..=MAX_QUEUE_CAPACITY).contains(&queue_capacity) {
            return Err(SegmentError::RegionTooLarge {
                what: "queue",
                len: queue_capacity,
                max: MAX_QUEUE_CAPACITY,
            });
        }

        let payload_off = align8(std::mem::size_of::<SegmentHeader>());
        let config_off = align8(payload_off + payload.len());
        let queue_off = align8(config_off + config_json.len());
        let total = queue_off + std::mem::size_of::<QueueHeader>() + queue_capacity;

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|source| SegmentError::Create {
            name: name.to_owned(),
            source,
        })?;

        if let Err(source) = nix::unistd::ftruncate(&fd, total as i64) {
            let _ = shm_unlink(name);
            return Err(SegmentError::Resize {
                name: name.to_owned(),
                len: total,
                source,
            });
        }

        let base = match map_fd(&fd, total) {
            Ok(base) => base,
            Err(source) => {
                let _ = shm_unlink(name);
                return Err(SegmentError::Map {
                    name: name.to_owned(),
                    source,
                });
            }
        };
        drop(fd); // the mapping holds its own reference

        // ftruncate zero-filled the object, so untouched fields (final
        // state, progress cell) are already in their valid initial state.
        // SAFETY: the mapping is fresh, private to this function until we
        // return, and at least `total` bytes long.
        unsafe {
            let hdr = &mut *(base.as_ptr() as *mut SegmentHeader);
            hdr.magic = SEGMENT_MAGIC;
            hdr.version = LAYOUT_VERSION;
            hdr.cookie = meta.cookie;
            hdr.created_at_ms = unix_millis();
            hdr.payload_off = payload_off as u32;
            hdr.payload_len = payload.len() as u32;
            hdr.config_off = config_off as u32;
            hdr.config_len = config_json.len() as u32;
            hdr.queue_off = queue_off as u32;
            hdr.queue_capacity = queue_capacity as u32;
            hdr.uid = meta.uid;
            hdr.user = pack_name(&meta.user);
            hdr.target = pack_name(&meta.target);
            hdr.attach_count.store(1, Ordering::Release);

            let dst = base.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(payload.as_ptr(), dst.add(payload_off), payload.len());
            std::ptr::copy_nonoverlapping(
                config_json.as_ptr(),
                dst.add(config_off),
                config_json.len(),
            );

            let qhdr = &mut *(dst.add(queue_off) as *mut QueueHeader);
            qhdr.init(queue_capacity as u32);
        }

        debug!(name, total, queue_capacity, "created shared segment");
        Ok(Self {
            map: Arc::new(SegmentMap {
                base,
                len: total,
                name: name.to_owned(),
                unlink_on_drop: AtomicBool::new(true),
            }),
        })
    }

    /// Open an existing segment by name (worker side).
    pub fn open(name: &str) -> Result<Self, SegmentError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|source| {
            SegmentError::Open {
                name: name.to_owned(),
                source,
            }
        })?;

        let stat = fstat(fd.as_raw_fd()).map_err(|source| SegmentError::Open {
            name: name.to_owned(),
            source,
        })?;
        let len = stat.st_size as usize;
        let need = std::mem::size_of::<SegmentHeader>();
        if len < need {
            return Err(SegmentError::Truncated {
                name: name.to_owned(),
                len,
                need,
            });
        }

        let base = map_fd(&fd, len).map_err(|source| SegmentError::Map {
            name: name.to_owned(),
            source,
        })?;
        drop(fd);

        let map = SegmentMap {
            base,
            len,
            name: name.to_owned(),
            unlink_on_drop: AtomicBool::new(false),
        };
        // Incremented up front so the decrement in Drop stays symmetric
        // even when validation below bails out.
        let hdr = map.header();
        hdr.attach_count.fetch_add(1, Ordering::AcqRel);
        if hdr.magic != SEGMENT_MAGIC {
            return Err(SegmentError::BadMagic {
                name: name.to_owned(),
            });
        }
        if hdr.version != LAYOUT_VERSION {
            return Err(SegmentError::Version {
                name: name.to_owned(),
                found: hdr.version,
            });
        }
        let need =
            hdr.queue_off as usize + std::mem::size_of::<QueueHeader>() + hdr.queue_capacity as usize;
        if len < need {
            return Err(SegmentError::Truncated {
                name: name.to_owned(),
                len,
                need,
            });
        }

        debug!(name, len, "opened shared segment");
        Ok(Self { map: Arc::new(map) })
    }

    /// Segment name, e.g. `/bgjob-1234-00a1b2...`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.map.name
    }

    /// Job cookie stored at creation.
    #[must_use]
    pub fn cookie(&self) -> u64 {
        self.map.header().cookie
    }

    /// Requesting user id.
    #[must_use]
    pub fn uid(&self) -> u32 {
        self.map.header().uid
    }

    /// Requesting user name.
    #[must_use]
    pub fn user(&self) -> String {
        unpack_name(&self.map.header().user)
    }

    /// Target name.
    #[must_use]
    pub fn target(&self) -> String {
        unpack_name(&self.map.header().target)
    }

    /// Creation time, milliseconds since the Unix epoch.
    #[must_use]
    pub fn created_at_ms(&self) -> i64 {
        self.map.header().created_at_ms
    }

    /// Configured queue capacity in bytes.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.map.header().queue_capacity as usize
    }

    /// The job payload (immutable after creation).
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let hdr = self.map.header();
        self.map
            .bytes(hdr.payload_off as usize, hdr.payload_len as usize)
    }

    /// The serialized config snapshot (immutable after creation).
    #[must_use]
    pub fn config_json(&self) -> &[u8] {
        let hdr = self.map.header();
        self.map
            .bytes(hdr.config_off as usize, hdr.config_len as usize)
    }

    /// Number of currently mapped attachments.
    #[must_use]
    pub fn attach_count(&self) -> u32 {
        self.map.header().attach_count.load(Ordering::Acquire)
    }

    /// Terminal state published by the worker, if any.
    #[must_use]
    pub fn final_state(&self) -> JobState {
        JobState::from_cell(self.map.header().final_state.load(Ordering::Acquire))
            .unwrap_or(JobState::Error)
    }

    /// Publish the worker's terminal state. The first terminal write
    /// wins; later writes are ignored.
    pub fn publish_final_state(&self, state: JobState) {
        if !state.is_terminal() {
            return;
        }
        let _ = self.map.header().final_state.compare_exchange(
            JobState::Running.to_cell(),
            state.to_cell(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Read the worker's progress report.
    #[must_use]
    pub fn progress(&self) -> Progress {
        self.map.header().progress.read()
    }

    /// Publish a progress report (worker side).
    pub fn report_progress(&self, percent: u32, message: &str) {
        self.map.header().progress.write(percent, message);
    }

    /// Remove the segment name now that the worker has attached.
    ///
    /// After this the mapping is anonymous: memory is freed when the last
    /// attacher unmaps, and a crash on either side cannot leak the name.
    pub fn unlink_now(&self) {
        if self.map.unlink_on_drop.swap(false, Ordering::AcqRel) {
            let _ = shm_unlink(self.map.name.as_str());
            debug!(name = %self.map.name, "unlinked segment name");
        }
    }

    /// Attach the receiving queue endpoint (launcher side).
    pub fn receiver(&self) -> Result<QueueReceiver, QueueError> {
        let (hdr, data, capacity) = self.queue_parts()?;
        QueueReceiver::attach(hdr, data, capacity, self.owner())
    }

    /// Attach the sending queue endpoint (worker side).
    ///
    /// This is the worker's half of the attach handshake: the launcher
    /// blocks in `launch` until this attachment is visible.
    pub fn sender(&self) -> Result<QueueSender, QueueError> {
        let (hdr, data, capacity) = self.queue_parts()?;
        QueueSender::attach(hdr, data, capacity, self.owner())
    }

    fn owner(&self) -> Arc<dyn Any + Send + Sync> {
        self.map.clone()
    }

    fn queue_parts(&self) -> Result<(NonNull<QueueHeader>, NonNull<u8>, usize), QueueError> {
        let hdr = self.map.header();
        let queue_off = hdr.queue_off as usize;
        let base = self.map.base.as_ptr() as *mut u8;
        // SAFETY: queue_off + header + capacity was validated against the
        // mapping length when the segment was created/opened.
        let qhdr = unsafe { base.add(queue_off) as *mut QueueHeader };
        let data = unsafe { base.add(queue_off + std::mem::size_of::<QueueHeader>()) };
        // SAFETY: qhdr points at the initialized queue control block.
        let magic = unsafe { (*qhdr).magic };
        if magic != QUEUE_MAGIC {
            return Err(QueueError::Corrupt("bad queue magic"));
        }
        let capacity = unsafe { (*qhdr).capacity } as usize;
        let hdr = NonNull::new(qhdr).ok_or(QueueError::Corrupt("null queue header"))?;
        let data = NonNull::new(data).ok_or(QueueError::Corrupt("null queue ring"))?;
        Ok((hdr, data, capacity))
    }
}

fn map_fd(fd: &OwnedFd, len: usize) -> nix::Result<NonNull<std::ffi::c_void>> {
    let len = NonZeroUsize::new(len).ok_or(nix::Error::EINVAL)?;
    // SAFETY: fresh mapping of a valid fd; does not alias any existing
    // Rust object in this process.
    unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
}

fn unix_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, Row};
    use std::sync::atomic::AtomicU64;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn unique_name() -> String {
        format!(
            "/bgjob-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn meta() -> SegmentMeta {
        SegmentMeta {
            cookie: 0xfeed_f00d,
            uid: 1000,
            user: "alice".into(),
            target: "analytics".into(),
        }
    }

    #[test]
    fn create_then_open_sees_all_regions() {
        let name = unique_name();
        let created = Segment::create(&name, &meta(), b"select 1", b"{}", 4096).unwrap();
        let opened = Segment::open(&name).unwrap();
        assert_eq!(opened.cookie(), 0xfeed_f00d);
        assert_eq!(opened.uid(), 1000);
        assert_eq!(opened.user(), "alice");
        assert_eq!(opened.target(), "analytics");
        assert_eq!(opened.payload(), b"select 1");
        assert_eq!(opened.config_json(), b"{}");
        assert_eq!(opened.queue_capacity(), 4096);
        assert_eq!(created.attach_count(), 2);
        created.unlink_now();
        assert!(Segment::open(&name).is_err());
    }

    #[test]
    fn queue_flows_between_mappings() {
        let name = unique_name();
        let launcher = Segment::create(&name, &meta(), b"job", b"{}", 4096).unwrap();
        let rx = launcher.receiver().unwrap();
        assert!(!rx.sender_seen());

        let worker = Segment::open(&name).unwrap();
        launcher.unlink_now();
        let handle = std::thread::spawn(move || {
            let tx = worker.sender().unwrap();
            tx.send(&Frame::Data(Row::from_i64(42)).encode()).unwrap();
            tx.send(&Frame::Complete { tag: "OK".into() }.encode())
                .unwrap();
            worker.publish_final_state(JobState::Stopped);
        });

        rx.wait_for_attach(|| false).unwrap();
        let frame = Frame::decode(&rx.recv().unwrap().unwrap()).unwrap();
        let Frame::Data(row) = frame else {
            panic!("expected a data frame");
        };
        assert_eq!(row.i64_field(0), Some(42));
        let frame = Frame::decode(&rx.recv().unwrap().unwrap()).unwrap();
        assert_eq!(frame, Frame::Complete { tag: "OK".into() });
        assert_eq!(rx.recv().unwrap(), None);
        handle.join().unwrap();
        assert_eq!(launcher.final_state(), JobState::Stopped);
    }

    #[test]
    fn progress_cell_crosses_mappings() {
        let name = unique_name();
        let launcher = Segment::create(&name, &meta(), b"job", b"{}", 4096).unwrap();
        let worker = Segment::open(&name).unwrap();
        launcher.unlink_now();
        worker.report_progress(60, "more than half done");
        let p = launcher.progress();
        assert_eq!(p.percent, 60);
        assert_eq!(p.message, "more than half done");
    }

    #[test]
    fn double_create_same_name_fails() {
        let name = unique_name();
        let first = Segment::create(&name, &meta(), b"job", b"{}", 4096).unwrap();
        assert!(matches!(
            Segment::create(&name, &meta(), b"job", b"{}", 4096),
            Err(SegmentError::Create { .. })
        ));
        first.unlink_now();
    }

    #[test]
    fn first_terminal_state_wins() {
        let name = unique_name();
        let seg = Segment::create(&name, &meta(), b"job", b"{}", 4096).unwrap();
        seg.unlink_now();
        assert_eq!(seg.final_state(), JobState::Running);
        seg.publish_final_state(JobState::Canceled);
        seg.publish_final_state(JobState::Stopped);
        assert_eq!(seg.final_state(), JobState::Canceled);
    }

    #[test]
    fn oversized_regions_are_rejected_before_allocation() {
        let name = unique_name();
        assert!(matches!(
            Segment::create(&name, &meta(), b"job", b"{}", 1024),
            Err(SegmentError::RegionTooLarge { what: "queue", .. })
        ));
        // The failed create must not have left a named object behind.
        assert!(Segment::open(&name).is_err());
    }
}
