//! Job handles: pid plus non-recyclable cookie.

use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Identity of one launched job for the lifetime of a session.
///
/// The pid alone is not a stable identity: the OS recycles pids, and a
/// stale pid can come back to life as an unrelated process. The cookie is
/// drawn from the OS entropy source at segment-creation time (before the
/// worker exists) and is never reused, so a `(pid, cookie)` pair names
/// exactly one launch. Every registry lookup validates both fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    /// OS process id of the worker.
    pub pid: i32,
    /// Random 64-bit token distinguishing this launch from any pid reuse.
    pub cookie: u64,
}

impl JobHandle {
    /// Pair a worker pid with its cookie.
    #[must_use]
    pub const fn new(pid: i32, cookie: u64) -> Self {
        Self { pid, cookie }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} cookie {:#018x}", self.pid, self.cookie)
    }
}

/// Generate a fresh, non-zero job cookie.
///
/// Zero is reserved as "no cookie" in the segment header, so it is
/// rerolled on the (vanishingly unlikely) draw.
#[must_use]
pub fn new_cookie() -> u64 {
    loop {
        let cookie = OsRng.next_u64();
        if cookie != 0 {
            return cookie;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_is_nonzero_and_distinct() {
        let a = new_cookie();
        let b = new_cookie();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        // Two draws from a 64-bit space colliding would point at a broken rng.
        assert_ne!(a, b);
    }

    #[test]
    fn handle_display_includes_both_fields() {
        let h = JobHandle::new(4242, 0xdead_beef);
        let s = h.to_string();
        assert!(s.contains("4242"));
        assert!(s.contains("0x00000000deadbeef"));
    }
}
