//! Monotonic 5-minute timeslots counted from a fixed protocol genesis.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 2018-01-01T00:00:00Z, a Monday. The protocol genesis instant.
pub const GENESIS_UNIX_SECS: u64 = 1_514_764_800;

/// Seconds per timeslot.
pub const SLOT_SECONDS: u64 = 300;

/// Timeslots per protocol week ("bucket").
pub const WEEK_SLOTS: u32 = 2016;

/// A `uint32` count of 5-minute intervals since [`GENESIS_UNIX_SECS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timeslot(pub u32);

impl Timeslot {
    pub fn new(raw: u32) -> Self {
        Timeslot(raw)
    }

    /// Start of the protocol week containing this slot: `t - (t mod 2016)`.
    pub fn week_start(self) -> Timeslot {
        Timeslot(self.0 - (self.0 % WEEK_SLOTS))
    }

    pub fn index_in_week(self) -> u32 {
        self.0 % WEEK_SLOTS
    }

    pub fn checked_sub(self, offset: Timeslot) -> Option<u32> {
        self.0.checked_sub(offset.0)
    }
}

impl std::ops::Add<u32> for Timeslot {
    type Output = Timeslot;
    fn add(self, rhs: u32) -> Timeslot {
        Timeslot(self.0 + rhs)
    }
}

impl std::ops::Sub<u32> for Timeslot {
    type Output = Timeslot;
    fn sub(self, rhs: u32) -> Timeslot {
        Timeslot(self.0 - rhs)
    }
}

// Process-wide, read-mostly test override. Production code never touches
// this; `set_test_timeslot` is the dedicated testing entry-point the spec
// calls for in §4.1 / §9.
static TEST_OVERRIDE_ACTIVE: AtomicBool = AtomicBool::new(false);
static TEST_OVERRIDE_VALUE: AtomicU32 = AtomicU32::new(0);

/// Override `now()` for the duration of a test. Pass `None` to return to
/// wall-clock-derived behavior.
pub fn set_test_timeslot(value: Option<u32>) {
    match value {
        Some(v) => {
            TEST_OVERRIDE_VALUE.store(v, Ordering::SeqCst);
            TEST_OVERRIDE_ACTIVE.store(true, Ordering::SeqCst);
        }
        None => TEST_OVERRIDE_ACTIVE.store(false, Ordering::SeqCst),
    }
}

/// The current timeslot. Panics if the wall clock precedes genesis, per
/// §4.1 — that can only happen on a badly misconfigured host and should
/// not be silently tolerated.
pub fn now() -> Timeslot {
    if TEST_OVERRIDE_ACTIVE.load(Ordering::SeqCst) {
        return Timeslot(TEST_OVERRIDE_VALUE.load(Ordering::SeqCst));
    }
    let unix_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs();
    let elapsed = unix_secs
        .checked_sub(GENESIS_UNIX_SECS)
        .expect("system clock precedes protocol genesis");
    Timeslot((elapsed / SLOT_SECONDS) as u32)
}

/// Unix timestamp (seconds) of the start of the given timeslot.
pub fn slot_to_unix(slot: Timeslot) -> u64 {
    GENESIS_UNIX_SECS + (slot.0 as u64) * SLOT_SECONDS
}

/// Timeslot containing the given unix timestamp (seconds).
pub fn unix_to_slot(unix_secs: u64) -> Timeslot {
    let elapsed = unix_secs.saturating_sub(GENESIS_UNIX_SECS);
    Timeslot((elapsed / SLOT_SECONDS) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn week_start_aligns_to_bucket() {
        let t = Timeslot(2016 * 3 + 57);
        assert_eq!(t.week_start(), Timeslot(2016 * 3));
        assert_eq!(t.index_in_week(), 57);
    }

    #[test]
    fn week_start_of_boundary_is_itself() {
        let t = Timeslot(2016 * 5);
        assert_eq!(t.week_start(), t);
    }

    #[test]
    fn slot_unix_roundtrip() {
        let t = Timeslot(123_456);
        let u = slot_to_unix(t);
        assert_eq!(unix_to_slot(u), t);
    }

    #[test]
    fn test_override_is_observed_by_now() {
        set_test_timeslot(Some(42));
        assert_eq!(now(), Timeslot(42));
        set_test_timeslot(None);
    }
}
