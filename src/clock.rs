//! The clock events are stamped with, plus the TSC calibration triple the
//! metadata page carries for consumers that convert raw cycle counts.

use crate::sys::RingMetadataPage;

/// Nanoseconds from `CLOCK_MONOTONIC`.
///
/// Every record's `sample_id.time` comes from here, so timestamps are in the
/// same clock domain as the rest of the profiler's perf events (which are
/// opened with `use_clockid = CLOCK_MONOTONIC`).
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// Timestamp calibration constants from a ring metadata page.
///
/// A kernel perf ring exports the parameters of the mapping from raw TSC
/// values to event time; a custom memfd ring synthesizes the identity
/// mapping because its producers stamp nanoseconds directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TscCalibration {
    pub time_zero: u64,
    pub time_mult: u32,
    pub time_shift: u16,
}

impl TscCalibration {
    /// The identity calibration written into custom rings: `to_ns` maps a
    /// nanosecond timestamp to itself.
    pub const IDENTITY: TscCalibration = TscCalibration {
        time_zero: 0,
        time_mult: 1,
        time_shift: 0,
    };

    pub fn from_page(page: &RingMetadataPage) -> TscCalibration {
        TscCalibration {
            time_zero: page.time_zero,
            time_mult: page.time_mult,
            time_shift: page.time_shift,
        }
    }

    pub fn write_to_page(self, page: &mut RingMetadataPage) {
        page.time_zero = self.time_zero;
        page.time_mult = self.time_mult;
        page.time_shift = self.time_shift;
    }

    /// Convert a raw counter value to nanoseconds, the way perf documents it:
    /// `time = zero + ((cycles * mult) >> shift)`.
    pub fn to_ns(self, cycles: u64) -> u64 {
        let quot = cycles >> self.time_shift;
        let rem = cycles & ((1u64 << self.time_shift) - 1);
        self.time_zero
            + quot.wrapping_mul(self.time_mult as u64)
            + ((rem.wrapping_mul(self.time_mult as u64)) >> self.time_shift)
    }
}
