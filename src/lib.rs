//! In-process allocation sampling core for a continuous memory profiler.
//!
//! The host instruments `malloc`/`free` (preload shim, global allocator, or
//! explicit calls) and forwards every event to [`AllocationTracker`]. The
//! tracker samples allocations along a Poisson process over allocated
//! bytes, captures a register + stack snapshot for each sampled event, and
//! writes perf-format records into a shared-memory MPSC ring buffer that an
//! out-of-process consumer drains, woken through an eventfd.
//!
//! Everything on the tracking path runs under hostile constraints: it is
//! called from inside the allocator, on arbitrary threads, possibly across
//! `fork`. It never allocates, never blocks on contended locks, never
//! panics, and bounces recursive entry off a per-thread guard.
//!
//! ```no_run
//! use alloc_self_profile::{AllocationTracker, OwnedRingBuffer, TrackerConfig};
//!
//! let ring = OwnedRingBuffer::create(6)?;
//! AllocationTracker::start(
//!     TrackerConfig {
//!         sampling_interval: 64 * 1024,
//!         track_deallocations: true,
//!         ..TrackerConfig::default()
//!     },
//!     ring.info(),
//! )?;
//!
//! // ... the host's allocator hooks call AllocationTracker::track_allocation /
//! // track_deallocation; a consumer drains ring.reader() ...
//!
//! AllocationTracker::stop();
//! # Ok::<(), alloc_self_profile::TrackerError>(())
//! ```

mod address_bitset;
mod clock;
mod error;
mod events;
mod module;
mod ring_buffer;
mod sampling;
mod stack;
mod sys;
mod thread_state;
mod tracker;

pub use crate::address_bitset::AddressBitset;
pub use crate::clock::{TscCalibration, monotonic_ns};
pub use crate::error::TrackerError;
pub use crate::events::{
    AllocationEvent, ClearLiveAllocationEvent, DeallocationEvent, LostEvent, ParsedRecord,
    SampleId, allocation_event_size,
};
pub use crate::module::{BuildId, ModuleInfo, module_info_from_bytes, module_info_from_file};
pub use crate::ring_buffer::{
    MpscRingBufferWriter, OwnedRingBuffer, ReserveError, Reservation, RingBufferInfo,
    RingBufferKind, RingBufferReader,
};
pub use crate::sys::{
    PERF_CUSTOM_EVENT_CLEAR_LIVE_ALLOCATION, PERF_CUSTOM_EVENT_DEALLOCATION, PERF_RECORD_LOST,
    PERF_RECORD_SAMPLE, PERF_SAMPLE_REGS_ABI_64, RecordHeader, SAMPLE_REG_FP, SAMPLE_REG_PC,
    SAMPLE_REG_SP, SAMPLE_REGS_COUNT,
};
pub use crate::tracker::{
    AllocationTracker, DEFAULT_MAX_LIVE_ALLOCATIONS, DEFAULT_STACK_SAMPLE_SIZE,
    IntervalTimerCheck, MAX_CONSECUTIVE_FAILURES, TrackerConfig,
};

/// Emit a log record at most once per process per call site. The tracking
/// paths may hit the same failure millions of times; one line is diagnostic,
/// a stream of them is an outage.
macro_rules! log_once {
    ($level:expr, $($arg:tt)+) => {{
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| log::log!($level, $($arg)+));
    }};
}
pub(crate) use log_once;
