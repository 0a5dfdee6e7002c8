//! Raw perf wire-format types, constants, and small syscall wrappers.
//!
//! The allocation tracker speaks the perf record format so the consumer can
//! reuse its kernel-ring parsing path for custom rings. Only the pieces the
//! writer side needs are defined here.

use std::sync::atomic::AtomicU64;

pub const PAGE_SIZE: usize = 4096;

// --- Record types ---

pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_LOST: u32 = 2;

// Custom record types live above the kernel's range, following the perf
// tool's convention of user-space records starting at 64.
pub const PERF_CUSTOM_EVENT_DEALLOCATION: u32 = 65;
pub const PERF_CUSTOM_EVENT_CLEAR_LIVE_ALLOCATION: u32 = 66;

// --- Sample register ABI ---

pub const PERF_SAMPLE_REGS_ABI_64: u64 = 2;

/// Register slots captured with each allocation sample. The consumer seeds
/// its unwinder from these three, in this order.
pub const SAMPLE_REGS_COUNT: usize = 3;
pub const SAMPLE_REG_SP: usize = 0;
pub const SAMPLE_REG_FP: usize = 1;
pub const SAMPLE_REG_PC: usize = 2;

// --- perf_event_header (precedes each record in the ring buffer) ---

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: u32,
    pub misc: u16,
    pub size: u16,
}

// --- Ring metadata page ---
//
// Byte-compatible with the kernel's `perf_event_mmap_page` so the consumer
// can treat custom memfd rings and kernel perf rings uniformly: `data_head`
// and `data_tail` sit at offsets 1024 and 1032, and the TSC calibration
// triple (`time_shift`, `time_mult`, `time_zero`) is where perf puts it.
#[repr(C)]
pub struct RingMetadataPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub _reserved: [u8; 948], // pad to offset 0x400 = 1024
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

impl RingMetadataPage {
    /// Shared-memory view of the published-watermark cursor.
    ///
    /// # Safety
    /// `page` must point into a live mapping of the metadata page.
    pub unsafe fn data_head_atomic<'a>(page: *mut Self) -> &'a AtomicU64 {
        unsafe { AtomicU64::from_ptr(&raw mut (*page).data_head) }
    }

    /// Shared-memory view of the consumer cursor.
    ///
    /// # Safety
    /// `page` must point into a live mapping of the metadata page.
    pub unsafe fn data_tail_atomic<'a>(page: *mut Self) -> &'a AtomicU64 {
        unsafe { AtomicU64::from_ptr(&raw mut (*page).data_tail) }
    }

    /// Shared-memory view of the producer reservation cursor. Custom MPSC
    /// rings carry no AUX area, so `aux_head` is repurposed for it; keeping
    /// it in the page makes reservations coherent across re-attached
    /// writers and forked producers.
    ///
    /// # Safety
    /// `page` must point into a live mapping of the metadata page of a
    /// custom (non-kernel) ring.
    pub unsafe fn reserve_head_atomic<'a>(page: *mut Self) -> &'a AtomicU64 {
        unsafe { AtomicU64::from_ptr(&raw mut (*page).aux_head) }
    }
}

// --- Syscall wrappers ---

/// Thread id of the calling thread. glibc caches this; the raw syscall is
/// what survives `fork` and works during thread teardown.
pub fn gettid() -> u32 {
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u32
}

pub fn getpid() -> u32 {
    (unsafe { libc::getpid() }) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn metadata_page_matches_perf_abi() {
        // The consumer hard-codes these offsets when it attaches to a kernel
        // perf ring; the custom ring must agree.
        assert_eq!(mem::offset_of!(RingMetadataPage, time_shift), 50);
        assert_eq!(mem::offset_of!(RingMetadataPage, time_mult), 52);
        assert_eq!(mem::offset_of!(RingMetadataPage, time_zero), 64);
        assert_eq!(mem::offset_of!(RingMetadataPage, data_head), 1024);
        assert_eq!(mem::offset_of!(RingMetadataPage, data_tail), 1032);
        assert!(mem::size_of::<RingMetadataPage>() <= PAGE_SIZE);
    }

    #[test]
    fn record_header_is_eight_bytes() {
        assert_eq!(mem::size_of::<RecordHeader>(), 8);
    }

    #[test]
    fn gettid_is_stable_within_a_thread() {
        assert_eq!(gettid(), gettid());
        assert_ne!(gettid(), 0);
    }
}
