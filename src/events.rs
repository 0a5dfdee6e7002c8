//! Typed layouts for the records the tracker writes, and parsing for the
//! consumer side.
//!
//! All records are little-endian fixed-width integers laid out `repr(C)`,
//! prefixed with a perf event header whose `size` covers the whole record.
//! The allocation sample mirrors the kernel's `PERF_RECORD_SAMPLE` layout
//! for the sample types the profiler enables (TID | TIME | ADDR | PERIOD |
//! REGS_USER | STACK_USER), so the consumer parses custom and kernel rings
//! with the same code.

use std::mem;
use std::ptr;

use crate::sys::{
    PERF_CUSTOM_EVENT_CLEAR_LIVE_ALLOCATION, PERF_CUSTOM_EVENT_DEALLOCATION, PERF_RECORD_LOST,
    PERF_RECORD_SAMPLE, RecordHeader, SAMPLE_REGS_COUNT,
};

/// Common `{pid, tid, time}` tuple carried by every record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleId {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
}

/// Fixed prefix of an allocation sample. The variable-length stack bytes and
/// the trailing `dyn_size` u64 follow it in the reserved slot.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AllocationEvent {
    pub header: RecordHeader,
    pub sample_id: SampleId,
    pub addr: u64,
    pub period: u64,
    pub regs_abi: u64,
    pub regs: [u64; SAMPLE_REGS_COUNT],
    pub size_stack: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DeallocationEvent {
    pub header: RecordHeader,
    pub sample_id: SampleId,
    pub ptr: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClearLiveAllocationEvent {
    pub header: RecordHeader,
    pub sample_id: SampleId,
}

/// Kernel `PERF_RECORD_LOST` layout: `id` and `lost` precede the sample id.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LostEvent {
    pub header: RecordHeader,
    pub id: u64,
    pub lost: u64,
    pub sample_id: SampleId,
}

/// Total record size for an allocation sample carrying `stack_size` bytes of
/// stack. `stack_size` must already be 8-byte aligned so the trailing
/// `dyn_size` lands aligned.
pub const fn allocation_event_size(stack_size: u32) -> usize {
    mem::size_of::<AllocationEvent>() + stack_size as usize + mem::size_of::<u64>()
}

/// A record parsed back out of a ring, borrowing the stack bytes in place.
#[derive(Debug)]
pub enum ParsedRecord<'a> {
    Sample {
        event: AllocationEvent,
        stack: &'a [u8],
        dyn_size: u64,
    },
    Deallocation(DeallocationEvent),
    ClearLiveAllocations(ClearLiveAllocationEvent),
    Lost(LostEvent),
    Unknown {
        header: RecordHeader,
    },
}

impl<'a> ParsedRecord<'a> {
    /// Decode one record from its raw bytes. Returns `None` when the slice
    /// is shorter than the layout it announces.
    pub fn parse(bytes: &'a [u8]) -> Option<ParsedRecord<'a>> {
        if bytes.len() < mem::size_of::<RecordHeader>() {
            return None;
        }
        let header = unsafe { ptr::read_unaligned(bytes.as_ptr() as *const RecordHeader) };
        if bytes.len() < header.size as usize {
            return None;
        }

        match header.record_type {
            PERF_RECORD_SAMPLE => {
                if bytes.len() < mem::size_of::<AllocationEvent>() + mem::size_of::<u64>() {
                    return None;
                }
                let event =
                    unsafe { ptr::read_unaligned(bytes.as_ptr() as *const AllocationEvent) };
                let stack_start = mem::size_of::<AllocationEvent>();
                let stack_end = stack_start + event.size_stack as usize;
                if bytes.len() < stack_end + mem::size_of::<u64>() {
                    return None;
                }
                let dyn_size =
                    u64::from_le_bytes(bytes[stack_end..stack_end + 8].try_into().ok()?);
                Some(ParsedRecord::Sample {
                    event,
                    stack: &bytes[stack_start..stack_end],
                    dyn_size,
                })
            }
            PERF_CUSTOM_EVENT_DEALLOCATION => {
                if bytes.len() < mem::size_of::<DeallocationEvent>() {
                    return None;
                }
                Some(ParsedRecord::Deallocation(unsafe {
                    ptr::read_unaligned(bytes.as_ptr() as *const DeallocationEvent)
                }))
            }
            PERF_CUSTOM_EVENT_CLEAR_LIVE_ALLOCATION => {
                if bytes.len() < mem::size_of::<ClearLiveAllocationEvent>() {
                    return None;
                }
                Some(ParsedRecord::ClearLiveAllocations(unsafe {
                    ptr::read_unaligned(bytes.as_ptr() as *const ClearLiveAllocationEvent)
                }))
            }
            PERF_RECORD_LOST => {
                if bytes.len() < mem::size_of::<LostEvent>() {
                    return None;
                }
                Some(ParsedRecord::Lost(unsafe {
                    ptr::read_unaligned(bytes.as_ptr() as *const LostEvent)
                }))
            }
            _ => Some(ParsedRecord::Unknown { header }),
        }
    }
}
