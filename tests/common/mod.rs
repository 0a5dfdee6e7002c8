//! Shared fixtures: a ring-buffer holder and owned record decoding.

use std::sync::{Mutex, MutexGuard, PoisonError};

use alloc_self_profile::{
    AllocationEvent, ClearLiveAllocationEvent, DeallocationEvent, LostEvent, OwnedRingBuffer,
    ParsedRecord, RingBufferInfo, RingBufferReader,
};

/// The tracker is a process-global singleton; tests that start/stop it must
/// not interleave.
pub fn tracker_lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owned copy of a drained record, so assertions outlive the ring walk.
#[derive(Debug)]
pub enum Record {
    Sample {
        event: AllocationEvent,
        stack: Vec<u8>,
        dyn_size: u64,
    },
    Deallocation(DeallocationEvent),
    ClearLiveAllocations(ClearLiveAllocationEvent),
    Lost(LostEvent),
    Unknown(u32),
}

pub struct RingBufferHolder {
    ring: OwnedRingBuffer,
    reader: RingBufferReader,
}

impl RingBufferHolder {
    pub fn new(order: u8) -> RingBufferHolder {
        let ring = OwnedRingBuffer::create(order).expect("create ring");
        let reader = ring.reader().expect("attach reader");
        RingBufferHolder { ring, reader }
    }

    pub fn info(&self) -> RingBufferInfo {
        self.ring.info()
    }

    pub fn take_notifications(&self) -> u64 {
        self.ring.take_notifications()
    }

    pub fn drain(&mut self) -> Vec<Record> {
        let mut records = Vec::new();
        self.reader.for_each_record(|bytes| {
            let record = match ParsedRecord::parse(bytes) {
                Some(ParsedRecord::Sample {
                    event,
                    stack,
                    dyn_size,
                }) => Record::Sample {
                    event,
                    stack: stack.to_vec(),
                    dyn_size,
                },
                Some(ParsedRecord::Deallocation(event)) => Record::Deallocation(event),
                Some(ParsedRecord::ClearLiveAllocations(event)) => {
                    Record::ClearLiveAllocations(event)
                }
                Some(ParsedRecord::Lost(event)) => Record::Lost(event),
                Some(ParsedRecord::Unknown { header }) => Record::Unknown(header.record_type),
                None => panic!("corrupt record in ring: {} bytes", bytes.len()),
            };
            records.push(record);
        });
        records
    }
}

pub fn gettid() -> u32 {
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u32
}

/// Sum of sample weights plus reported drops across a record batch.
pub fn accounted_events(records: &[Record]) -> u64 {
    records
        .iter()
        .map(|record| match record {
            Record::Sample { event, .. } => event.period,
            Record::Lost(event) => event.lost,
            _ => 0,
        })
        .sum()
}
