//! Shared-memory MPSC ring buffer: the writer-side discipline the tracker
//! uses, a reader for in-process consumers and tests, and a memfd-backed
//! constructor.
//!
//! The ring is one metadata page (`perf_event_mmap_page` layout) followed by
//! a power-of-two byte arena. Producers race the shared reservation cursor
//! forward with CAS, fill their slot, then publish by advancing the shared
//! `data_head` watermark in reservation order. The consumer walks
//! `[data_tail, data_head)` record by record, each self-sized through its
//! perf header.
//!
//! The arena is mapped twice, back to back, so a record never wraps: byte
//! `i` past the end of the first view is byte `i` of the second. Both the
//! producer fill and the consumer walk get contiguous slices for any record
//! up to the arena size.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock::TscCalibration;
use crate::error::TrackerError;
use crate::sys::{PAGE_SIZE, RecordHeader, RingMetadataPage};

/// How the memory behind a `RingBufferInfo` is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferKind {
    /// Custom memfd ring written by in-process producers. The only kind the
    /// allocation tracker accepts.
    Mpsc,
    /// Kernel-written perf ring; consumers share the parsing path but the
    /// tracker cannot produce into it.
    Perf,
}

/// Handle triple describing a ring to attach to, as passed across the IPC
/// boundary from the profiler process.
#[derive(Debug, Clone, Copy)]
pub struct RingBufferInfo {
    pub kind: RingBufferKind,
    /// Metadata page plus arena, in bytes (the memfd's length).
    pub mapping_size: usize,
    pub map_fd: RawFd,
    pub event_fd: RawFd,
}

/// A live double mapping of a ring's backing file.
pub(crate) struct RingBufferMapping {
    base: *mut u8,
    data_size: usize,
    /// Reserved VA span: metadata page + two arena views.
    span: usize,
}

// The mapping is raw shared memory; all cross-thread access goes through
// the atomic cursors.
unsafe impl Send for RingBufferMapping {}
unsafe impl Sync for RingBufferMapping {}

impl RingBufferMapping {
    pub(crate) fn attach(info: &RingBufferInfo) -> Result<RingBufferMapping, TrackerError> {
        let Some(data_size) = info.mapping_size.checked_sub(PAGE_SIZE) else {
            return Err(TrackerError::InvalidRingSize(info.mapping_size));
        };
        if data_size == 0 || !data_size.is_power_of_two() {
            return Err(TrackerError::InvalidRingSize(info.mapping_size));
        }

        let span = PAGE_SIZE + 2 * data_size;
        unsafe {
            // Reserve the span, then pin the file views into it: the page and
            // first arena view, then the arena again right behind itself.
            let base = libc::mmap(
                ptr::null_mut(),
                span,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(io::Error::last_os_error().into());
            }
            let first = libc::mmap(
                base,
                PAGE_SIZE + data_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                info.map_fd,
                0,
            );
            let second = libc::mmap(
                base.add(PAGE_SIZE + data_size),
                data_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                info.map_fd,
                PAGE_SIZE as libc::off_t,
            );
            if first == libc::MAP_FAILED || second == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                libc::munmap(base, span);
                return Err(err.into());
            }
            Ok(RingBufferMapping {
                base: base as *mut u8,
                data_size,
                span,
            })
        }
    }

    pub(crate) fn page(&self) -> *mut RingMetadataPage {
        self.base as *mut RingMetadataPage
    }

    pub(crate) fn data_size(&self) -> usize {
        self.data_size
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(PAGE_SIZE) }
    }

    fn data_head(&self) -> &AtomicU64 {
        unsafe { RingMetadataPage::data_head_atomic(self.page()) }
    }

    fn data_tail(&self) -> &AtomicU64 {
        unsafe { RingMetadataPage::data_tail_atomic(self.page()) }
    }

    fn reserve_head(&self) -> &AtomicU64 {
        unsafe { RingMetadataPage::reserve_head_atomic(self.page()) }
    }
}

impl Drop for RingBufferMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.span);
        }
    }
}

/// Why `reserve` handed back nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    /// Not enough unconsumed space; the caller accounts a lost event.
    Full,
    /// The CAS spin budget ran out under producer contention.
    Timeout,
}

/// A claimed `[start, end)` span of the arena, not yet visible to the
/// consumer. Committing it (and every predecessor) publishes it.
pub struct Reservation<'a> {
    buf: &'a mut [u8],
    start: u64,
    end: u64,
}

impl Reservation<'_> {
    pub fn bytes(&mut self) -> &mut [u8] {
        &mut *self.buf
    }
}

const RESERVE_SPIN_BUDGET: u32 = 256;

/// Multi-producer writer over an attached ring. The reservation cursor
/// lives in the shared metadata page, so writers re-attached to the same
/// ring (including across `fork`) reserve coherently.
pub struct MpscRingBufferWriter {
    mapping: RingBufferMapping,
}

impl MpscRingBufferWriter {
    pub fn attach(info: &RingBufferInfo) -> Result<MpscRingBufferWriter, TrackerError> {
        Ok(MpscRingBufferWriter {
            mapping: RingBufferMapping::attach(info)?,
        })
    }

    pub(crate) fn data_size(&self) -> usize {
        self.mapping.data_size()
    }

    /// Claim `len` contiguous bytes. `len` must be a multiple of 8 so the
    /// perf headers of later records stay aligned.
    pub fn reserve(&self, len: usize) -> Result<Reservation<'_>, ReserveError> {
        debug_assert!(len % 8 == 0);
        let data_size = self.mapping.data_size() as u64;
        if len as u64 > data_size || len == 0 {
            return Err(ReserveError::Full);
        }

        let reserve_head = self.mapping.reserve_head();
        let mut spins = 0u32;
        loop {
            let head = reserve_head.load(Ordering::Acquire);
            let tail = self.mapping.data_tail().load(Ordering::Acquire);
            if head + len as u64 - tail > data_size {
                return Err(ReserveError::Full);
            }
            match reserve_head.compare_exchange_weak(
                head,
                head + len as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let offset = (head % data_size) as usize;
                    let buf = unsafe {
                        std::slice::from_raw_parts_mut(self.mapping.data_ptr().add(offset), len)
                    };
                    return Ok(Reservation {
                        buf,
                        start: head,
                        end: head + len as u64,
                    });
                }
                Err(_) => {
                    spins += 1;
                    if spins > RESERVE_SPIN_BUDGET {
                        return Err(ReserveError::Timeout);
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Publish a filled reservation. Publication is in reservation order: a
    /// committer waits for its predecessor's slot to become visible before
    /// advancing the watermark over its own.
    ///
    /// Returns true when the consumer had already drained everything before
    /// this record, i.e. it may be parked and wants an eventfd nudge.
    pub fn commit(&self, reservation: Reservation<'_>) -> bool {
        let head = self.mapping.data_head();
        while head.load(Ordering::Acquire) != reservation.start {
            std::hint::spin_loop();
        }
        head.store(reservation.end, Ordering::Release);
        self.mapping.data_tail().load(Ordering::Acquire) == reservation.start
    }
}

/// Single-consumer reader over an attached ring. Production deployments run
/// this in the profiler process; tests and embedded consumers run it in
/// process.
pub struct RingBufferReader {
    mapping: RingBufferMapping,
}

impl RingBufferReader {
    pub fn attach(info: &RingBufferInfo) -> Result<RingBufferReader, TrackerError> {
        Ok(RingBufferReader {
            mapping: RingBufferMapping::attach(info)?,
        })
    }

    /// Unconsumed bytes currently published.
    pub fn available(&self) -> usize {
        let head = self.mapping.data_head().load(Ordering::Acquire);
        let tail = self.mapping.data_tail().load(Ordering::Acquire);
        (head - tail) as usize
    }

    pub fn calibration(&self) -> TscCalibration {
        TscCalibration::from_page(unsafe { &*self.mapping.page() })
    }

    /// Walk every published record, handing each one's full bytes (header
    /// included) to `f`, releasing its space to producers afterwards.
    pub fn for_each_record<F>(&mut self, mut f: F)
    where
        F: FnMut(&[u8]),
    {
        let data_size = self.mapping.data_size() as u64;
        loop {
            let head = self.mapping.data_head().load(Ordering::Acquire);
            let tail = self.mapping.data_tail().load(Ordering::Acquire);
            if head == tail {
                return;
            }

            let offset = (tail % data_size) as usize;
            let header: RecordHeader = unsafe {
                ptr::read_unaligned(self.mapping.data_ptr().add(offset) as *const RecordHeader)
            };
            if header.size == 0 {
                // A zero-size header means a corrupt ring; stop rather than
                // spin on the same offset forever.
                return;
            }
            let record = unsafe {
                std::slice::from_raw_parts(
                    self.mapping.data_ptr().add(offset),
                    header.size as usize,
                )
            };
            f(record);
            self.mapping
                .data_tail()
                .store(tail + header.size as u64, Ordering::Release);
        }
    }
}

/// A custom MPSC ring created in this process: memfd arena plus notification
/// eventfd. The creator keeps the fds; `info()` is what crosses to the
/// tracker (or another process).
pub struct OwnedRingBuffer {
    map_fd: OwnedFd,
    event_fd: OwnedFd,
    mapping_size: usize,
}

impl OwnedRingBuffer {
    /// Create a ring whose arena is `2^order` pages.
    pub fn create(order: u8) -> io::Result<OwnedRingBuffer> {
        let data_size = PAGE_SIZE << order;
        let mapping_size = PAGE_SIZE + data_size;

        let map_fd = unsafe {
            let fd = libc::memfd_create(c"alloc-ring".as_ptr(), libc::MFD_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let fd = OwnedFd::from_raw_fd(fd);
            if libc::ftruncate(fd.as_raw_fd(), mapping_size as libc::off_t) != 0 {
                return Err(io::Error::last_os_error());
            }
            fd
        };

        let event_fd = unsafe {
            let fd = libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            OwnedFd::from_raw_fd(fd)
        };

        let ring = OwnedRingBuffer {
            map_fd,
            event_fd,
            mapping_size,
        };

        // Initialize the metadata page: cursor fields start zeroed by
        // ftruncate; fill in the geometry and synthesized calibration.
        let mapping = RingBufferMapping::attach(&ring.info())
            .map_err(|e| io::Error::other(e.to_string()))?;
        unsafe {
            let page = &mut *mapping.page();
            page.data_offset = PAGE_SIZE as u64;
            page.data_size = data_size as u64;
            TscCalibration::IDENTITY.write_to_page(page);
        }

        Ok(ring)
    }

    pub fn info(&self) -> RingBufferInfo {
        RingBufferInfo {
            kind: RingBufferKind::Mpsc,
            mapping_size: self.mapping_size,
            map_fd: self.map_fd.as_raw_fd(),
            event_fd: self.event_fd.as_raw_fd(),
        }
    }

    pub fn reader(&self) -> Result<RingBufferReader, TrackerError> {
        RingBufferReader::attach(&self.info())
    }

    /// Drain the notification eventfd, returning the accumulated count.
    /// Zero means no notification since the last drain.
    pub fn take_notifications(&self) -> u64 {
        let mut count = 0u64;
        let n = unsafe {
            libc::read(
                self.event_fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n == 8 { count } else { 0 }
    }
}
