//! The allocation tracker singleton: lifecycle, the malloc/free hot paths,
//! lost-event accounting, and the periodic timer check.
//!
//! One tracker exists per process and is never destroyed: a producer may sit
//! between its `track_allocations` load and the tracked call when another
//! thread stops profiling, so the object it is about to touch must stay
//! usable forever. Stopping only flips the atomic flags and swaps the
//! per-session resources (ring mapping, live set) out of an `ArcSwap`; a
//! racing producer that already loaded the session keeps it alive until it
//! returns, and the mapping is unmapped when the last such reference drops.

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::address_bitset::AddressBitset;
use crate::error::TrackerError;
use crate::events::{
    AllocationEvent, ClearLiveAllocationEvent, DeallocationEvent, LostEvent, SampleId,
    allocation_event_size,
};
use crate::log_once;
use crate::ring_buffer::{MpscRingBufferWriter, ReserveError, RingBufferInfo, RingBufferKind};
use crate::sys::{
    PERF_CUSTOM_EVENT_CLEAR_LIVE_ALLOCATION, PERF_CUSTOM_EVENT_DEALLOCATION, PERF_RECORD_LOST,
    PERF_RECORD_SAMPLE, PERF_SAMPLE_REGS_ABI_64, RecordHeader, SAMPLE_REGS_COUNT,
};
use crate::thread_state::{self, ReentryGuard, ThreadLocalState};
use crate::{clock, sampling, stack, sys};

/// Consecutive write failures after which the tracker stops itself.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Default stack snapshot per sample: 8 pages, comfortably under the u16
/// record-size ceiling with headers included.
pub const DEFAULT_STACK_SAMPLE_SIZE: u32 = 4096 * 8;

/// Default bound on the live-address set population.
pub const DEFAULT_MAX_LIVE_ALLOCATIONS: usize = 500_000;

/// Bit slots per tracked address; 16x oversizing keeps the collision
/// probability of the live set low.
const LIVE_SET_SLOTS_PER_ADDRESS: usize = 16;

/// Periodic check run from whichever producer first observes its deadline
/// passed. The callback runs under the tracker's lifecycle mutex and must
/// not call back into start/stop.
#[derive(Clone)]
pub struct IntervalTimerCheck {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub callback: Arc<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for IntervalTimerCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalTimerCheck")
            .field("initial_delay", &self.initial_delay)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Expected bytes between samples. 1 captures every allocation.
    pub sampling_interval: u64,
    /// Sample every `sampling_interval` bytes exactly instead of drawing
    /// exponential gaps.
    pub deterministic_sampling: bool,
    /// Track frees of sampled allocations through the live-address set.
    pub track_deallocations: bool,
    /// Requested stack snapshot bytes per sample; rounded up to 8 and
    /// clamped to what the ring can carry.
    pub stack_sample_size: u32,
    /// Live-address set population bound.
    pub max_live_allocations: usize,
    pub timer_check: Option<IntervalTimerCheck>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            sampling_interval: 512 * 1024,
            deterministic_sampling: false,
            track_deallocations: false,
            stack_sample_size: DEFAULT_STACK_SAMPLE_SIZE,
            max_live_allocations: DEFAULT_MAX_LIVE_ALLOCATIONS,
            timer_check: None,
        }
    }
}

/// Everything that lives and dies with one start/stop cycle.
struct Session {
    writer: MpscRingBufferWriter,
    event_fd: libc::c_int,
    live_addresses: Option<AddressBitset>,
    sampling_interval: u64,
    deterministic_sampling: bool,
    stack_sample_size: u32,
    max_live_allocations: usize,
}

#[derive(Default)]
struct TimerSettings {
    check: Option<IntervalTimerCheck>,
}

struct TrackerState {
    track_allocations: AtomicBool,
    track_deallocations: AtomicBool,
    pid: AtomicU32,
    lost_count: AtomicU64,
    failure_count: AtomicU32,
    /// Monotonic nanoseconds; `u64::MAX` disables the periodic check.
    next_check_time: AtomicU64,
    lifecycle: Mutex<TimerSettings>,
}

enum PushOutcome {
    Committed,
    /// Ring full: the event was dropped and the lost counter bumped.
    Dropped,
}

pub struct AllocationTracker {
    state: TrackerState,
    session: ArcSwap<Option<Session>>,
    /// Pre-built empty session so the self-disable path swaps without
    /// allocating.
    empty_session: Arc<Option<Session>>,
}

static TRACKER: OnceLock<AllocationTracker> = OnceLock::new();

fn lock_lifecycle(mutex: &Mutex<TimerSettings>) -> MutexGuard<'_, TimerSettings> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AllocationTracker {
    fn new() -> AllocationTracker {
        AllocationTracker {
            state: TrackerState {
                track_allocations: AtomicBool::new(false),
                track_deallocations: AtomicBool::new(false),
                pid: AtomicU32::new(0),
                lost_count: AtomicU64::new(0),
                failure_count: AtomicU32::new(0),
                next_check_time: AtomicU64::new(u64::MAX),
                lifecycle: Mutex::new(TimerSettings::default()),
            },
            session: ArcSwap::from_pointee(None),
            empty_session: Arc::new(None),
        }
    }

    /// Start allocation profiling into the given ring. Errors if profiling
    /// is already active or the ring is not an MPSC ring.
    pub fn start(config: TrackerConfig, ring_buffer: RingBufferInfo) -> Result<(), TrackerError> {
        let tracker = TRACKER.get_or_init(AllocationTracker::new);

        // This is the one moment TLS creation must succeed; the tracking
        // paths will not retry harder than this.
        let tl = thread_state::get_or_init();
        if tl.is_null() {
            return Err(TrackerError::ThreadLocalStorage);
        }
        let _guard =
            unsafe { ReentryGuard::acquire(tl) }.ok_or(TrackerError::Reentered)?;

        let mut lifecycle = lock_lifecycle(&tracker.state.lifecycle);
        if tracker.state.track_allocations.load(Ordering::Relaxed) {
            return Err(TrackerError::AlreadyActive);
        }

        // Route the allocator through any lazy initialization now, before
        // the hooks observe an active tracker.
        drop(std::hint::black_box(Box::new(0u8)));

        if ring_buffer.kind != RingBufferKind::Mpsc {
            return Err(TrackerError::UnsupportedRingBuffer);
        }
        let writer = MpscRingBufferWriter::attach(&ring_buffer)?;
        let stack_sample_size =
            clamp_stack_sample_size(config.stack_sample_size, writer.data_size());

        let live_addresses = config.track_deallocations.then(|| {
            AddressBitset::with_capacity(
                config.max_live_allocations * LIVE_SET_SLOTS_PER_ADDRESS,
            )
        });

        let now = clock::monotonic_ns();
        let next_check = match &config.timer_check {
            Some(check) if !check.initial_delay.is_zero() => {
                now + check.initial_delay.as_nanos() as u64
            }
            Some(check) => now + check.interval.as_nanos() as u64,
            None => u64::MAX,
        };
        tracker.state.next_check_time.store(next_check, Ordering::Release);
        lifecycle.check = config.timer_check;

        tracker.state.lost_count.store(0, Ordering::Relaxed);
        tracker.state.failure_count.store(0, Ordering::Relaxed);
        tracker.session.store(Arc::new(Some(Session {
            writer,
            event_fd: ring_buffer.event_fd,
            live_addresses,
            sampling_interval: config.sampling_interval.max(1),
            deterministic_sampling: config.deterministic_sampling,
            stack_sample_size,
            max_live_allocations: config.max_live_allocations,
        })));

        tracker
            .state
            .track_deallocations
            .store(config.track_deallocations, Ordering::Release);
        tracker.state.track_allocations.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop profiling. The tracker stays usable for a later `start`; the
    /// ring mapping is released once the last in-flight producer is done
    /// with it.
    pub fn stop() {
        let Some(tracker) = TRACKER.get() else {
            return;
        };
        let tl = thread_state::get_or_init();
        if tl.is_null() {
            log_once!(
                log::Level::Error,
                "unable to find thread-local state while stopping the allocation tracker"
            );
            tracker.disable();
            return;
        }
        let _guard = unsafe { ReentryGuard::acquire(tl) };
        let _lifecycle = lock_lifecycle(&tracker.state.lifecycle);
        tracker.disable();
    }

    /// Record an allocation of `size` bytes at `addr`. Called from the
    /// host's malloc hook after the real allocation succeeded.
    #[inline]
    pub fn track_allocation(addr: usize, size: usize) {
        let Some(tracker) = TRACKER.get() else {
            return;
        };
        if !tracker.state.track_allocations.load(Ordering::Relaxed) {
            return;
        }
        let tl = thread_state::get_or_init();
        if tl.is_null() {
            return;
        }
        let Some(_guard) = (unsafe { ReentryGuard::acquire(tl) }) else {
            return;
        };
        let tl = unsafe { &mut *tl };
        tl.remaining_bytes += size as i64;
        if tl.remaining_bytes >= 0 {
            tracker.track_allocation_slow(addr as u64, tl);
        }
    }

    /// Record a free of `addr`. Called from the host's free hook.
    #[inline]
    pub fn track_deallocation(addr: usize) {
        let Some(tracker) = TRACKER.get() else {
            return;
        };
        if !tracker.state.track_deallocations.load(Ordering::Relaxed) {
            return;
        }
        let tl = thread_state::get_or_init();
        if tl.is_null() {
            return;
        }
        let Some(_guard) = (unsafe { ReentryGuard::acquire(tl) }) else {
            return;
        };
        tracker.track_deallocation_slow(addr as u64, unsafe { &mut *tl });
    }

    /// Eagerly create this thread's tracking state and learn its stack
    /// bounds. Call from thread-start hooks, where failure is still benign.
    pub fn notify_thread_start() {
        let tl = thread_state::get_or_init();
        if tl.is_null() {
            log_once!(
                log::Level::Error,
                "unable to start allocation profiling on thread {}",
                sys::gettid()
            );
            return;
        }
        let Some(_guard) = (unsafe { ReentryGuard::acquire(tl) }) else {
            return;
        };
        unsafe {
            (*tl).stack_bounds = stack::retrieve_stack_bounds().unwrap_or_default();
        }
    }

    /// Reset process/thread identity caches in the child after `fork`. The
    /// inherited ring mapping stays valid; samples from the child simply
    /// carry its own pid once this has run.
    pub fn notify_fork() {
        thread_state::THREAD_ENTRIES.reset();
        if let Some(tracker) = TRACKER.get() {
            tracker.state.pid.store(0, Ordering::Relaxed);
        }
        let tl = thread_state::get();
        if tl.is_null() {
            // The state was created before forking or not at all; nothing
            // to scrub in the latter case.
            log_once!(
                log::Level::Error,
                "unable to retrieve thread-local state after fork in thread {}",
                sys::gettid()
            );
            return;
        }
        unsafe {
            (*tl).tid = 0;
        }
    }

    /// Whether allocation tracking is currently active.
    pub fn is_active() -> bool {
        TRACKER
            .get()
            .is_some_and(|t| t.state.track_allocations.load(Ordering::Acquire))
    }

    /// Drops accumulated since the last lost-event record made it out.
    pub fn pending_lost_count() -> u64 {
        TRACKER
            .get()
            .map_or(0, |t| t.state.lost_count.load(Ordering::Relaxed))
    }

    fn disable(&self) {
        self.state.track_allocations.store(false, Ordering::Release);
        self.state.track_deallocations.store(false, Ordering::Release);
        self.session.store(Arc::clone(&self.empty_session));
    }

    fn track_allocation_slow(&self, mut addr: u64, tl: &mut ThreadLocalState) {
        // Recheck now that we hold the reentry guard: a concurrent stop()
        // may have won the race since the hook's relaxed load.
        if !self.state.track_allocations.load(Ordering::Acquire) {
            return;
        }
        let session_guard = self.session.load();
        let Some(session) = &**session_guard else {
            return;
        };

        let nsamples = sampling::take_samples(
            &mut tl.remaining_bytes,
            &mut tl.remaining_bytes_initialized,
            &mut tl.r#gen,
            session.sampling_interval,
            session.deterministic_sampling,
        );
        if nsamples == 0 {
            return;
        }
        let total_size = nsamples * session.sampling_interval;

        if self.state.track_deallocations.load(Ordering::Relaxed)
            && let Some(live) = &session.live_addresses
        {
            if live.add(addr) {
                if live.count() > session.max_live_allocations {
                    // The set is at its bound: make the consumer drop its
                    // view, then start refilling with this address.
                    if self.push_clear_live_allocations(session, tl).is_ok() {
                        live.clear();
                        live.add(addr);
                    } else {
                        log_once!(
                            log::Level::Error,
                            "stopping allocation profiling: unable to clear the live-allocation set"
                        );
                        self.disable();
                    }
                }
            } else {
                // Slot already occupied: keep the sample for byte accounting
                // but do not pair it with a future deallocation.
                addr = 0;
            }
        }

        let result = self.push_allocation_sample(addr, total_size, session, tl);
        self.note_write_outcome(matches!(result, Ok(PushOutcome::Committed)));
        if result.is_err()
            && self.state.track_deallocations.load(Ordering::Relaxed)
            && addr != 0
            && let Some(live) = &session.live_addresses
        {
            live.remove(addr);
        }
    }

    fn track_deallocation_slow(&self, addr: u64, tl: &mut ThreadLocalState) {
        if !self.state.track_deallocations.load(Ordering::Acquire) {
            return;
        }
        let session_guard = self.session.load();
        let Some(session) = &**session_guard else {
            return;
        };
        let Some(live) = &session.live_addresses else {
            return;
        };
        if !live.remove(addr) {
            // Never sampled (or evicted by a clear): nothing to pair.
            return;
        }
        let result = self.push_deallocation_sample(addr, session, tl);
        self.note_write_outcome(matches!(result, Ok(PushOutcome::Committed)));
    }

    fn note_write_outcome(&self, success: bool) {
        if !success {
            let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
            if failures >= MAX_CONSECUTIVE_FAILURES {
                // Too many errors in a row on the ring: stop profiling.
                self.disable();
            }
        } else if self.state.failure_count.load(Ordering::Relaxed) > 0 {
            self.state.failure_count.store(0, Ordering::Relaxed);
        }
    }

    fn sample_id(&self, tl: &mut ThreadLocalState, now: u64) -> SampleId {
        let mut pid = self.state.pid.load(Ordering::Relaxed);
        if pid == 0 {
            pid = sys::getpid();
            self.state.pid.store(pid, Ordering::Relaxed);
        }
        if tl.tid == 0 {
            tl.tid = sys::gettid();
        }
        SampleId {
            pid,
            tid: tl.tid,
            time: now,
        }
    }

    fn push_allocation_sample(
        &self,
        addr: u64,
        total_size: u64,
        session: &Session,
        tl: &mut ThreadLocalState,
    ) -> Result<PushOutcome, TrackerError> {
        let mut notify_consumer = false;
        if self.state.lost_count.load(Ordering::Relaxed) != 0 {
            let _ = self.push_lost_sample(session, tl, &mut notify_consumer);
        }

        if tl.stack_bounds.is_empty() {
            // Only the main thread gets here: spawned threads learn their
            // bounds in notify_thread_start.
            tl.stack_bounds =
                stack::retrieve_stack_bounds().ok_or(TrackerError::StackBounds)?;
        }

        // Size the snapshot from the current depth plus margin for the call
        // frames between here and the save routine.
        let anchor = 0u8;
        let depth = tl.stack_bounds.hi as i64 - (&anchor as *const u8 as i64);
        let sample_stack_size = ((depth + stack::STACK_MARGIN)
            .clamp(0, session.stack_sample_size as i64) as u32)
            .next_multiple_of(8);
        let event_size = allocation_event_size(sample_stack_size);

        let mut reservation = match session.writer.reserve(event_size) {
            Ok(reservation) => reservation,
            Err(err) => {
                self.state.lost_count.fetch_add(1, Ordering::AcqRel);
                return match err {
                    ReserveError::Full => Ok(PushOutcome::Dropped),
                    ReserveError::Timeout => Err(TrackerError::RingBufferTimeout),
                };
            }
        };

        let now = clock::monotonic_ns();
        let sample_id = self.sample_id(tl, now);
        {
            let bytes = reservation.bytes();
            let mut regs = [0u64; SAMPLE_REGS_COUNT];
            let stack_dst = &mut bytes
                [mem::size_of::<AllocationEvent>()..][..sample_stack_size as usize];
            let dyn_size = stack::save_context(tl.stack_bounds, &mut regs, stack_dst);

            let event = AllocationEvent {
                header: RecordHeader {
                    record_type: PERF_RECORD_SAMPLE,
                    misc: 0,
                    size: event_size as u16,
                },
                sample_id,
                addr,
                period: total_size,
                regs_abi: PERF_SAMPLE_REGS_ABI_64,
                regs,
                size_stack: sample_stack_size as u64,
            };
            unsafe {
                ptr::write_unaligned(bytes.as_mut_ptr() as *mut AllocationEvent, event);
            }
            // A zero dyn_size still commits: accounting stays correct even
            // for samples whose stack could not be walked.
            bytes[event_size - 8..].copy_from_slice(&dyn_size.to_le_bytes());
        }

        if session.writer.commit(reservation) || notify_consumer {
            self.notify_consumer(session)?;
        }
        self.maybe_fire_timer(now);
        Ok(PushOutcome::Committed)
    }

    fn push_deallocation_sample(
        &self,
        addr: u64,
        session: &Session,
        tl: &mut ThreadLocalState,
    ) -> Result<PushOutcome, TrackerError> {
        let mut notify_consumer = false;
        if self.state.lost_count.load(Ordering::Relaxed) != 0 {
            let _ = self.push_lost_sample(session, tl, &mut notify_consumer);
        }

        let event_size = mem::size_of::<DeallocationEvent>();
        let mut reservation = match session.writer.reserve(event_size) {
            Ok(reservation) => reservation,
            Err(err) => {
                self.state.lost_count.fetch_add(1, Ordering::AcqRel);
                return match err {
                    ReserveError::Full => Ok(PushOutcome::Dropped),
                    ReserveError::Timeout => Err(TrackerError::RingBufferTimeout),
                };
            }
        };

        let now = clock::monotonic_ns();
        let event = DeallocationEvent {
            header: RecordHeader {
                record_type: PERF_CUSTOM_EVENT_DEALLOCATION,
                misc: 0,
                size: event_size as u16,
            },
            sample_id: self.sample_id(tl, now),
            ptr: addr,
        };
        unsafe {
            ptr::write_unaligned(
                reservation.bytes().as_mut_ptr() as *mut DeallocationEvent,
                event,
            );
        }

        if session.writer.commit(reservation) || notify_consumer {
            self.notify_consumer(session)?;
        }
        self.maybe_fire_timer(now);
        Ok(PushOutcome::Committed)
    }

    /// Emit the accumulated drop count ahead of a regular record. On
    /// failure the count goes back so a later producer retries: drops are
    /// reported at least once.
    fn push_lost_sample(
        &self,
        session: &Session,
        tl: &mut ThreadLocalState,
        notify_consumer: &mut bool,
    ) -> Result<(), TrackerError> {
        let lost = self.state.lost_count.swap(0, Ordering::AcqRel);
        if lost == 0 {
            return Ok(());
        }

        let event_size = mem::size_of::<LostEvent>();
        let mut reservation = match session.writer.reserve(event_size) {
            Ok(reservation) => reservation,
            Err(err) => {
                self.state.lost_count.fetch_add(lost, Ordering::AcqRel);
                return match err {
                    ReserveError::Full => Ok(()),
                    ReserveError::Timeout => Err(TrackerError::RingBufferTimeout),
                };
            }
        };

        let now = clock::monotonic_ns();
        let event = LostEvent {
            header: RecordHeader {
                record_type: PERF_RECORD_LOST,
                misc: 0,
                size: event_size as u16,
            },
            id: 0,
            lost,
            sample_id: self.sample_id(tl, now),
        };
        unsafe {
            ptr::write_unaligned(reservation.bytes().as_mut_ptr() as *mut LostEvent, event);
        }

        *notify_consumer = session.writer.commit(reservation);
        self.maybe_fire_timer(now);
        Ok(())
    }

    /// Tell the consumer to drop its live-allocation view. Failing to
    /// reserve here is a hard error: the set bound would be violated, and a
    /// lost event cannot stand in for a synchronization marker.
    fn push_clear_live_allocations(
        &self,
        session: &Session,
        tl: &mut ThreadLocalState,
    ) -> Result<(), TrackerError> {
        let event_size = mem::size_of::<ClearLiveAllocationEvent>();
        let Ok(mut reservation) = session.writer.reserve(event_size) else {
            return Err(TrackerError::ClearLiveAllocations);
        };

        let now = clock::monotonic_ns();
        let event = ClearLiveAllocationEvent {
            header: RecordHeader {
                record_type: PERF_CUSTOM_EVENT_CLEAR_LIVE_ALLOCATION,
                misc: 0,
                size: event_size as u16,
            },
            sample_id: self.sample_id(tl, now),
        };
        unsafe {
            ptr::write_unaligned(
                reservation.bytes().as_mut_ptr() as *mut ClearLiveAllocationEvent,
                event,
            );
        }

        if session.writer.commit(reservation) {
            self.notify_consumer(session)?;
        }
        self.maybe_fire_timer(now);
        Ok(())
    }

    fn notify_consumer(&self, session: &Session) -> Result<(), TrackerError> {
        let count: u64 = 1;
        let written = unsafe {
            libc::write(
                session.event_fd,
                &count as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if written != mem::size_of::<u64>() as isize {
            let err = io::Error::last_os_error();
            log_once!(
                log::Level::Error,
                "error writing to the allocation profiler eventfd: {err}"
            );
            return Err(TrackerError::Eventfd(err));
        }
        Ok(())
    }

    fn maybe_fire_timer(&self, now: u64) {
        if now > self.state.next_check_time.load(Ordering::Acquire) {
            self.update_timer(now);
        }
    }

    fn update_timer(&self, now: u64) {
        let settings = lock_lifecycle(&self.state.lifecycle);

        // Recheck under the lock: another producer may have advanced the
        // deadline (and fired) first.
        if now <= self.state.next_check_time.load(Ordering::Relaxed) {
            return;
        }
        if let Some(check) = &settings.check
            && !check.interval.is_zero()
        {
            self.state
                .next_check_time
                .store(now + check.interval.as_nanos() as u64, Ordering::Release);
            (check.callback)();
        } else {
            self.state.next_check_time.store(u64::MAX, Ordering::Release);
        }
    }
}

/// Round the requested snapshot size up to 8 and clamp it so a full sample
/// record fits both the u16 size field of its header and half the arena.
fn clamp_stack_sample_size(requested: u32, ring_data_size: usize) -> u32 {
    let fixed_overhead = allocation_event_size(0);
    let record_budget = (u16::MAX as usize).min(ring_data_size / 2);
    let max_stack = (record_budget.saturating_sub(fixed_overhead) as u64) & !7;
    (requested as u64).next_multiple_of(8).min(max_stack) as u32
}
