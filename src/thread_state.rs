//! Per-thread tracker state, reachable without touching the allocator.
//!
//! TLS access goes through an explicit pthread key rather than a
//! `thread_local!`: in shared libraries the compiler's TLS can route through
//! `__tls_get_addr`, which may call into `malloc` on first touch and loop
//! straight back into the tracking hook. `pthread_getspecific` never
//! allocates.
//!
//! Creating the state itself does allocate (one `Box`), so creation is
//! fenced by a process-wide registry of tids currently inside `init`: the
//! nested allocation finds its tid already registered, gets no state, and
//! goes unsampled.

use std::ptr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::log_once;
use crate::sampling::Minstd;
use crate::stack::StackBounds;
use crate::{clock, sys};

pub(crate) struct ThreadLocalState {
    pub(crate) tid: u32,
    pub(crate) remaining_bytes: i64,
    pub(crate) remaining_bytes_initialized: bool,
    pub(crate) r#gen: Minstd,
    pub(crate) stack_bounds: StackBounds,
    pub(crate) reentry_guard: bool,
}

impl ThreadLocalState {
    fn new(tid: u32) -> ThreadLocalState {
        // Seed differs per thread; sampling correctness needs independence
        // across threads, not unpredictability.
        let seed = (tid as u64 ^ clock::monotonic_ns()) as u32;
        ThreadLocalState {
            tid,
            remaining_bytes: 0,
            remaining_bytes_initialized: false,
            r#gen: Minstd::new(seed),
            stack_bounds: StackBounds::default(),
            reentry_guard: false,
        }
    }
}

static TL_STATE_KEY: OnceLock<Option<libc::pthread_key_t>> = OnceLock::new();

extern "C" fn delete_tl_state(state: *mut libc::c_void) {
    // pthread runs key destructors at thread exit with the value non-null.
    drop(unsafe { Box::from_raw(state as *mut ThreadLocalState) });
}

fn key() -> Option<libc::pthread_key_t> {
    *TL_STATE_KEY.get_or_init(|| {
        let mut key: libc::pthread_key_t = 0;
        let res = unsafe { libc::pthread_key_create(&mut key, Some(delete_tl_state)) };
        if res != 0 {
            log_once!(
                log::Level::Error,
                "unable to create tracker TLS key: errno {res}"
            );
            return None;
        }
        Some(key)
    })
}

/// This thread's state, or null if none has been created yet.
pub(crate) fn get() -> *mut ThreadLocalState {
    match key() {
        Some(key) => unsafe { libc::pthread_getspecific(key) as *mut ThreadLocalState },
        None => ptr::null_mut(),
    }
}

/// Create this thread's state. Returns null under reentry (the nested
/// allocation is silently not sampled) or on OS failure.
pub(crate) fn init() -> *mut ThreadLocalState {
    let Some(key) = key() else {
        return ptr::null_mut();
    };
    let tid = sys::gettid();
    let Some(_entry) = TlReentryGuard::acquire(&THREAD_ENTRIES, tid) else {
        return ptr::null_mut();
    };

    let state = Box::into_raw(Box::new(ThreadLocalState::new(tid)));
    let res = unsafe { libc::pthread_setspecific(key, state as *const libc::c_void) };
    if res != 0 {
        log_once!(
            log::Level::Error,
            "unable to store tracker thread-local state: errno {res}"
        );
        drop(unsafe { Box::from_raw(state) });
        return ptr::null_mut();
    }
    state
}

pub(crate) fn get_or_init() -> *mut ThreadLocalState {
    let state = get();
    if !state.is_null() { state } else { init() }
}

const THREAD_ENTRY_SLOTS: usize = 64;

/// Bounded registry of tids currently creating their thread-local state.
/// An array of atomics indexed by hashed tid: no allocation, no locks. A
/// slot collision between two live tids makes one thread skip sampling its
/// current allocation, nothing more.
pub(crate) struct ThreadEntries {
    slots: [AtomicU32; THREAD_ENTRY_SLOTS],
}

impl ThreadEntries {
    const fn new() -> ThreadEntries {
        ThreadEntries {
            slots: [const { AtomicU32::new(0) }; THREAD_ENTRY_SLOTS],
        }
    }

    /// Forget every registration. Called in the child after `fork`, where
    /// the registering threads no longer exist.
    pub(crate) fn reset(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Relaxed);
        }
    }

    fn slot_for(&self, tid: u32) -> &AtomicU32 {
        // Fibonacci hash spreads consecutive tids over the table.
        let index = (tid.wrapping_mul(0x9e37_79b9) >> 26) as usize;
        &self.slots[index % THREAD_ENTRY_SLOTS]
    }
}

pub(crate) static THREAD_ENTRIES: ThreadEntries = ThreadEntries::new();

struct TlReentryGuard<'a> {
    slot: &'a AtomicU32,
}

impl<'a> TlReentryGuard<'a> {
    fn acquire(entries: &'a ThreadEntries, tid: u32) -> Option<TlReentryGuard<'a>> {
        let slot = entries.slot_for(tid);
        match slot.compare_exchange(0, tid, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Some(TlReentryGuard { slot }),
            // Either this tid is already inside `init` (true reentry) or a
            // colliding tid is; both mean "do not create state right now".
            Err(_) => None,
        }
    }
}

impl Drop for TlReentryGuard<'_> {
    fn drop(&mut self) {
        self.slot.store(0, Ordering::Release);
    }
}

/// Scoped latch over a thread's `reentry_guard` flag. Acquisition fails when
/// the flag is already up, which is exactly the recursion case the tracking
/// entry points must bounce off.
pub(crate) struct ReentryGuard {
    state: *mut ThreadLocalState,
}

impl ReentryGuard {
    /// # Safety
    /// `state` must be the calling thread's own state; the guard must not
    /// outlive it.
    pub(crate) unsafe fn acquire(state: *mut ThreadLocalState) -> Option<ReentryGuard> {
        unsafe {
            if (*state).reentry_guard {
                return None;
            }
            (*state).reentry_guard = true;
        }
        Some(ReentryGuard { state })
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        unsafe {
            (*self.state).reentry_guard = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_created_once_per_thread() {
        let first = get_or_init();
        let second = get_or_init();
        assert!(!first.is_null());
        assert_eq!(first, second);
        assert_eq!(unsafe { (*first).tid }, sys::gettid());
    }

    #[test]
    fn each_thread_gets_its_own_state() {
        let here = get_or_init() as usize;
        let there = std::thread::spawn(|| get_or_init() as usize)
            .join()
            .unwrap();
        assert!(there != 0);
        assert_ne!(here, there);
    }

    #[test]
    fn reentry_guard_blocks_nested_acquisition() {
        let mut state = ThreadLocalState::new(1);
        let state = &raw mut state;
        let outer = unsafe { ReentryGuard::acquire(state) };
        assert!(outer.is_some());
        assert!(unsafe { ReentryGuard::acquire(state) }.is_none());
        drop(outer);
        assert!(unsafe { ReentryGuard::acquire(state) }.is_some());
    }

    #[test]
    fn registry_rejects_a_tid_already_inside_init() {
        let entries = ThreadEntries::new();
        let guard = TlReentryGuard::acquire(&entries, 1234);
        assert!(guard.is_some());
        assert!(TlReentryGuard::acquire(&entries, 1234).is_none());
        drop(guard);
        assert!(TlReentryGuard::acquire(&entries, 1234).is_some());
    }

    #[test]
    fn registry_reset_clears_stale_registrations() {
        let entries = ThreadEntries::new();
        std::mem::forget(TlReentryGuard::acquire(&entries, 77).unwrap());
        assert!(TlReentryGuard::acquire(&entries, 77).is_none());
        entries.reset();
        assert!(TlReentryGuard::acquire(&entries, 77).is_some());
    }
}
