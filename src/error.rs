//! Structured error types for the tracker.
//!
//! Hot-path rules: errors never panic and never allocate while the calling
//! thread may be inside the allocator. Everything that can go wrong on the
//! tracking path degrades into a counter bump, a soft return, or ultimately
//! a self-disable; these variants exist so the cold paths (`start`, module
//! resolution, the host's hook layer) can report precisely.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("allocation tracker already started")]
    AlreadyActive,

    #[error("ring buffer is not an MPSC ring")]
    UnsupportedRingBuffer,

    #[error("ring buffer mapping size {0} is not a metadata page plus a power-of-two arena")]
    InvalidRingSize(usize),

    #[error("unable to create thread-local tracker state")]
    ThreadLocalStorage,

    #[error("tracking entry point re-entered on the same thread")]
    Reentered,

    #[error("timed out contending for a ring buffer slot")]
    RingBufferTimeout,

    #[error("unable to retrieve stack bounds for this thread")]
    StackBounds,

    #[error("error writing to the notification eventfd: {0}")]
    Eventfd(std::io::Error),

    #[error("unable to clear the live-allocation set")]
    ClearLiveAllocations,

    #[error("{0}")]
    InvalidElf(String),

    #[error(transparent)]
    Object(#[from] object::read::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
