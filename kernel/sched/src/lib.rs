//! Threading system: thread table, round-robin scheduler, sleep queue,
//! semaphores and the sleeping mutex built on them.
//!
//! The concurrency substrate is layered. Spin locks (from `kudos-core`)
//! protect short interrupt-safe critical sections; the sleep queue parks
//! threads on opaque resource addresses; semaphores combine a counter
//! with the sleep queue; the mutex wraps a binary semaphore in an RAII
//! guard. The scheduler circulates Ready threads over a single FIFO ready
//! queue, with thread 0 permanently reserved as the idle thread.
//!
//! On a bare target the actual context switch is performed by the
//! platform's exception layer; everything here is the machine-independent
//! bookkeeping, which is why the crate also runs (and is tested) on the
//! host, where a "switch" changes the current-thread bookkeeping and
//! execution simply carries on as the newly chosen thread.

#![cfg_attr(not(test), no_std)]

pub mod mutex;
pub mod scheduler;
pub mod semaphore;
pub mod sleepq;
pub mod thread;

use core::fmt;

pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub use thread::{IDLE_THREAD, Tid};

/// Errors reported by the threading system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// The thread table has no free slot.
    TableFull,
    /// The semaphore table has no free slot.
    Exhausted,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableFull => f.write_str("thread table full"),
            Self::Exhausted => f.write_str("semaphore table exhausted"),
        }
    }
}

/// An opaque resource a thread can sleep on.
///
/// The value is an address used purely as a hash key; the sleep queue
/// never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource(pub usize);
