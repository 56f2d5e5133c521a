//! Physical and virtual memory management.
//!
//! Memory comes up in two phases. During bootstrap, [`stalloc`] hands out
//! permanent allocations from the region after the kernel image. At VM
//! init ([`vm::init`]) the frame pool takes over: every page below the
//! bootstrap high-water mark is marked statically reserved, the bump
//! allocator is permanently disabled, and from then on page-granular
//! allocation goes through [`physmem`] and byte-granular allocation
//! through the [`heap`].

#![cfg_attr(not(test), no_std)]

pub mod directmap;
pub mod heap;
pub mod pagetable;
pub mod physmem;
pub mod stalloc;
pub mod vm;

use core::fmt;

#[cfg(test)]
pub(crate) mod test_glue {
    //! The allocator globals are process-wide; tests that touch them take
    //! this lock. Poisoning is expected (some tests panic on purpose).
    use std::sync::{Mutex, MutexGuard};

    static KERNEL_LOCK: Mutex<()> = Mutex::new(());

    pub fn serialize() -> MutexGuard<'static, ()> {
        KERNEL_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Errors reported by the memory-management subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// No free physical frame (or no run of frames long enough).
    OutOfMemory,
    /// A frame address outside the tracked range was passed in.
    InvalidFrame,
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of physical memory"),
            Self::InvalidFrame => f.write_str("invalid frame address"),
        }
    }
}
