//! Device drivers and the registries that bind them to the kernel.
//!
//! Bus enumeration produces IO descriptors; [`device::init`] matches each
//! against the driver table and collects the initialized devices into a
//! fixed table, from which the rest of the kernel looks them up by
//! typecode. Drivers that need interrupts register handlers with
//! [`interrupt`] before interrupts are enabled.
//!
//! The hardware itself sits behind narrow controller traits
//! ([`disk::DiskController`], [`tty::SerialController`]); memory-mapped
//! implementations drive the real ports, and ram-backed implementations
//! stand in for them in hosted tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod device;
pub mod disk;
pub mod disksched;
pub mod gbd;
pub mod interrupt;
pub mod metadev;
pub mod ramdisk;
pub mod tty;

use core::fmt;

/// Errors reported by device drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// No free semaphore to run a synchronous request.
    Exhausted,
    /// The device completed the request with a nonzero status.
    Device,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => f.write_str("out of semaphores for device request"),
            Self::Device => f.write_str("device reported an error"),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_glue {
    //! The device and interrupt tables are process-wide, and drivers
    //! lean on the threading globals; tests serialize through this lock.
    use std::sync::{Mutex, MutexGuard};

    static KERNEL_LOCK: Mutex<()> = Mutex::new(());

    pub fn serialize() -> MutexGuard<'static, ()> {
        KERNEL_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Threading, interrupt and device state reset to boot defaults.
    pub fn reset_kernel() {
        kudos_sched::thread::init();
        kudos_sched::scheduler::init();
        kudos_sched::semaphore::init();
        crate::interrupt::init();
        crate::device::init(&[]);
    }
}
