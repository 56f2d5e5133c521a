//! Physical-to-kernel-virtual translation.
//!
//! The kernel sees all physical memory through one linear window at a
//! fixed offset (the unmapped kernel segment on the bare target). The
//! offset is set once during bring-up; hosted tests point it at a buffer
//! standing in for physical memory.

use core::sync::atomic::{AtomicU64, Ordering};

use kudos_core::addr::PhysAddr;

static OFFSET: AtomicU64 = AtomicU64::new(0);

/// Sets the base of the kernel's direct-mapped window.
pub fn set_offset(offset: u64) {
    OFFSET.store(offset, Ordering::Release);
}

/// Returns the current window offset.
pub fn offset() -> u64 {
    OFFSET.load(Ordering::Acquire)
}

/// Translates a physical address to a kernel pointer through the window.
pub fn phys_to_ptr(addr: PhysAddr) -> *mut u8 {
    (offset() + addr.as_u64()) as *mut u8
}

/// Translates a kernel pointer inside the window back to its physical
/// address.
pub fn ptr_to_phys(ptr: *const u8) -> PhysAddr {
    PhysAddr::new(ptr as u64 - offset())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        set_offset(0x1000);
        let pa = PhysAddr::new(0x234);
        let ptr = phys_to_ptr(pa);
        assert_eq!(ptr as u64, 0x1234);
        assert_eq!(ptr_to_phys(ptr), pa);
        set_offset(0);
    }
}
