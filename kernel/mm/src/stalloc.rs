//! Permanent kernel memory allocation.
//!
//! A monotonic bump allocator over the region immediately after the kernel
//! image. Memory allocated here can never be freed; it holds structures
//! that live for the whole run (device descriptors, the frame bitmap,
//! interrupt stacks). VM init permanently disables it, and any later call
//! is a bootstrap logic error worth dying for.

use kudos_core::addr::PhysAddr;
use kudos_core::sync::IrqSpinLock;

const WORD_ALIGN: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninit,
    Active,
    Disabled,
}

struct Stalloc {
    /// Next free physical address.
    next: u64,
    /// End of the allocatable region (exclusive).
    end: u64,
    /// Total bytes handed out, fixed once disabled.
    total: u64,
    phase: Phase,
}

static STALLOC: IrqSpinLock<Stalloc> = IrqSpinLock::new(Stalloc {
    next: 0,
    end: 0,
    total: 0,
    phase: Phase::Uninit,
});

/// Initializes the bump allocator over `[start, end)`.
pub fn init(start: PhysAddr, end: PhysAddr) {
    let mut st = STALLOC.lock();
    st.next = align_up(start.as_u64());
    st.end = end.as_u64();
    st.total = 0;
    st.phase = Phase::Active;
}

/// Allocates `bytes` of permanent memory, word-aligned.
///
/// `bytes == 0` is allowed (useful purely for alignment).
///
/// # Panics
///
/// Panics when called before [`init`] or after [`disable`], or when the
/// region is exhausted. There is no recovery path during bootstrap.
pub fn stalloc(bytes: usize) -> PhysAddr {
    let mut st = STALLOC.lock();
    match st.phase {
        Phase::Uninit => panic!("stalloc: use before initialization"),
        Phase::Disabled => panic!("stalloc: use after vm init"),
        Phase::Active => {}
    }

    let addr = st.next;
    let next = align_up(addr + bytes as u64);
    assert!(next <= st.end, "stalloc: boot memory region exhausted");
    st.next = next;
    st.total += bytes as u64;
    PhysAddr::new(addr)
}

/// Returns the current start of the free area (the bootstrap high-water
/// mark). The frame pool uses this to size its statically reserved prefix.
pub fn free_area_start() -> PhysAddr {
    let st = STALLOC.lock();
    assert!(st.phase != Phase::Uninit, "stalloc: not initialized");
    PhysAddr::new(st.next)
}

/// Permanently disables static allocation. Called from VM init; returns
/// the total number of bytes that were handed out.
pub fn disable() -> u64 {
    let mut st = STALLOC.lock();
    st.phase = Phase::Disabled;
    st.total
}

fn align_up(addr: u64) -> u64 {
    addr.next_multiple_of(WORD_ALIGN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_glue::serialize;

    #[test]
    fn bump_allocations_are_aligned_and_disjoint() {
        let _g = serialize();
        init(PhysAddr::new(0x1004), PhysAddr::new(0x2000));

        let a = stalloc(10);
        let b = stalloc(1);
        let c = stalloc(32);
        assert_eq!(a.as_u64() % WORD_ALIGN, 0);
        assert_eq!(b.as_u64() % WORD_ALIGN, 0);
        assert!(a.as_u64() < b.as_u64());
        assert!(b.as_u64() < c.as_u64());
        assert!(free_area_start().as_u64() >= c.as_u64() + 32);
    }

    #[test]
    fn zero_byte_allocation_is_allowed() {
        let _g = serialize();
        init(PhysAddr::new(0x1000), PhysAddr::new(0x2000));
        let a = stalloc(0);
        let b = stalloc(0);
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic(expected = "after vm init")]
    fn use_after_disable_panics() {
        let _g = serialize();
        init(PhysAddr::new(0x1000), PhysAddr::new(0x2000));
        disable();
        let _ = stalloc(8);
    }

    #[test]
    #[should_panic(expected = "region exhausted")]
    fn exhaustion_panics() {
        let _g = serialize();
        init(PhysAddr::new(0x1000), PhysAddr::new(0x1010));
        let _ = stalloc(64);
    }
}
