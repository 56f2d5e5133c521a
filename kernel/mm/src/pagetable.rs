//! Pagetables.
//!
//! A pagetable is a per-address-space array of virtual-page to
//! physical-frame mappings, tagged with an address space identifier. The
//! whole structure fits in exactly one physical page so that creating an
//! address space costs one frame. Mapped frames are owned by the pagetable
//! until unmapped or the table is destroyed.

use bitflags::bitflags;

use kudos_core::addr::{PhysAddr, VirtAddr};
use kudos_core::config::{PAGE_SIZE, PAGETABLE_ENTRIES};

bitflags! {
    /// Per-mapping attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// The entry holds a live mapping.
        const VALID = 1 << 0;
        /// The page may be written. The hardware calls this the dirty
        /// bit; in reality it is a write-enable bit.
        const DIRTY = 1 << 1;
    }
}

/// One mapping: virtual page number to physical frame number.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct Entry {
    vpn: u32,
    pfn: u32,
    flags: u32,
}

impl Entry {
    const EMPTY: Entry = Entry {
        vpn: 0,
        pfn: 0,
        flags: 0,
    };
}

/// A pagetable. Fits in one physical page.
#[repr(C)]
pub struct Pagetable {
    /// Address space identifier; thread ids are used for this.
    asid: u32,
    /// Number of live entries. Entries `0..valid_count` are valid and
    /// densely packed.
    valid_count: u32,
    entries: [Entry; PAGETABLE_ENTRIES],
}

const _: () = assert!(core::mem::size_of::<Pagetable>() <= PAGE_SIZE);

impl Pagetable {
    /// Creates an empty pagetable value.
    ///
    /// Kernel code initializes pagetables in place inside a freshly
    /// allocated frame (see [`crate::vm::create_pagetable`]); this
    /// constructor exists for building tables in caller-owned storage.
    pub const fn empty(asid: u32) -> Self {
        Self {
            asid,
            valid_count: 0,
            entries: [Entry::EMPTY; PAGETABLE_ENTRIES],
        }
    }

    /// Initializes a pagetable in place at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of one full page and not aliased.
    pub unsafe fn init_at(ptr: *mut Pagetable, asid: u32) {
        // A zeroed entry array is an array of invalid entries, so one
        // page-wide clear initializes everything but the ASID.
        unsafe {
            core::ptr::write_bytes(ptr.cast::<u8>(), 0, PAGE_SIZE);
            (*ptr).asid = asid;
        }
    }

    /// Returns the address space identifier.
    pub fn asid(&self) -> u32 {
        self.asid
    }

    /// Returns the number of live mappings.
    pub fn valid_count(&self) -> usize {
        self.valid_count as usize
    }

    /// Inserts a mapping from the page containing `vaddr` to the frame at
    /// `paddr`. Both should be page-aligned.
    ///
    /// # Panics
    ///
    /// Panics if the virtual page is already mapped in this table, or if
    /// the mapping-entry capacity is exhausted.
    pub fn map(&mut self, vaddr: VirtAddr, paddr: PhysAddr, writable: bool) {
        let vpn = vaddr.page_number() as u32;

        assert!(
            self.find(vpn).is_none(),
            "tried to re-map virtual page {:#x} (asid {})",
            vaddr.as_u64(),
            self.asid
        );
        assert!(
            (self.valid_count as usize) < PAGETABLE_ENTRIES,
            "asid {} ran out of pagetable mapping entries",
            self.asid
        );

        let mut flags = EntryFlags::VALID;
        if writable {
            flags |= EntryFlags::DIRTY;
        }
        self.entries[self.valid_count as usize] = Entry {
            vpn,
            pfn: paddr.frame_index() as u32,
            flags: flags.bits(),
        };
        self.valid_count += 1;
    }

    /// Removes the mapping for the page containing `vaddr`.
    ///
    /// # Panics
    ///
    /// Panics if the page is not mapped.
    pub fn unmap(&mut self, vaddr: VirtAddr) {
        let vpn = vaddr.page_number() as u32;
        let idx = self
            .find(vpn)
            .unwrap_or_else(|| panic!("tried to unmap unmapped page {:#x}", vaddr.as_u64()));

        // Entries are unordered; keep them dense by moving the last one
        // into the hole.
        self.valid_count -= 1;
        self.entries[idx] = self.entries[self.valid_count as usize];
        self.entries[self.valid_count as usize] = Entry::EMPTY;
    }

    /// Resolves `vaddr` to the physical base address of its mapped frame,
    /// or `None` if the page is not mapped.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let vpn = vaddr.page_number() as u32;
        self.find(vpn)
            .map(|idx| PhysAddr::new(self.entries[idx].pfn as u64 * PAGE_SIZE as u64))
    }

    /// Returns true if the page containing `vaddr` is mapped writable.
    pub fn is_writable(&self, vaddr: VirtAddr) -> bool {
        let vpn = vaddr.page_number() as u32;
        self.find(vpn).is_some_and(|idx| {
            EntryFlags::from_bits_truncate(self.entries[idx].flags).contains(EntryFlags::DIRTY)
        })
    }

    /// Sets or clears the write-enable bit of an existing mapping.
    ///
    /// # Panics
    ///
    /// Panics if the page is not mapped.
    pub fn set_dirty(&mut self, vaddr: VirtAddr, writable: bool) {
        let vpn = vaddr.page_number() as u32;
        let idx = self.find(vpn).unwrap_or_else(|| {
            panic!(
                "tried to set dirty bit of unmapped page {:#x}",
                vaddr.as_u64()
            )
        });
        let mut flags = EntryFlags::from_bits_truncate(self.entries[idx].flags);
        flags.set(EntryFlags::DIRTY, writable);
        self.entries[idx].flags = flags.bits();
    }

    fn find(&self, vpn: u32) -> Option<usize> {
        self.entries[..self.valid_count as usize]
            .iter()
            .position(|e| e.vpn == vpn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Box<Pagetable> {
        Box::new(Pagetable::empty(7))
    }

    #[test]
    fn map_then_translate() {
        let mut pt = table();
        pt.map(VirtAddr::new(0x4000), PhysAddr::new(0x9000), true);
        assert_eq!(pt.translate(VirtAddr::new(0x4000)), Some(PhysAddr::new(0x9000)));
        // Any address inside the page resolves to the frame base.
        assert_eq!(pt.translate(VirtAddr::new(0x4abc)), Some(PhysAddr::new(0x9000)));
        assert_eq!(pt.translate(VirtAddr::new(0x5000)), None);
        assert_eq!(pt.valid_count(), 1);
        assert_eq!(pt.asid(), 7);
    }

    #[test]
    #[should_panic(expected = "re-map")]
    fn remapping_same_page_panics() {
        let mut pt = table();
        pt.map(VirtAddr::new(0x4000), PhysAddr::new(0x9000), false);
        pt.map(VirtAddr::new(0x4000), PhysAddr::new(0xa000), false);
    }

    #[test]
    #[should_panic(expected = "ran out of pagetable mapping entries")]
    fn capacity_exhaustion_panics() {
        let mut pt = table();
        for i in 0..=PAGETABLE_ENTRIES as u64 {
            pt.map(
                VirtAddr::new(i * PAGE_SIZE as u64),
                PhysAddr::new(i * PAGE_SIZE as u64),
                false,
            );
        }
    }

    #[test]
    fn unmap_removes_and_compacts() {
        let mut pt = table();
        pt.map(VirtAddr::new(0x1000), PhysAddr::new(0xa000), false);
        pt.map(VirtAddr::new(0x2000), PhysAddr::new(0xb000), false);
        pt.map(VirtAddr::new(0x3000), PhysAddr::new(0xc000), false);
        pt.unmap(VirtAddr::new(0x2000));
        assert_eq!(pt.valid_count(), 2);
        assert_eq!(pt.translate(VirtAddr::new(0x2000)), None);
        assert_eq!(pt.translate(VirtAddr::new(0x1000)), Some(PhysAddr::new(0xa000)));
        assert_eq!(pt.translate(VirtAddr::new(0x3000)), Some(PhysAddr::new(0xc000)));
        // The slot can be reused.
        pt.map(VirtAddr::new(0x2000), PhysAddr::new(0xd000), false);
        assert_eq!(pt.translate(VirtAddr::new(0x2000)), Some(PhysAddr::new(0xd000)));
    }

    #[test]
    #[should_panic(expected = "unmap unmapped")]
    fn unmapping_unmapped_page_panics() {
        let mut pt = table();
        pt.unmap(VirtAddr::new(0x8000));
    }

    #[test]
    fn dirty_bit_toggles() {
        let mut pt = table();
        pt.map(VirtAddr::new(0x1000), PhysAddr::new(0xa000), false);
        assert!(!pt.is_writable(VirtAddr::new(0x1000)));
        pt.set_dirty(VirtAddr::new(0x1000), true);
        assert!(pt.is_writable(VirtAddr::new(0x1000)));
        pt.set_dirty(VirtAddr::new(0x1000), false);
        assert!(!pt.is_writable(VirtAddr::new(0x1000)));
    }

    #[test]
    #[should_panic(expected = "set dirty bit of unmapped")]
    fn dirty_bit_of_unmapped_page_panics() {
        let mut pt = table();
        pt.set_dirty(VirtAddr::new(0x1000), true);
    }
}
