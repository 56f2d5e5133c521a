//! Virtual memory system.
//!
//! Pagetable lifecycle over the frame pool, plus the cross-address-space
//! copy used when the kernel writes into a process image. VM init is the
//! point of no return for the bootstrap allocator: after [`init`] runs,
//! `stalloc` is dead and all memory comes from the frame pool.

use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use kudos_core::addr::VirtAddr;
use kudos_core::bitmap;
use kudos_core::config::PAGE_SIZE;
use kudos_core::kinfo;

use crate::pagetable::Pagetable;
use crate::{MmError, directmap, physmem, stalloc};

/// Owning handle to a frame-backed pagetable.
///
/// Created by [`create_pagetable`], destroyed by [`destroy_pagetable`];
/// the handle is the exclusive owner of the underlying frame.
pub struct PagetableHandle {
    ptr: NonNull<Pagetable>,
}

// SAFETY: The handle is the sole owner of the pagetable frame and the
// frame is valid until destroy_pagetable.
unsafe impl Send for PagetableHandle {}

impl Deref for PagetableHandle {
    type Target = Pagetable;

    fn deref(&self) -> &Pagetable {
        // SAFETY: The handle exclusively owns a live, initialized frame.
        unsafe { self.ptr.as_ref() }
    }
}

impl DerefMut for PagetableHandle {
    fn deref_mut(&mut self) -> &mut Pagetable {
        // SAFETY: As above; `&mut self` gives unique access.
        unsafe { self.ptr.as_mut() }
    }
}

/// Initializes the virtual memory system.
///
/// Sizes and places the frame bitmap with the last gasp of the bootstrap
/// allocator, reserves every page below the bootstrap high-water mark,
/// and permanently disables `stalloc`.
pub fn init(total_pages: usize) {
    let map_bytes = bitmap::size_in_bytes(total_pages);
    let map_phys = stalloc::stalloc(map_bytes);

    // Reserved prefix is computed after the bitmap itself was reserved.
    let free_start = stalloc::free_area_start().as_u64();
    let reserved = (free_start as usize).div_ceil(PAGE_SIZE);

    // SAFETY: The bitmap region was just reserved from boot memory for
    // exactly this purpose and is never handed out again.
    let map = unsafe {
        core::slice::from_raw_parts_mut(directmap::phys_to_ptr(map_phys), map_bytes)
    };
    // SAFETY: `map` is dedicated storage and the page counts describe the
    // machine's real memory, as reported by the meminfo device.
    let pool = unsafe { physmem::FramePool::new(map, total_pages, reserved) };

    kinfo!(
        "vm: {} pages of size {}, {} statically reserved",
        total_pages,
        PAGE_SIZE,
        reserved
    );

    physmem::install(pool);
    let booted = stalloc::disable();
    kinfo!("vm: boot allocator retired after {} bytes", booted);
}

/// Creates a new pagetable in a freshly allocated frame.
pub fn create_pagetable(asid: u32) -> Result<PagetableHandle, MmError> {
    let frame = physmem::alloc_block()?;
    let ptr = directmap::phys_to_ptr(frame).cast::<Pagetable>();
    // SAFETY: `ptr` addresses one whole page we exclusively own.
    unsafe { Pagetable::init_at(ptr, asid) };
    Ok(PagetableHandle {
        // SAFETY: phys_to_ptr of an allocated frame is non-null.
        ptr: unsafe { NonNull::new_unchecked(ptr) },
    })
}

/// Destroys a pagetable, freeing its frame. Does not free the frames the
/// table maps; the owner unmaps those first.
pub fn destroy_pagetable(pt: PagetableHandle) {
    let phys = directmap::ptr_to_phys(pt.ptr.as_ptr().cast::<u8>().cast_const());
    physmem::free_block(phys);
}

/// Copies `source` into the address space described by `pagetable`,
/// starting at virtual address `target`.
///
/// Resolves each intersecting page through the table and copies up to the
/// page boundary at a time.
///
/// # Panics
///
/// Panics if any page in the target range is unmapped.
pub fn memwrite(pagetable: &Pagetable, target: VirtAddr, source: &[u8]) {
    let mut target = target;
    let mut source = source;

    while !source.is_empty() {
        let offset = target.page_offset();
        let frame = pagetable
            .translate(target)
            .unwrap_or_else(|| panic!("memwrite to unmapped page {:#x}", target.as_u64()));

        let chunk = source.len().min(PAGE_SIZE - offset);
        let dst = directmap::phys_to_ptr(frame + offset as u64);
        // SAFETY: `frame` is a live frame owned by the pagetable, and the
        // copy stays within one page.
        unsafe {
            core::ptr::copy_nonoverlapping(source.as_ptr(), dst, chunk);
        }

        source = &source[chunk..];
        target = target + chunk as u64;
    }
}
