//! Kernel heap.
//!
//! A first-fit free-list allocator over one contiguous kernel region.
//! Each block carries an in-region header; allocation sizes are rounded
//! to 16 bytes, splitting a free block from its head when it is larger
//! than needed. Freeing marks the block free and coalesces it with a
//! physically adjacent free successor.

use kudos_core::sync::IrqSpinLock;

/// Allocation granularity and payload alignment.
const ALIGN: usize = 16;

/// Header size, padded so payloads stay 16-byte aligned.
const HEADER_SIZE: usize = 32;

#[repr(C)]
struct Header {
    /// Payload bytes in this block (multiple of `ALIGN`).
    size: usize,
    /// Next block by address, or null for the last block.
    next: *mut Header,
    /// Whether the block is currently allocated.
    allocated: bool,
}

const _: () = assert!(core::mem::size_of::<Header>() <= HEADER_SIZE);

/// A first-fit heap over a caller-provided region.
pub struct KernelHeap {
    head: *mut Header,
}

// SAFETY: The heap exclusively owns its region; the raw pointers never
// leave the structure un-synchronized (the global instance sits behind an
// IrqSpinLock).
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    /// Creates a heap with no backing region. Every allocation fails
    /// until [`init`](Self::init) is called.
    pub const fn empty() -> Self {
        Self {
            head: core::ptr::null_mut(),
        }
    }

    /// Initializes the heap over `region`.
    ///
    /// # Safety
    ///
    /// `region` must point to `len` bytes of memory dedicated to this
    /// heap for its whole lifetime, with `len > HEADER_SIZE + ALIGN`.
    pub unsafe fn init(&mut self, region: *mut u8, len: usize) {
        let head = region.cast::<Header>();
        // SAFETY: The region is ours and large enough for one header.
        unsafe {
            head.write(Header {
                size: (len - HEADER_SIZE) & !(ALIGN - 1),
                next: core::ptr::null_mut(),
                allocated: false,
            });
        }
        self.head = head;
    }

    /// Allocates `size` bytes, 16-byte aligned. Returns null if no free
    /// block fits.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 || self.head.is_null() {
            return core::ptr::null_mut();
        }
        let size = size.next_multiple_of(ALIGN);

        let mut block = self.head;
        while !block.is_null() {
            // SAFETY: `block` came from the list, which only ever holds
            // headers inside the region.
            let hdr = unsafe { &mut *block };
            if !hdr.allocated && hdr.size >= size {
                if hdr.size >= size + HEADER_SIZE + ALIGN {
                    // Split: carve the tail into a new free block.
                    let rest = unsafe { block.cast::<u8>().add(HEADER_SIZE + size) };
                    let rest = rest.cast::<Header>();
                    // SAFETY: The split point is inside this block's span.
                    unsafe {
                        rest.write(Header {
                            size: hdr.size - size - HEADER_SIZE,
                            next: hdr.next,
                            allocated: false,
                        });
                    }
                    hdr.next = rest;
                    hdr.size = size;
                }
                hdr.allocated = true;
                // SAFETY: Payload directly follows the header.
                return unsafe { block.cast::<u8>().add(HEADER_SIZE) };
            }
            block = hdr.next;
        }
        core::ptr::null_mut()
    }

    /// Frees a block previously returned by [`alloc`](Self::alloc).
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this heap's `alloc` and not been freed
    /// since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        // SAFETY: Per contract, the header sits HEADER_SIZE before ptr.
        let hdr = unsafe { &mut *ptr.sub(HEADER_SIZE).cast::<Header>() };
        assert!(hdr.allocated, "double free of heap block");
        hdr.allocated = false;

        // Coalesce with a physically adjacent free successor so repeated
        // alloc/free cycles do not shred the region.
        let next = hdr.next;
        if !next.is_null() {
            let end = unsafe { (hdr as *mut Header).cast::<u8>().add(HEADER_SIZE + hdr.size) };
            // SAFETY: `next` is a live header from the list.
            let next_hdr = unsafe { &mut *next };
            if !next_hdr.allocated && core::ptr::eq(end.cast::<Header>(), next) {
                hdr.size += HEADER_SIZE + next_hdr.size;
                hdr.next = next_hdr.next;
            }
        }
    }

    /// Total free payload bytes (diagnostics).
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut block = self.head;
        while !block.is_null() {
            // SAFETY: list invariant, as in alloc.
            let hdr = unsafe { &*block };
            if !hdr.allocated {
                total += hdr.size;
            }
            block = hdr.next;
        }
        total
    }
}

// ---------------------------------------------------------------------------
// Global heap
// ---------------------------------------------------------------------------

static KHEAP: IrqSpinLock<KernelHeap> = IrqSpinLock::new(KernelHeap::empty());

/// Initializes the global kernel heap over `region`.
///
/// # Safety
///
/// Same contract as [`KernelHeap::init`]; call once during bring-up.
pub unsafe fn init(region: *mut u8, len: usize) {
    unsafe { KHEAP.lock().init(region, len) };
}

/// Allocates from the global kernel heap. Null when out of heap.
pub fn kmalloc(size: usize) -> *mut u8 {
    KHEAP.lock().alloc(size)
}

/// Returns a block to the global kernel heap.
///
/// # Safety
///
/// `ptr` must have come from [`kmalloc`] and not been freed since.
pub unsafe fn kfree(ptr: *mut u8) {
    unsafe { KHEAP.lock().free(ptr) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_over(len: usize) -> KernelHeap {
        let region = vec![0u8; len].leak();
        let mut heap = KernelHeap::empty();
        unsafe { heap.init(region.as_mut_ptr(), len) };
        heap
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut heap = heap_over(4096);
        let a = heap.alloc(10);
        let b = heap.alloc(100);
        assert!(!a.is_null() && !b.is_null());
        assert_eq!(a as usize % ALIGN, 0);
        assert_eq!(b as usize % ALIGN, 0);
        // Blocks must not overlap: a got 16 bytes plus the next header.
        assert!(b as usize >= a as usize + 16 + HEADER_SIZE);
    }

    #[test]
    fn exhaustion_returns_null() {
        let mut heap = heap_over(256);
        assert!(!heap.alloc(128).is_null());
        assert!(heap.alloc(128).is_null());
    }

    #[test]
    fn free_makes_space_reusable() {
        let mut heap = heap_over(512);
        let a = heap.alloc(64);
        let _held = heap.alloc(128);
        unsafe { heap.free(a) };
        let b = heap.alloc(64);
        assert_eq!(a, b);
    }

    #[test]
    fn coalescing_rebuilds_large_blocks() {
        let mut heap = heap_over(4096);
        let free_at_start = heap.free_bytes();
        let a = heap.alloc(512);
        let b = heap.alloc(512);
        let c = heap.alloc(512);
        assert!(!c.is_null());
        // Free back-to-front so each free can absorb its successor.
        unsafe {
            heap.free(c);
            heap.free(b);
            heap.free(a);
        }
        assert_eq!(heap.free_bytes(), free_at_start);
        // A large allocation fits again.
        assert!(!heap.alloc(2048).is_null());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut heap = heap_over(512);
        let a = heap.alloc(32);
        unsafe {
            heap.free(a);
            heap.free(a);
        }
    }

    #[test]
    fn zero_size_allocation_is_null() {
        let mut heap = heap_over(512);
        assert!(heap.alloc(0).is_null());
    }
}
