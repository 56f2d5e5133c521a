//! Physical page pool.
//!
//! A bitmap over all physical pages, one bit per 4 KiB frame. Pages below
//! the bootstrap high-water mark are statically reserved at init and can
//! never be freed. All mutation goes through `&mut self`; the global
//! `PHYSMEM: IrqSpinLock<Option<…>>` provides thread- and interrupt-safety,
//! so the pool itself carries no lock.

use kudos_core::addr::PhysAddr;
use kudos_core::bitmap;
use kudos_core::config::PAGE_SIZE;
use kudos_core::sync::IrqSpinLock;

use crate::MmError;

/// A bitmap-based physical frame pool.
pub struct FramePool {
    /// One bit per page; set = allocated or reserved.
    map: &'static mut [u8],
    /// Total number of pages tracked.
    total_pages: usize,
    /// Number of currently free pages.
    free_pages: usize,
    /// Pages below this index are statically reserved and never freeable.
    static_end: usize,
}

impl FramePool {
    /// Creates a pool over `total_pages` pages, marking the first
    /// `reserved_prefix` pages as statically reserved.
    ///
    /// # Safety
    ///
    /// `map` must be unused memory dedicated to this pool and large enough
    /// for `total_pages` bits, and the described pages must really exist.
    pub unsafe fn new(
        map: &'static mut [u8],
        total_pages: usize,
        reserved_prefix: usize,
    ) -> Self {
        assert!(map.len() >= bitmap::size_in_bytes(total_pages));
        assert!(reserved_prefix <= total_pages);

        bitmap::init(map);
        for page in 0..reserved_prefix {
            bitmap::set(map, page);
        }

        Self {
            map,
            total_pages,
            free_pages: total_pages - reserved_prefix,
            static_end: reserved_prefix,
        }
    }

    /// Allocates one page, returning its physical address.
    pub fn alloc_block(&mut self) -> Result<PhysAddr, MmError> {
        if self.free_pages == 0 {
            return Err(MmError::OutOfMemory);
        }
        let page = bitmap::find_and_set(self.map, self.total_pages)
            .ok_or(MmError::OutOfMemory)?;
        self.free_pages -= 1;
        Ok(PhysAddr::new(page as u64 * PAGE_SIZE as u64))
    }

    /// Allocates `count` physically contiguous pages, returning the
    /// address of the first.
    pub fn alloc_blocks(&mut self, count: usize) -> Result<PhysAddr, MmError> {
        if count == 0 || self.free_pages < count {
            return Err(MmError::OutOfMemory);
        }
        let first = bitmap::find_n_and_set(self.map, self.total_pages, count)
            .ok_or(MmError::OutOfMemory)?;
        self.free_pages -= count;
        Ok(PhysAddr::new(first as u64 * PAGE_SIZE as u64))
    }

    /// Frees a previously allocated page.
    ///
    /// # Panics
    ///
    /// Panics if the page lies in the statically reserved prefix, beyond
    /// the tracked range, or was not allocated (double free).
    pub fn free_block(&mut self, addr: PhysAddr) {
        let page = addr.frame_index();
        assert!(page < self.total_pages, "free of untracked frame {:#x}", addr.as_u64());
        assert!(
            page >= self.static_end,
            "free of statically reserved frame {:#x}",
            addr.as_u64()
        );
        assert!(
            bitmap::get(self.map, page),
            "double free of frame {:#x}",
            addr.as_u64()
        );
        bitmap::clear(self.map, page);
        self.free_pages += 1;
    }

    /// Number of pages tracked in total.
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Number of pages currently free.
    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    /// Number of statically reserved pages.
    pub fn reserved_pages(&self) -> usize {
        self.static_end
    }
}

// ---------------------------------------------------------------------------
// Global pool
// ---------------------------------------------------------------------------

static PHYSMEM: IrqSpinLock<Option<FramePool>> = IrqSpinLock::new(None);

/// Installs the global frame pool. Called once from [`crate::vm::init`].
pub fn install(pool: FramePool) {
    *PHYSMEM.lock() = Some(pool);
}

/// Executes a closure with exclusive access to the global pool.
///
/// # Panics
///
/// Panics if the pool has not been installed yet.
pub fn with<R>(f: impl FnOnce(&mut FramePool) -> R) -> R {
    let mut pool = PHYSMEM.lock();
    f(pool.as_mut().expect("physmem not initialized"))
}

/// Allocates one physical page from the global pool.
pub fn alloc_block() -> Result<PhysAddr, MmError> {
    with(|pool| pool.alloc_block())
}

/// Allocates `count` contiguous physical pages from the global pool.
pub fn alloc_blocks(count: usize) -> Result<PhysAddr, MmError> {
    with(|pool| pool.alloc_blocks(count))
}

/// Frees a page back to the global pool.
pub fn free_block(addr: PhysAddr) {
    with(|pool| pool.free_block(addr));
}
