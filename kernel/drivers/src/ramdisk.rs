//! Ram-backed disk controller.
//!
//! Implements [`DiskController`] over a `Vec<u8>`, completing every
//! transfer immediately and latching its IRQ line the way the real
//! controller would, so the whole request-queue/interrupt path of the
//! disk driver runs unchanged on the host. No hardware required.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use kudos_core::addr::PhysAddr;
use kudos_mm::directmap;

use crate::device::{Device, IoDescriptor, typecode};
use crate::disk::{DiskController, DiskDriver};
use crate::gbd::BlockOp;
use crate::interrupt;

/// Block size of the ram disk, matching the filesystem's expectations.
pub const RAMDISK_BLOCK_SIZE: u32 = 512;

/// An in-memory disk.
pub struct RamDisk {
    data: Vec<u8>,
    total_blocks: u32,
    /// Cause bit to latch on completion.
    irq_mask: u32,
    irq_latched: bool,
}

impl RamDisk {
    /// Creates a zeroed ram disk of `total_blocks` blocks that raises
    /// `irq_mask` when a transfer completes.
    pub fn new(total_blocks: u32, irq_mask: u32) -> Self {
        Self {
            data: vec![0u8; total_blocks as usize * RAMDISK_BLOCK_SIZE as usize],
            total_blocks,
            irq_mask,
            irq_latched: false,
        }
    }

    /// Creates a ram disk pre-loaded with `image`, padded with zero
    /// blocks to `total_blocks`.
    pub fn with_image(total_blocks: u32, irq_mask: u32, image: &[u8]) -> Self {
        let mut disk = Self::new(total_blocks, irq_mask);
        assert!(image.len() <= disk.data.len());
        disk.data[..image.len()].copy_from_slice(image);
        disk
    }
}

impl DiskController for RamDisk {
    fn begin(&mut self, op: BlockOp, block: u32, buf: PhysAddr) {
        assert!(block < self.total_blocks, "ramdisk transfer out of range");
        let offset = block as usize * RAMDISK_BLOCK_SIZE as usize;
        let len = RAMDISK_BLOCK_SIZE as usize;
        let mem = directmap::phys_to_ptr(buf);

        // SAFETY: `buf` names a block-sized buffer supplied by the
        // caller of the GBD interface; the direct map makes it
        // addressable here.
        unsafe {
            match op {
                BlockOp::Read => {
                    core::ptr::copy_nonoverlapping(self.data[offset..].as_ptr(), mem, len);
                }
                BlockOp::Write => {
                    core::ptr::copy_nonoverlapping(mem, self.data[offset..].as_mut_ptr(), len);
                }
            }
        }

        // Transfer done; latch the interrupt for delivery once the
        // driver leaves its critical section.
        self.irq_latched = true;
        interrupt::raise(self.irq_mask);
    }

    fn poll_and_clear_irq(&mut self) -> bool {
        core::mem::replace(&mut self.irq_latched, false)
    }

    fn busy(&self) -> bool {
        false
    }

    fn error(&self) -> bool {
        false
    }

    fn block_size(&self) -> u32 {
        RAMDISK_BLOCK_SIZE
    }

    fn total_blocks(&self) -> u32 {
        self.total_blocks
    }
}

/// Builds a complete DISK device over a fresh ram disk. With an IRQ
/// number the driver's interrupt handler is registered as usual.
pub fn create_disk_device(total_blocks: u32, irq: Option<u32>) -> Device {
    let desc = IoDescriptor {
        typecode: typecode::DISK,
        io_base: 0,
        irq: irq.or(Some(3)),
    };
    let mask = interrupt::irq_mask(desc.irq.unwrap());
    DiskDriver::init_device(&desc, Box::new(RamDisk::new(total_blocks, mask)))
}

/// Builds a DISK device over a pre-loaded ram disk image.
pub fn create_disk_device_with_image(total_blocks: u32, irq: Option<u32>, image: &[u8]) -> Device {
    let desc = IoDescriptor {
        typecode: typecode::DISK,
        io_base: 0,
        irq: irq.or(Some(3)),
    };
    let mask = interrupt::irq_mask(desc.irq.unwrap());
    DiskDriver::init_device(&desc, Box::new(RamDisk::with_image(total_blocks, mask, image)))
}
