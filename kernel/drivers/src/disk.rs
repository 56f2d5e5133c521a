//! Disk driver.
//!
//! A request-queued block driver: submissions enter a FIFO queue, the
//! controller carries at most one command at a time, and the interrupt
//! handler completes the served request and starts the next one. The
//! actual hardware sits behind [`DiskController`]; the memory-mapped
//! implementation below drives a real IO area, and the ram-backed one in
//! [`crate::ramdisk`] stands in for hosted tests.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;

use kudos_core::addr::PhysAddr;
use kudos_core::kprintln;
use kudos_core::sync::IrqSpinLock;
use kudos_sched::semaphore;

use crate::device::{Device, DriverState, IoDescriptor, typecode};
use crate::gbd::{BlockDevice, BlockOp, Request};
use crate::{IoError, disksched, interrupt};

/// The hardware half of the disk driver.
pub trait DiskController: Send {
    /// Programs one transfer: block number, physical buffer, direction.
    /// The device raises its IRQ when the transfer completes.
    fn begin(&mut self, op: BlockOp, block: u32, buf: PhysAddr);

    /// True if this device raised the pending interrupt; clears its IRQ
    /// latches as a side effect.
    fn poll_and_clear_irq(&mut self) -> bool;

    /// True while a transfer is in progress.
    fn busy(&self) -> bool;

    /// True if the device status carries error bits.
    fn error(&self) -> bool;

    /// Block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn total_blocks(&self) -> u32;
}

struct DiskState {
    controller: Box<dyn DiskController>,
    queue: VecDeque<Request>,
    /// The request the device is currently working on.
    served: Option<Request>,
}

/// A request-queued disk bound to one controller.
pub struct DiskDriver {
    state: IrqSpinLock<DiskState>,
}

impl DiskDriver {
    /// Initializes a disk over `controller`, registering its interrupt
    /// handler, and returns the device table entry.
    pub fn init_device(desc: &IoDescriptor, controller: Box<dyn DiskController>) -> Device {
        let driver = Arc::new(DiskDriver {
            state: IrqSpinLock::new(DiskState {
                controller,
                queue: VecDeque::new(),
                served: None,
            }),
        });

        if let Some(irq) = desc.irq {
            let handler = Arc::clone(&driver);
            interrupt::register(interrupt::irq_mask(irq), move || handler.handle_interrupt());
        }

        Device {
            typecode: typecode::DISK,
            io_base: desc.io_base,
            driver: DriverState::Disk(driver),
        }
    }

    /// Completes the served request and starts the next queued one.
    fn handle_interrupt(&self) {
        let mut state = self.state.lock();

        if !state.controller.poll_and_clear_irq() {
            // Shared line; not ours.
            return;
        }

        let request = state
            .served
            .take()
            .expect("disk interrupt without a request in flight");
        request.status.set(0);
        // Wake whoever waits on this request: the synchronous submit
        // path, or an asynchronous caller.
        request.sem.expect("in-flight request without semaphore").v();

        Self::next_request(&mut state);
    }

    /// Starts the queue head on an idle device. Caller holds the device
    /// lock; the device must not be busy.
    fn next_request(state: &mut DiskState) {
        assert!(!state.controller.busy());
        assert!(state.served.is_none());

        let Some(request) = state.queue.pop_front() else {
            return;
        };

        state
            .controller
            .begin(request.op, request.block, request.buf);
        if state.controller.error() {
            kprintln!("disk error on block {}", request.block);
            panic!("disk error occurred");
        }
        state.served = Some(request);
    }

    fn submit_request(&self, mut request: Request, op: BlockOp) -> Result<(), IoError> {
        request.op = op;
        request.status.set(-1);

        // A synchronous request gets a private semaphore; we wait on it
        // below and destroy it afterwards.
        let private = match request.sem {
            Some(_) => None,
            None => {
                let sem = semaphore::create(0).map_err(|_| IoError::Exhausted)?;
                request.sem = Some(sem);
                Some(sem)
            }
        };
        let status = request.status();

        {
            let mut state = self.state.lock();
            disksched::schedule(&mut state.queue, request);
            if state.served.is_none() {
                Self::next_request(&mut state);
            }
        }
        // The lock guard is gone: a completion latched by the controller
        // is delivered here, before any synchronous wait begins.

        match private {
            Some(sem) => {
                sem.p();
                semaphore::destroy(sem);
                if status.code() == 0 {
                    Ok(())
                } else {
                    Err(IoError::Device)
                }
            }
            None => Ok(()),
        }
    }
}

impl BlockDevice for DiskDriver {
    fn read_block(&self, request: Request) -> Result<(), IoError> {
        self.submit_request(request, BlockOp::Read)
    }

    fn write_block(&self, request: Request) -> Result<(), IoError> {
        self.submit_request(request, BlockOp::Write)
    }

    fn block_size(&self) -> u32 {
        self.state.lock().controller.block_size()
    }

    fn total_blocks(&self) -> u32 {
        self.state.lock().controller.total_blocks()
    }
}

// ---------------------------------------------------------------------------
// Memory-mapped controller (real hardware)
// ---------------------------------------------------------------------------

/// Command codes of the memory-mapped disk IO area.
mod cmd {
    pub const READ: u32 = 0x1;
    pub const WRITE: u32 = 0x2;
    pub const CLEAR_RIRQ: u32 = 0x3;
    pub const CLEAR_WIRQ: u32 = 0x4;
    pub const BLOCKSIZE: u32 = 0x5;
    pub const BLOCKS: u32 = 0x6;
}

bitflags::bitflags! {
    /// Status bits of the memory-mapped disk IO area.
    #[derive(Debug, Clone, Copy)]
    struct DiskStatus: u32 {
        const RIRQ = 1 << 0;
        const WIRQ = 1 << 1;
        const RBUSY = 1 << 2;
        const WBUSY = 1 << 3;
        const ERRORS = 0xf800_0000;
    }
}

/// Word offsets into the disk IO area.
const REG_STATUS: usize = 0;
const REG_COMMAND: usize = 1;
const REG_DATA: usize = 2;
const REG_TSECTOR: usize = 3;
const REG_DMAADDR: usize = 4;

/// A disk controller speaking through a memory-mapped IO area.
pub struct MemMappedDisk {
    io_base: *mut u32,
}

// SAFETY: The IO area belongs to this controller alone; the owning
// driver serializes access behind its spin lock.
unsafe impl Send for MemMappedDisk {}

impl MemMappedDisk {
    /// Creates a controller over the IO area at `io_base`.
    pub fn new(io_base: u64) -> Self {
        Self {
            io_base: io_base as *mut u32,
        }
    }

    fn read_reg(&self, reg: usize) -> u32 {
        // SAFETY: The register offsets are within the device IO area.
        unsafe { self.io_base.add(reg).read_volatile() }
    }

    fn read_status(&self) -> DiskStatus {
        DiskStatus::from_bits_truncate(self.read_reg(REG_STATUS))
    }

    fn write_reg(&self, reg: usize, value: u32) {
        // SAFETY: As above.
        unsafe { self.io_base.add(reg).write_volatile(value) }
    }
}

impl DiskController for MemMappedDisk {
    fn begin(&mut self, op: BlockOp, block: u32, buf: PhysAddr) {
        self.write_reg(REG_TSECTOR, block);
        self.write_reg(REG_DMAADDR, buf.as_u64() as u32);
        match op {
            BlockOp::Read => self.write_reg(REG_COMMAND, cmd::READ),
            BlockOp::Write => self.write_reg(REG_COMMAND, cmd::WRITE),
        }
    }

    fn poll_and_clear_irq(&mut self) -> bool {
        let st = self.read_status();
        if !st.intersects(DiskStatus::RIRQ | DiskStatus::WIRQ) {
            return false;
        }
        // Both latches are cleared; the handling is identical.
        self.write_reg(REG_COMMAND, cmd::CLEAR_WIRQ);
        self.write_reg(REG_COMMAND, cmd::CLEAR_RIRQ);
        true
    }

    fn busy(&self) -> bool {
        self.read_status()
            .intersects(DiskStatus::RBUSY | DiskStatus::WBUSY)
    }

    fn error(&self) -> bool {
        self.read_status().intersects(DiskStatus::ERRORS)
    }

    fn block_size(&self) -> u32 {
        self.write_reg(REG_COMMAND, cmd::BLOCKSIZE);
        self.read_reg(REG_DATA)
    }

    fn total_blocks(&self) -> u32 {
        self.write_reg(REG_COMMAND, cmd::BLOCKS);
        self.read_reg(REG_DATA)
    }
}

/// Driver-table entry point: binds the memory-mapped controller at the
/// descriptor's IO area.
pub fn probe(desc: &IoDescriptor) -> Option<Device> {
    Some(DiskDriver::init_device(
        desc,
        Box::new(MemMappedDisk::new(desc.io_base)),
    ))
}
