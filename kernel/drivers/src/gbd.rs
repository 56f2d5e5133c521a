//! Generic block device interface.
//!
//! Fixed-size-block read/write with a request descriptor. Callers fill
//! in the block number, a physical buffer address and optionally a
//! semaphore:
//!
//! - no semaphore: the call is synchronous and returns once the block
//!   has been transferred, reporting success or failure;
//! - with a semaphore: the call returns immediately and the semaphore is
//!   signalled exactly once when the request completes; the request's
//!   shared [`RequestStatus`] then carries the device status.

use alloc::sync::Arc;

use core::sync::atomic::{AtomicI32, Ordering};

use kudos_core::addr::PhysAddr;
use kudos_sched::Semaphore;

use crate::IoError;

/// Operation codes for block device requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    /// Transfer a block from the device into memory.
    Read,
    /// Transfer a block from memory onto the device.
    Write,
}

/// Completion status shared between a request's submitter and the
/// interrupt handler that finishes it.
pub struct RequestStatus {
    code: AtomicI32,
}

impl RequestStatus {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            code: AtomicI32::new(-1),
        })
    }

    /// Device status of the completed request; `0` is success, negative
    /// means still in flight.
    pub fn code(&self) -> i32 {
        self.code.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, code: i32) {
        self.code.store(code, Ordering::Release);
    }
}

/// One block device request.
pub struct Request {
    /// Block number to operate on.
    pub block: u32,
    /// Physical address of a buffer one block in size.
    pub buf: PhysAddr,
    /// Completion semaphore; `None` makes the request synchronous.
    pub sem: Option<Semaphore>,
    /// Operation code, filled in by the driver.
    pub(crate) op: BlockOp,
    pub(crate) status: Arc<RequestStatus>,
}

impl Request {
    /// Creates a synchronous request: submitting it blocks until the
    /// transfer is done.
    pub fn new(block: u32, buf: PhysAddr) -> Self {
        Self {
            block,
            buf,
            sem: None,
            op: BlockOp::Read,
            status: RequestStatus::new(),
        }
    }

    /// Creates an asynchronous request completed by signalling `sem`.
    pub fn with_sem(block: u32, buf: PhysAddr, sem: Semaphore) -> Self {
        Self {
            sem: Some(sem),
            ..Self::new(block, buf)
        }
    }

    /// Shared handle to this request's completion status. Asynchronous
    /// callers clone it before submitting.
    pub fn status(&self) -> Arc<RequestStatus> {
        Arc::clone(&self.status)
    }
}

/// A generic block device.
pub trait BlockDevice: Send + Sync {
    /// Reads the block named by `request` into its buffer.
    fn read_block(&self, request: Request) -> Result<(), IoError>;

    /// Writes `request`'s buffer to the block it names.
    fn write_block(&self, request: Request) -> Result<(), IoError>;

    /// Block size of the device in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks on the device.
    fn total_blocks(&self) -> u32;
}
