//! Disk scheduler.
//!
//! Decides where a new request enters a device's queue. The current
//! policy is plain FIFO; anything smarter (elevator, deadline) would
//! slot in here without touching the driver.

use alloc::collections::VecDeque;

use crate::gbd::Request;

/// Schedules `request` into `queue`.
pub fn schedule(queue: &mut VecDeque<Request>, request: Request) {
    queue.push_back(request);
}
