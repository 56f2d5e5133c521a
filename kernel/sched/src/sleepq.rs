//! Sleep queue.
//!
//! The mechanism that lets threads wait for a resource and be woken when
//! it becomes available. A "resource" is just an address used as a hash
//! key; the sleep queue never dereferences it. Waiters hash into a fixed
//! bucket table and chain FIFO through the thread table's intrusive
//! `next` links, so waking happens in arrival order per resource.
//!
//! [`add`] only queues the calling thread — it does not block. The
//! caller releases whatever spin lock guards the resource and then
//! yields; the scheduler, seeing the queued resource, parks the thread
//! as Sleeping. Waking between the add and the yield is benign: the wake
//! clears the queued resource, so the yield leaves the thread Ready.

use kudos_core::intr;

use crate::thread::{self, IDLE_THREAD};
use crate::Resource;

/// Queues the calling thread on the bucket for `resource`.
///
/// Interrupts must be disabled when calling this; the caller then drops
/// the resource's guard and yields. Does nothing if interrupts are
/// enabled, matching the contract that the add/yield pair is atomic with
/// respect to the waker.
pub fn add(resource: Resource) {
    if !intr::is_disabled() {
        return;
    }

    let tid = thread::current();
    // The idle thread never does anything but its own wait loop.
    assert!(tid != IDLE_THREAD, "idle thread tried to sleep");

    thread::with_table(|table| table.sleepq_add(tid, resource));
}

/// Wakes the first thread waiting for `resource`, if any, moving it to
/// the ready queue. Threads that merely hash-collide are skipped.
pub fn wake(resource: Resource) {
    thread::with_table(|table| {
        table.sleepq_wake(resource);
    });
}

/// Wakes every thread waiting for `resource`.
pub fn wake_all(resource: Resource) {
    thread::with_table(|table| {
        table.sleepq_wake_all(resource);
    });
}
