//! Round-robin scheduler.
//!
//! One global FIFO ready queue; one current thread per CPU. Every timer
//! tick (or explicit yield) retires the current thread back to the ready
//! queue — or to Free if it is Dying, or to Sleeping if it parked itself
//! on a sleep bucket — and runs the queue head, falling back to the idle
//! thread when the queue is empty. The next tick is programmed with a
//! randomized timeslice so that CPUs do not resonate on the same period.

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use kudos_core::config::{MAX_CPUS, SCHEDULER_TIMESLICE};
use kudos_core::{intr, rand};

use crate::thread::{self, Tid};

/// Currently running thread on each CPU.
///
/// Each entry is written only by its own CPU with interrupts disabled;
/// cross-CPU readers (statistics) take atomic loads, so no lock is
/// needed.
static CURRENT_THREAD: [AtomicU16; MAX_CPUS] = [const { AtomicU16::new(0) }; MAX_CPUS];

/// Ticks programmed for the most recent timeslice, for diagnostics.
static LAST_TIMESLICE: AtomicU32 = AtomicU32::new(0);

/// Initializes the scheduler: every CPU starts out running the idle
/// thread.
pub fn init() {
    for cpu in &CURRENT_THREAD {
        cpu.store(0, Ordering::Relaxed);
    }
}

/// Returns the thread currently running on `cpu`.
pub(crate) fn current_on(cpu: usize) -> Tid {
    Tid(CURRENT_THREAD[cpu].load(Ordering::Relaxed))
}

/// Adds a thread to the ready queue and marks it Ready. Safe to call
/// from anywhere the thread-table lock is not already held.
pub fn add_ready(tid: Tid) {
    thread::with_table(|table| {
        table.add_to_ready_list(tid);
        table.set_ready(tid);
    });
}

/// Selects the next thread for this CPU.
///
/// Called from the timer interrupt and from explicit yields; the two are
/// deliberately indistinguishable. Also reprograms the timer for a
/// timeslice drawn from `[T/2, 3T/2)` to reduce scheduling resonance.
pub fn schedule() {
    let this_cpu = intr::current_cpu();

    let current = current_on(this_cpu);
    let next = thread::with_table(|table| table.schedule_from(current));
    CURRENT_THREAD[this_cpu].store(next.0, Ordering::Relaxed);

    let ticks = SCHEDULER_TIMESLICE / 2 + rand::next_int(SCHEDULER_TIMESLICE);
    timer_set_ticks(ticks);
}

/// Programs the next timer interrupt.
///
/// The platform timer driver consumes the latest value; on the host the
/// recorded value doubles as a test observable.
fn timer_set_ticks(ticks: u32) {
    LAST_TIMESLICE.store(ticks, Ordering::Relaxed);
}

/// The ticks most recently programmed for a timeslice.
pub fn last_timeslice() -> u32 {
    LAST_TIMESLICE.load(Ordering::Relaxed)
}
