//! Counting semaphores.
//!
//! Semaphores live in a fixed table; a [`Semaphore`] handle is just the
//! slot index, cheap to copy into device requests and wake paths. A slot
//! with no creator is free. Waiting is built on the sleep queue, keyed by
//! the table entry's address, so waiters are woken strictly in arrival
//! order.

use core::ptr;

use kudos_core::config::MAX_SEMAPHORES;
use kudos_core::intr;
use kudos_core::sync::IrqSpinLock;

use crate::thread::{self, Tid};
use crate::{Resource, SchedError, sleepq};

struct SemEntry {
    value: i32,
    creator: Option<Tid>,
}

struct SemTable {
    entries: [SemEntry; MAX_SEMAPHORES],
    /// Rotating cursor for slot allocation.
    next: usize,
}

static SEMAPHORES: IrqSpinLock<SemTable> = IrqSpinLock::new(SemTable {
    entries: [const {
        SemEntry {
            value: 0,
            creator: None,
        }
    }; MAX_SEMAPHORES],
    next: 0,
});

/// Handle to a semaphore table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semaphore {
    idx: u16,
}

/// Initializes the semaphore subsystem: every slot becomes free.
pub fn init() {
    let mut table = SEMAPHORES.lock();
    for entry in &mut table.entries {
        entry.creator = None;
        entry.value = 0;
    }
    table.next = 0;
}

/// Creates a semaphore with the given initial value (must be >= 0).
///
/// Fails with [`SchedError::Exhausted`] when the table is full.
pub fn create(value: i32) -> Result<Semaphore, SchedError> {
    assert!(value >= 0, "semaphore created with negative value");

    let mut table = SEMAPHORES.lock();
    for _ in 0..MAX_SEMAPHORES {
        let idx = table.next;
        table.next = (table.next + 1) % MAX_SEMAPHORES;
        if table.entries[idx].creator.is_none() {
            table.entries[idx].creator = Some(current_or_idle());
            table.entries[idx].value = value;
            return Ok(Semaphore { idx: idx as u16 });
        }
    }
    Err(SchedError::Exhausted)
}

/// Frees a semaphore for later re-creation. The caller guarantees no
/// thread is waiting on it.
pub fn destroy(sem: Semaphore) {
    SEMAPHORES.lock().entries[sem.idx as usize].creator = None;
}

/// The creator is recorded for diagnostics; during bootstrap there is no
/// current thread yet, so fall back to the idle slot.
fn current_or_idle() -> Tid {
    thread::current()
}

impl Semaphore {
    /// The sleep-queue key: the address of this semaphore's table entry.
    fn resource(self) -> Resource {
        let base = ptr::addr_of!(SEMAPHORES) as usize;
        Resource(base + self.idx as usize)
    }

    /// Decrements the semaphore, blocking while the result is negative.
    ///
    /// Must not be called from an interrupt handler.
    pub fn p(self) {
        let st = intr::disable();
        let must_wait = {
            let mut table = SEMAPHORES.lock();
            let entry = &mut table.entries[self.idx as usize];
            entry.value -= 1;
            if entry.value < 0 {
                // Queue ourselves before releasing the table, so a V
                // racing in cannot miss us.
                sleepq::add(self.resource());
                true
            } else {
                false
            }
        };
        if must_wait {
            thread::switch();
        }
        intr::restore(st);
    }

    /// Increments the semaphore, waking one waiter if any.
    ///
    /// Never blocks, so it is safe from interrupt handlers.
    pub fn v(self) {
        let st = intr::disable();
        {
            let mut table = SEMAPHORES.lock();
            let entry = &mut table.entries[self.idx as usize];
            entry.value += 1;
            if entry.value <= 0 {
                sleepq::wake(self.resource());
            }
        }
        intr::restore(st);
    }

    /// The current counter value (diagnostics).
    pub fn value(self) -> i32 {
        SEMAPHORES.lock().entries[self.idx as usize].value
    }

    /// Number of threads currently waiting on this semaphore
    /// (diagnostics).
    pub fn waiters(self) -> usize {
        let resource = self.resource();
        thread::inspect(|table| {
            (0..kudos_core::config::MAX_THREADS)
                .map(|i| Tid(i as u16))
                .filter(|&tid| table.sleeps_on(tid) == Some(resource) && table.on_sleep_queue(tid))
                .count()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_glue;
    use crate::thread::ThreadState;

    fn noop(_arg: usize) {}

    fn spawn_running(n: usize) -> Vec<Tid> {
        let tids: Vec<_> = (0..n)
            .map(|_| thread::create(noop, 0).unwrap())
            .collect();
        for &t in &tids {
            thread::run(t);
        }
        thread::switch();
        tids
    }

    #[test]
    fn uncontended_p_and_v() {
        let _g = test_glue::serialize();
        test_glue::reset_threading();
        let _tids = spawn_running(1);

        let sem = create(2).unwrap();
        sem.p();
        sem.p();
        assert_eq!(sem.value(), 0);
        sem.v();
        assert_eq!(sem.value(), 1);
        sem.v();
        assert_eq!(sem.value(), 2);
        destroy(sem);
    }

    #[test]
    fn create_exhaustion_and_reuse() {
        let _g = test_glue::serialize();
        test_glue::reset_threading();

        let sems: Vec<_> = (0..MAX_SEMAPHORES).map(|_| create(1).unwrap()).collect();
        assert_eq!(create(1), Err(SchedError::Exhausted));
        destroy(sems[7]);
        assert!(create(1).is_ok());
    }

    #[test]
    fn waiters_unblock_in_arrival_order() {
        let _g = test_glue::serialize();
        test_glue::reset_threading();
        let tids = spawn_running(4);
        let sem = create(0).unwrap();

        // T1, T2, T3 each P in turn and block.
        for i in 0..3 {
            assert_eq!(thread::current(), tids[i]);
            sem.p();
        }
        assert_eq!(thread::current(), tids[3]);
        assert_eq!(sem.value(), -3);
        assert_eq!(sem.waiters(), 3);
        thread::inspect(|t| {
            for &tid in &tids[..3] {
                assert_eq!(t.state_of(tid), ThreadState::Sleeping);
            }
        });

        // A fourth thread Vs three times; the sleepers become Ready in
        // the order they blocked.
        sem.v();
        sem.v();
        sem.v();
        assert_eq!(sem.value(), 0);
        assert_eq!(sem.waiters(), 0);
        thread::inspect(|t| {
            let order: Vec<_> = t.ready_queue().collect();
            assert_eq!(order, tids[..3].to_vec());
        });
        destroy(sem);
    }

    #[test]
    fn value_accounts_for_waiters() {
        let _g = test_glue::serialize();
        test_glue::reset_threading();
        let _tids = spawn_running(3);
        let sem = create(1).unwrap();

        // First P takes the free value; the next two block.
        sem.p();
        assert_eq!(sem.value(), 0);
        assert_eq!(sem.waiters(), 0);

        sem.p();
        sem.p();
        // value < 0 implies |value| threads are waiting.
        assert_eq!(sem.value(), -2);
        assert_eq!(sem.waiters(), 2);
        destroy(sem);
    }

    #[test]
    fn v_from_any_context_wakes_one() {
        let _g = test_glue::serialize();
        test_glue::reset_threading();
        let tids = spawn_running(2);
        let sem = create(0).unwrap();

        sem.p(); // tids[0] blocks
        assert_eq!(thread::current(), tids[1]);
        sem.v();
        thread::inspect(|t| {
            assert_eq!(t.state_of(tids[0]), ThreadState::Ready);
        });
        destroy(sem);
    }
}
