//! Thread table and thread lifecycle.
//!
//! All threads live in a fixed table of `MAX_THREADS` slots. Slot 0 is
//! the idle thread: permanently present, run only when nothing else is
//! Ready, and never enqueued anywhere. The ready queue and the sleep
//! queue are intrusive lists threaded through each slot's `next` field,
//! so they live in the same structure under the same lock.

use core::ptr;

use bitflags::bitflags;

use kudos_core::config::{MAX_THREADS, SLEEPQ_SIZE, THREAD_STACK_SIZE};
use kudos_core::sync::IrqSpinLock;
use kudos_mm::vm::PagetableHandle;

use crate::{Resource, SchedError, scheduler};

/// Thread identifier: an index into the thread table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tid(pub(crate) u16);

/// The idle thread's fixed identifier.
pub const IDLE_THREAD: Tid = Tid(0);

impl Tid {
    /// Returns the table index of this thread.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lifecycle state of a thread table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Slot unused.
    Free,
    /// Currently executing on some CPU.
    Running,
    /// On the ready queue, waiting for a CPU.
    Ready,
    /// Parked in a sleep queue bucket.
    Sleeping,
    /// Created but not yet handed to the scheduler.
    NonReady,
    /// Finished; the slot is reclaimed on the next scheduling decision.
    Dying,
}

bitflags! {
    /// Thread attribute flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// The thread has a userland context.
        const USERMODE = 1 << 0;
        /// The thread should enter userland on its next return.
        const ENTERUSER = 1 << 1;
    }
}

/// Entry point signature for kernel threads.
pub type ThreadEntry = fn(usize);

/// Saved execution context for a thread.
///
/// The platform context-switch layer saves and restores the real register
/// file; these fields describe where a fresh thread starts: its entry
/// point, its argument, its stack top, and the address execution returns
/// to when the entry function falls off the end.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pc: usize,
    ra: usize,
    sp: usize,
    arg: usize,
}

impl Context {
    const ZERO: Context = Context {
        pc: 0,
        ra: 0,
        sp: 0,
        arg: 0,
    };

    fn init(&mut self, entry: ThreadEntry, arg: usize, stack_top: usize) {
        let finish: fn() = finish;
        self.pc = entry as usize;
        self.ra = finish as usize;
        self.sp = stack_top;
        self.arg = arg;
    }

    /// Address the thread starts (or resumes) executing at.
    pub fn entry_point(&self) -> usize {
        self.pc
    }

    /// Address executed when the thread body returns. Points at
    /// [`finish`], so returning from a thread function is suicide.
    pub fn return_address(&self) -> usize {
        self.ra
    }

    /// Initial stack pointer.
    pub fn stack_pointer(&self) -> usize {
        self.sp
    }

    /// Argument passed to the entry function.
    pub fn argument(&self) -> usize {
        self.arg
    }
}

/// One thread table slot.
pub struct Thread {
    state: ThreadState,
    /// The resource this thread sleeps on, if any.
    sleeps_on: Option<Resource>,
    /// Intrusive link for the ready queue or a sleep bucket.
    next: Option<Tid>,
    /// The address space this thread runs in; kernel threads have none.
    pagetable: Option<PagetableHandle>,
    process_id: Option<u32>,
    flags: ThreadFlags,
    context: Context,
}

impl Thread {
    const fn free() -> Thread {
        Thread {
            state: ThreadState::Free,
            sleeps_on: None,
            next: None,
            pagetable: None,
            process_id: None,
            flags: ThreadFlags::empty(),
            context: Context::ZERO,
        }
    }
}

/// Per-thread kernel stacks.
#[repr(align(16))]
struct StackAreas([u8; MAX_THREADS * THREAD_STACK_SIZE]);

/// Written only by the context-switch layer, never from Rust.
static THREAD_STACKS: StackAreas = StackAreas([0; MAX_THREADS * THREAD_STACK_SIZE]);

fn stack_top(tid: Tid) -> usize {
    let base = ptr::addr_of!(THREAD_STACKS.0) as usize;
    base + (tid.index() + 1) * THREAD_STACK_SIZE - 16
}

/// The thread table, with the ready queue and the sleep queue hash table
/// threaded through it.
pub struct ThreadTable {
    threads: [Thread; MAX_THREADS],
    ready_head: Option<Tid>,
    ready_tail: Option<Tid>,
    /// Head of each sleep queue bucket, keyed by `resource % SLEEPQ_SIZE`.
    buckets: [Option<Tid>; SLEEPQ_SIZE],
    /// Rotating cursor for slot allocation.
    next_tid: u16,
}

impl ThreadTable {
    const fn new() -> Self {
        Self {
            threads: [const { Thread::free() }; MAX_THREADS],
            ready_head: None,
            ready_tail: None,
            buckets: [None; SLEEPQ_SIZE],
            next_tid: 0,
        }
    }

    fn bucket_of(resource: Resource) -> usize {
        resource.0 % SLEEPQ_SIZE
    }

    /// Finds a free slot starting at the rotating cursor and initializes
    /// it NonReady with a fresh context.
    fn create(&mut self, entry: ThreadEntry, arg: usize) -> Result<Tid, SchedError> {
        let mut chosen = None;
        for i in 0..MAX_THREADS {
            let t = (i + self.next_tid as usize) % MAX_THREADS;
            if Tid(t as u16) == IDLE_THREAD {
                continue;
            }
            if self.threads[t].state == ThreadState::Free {
                chosen = Some(Tid(t as u16));
                break;
            }
        }
        let tid = chosen.ok_or(SchedError::TableFull)?;
        self.next_tid = ((tid.index() + 1) % MAX_THREADS) as u16;

        let slot = &mut self.threads[tid.index()];
        *slot = Thread::free();
        slot.state = ThreadState::NonReady;
        slot.context.init(entry, arg, stack_top(tid));
        Ok(tid)
    }

    /// Appends `tid` to the ready queue. The caller has set its state.
    ///
    /// The idle thread never goes on the ready list.
    pub(crate) fn add_to_ready_list(&mut self, tid: Tid) {
        assert!(tid != IDLE_THREAD);
        assert!(tid.index() < MAX_THREADS);

        self.threads[tid.index()].next = None;
        match self.ready_tail {
            None => {
                self.ready_head = Some(tid);
                self.ready_tail = Some(tid);
            }
            Some(tail) => {
                self.threads[tail.index()].next = Some(tid);
                self.ready_tail = Some(tid);
            }
        }
    }

    /// Marks a thread Ready. Paired with
    /// [`add_to_ready_list`](Self::add_to_ready_list) by the scheduler's
    /// add-ready entry point.
    pub(crate) fn set_ready(&mut self, tid: Tid) {
        self.threads[tid.index()].state = ThreadState::Ready;
    }

    /// Removes and returns the first ready thread, falling back to the
    /// idle thread when the queue is empty.
    fn remove_first_ready(&mut self) -> Tid {
        match self.ready_head {
            None => IDLE_THREAD,
            Some(head) => {
                assert!(head != IDLE_THREAD);
                assert!(self.threads[head.index()].state == ThreadState::Ready);
                self.ready_head = self.threads[head.index()].next;
                if self.ready_tail == Some(head) {
                    self.ready_tail = None;
                }
                self.threads[head.index()].next = None;
                head
            }
        }
    }

    /// One scheduling decision: retires or re-queues `current`, then
    /// picks and marks the next Running thread.
    pub(crate) fn schedule_from(&mut self, current: Tid) -> Tid {
        let slot = &mut self.threads[current.index()];
        if slot.state == ThreadState::Dying {
            slot.state = ThreadState::Free;
        } else if slot.sleeps_on.is_some() {
            // The thread queued itself on a sleep bucket before yielding;
            // it now belongs to that bucket.
            slot.state = ThreadState::Sleeping;
        } else {
            slot.state = ThreadState::Ready;
            if current != IDLE_THREAD {
                self.add_to_ready_list(current);
            }
        }

        let next = self.remove_first_ready();
        self.threads[next.index()].state = ThreadState::Running;
        next
    }

    /// Appends `tid` to the bucket for `resource` and records what it
    /// sleeps on. Does not change its state; the scheduler moves it to
    /// Sleeping when the thread yields.
    pub(crate) fn sleepq_add(&mut self, tid: Tid, resource: Resource) {
        assert!(tid != IDLE_THREAD);

        let slot = &mut self.threads[tid.index()];
        slot.next = None;
        slot.sleeps_on = Some(resource);

        let bucket = Self::bucket_of(resource);
        match self.buckets[bucket] {
            None => self.buckets[bucket] = Some(tid),
            Some(head) => {
                let mut prev = head;
                while let Some(n) = self.threads[prev.index()].next {
                    prev = n;
                }
                self.threads[prev.index()].next = Some(tid);
            }
        }
    }

    /// Unlinks the first thread in `resource`'s bucket that actually
    /// waits for `resource` (hash collisions are skipped in place) and
    /// makes it Ready if it was Sleeping. Returns the woken thread.
    pub(crate) fn sleepq_wake(&mut self, resource: Resource) -> Option<Tid> {
        let bucket = Self::bucket_of(resource);

        let mut prev: Option<Tid> = None;
        let mut cur = self.buckets[bucket];
        while let Some(tid) = cur {
            if self.threads[tid.index()].sleeps_on == Some(resource) {
                break;
            }
            prev = cur;
            cur = self.threads[tid.index()].next;
        }
        let tid = cur?;

        let after = self.threads[tid.index()].next;
        match prev {
            None => self.buckets[bucket] = after,
            Some(p) => self.threads[p.index()].next = after,
        }

        let slot = &mut self.threads[tid.index()];
        slot.sleeps_on = None;
        slot.next = None;
        if slot.state == ThreadState::Sleeping {
            slot.state = ThreadState::Ready;
            self.add_to_ready_list(tid);
        }
        Some(tid)
    }

    /// Wakes every thread in `resource`'s bucket waiting for `resource`.
    /// Returns how many were woken.
    pub(crate) fn sleepq_wake_all(&mut self, resource: Resource) -> usize {
        let mut woken = 0;
        while self.sleepq_wake(resource).is_some() {
            woken += 1;
        }
        woken
    }

    // -- queries (diagnostics and tests) ----------------------------------

    /// Returns the state of a thread slot.
    pub fn state_of(&self, tid: Tid) -> ThreadState {
        self.threads[tid.index()].state
    }

    /// Returns the resource a thread sleeps on, if any.
    pub fn sleeps_on(&self, tid: Tid) -> Option<Resource> {
        self.threads[tid.index()].sleeps_on
    }

    /// Returns a thread's attribute flags.
    pub fn flags_of(&self, tid: Tid) -> ThreadFlags {
        self.threads[tid.index()].flags
    }

    /// Returns a copy of a thread's saved context.
    pub fn context_of(&self, tid: Tid) -> Context {
        self.threads[tid.index()].context
    }

    /// Iterates the ready queue front to back.
    pub fn ready_queue(&self) -> impl Iterator<Item = Tid> + '_ {
        let mut cur = self.ready_head;
        core::iter::from_fn(move || {
            let tid = cur?;
            cur = self.threads[tid.index()].next;
            Some(tid)
        })
    }

    /// True if `tid` is linked on the ready queue.
    pub fn on_ready_queue(&self, tid: Tid) -> bool {
        self.ready_queue().any(|t| t == tid)
    }

    /// True if `tid` is linked in any sleep bucket.
    pub fn on_sleep_queue(&self, tid: Tid) -> bool {
        for bucket in 0..SLEEPQ_SIZE {
            let mut cur = self.buckets[bucket];
            while let Some(t) = cur {
                if t == tid {
                    return true;
                }
                cur = self.threads[t.index()].next;
            }
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Global thread table and public thread API
// ---------------------------------------------------------------------------

static THREADS: IrqSpinLock<ThreadTable> = IrqSpinLock::new(ThreadTable::new());

/// Initializes the threading system: clears the table and sets up the
/// idle thread, permanently Ready but never queued.
pub fn init() {
    let mut table = THREADS.lock();
    *table = ThreadTable::new();

    let idle = &mut table.threads[IDLE_THREAD.index()];
    idle.state = ThreadState::Ready;
    idle.context.init(idle_thread_loop, 0, stack_top(IDLE_THREAD));
}

/// Creates a new thread that will run `entry(arg)` once scheduled.
/// The new thread is NonReady until [`run`] hands it to the scheduler.
pub fn create(entry: ThreadEntry, arg: usize) -> Result<Tid, SchedError> {
    THREADS.lock().create(entry, arg)
}

/// Makes a created thread Ready. Just a wrapper for the scheduler's
/// add-ready.
pub fn run(tid: Tid) {
    scheduler::add_ready(tid);
}

/// Returns the id of the thread running on this CPU.
pub fn current() -> Tid {
    let st = kudos_core::intr::disable();
    let tid = scheduler::current_on(kudos_core::intr::current_cpu());
    kudos_core::intr::restore(st);
    tid
}

/// Voluntary rescheduling: ends the calling thread's timeslice exactly
/// as a timer tick would. Not a substitute for sleeping.
pub fn switch() {
    let st = kudos_core::intr::enable();
    scheduler::schedule();
    kudos_core::intr::restore(st);
}

/// Alias for [`switch`], for call sites that read better as a yield.
pub fn yield_now() {
    switch();
}

/// Thread suicide. Marks the calling thread Dying; the scheduler frees
/// the slot when it next runs. The thread's pagetable must already have
/// been detached.
pub fn finish() {
    let tid = current();
    {
        let table = THREADS.lock();
        assert!(
            table.threads[tid.index()].pagetable.is_none(),
            "finishing thread still owns a pagetable"
        );
    }
    THREADS.lock().threads[tid.index()].state = ThreadState::Dying;
    switch();

    // Unreachable once the context switch layer stops returning here.
    #[cfg(target_os = "none")]
    panic!("finish: thread was not destroyed");
}

/// Attaches an address space to a thread.
pub fn give_pagetable(tid: Tid, pagetable: PagetableHandle) {
    let mut table = THREADS.lock();
    let slot = &mut table.threads[tid.index()];
    assert!(slot.pagetable.is_none(), "thread already has a pagetable");
    slot.pagetable = Some(pagetable);
}

/// Detaches and returns a thread's address space, if it has one.
pub fn take_pagetable(tid: Tid) -> Option<PagetableHandle> {
    THREADS.lock().threads[tid.index()].pagetable.take()
}

/// Sets a thread's attribute flags. Used by the process layer when a
/// thread gains a userland context.
pub fn set_flags(tid: Tid, flags: ThreadFlags) {
    THREADS.lock().threads[tid.index()].flags = flags;
}

/// Sets a thread's owning process id.
pub fn set_process(tid: Tid, process_id: Option<u32>) {
    THREADS.lock().threads[tid.index()].process_id = process_id;
}

/// Returns a thread's owning process id.
pub fn process_of(tid: Tid) -> Option<u32> {
    THREADS.lock().threads[tid.index()].process_id
}

/// Executes a closure with shared access to the thread table. For
/// diagnostics and tests; the closure must not block.
pub fn inspect<R>(f: impl FnOnce(&ThreadTable) -> R) -> R {
    f(&THREADS.lock())
}

/// Executes a closure with exclusive access to the thread table. Used by
/// the scheduler and sleep queue front ends.
pub(crate) fn with_table<R>(f: impl FnOnce(&mut ThreadTable) -> R) -> R {
    f(&mut THREADS.lock())
}

/// The idle thread: spins with interrupts enabled and yields, forever.
pub fn idle_thread_loop(_arg: usize) {
    loop {
        switch();
        core::hint::spin_loop();
    }
}
