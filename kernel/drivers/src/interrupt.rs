//! Interrupt handler registry and dispatch.
//!
//! Drivers register `(irq mask, handler)` pairs during bring-up, before
//! interrupts are enabled. On every hardware interrupt the dispatch walks
//! the table in insertion order and invokes each handler whose mask
//! intersects the cause bits.
//!
//! On the host there is no hardware to raise lines, so device models call
//! [`raise`]; the pending mask is drained through the hook this module
//! installs into `kudos_core::intr`, which fires exactly when interrupts
//! transition back to enabled — the same latency a real pended IRQ has.

use alloc::boxed::Box;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use kudos_core::intr;
use kudos_core::sync::SpinLock;

use planck_noalloc::vec::ArrayVec;

/// Interrupt cause bits: software interrupts 0-1, hardware 0-5.
pub const MASK_SOFTWARE_0: u32 = 1 << 8;
/// Software interrupt 1.
pub const MASK_SOFTWARE_1: u32 = 1 << 9;
/// The timer interrupt line (hardware 5).
pub const MASK_TIMER: u32 = 1 << 15;
/// All interrupt cause bits this kernel understands.
pub const MASK_ALL: u32 = 0xff00;

/// Maximum registered handlers: one per device slot.
const MAX_HANDLERS: usize = kudos_core::config::MAX_DEVICES;

/// Returns the cause-register mask for a device IRQ number.
pub const fn irq_mask(irq: u32) -> u32 {
    1 << (irq + 10)
}

struct HandlerEntry {
    mask: u32,
    handler: Box<dyn Fn() + Send + Sync>,
}

static HANDLERS: SpinLock<ArrayVec<HandlerEntry, MAX_HANDLERS>> =
    SpinLock::new(ArrayVec::new());

/// Software-raised interrupt lines awaiting dispatch (host emulation).
static PENDING: AtomicU32 = AtomicU32::new(0);
static IN_DRAIN: AtomicBool = AtomicBool::new(false);

/// Initializes interrupt handling: clears the handler table and installs
/// the pending-line drain hook.
pub fn init() {
    HANDLERS.lock().clear();
    PENDING.store(0, Ordering::Release);
    // SAFETY: `drain_pending` is safe from any context and guards
    // against re-entry.
    unsafe { intr::set_drain_fn(drain_pending) };
}

/// Registers `handler` for every interrupt in `mask`.
///
/// Called by drivers during bring-up only; there is no unregistration.
///
/// # Panics
///
/// Panics on a mask with unknown bits or when the table is full.
pub fn register(mask: u32, handler: impl Fn() + Send + Sync + 'static) {
    assert!(mask & !MASK_ALL == 0, "unsupported IRQ mask {mask:#010x}");

    let mut table = HANDLERS.lock();
    table
        .try_push(HandlerEntry {
            mask,
            handler: Box::new(handler),
        })
        .unwrap_or_else(|_| panic!("interrupt handler table is full"));
}

/// Dispatches one interrupt: invokes, in registration order, every
/// handler whose mask intersects `cause`, then hands the CPU to the
/// scheduler if the timer fired, a context switch was requested, or the
/// idle thread is running. Interrupts are disabled for the duration.
///
/// # Panics
///
/// Panics on cause bits outside the interrupt range: exceptions are
/// handled elsewhere and must never reach this path.
pub fn dispatch(cause: u32) {
    assert!(
        cause & !MASK_ALL == 0,
        "caught exception in interrupt dispatch, cause {cause:#010x}"
    );

    let st = intr::disable();
    {
        let table = HANDLERS.lock();
        for entry in table.iter() {
            if entry.mask & cause != 0 {
                (entry.handler)();
            }
        }
    }

    if cause & (MASK_SOFTWARE_0 | MASK_TIMER) != 0
        || kudos_sched::thread::current() == kudos_sched::IDLE_THREAD
    {
        kudos_sched::scheduler::schedule();
    }
    intr::restore(st);
}

/// Latches interrupt lines for later dispatch.
///
/// Device models (and, on real hardware, nothing) call this; the latched
/// lines fire when interrupts are next enabled.
pub fn raise(mask: u32) {
    PENDING.fetch_or(mask, Ordering::AcqRel);
}

/// Returns the currently latched lines without clearing them.
pub fn pending() -> u32 {
    PENDING.load(Ordering::Acquire)
}

fn drain_pending() {
    // A handler that re-enables interrupts must not recurse into the
    // drain; the outer loop will pick up anything it raised.
    if IN_DRAIN.swap(true, Ordering::AcqRel) {
        return;
    }
    loop {
        let cause = PENDING.swap(0, Ordering::AcqRel);
        if cause == 0 {
            break;
        }
        dispatch(cause);
    }
    IN_DRAIN.store(false, Ordering::Release);
}
