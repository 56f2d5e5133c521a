//! Local CPU interrupt state.
//!
//! The canonical critical-section pattern everywhere in this kernel is:
//! disable interrupts saving the previous state, take a spin lock, do the
//! work, release the lock, restore the previous state. This module owns the
//! first and last step; [`crate::sync::IrqSpinLock`] composes the whole
//! sequence into one guard.
//!
//! On the bare target, `disable`/`restore` manipulate the CPU's interrupt
//! flag. On the host, the flag is emulated, and restoring the enabled state
//! additionally drains any software-raised interrupt lines through a
//! registered dispatch hook — the same observable behavior as hardware
//! taking a pended IRQ the moment the critical section ends.

use core::sync::atomic::{AtomicPtr, Ordering};

#[cfg(not(target_os = "none"))]
use core::sync::atomic::AtomicBool;

/// Saved interrupt state, as returned by [`disable`] and [`enable`].
///
/// Opaque to callers; hand it back to [`restore`].
#[derive(Debug, Clone, Copy)]
#[must_use = "dropping the saved state leaks the previous interrupt flag"]
pub struct IntrStatus(bool);

/// The signature of the pending-interrupt drain hook.
pub type DrainFn = fn();

fn null_drain() {}

static DRAIN_FN: AtomicPtr<()> = AtomicPtr::new(null_drain as *mut ());

/// Registers the hook invoked when interrupts transition to enabled.
///
/// The interrupt dispatch layer installs itself here during bring-up so
/// that software-raised IRQ lines are serviced with hardware-like latency.
///
/// # Safety
///
/// `f` must be safe to call from any context and must tolerate re-entrant
/// enables performed while it runs.
pub unsafe fn set_drain_fn(f: DrainFn) {
    DRAIN_FN.store(f as *mut (), Ordering::Release);
}

fn drain_pending() {
    let ptr = DRAIN_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `DrainFn` pointers are ever stored into DRAIN_FN.
    let f: DrainFn = unsafe { core::mem::transmute::<*mut (), DrainFn>(ptr) };
    f();
}

/// Disables interrupts on the local CPU, returning the previous state.
pub fn disable() -> IntrStatus {
    IntrStatus(arch::save_and_disable())
}

/// Enables interrupts on the local CPU, returning the previous state.
pub fn enable() -> IntrStatus {
    let prev = IntrStatus(arch::save_and_disable());
    arch::set_enabled();
    drain_pending();
    prev
}

/// Restores a previously saved interrupt state, whichever way that
/// goes: a yield may legitimately be followed by a return to a
/// disabled section.
pub fn restore(status: IntrStatus) {
    if status.0 {
        arch::set_enabled();
        drain_pending();
    } else {
        arch::set_disabled();
    }
}

/// True if interrupts are currently disabled on the local CPU.
pub fn is_disabled() -> bool {
    !arch::is_enabled()
}

/// Returns the index of the executing CPU.
///
/// The uniprocessor ports report CPU 0 unconditionally; the per-CPU arrays
/// throughout the kernel are sized for `MAX_CPUS` so a real cpu-id
/// primitive can slot in without further changes.
pub fn current_cpu() -> usize {
    arch::cpu_id()
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod arch {
    pub fn save_and_disable() -> bool {
        let flags: u64;
        // SAFETY: Reading RFLAGS and clearing IF is safe in kernel mode.
        unsafe {
            core::arch::asm!(
                "pushfq",
                "pop {}",
                "cli",
                out(reg) flags,
                options(nomem),
            );
        }
        flags & (1 << 9) != 0
    }

    pub fn set_enabled() {
        // SAFETY: Re-enabling interrupts is safe; we restore a prior state.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }

    pub fn set_disabled() {
        // SAFETY: Disabling interrupts is safe in kernel mode.
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
        }
    }

    pub fn is_enabled() -> bool {
        let flags: u64;
        // SAFETY: Reading RFLAGS has no side effects.
        unsafe {
            core::arch::asm!("pushfq", "pop {}", out(reg) flags, options(nomem));
        }
        flags & (1 << 9) != 0
    }

    pub fn cpu_id() -> usize {
        0
    }
}

#[cfg(not(target_os = "none"))]
mod arch {
    use super::AtomicBool;
    use core::sync::atomic::Ordering;

    // The kernel comes up with interrupts disabled.
    static ENABLED: AtomicBool = AtomicBool::new(false);

    pub fn save_and_disable() -> bool {
        ENABLED.swap(false, Ordering::SeqCst)
    }

    pub fn set_enabled() {
        ENABLED.store(true, Ordering::SeqCst);
    }

    pub fn set_disabled() {
        ENABLED.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled() -> bool {
        ENABLED.load(Ordering::SeqCst)
    }

    pub fn cpu_id() -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomOrd};

    // Interrupt state is process-global on the host; serialize these tests.
    static GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn disable_restore_nests() {
        let _g = GUARD.lock().unwrap();
        let outer = enable();
        assert!(!is_disabled());
        let st1 = disable();
        assert!(is_disabled());
        let st2 = disable();
        assert!(is_disabled());
        restore(st2);
        // Inner restore must not re-enable: state was already disabled.
        assert!(is_disabled());
        restore(st1);
        assert!(!is_disabled());
        restore(outer);
    }

    #[test]
    fn drain_runs_on_enable_transition() {
        static DRAINS: AtomicUsize = AtomicUsize::new(0);
        fn counting_drain() {
            DRAINS.fetch_add(1, AtomOrd::SeqCst);
        }

        let _g = GUARD.lock().unwrap();
        let st = disable();
        unsafe { set_drain_fn(counting_drain) };
        let before = DRAINS.load(AtomOrd::SeqCst);
        let prev = enable();
        assert!(DRAINS.load(AtomOrd::SeqCst) > before);
        unsafe { set_drain_fn(null_drain) };
        restore(prev);
        restore(st);
    }
}
