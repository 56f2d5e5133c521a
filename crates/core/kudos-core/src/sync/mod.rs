//! Spin-based synchronization primitives.
//!
//! [`SpinLock`] is a plain test-and-test-and-set lock for state never
//! touched from interrupt handlers. [`IrqSpinLock`] additionally disables
//! local interrupts for the duration of the critical section and is the
//! lock to use for anything an interrupt handler can reach. Neither may be
//! held across a suspension point; blocking tables use the sleeping mutex
//! in the scheduler crate instead.

mod irq_spinlock;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
