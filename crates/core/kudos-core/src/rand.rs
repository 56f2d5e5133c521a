//! Pseudorandom numbers for the kernel.
//!
//! A classic linear congruential generator. Not cryptographic and not meant
//! to be; the only consumer is the scheduler's timeslice jitter. The seed
//! comes from the `randomseed` boot argument, defaulting to 0 so runs are
//! reproducible unless asked otherwise.

use core::sync::atomic::{AtomicU32, Ordering};

static STATE: AtomicU32 = AtomicU32::new(0);

/// Seeds the generator.
pub fn set_seed(seed: u32) {
    STATE.store(seed, Ordering::Relaxed);
}

/// Returns the next pseudorandom number in `0..32768`.
pub fn next() -> u32 {
    let mut state = STATE.load(Ordering::Relaxed);
    state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
    STATE.store(state, Ordering::Relaxed);
    (state >> 16) & 0x7fff
}

/// Returns a pseudorandom number in `0..max`. `max` must be nonzero.
pub fn next_int(max: u32) -> u32 {
    next() % max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_seed() {
        set_seed(42);
        let a = [next(), next(), next()];
        set_seed(42);
        let b = [next(), next(), next()];
        assert_eq!(a, b);
    }

    #[test]
    fn next_int_in_range() {
        set_seed(7);
        for _ in 0..1000 {
            assert!(next_int(750) < 750);
        }
    }
}
