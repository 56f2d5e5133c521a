//! Sleeping mutex.
//!
//! A binary semaphore wrapped in an RAII guard. This is the lock for
//! blocking tables (mounts, open files): contended threads sleep instead
//! of spinning, so it must never be taken with a spin lock held or from
//! an interrupt handler.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::{SchedError, Semaphore, semaphore};

/// A mutual exclusion lock that sleeps on contention.
pub struct Mutex<T> {
    sem: Semaphore,
    data: UnsafeCell<T>,
}

// SAFETY: The binary semaphore admits one holder at a time, giving
// exclusive access to the data.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a mutex around `value`.
    ///
    /// Allocates a semaphore, so this can fail with
    /// [`SchedError::Exhausted`] and cannot run before the semaphore
    /// subsystem is up.
    pub fn new(value: T) -> Result<Self, SchedError> {
        Ok(Self {
            sem: semaphore::create(1)?,
            data: UnsafeCell::new(value),
        })
    }

    /// Acquires the mutex, sleeping until it is free.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.sem.p();
        MutexGuard { mutex: self }
    }
}

impl<T> Drop for Mutex<T> {
    fn drop(&mut self) {
        semaphore::destroy(self.sem);
    }
}

/// RAII guard; releases the mutex when dropped.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Holding the guard means holding the semaphore.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Holding the guard means holding the semaphore.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.sem.v();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_glue;

    #[test]
    fn lock_gives_exclusive_access() {
        let _g = test_glue::serialize();
        test_glue::reset_threading();

        let mutex = Mutex::new(5).unwrap();
        {
            let mut guard = mutex.lock();
            *guard += 1;
        }
        assert_eq!(*mutex.lock(), 6);
    }

    #[test]
    fn guard_drop_releases() {
        let _g = test_glue::serialize();
        test_glue::reset_threading();

        let mutex = Mutex::new(()).unwrap();
        assert_eq!(mutex.sem.value(), 1);
        {
            let _guard = mutex.lock();
            assert_eq!(mutex.sem.value(), 0);
        }
        assert_eq!(mutex.sem.value(), 1);
    }

    #[test]
    fn drop_returns_semaphore_slot() {
        let _g = test_glue::serialize();
        test_glue::reset_threading();

        {
            let _mutexes: Vec<Mutex<u8>> =
                (0..8).map(|i| Mutex::new(i).unwrap()).collect();
        }
        // All slots freed again: the whole table can be re-filled.
        let sems: Vec<_> = (0..kudos_core::config::MAX_SEMAPHORES)
            .map(|_| semaphore::create(0).unwrap())
            .collect();
        for s in sems {
            semaphore::destroy(s);
        }
    }
}
