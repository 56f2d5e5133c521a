//! Kernel configuration options.
//!
//! One module of compile-time knobs, so every table size in the kernel has
//! a single source of truth. The allowed ranges come from the hardware
//! limits of the platforms the kernel targets (e.g. the 8-bit ASID space
//! bounds `MAX_THREADS`).

/// Maximum number of threads supported by the kernel.
/// Range from 2 (idle + init) to 256 (ASID size).
pub const MAX_THREADS: usize = 32;

/// Size of the stack of a kernel thread, in bytes.
pub const THREAD_STACK_SIZE: usize = 4096;

/// Maximum number of CPUs supported by the kernel.
/// Range from 1 to 32. `MAX_THREADS` should be the same or greater.
pub const MAX_CPUS: usize = 4;

/// Length of the scheduling interval (timeslice) in processor cycles.
/// Range from 200 to 2_000_000_000.
pub const SCHEDULER_TIMESLICE: u32 = 750;

/// Maximum number of boot arguments the kernel will accept.
pub const BOOTARGS_MAX: usize = 32;

/// Maximum number of semaphores. Range from 16 to 1024.
pub const MAX_SEMAPHORES: usize = 128;

/// Maximum number of devices. Range from 16 to 128.
pub const MAX_DEVICES: usize = 128;

/// Maximum number of mounted filesystems. Range from 1 to 128.
pub const MAX_FILESYSTEMS: usize = 8;

/// Maximum number of open files. Range from 16 to 65536.
pub const MAX_OPEN_FILES: usize = 512;

/// Size of the sleep queue hash table. Must be prime.
pub const SLEEPQ_SIZE: usize = 127;

/// Size of one physical memory page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Number of mapping entries in one pagetable. Chosen so that the whole
/// pagetable structure fits in a single physical page.
pub const PAGETABLE_ENTRIES: usize = 338;

/// Size of the TTY driver's internal read and write buffers, in bytes.
pub const TTY_BUF_SIZE: usize = 2048;

const _: () = {
    assert!(MAX_THREADS >= 2 && MAX_THREADS <= 256);
    assert!(MAX_THREADS.is_power_of_two());
    assert!(MAX_CPUS >= 1 && MAX_CPUS <= 32);
    assert!(MAX_THREADS >= MAX_CPUS);
    assert!(SCHEDULER_TIMESLICE >= 200);
    assert!(MAX_SEMAPHORES >= 16 && MAX_SEMAPHORES <= 1024);
    assert!(MAX_DEVICES >= 16 && MAX_DEVICES <= 128);
    assert!(MAX_FILESYSTEMS >= 1 && MAX_FILESYSTEMS <= 128);
    assert!(MAX_OPEN_FILES >= 16 && MAX_OPEN_FILES <= 65536);
    assert!(PAGE_SIZE == 4096);
};
