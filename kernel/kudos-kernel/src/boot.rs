//! System bring-up.
//!
//! The bootstrap order matters and is easy to get wrong: static
//! allocation first (everything else reserves memory through it), then
//! the polling console (so failures are visible), then interrupts,
//! threading, devices and the VFS — and virtual memory last, because VM
//! init retires the static allocator for good. The first real thread
//! mounts filesystems and starts the initial program; only then are
//! interrupts enabled and the scheduler takes over.

use kudos_core::addr::PhysAddr;
use kudos_core::config::{MAX_CPUS, PAGE_SIZE};
use kudos_core::{intr, kprintln, rand};
use kudos_drivers::device::{self, IoDescriptor, typecode};
use kudos_drivers::{interrupt, metadev};
use kudos_fs::vfs;
use kudos_mm::{directmap, heap, physmem, stalloc, vm};
use kudos_sched::{scheduler, semaphore, thread};

use crate::{bootargs, console, halt};

/// Pages reserved for the kernel heap at bring-up.
const KERNEL_HEAP_PAGES: usize = 16;

/// Everything the platform layer hands the machine-independent kernel.
pub struct BootInfo<'a> {
    /// Enumerated IO descriptors.
    pub descriptors: &'a [IoDescriptor],
    /// The raw boot argument string.
    pub bootargs: &'a str,
    /// Offset of the kernel's direct-mapped view of physical memory.
    pub directmap_offset: u64,
    /// First physical byte after the kernel image.
    pub kernel_image_end: PhysAddr,
    /// End of physical memory usable for boot-time allocation.
    pub boot_memory_end: PhysAddr,
}

/// Initializes the system. Called once on the boot CPU; finishes by
/// switching into the scheduler.
pub fn kernel_init(boot: &BootInfo<'_>) {
    directmap::set_offset(boot.directmap_offset);
    stalloc::init(boot.kernel_image_end, boot.boot_memory_end);

    // Polling console for kprintln; the first terminal port doubles as
    // the kernel console.
    let console_port = boot
        .descriptors
        .iter()
        .find(|d| d.typecode == typecode::TTY)
        .map(|d| d.io_base);
    console::init(console_port);

    kprintln!("KUDOS - a skeleton OS for exploring OS concepts");
    kprintln!("===============================================");
    kprintln!();

    kprintln!("Reading boot arguments");
    bootargs::init(boot.bootargs);

    match bootargs::get("randomseed")
        .as_deref()
        .and_then(|s| s.parse::<u32>().ok())
    {
        Some(seed) => {
            kprintln!("Seeding pseudorandom number generator with {}", seed);
            rand::set_seed(seed);
        }
        None => rand::set_seed(0),
    }

    let numcpus = metadev::cpustatus_count(boot.descriptors);
    kprintln!("Detected {} CPUs", numcpus);
    assert!(numcpus <= MAX_CPUS);

    kprintln!("Initializing interrupt handling");
    interrupt::init();

    kprintln!("Initializing threading system");
    thread::init();

    kprintln!("Initializing semaphores");
    semaphore::init();

    kprintln!("Initializing device drivers");
    device::init(boot.descriptors);

    kprintln!("Initializing virtual filesystem");
    vfs::init();

    kprintln!("Initializing scheduler");
    scheduler::init();

    kprintln!("Initializing virtual memory");
    let pages = metadev::meminfo_get_pages() as usize;
    vm::init(pages);

    // Carve the kernel heap out of the fresh frame pool.
    let heap_base = physmem::alloc_blocks(KERNEL_HEAP_PAGES).expect("no memory for kernel heap");
    // SAFETY: The pages were just allocated for the heap and are
    // addressable through the direct map.
    unsafe {
        heap::init(
            directmap::phys_to_ptr(heap_base),
            KERNEL_HEAP_PAGES * PAGE_SIZE,
        );
    }

    kprintln!("Creating initialization thread");
    let startup = thread::create(init_startup_thread, 0).expect("no thread for startup");
    thread::run(startup);

    kprintln!("Starting threading system and SMP");
    let _ = intr::enable();

    // Enter the scheduler; voluntary switch behaves exactly like the
    // timer tick that ends a timeslice.
    thread::switch();

    #[cfg(target_os = "none")]
    panic!("threading system startup failed");
}

/// Hook the process subsystem installs for launching the initial
/// program. The kernel core has no ELF loader of its own.
static PROCESS_RUNNER: core::sync::atomic::AtomicPtr<()> =
    core::sync::atomic::AtomicPtr::new(core::ptr::null_mut());

/// Registers the function that launches the initial userland program.
pub fn set_process_runner(runner: fn(&str)) {
    PROCESS_RUNNER.store(runner as *mut (), core::sync::atomic::Ordering::Release);
}

/// Body of the first real thread: mount everything, start the initial
/// program, or fall back to the console test and halt.
pub fn init_startup_thread(_arg: usize) {
    kprintln!("Mounting filesystems");
    vfs::mount_all();

    let Some(initprog) = bootargs::get("initprog") else {
        kprintln!("No initial program (initprog), dropping to fallback");
        startup_fallback();
        return;
    };

    let runner = PROCESS_RUNNER.load(core::sync::atomic::Ordering::Acquire);
    if runner.is_null() {
        kprintln!("No process subsystem for '{}', dropping to fallback", initprog);
        startup_fallback();
        return;
    }

    kprintln!("Starting initial program '{}'", initprog);
    // SAFETY: Only valid `fn(&str)` pointers are stored above.
    let runner: fn(&str) = unsafe { core::mem::transmute(runner) };
    runner(&initprog);

    // A successful process start never returns.
    panic!("ran out of initprog");
}

/// Fallback when no initial program was given: optionally run the
/// console self-test, then shut down.
fn startup_fallback() {
    crate::kdebug_if!("debuginit", "In startup fallback\n");

    if bootargs::get("testconsole").is_some() {
        console_selftest();
    }

    kprintln!("Startup fallback code ends.");
    halt::halt_kernel();
}

/// Echo test against the first terminal: prove that interrupt-driven
/// writes and reads both work.
fn console_selftest() {
    crate::kdebug_if!("debuginit", "In console test\n");

    let dev = device::get(typecode::TTY, 0).expect("console test needs a terminal");
    let tty = dev.char_device().expect("terminal without a character interface");

    tty.write(b"Hello user! Press any key.\n");

    let mut buf = [0u8; 63];
    let len = tty.read(&mut buf);
    let input = core::str::from_utf8(&buf[..len]).unwrap_or("");

    let mut reply = alloc::string::String::new();
    let _ = core::fmt::write(&mut reply, format_args!("You said: '{}'\n", input));
    tty.write(reply.as_bytes());
}
