//! Whole-system bring-up on a host machine model.
//!
//! Builds a small machine — memory, meminfo/RTC/shutdown/CPU-status
//! metadevices, a TFS-formatted ram disk and a terminal — and drives
//! the real boot path end to end: `kernel_init`, the startup thread,
//! filesystem mounting, the console self-test and the final halt.

use std::sync::{Arc, Mutex, MutexGuard};

use kudos_core::addr::PhysAddr;
use kudos_core::bitmap;
use kudos_core::config::PAGE_SIZE;
use kudos_drivers::device::{self, IoDescriptor, typecode};
use kudos_drivers::metadev::POWEROFF_SHUTDOWN_MAGIC;
use kudos_drivers::ramdisk;
use kudos_drivers::tty::{SerialController, TtyDriver};
use kudos_drivers::interrupt;
use kudos_fs::vfs;
use kudos_kernel::boot::{self, BootInfo};
use kudos_kernel::console;

static GUARD: Mutex<()> = Mutex::new(());

fn serialize() -> MutexGuard<'static, ()> {
    GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Machine model
// ---------------------------------------------------------------------------

const TFS_BLOCK_SIZE: usize = 512;
const TFS_MAGIC: u32 = 3745;

/// A freshly formatted TFS image with the given volume name.
fn format_image(volume: &str, blocks: u32) -> Vec<u8> {
    let mut image = vec![0u8; blocks as usize * TFS_BLOCK_SIZE];
    image[..4].copy_from_slice(&TFS_MAGIC.to_be_bytes());
    let name = volume.as_bytes();
    image[4..4 + name.len()].copy_from_slice(name);
    let bat = &mut image[TFS_BLOCK_SIZE..2 * TFS_BLOCK_SIZE];
    for b in 0..3 {
        bitmap::set(bat, b);
    }
    image
}

#[derive(Default)]
struct SerialPortInner {
    tx: Vec<u8>,
    rx: std::collections::VecDeque<u8>,
    wirq: bool,
    rirq: bool,
}

/// Terminal hardware model: output is captured, input is injected,
/// every transfer completes instantly and latches the IRQ line.
struct SerialPort {
    inner: Arc<Mutex<SerialPortInner>>,
    irq_mask: u32,
}

#[derive(Clone)]
struct SerialHandle {
    inner: Arc<Mutex<SerialPortInner>>,
    irq_mask: u32,
}

impl SerialHandle {
    fn inject(&self, data: &[u8]) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.rx.extend(data);
            inner.rirq = true;
        }
        interrupt::raise(self.irq_mask);
    }

    fn output(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().unwrap().tx).into_owned()
    }
}

impl SerialController for SerialPort {
    fn write_ready(&self) -> bool {
        true
    }

    fn put_byte(&mut self, byte: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.tx.push(byte);
        inner.wirq = true;
        interrupt::raise(self.irq_mask);
    }

    fn read_avail(&self) -> bool {
        !self.inner.lock().unwrap().rx.is_empty()
    }

    fn get_byte(&mut self) -> u8 {
        self.inner.lock().unwrap().rx.pop_front().unwrap()
    }

    fn poll_and_clear_irq(&mut self) -> (bool, bool) {
        let mut inner = self.inner.lock().unwrap();
        let latched = (inner.wirq, inner.rirq);
        inner.wirq = false;
        inner.rirq = false;
        latched
    }
}

struct Machine {
    shutdown_area: &'static mut [u32],
}

/// Boots the kernel over a 64-page memory arena and the standard
/// metadevice set.
fn boot_machine(bootargs: &str) -> Machine {
    let pages = 64usize;
    let arena = vec![0u8; pages * PAGE_SIZE].leak();

    let meminfo_area: &'static [u32] = vec![pages as u32].leak();
    let rtc_area: &'static [u32] = vec![0u32, 100_000_000].leak();
    let shutdown_area = vec![0u32; 1].leak();
    let cpu0_area: &'static [u32] = vec![0u32, 0].leak();

    let descriptors = vec![
        IoDescriptor {
            typecode: typecode::MEMINFO,
            io_base: meminfo_area.as_ptr() as u64,
            irq: None,
        },
        IoDescriptor {
            typecode: typecode::RTC,
            io_base: rtc_area.as_ptr() as u64,
            irq: None,
        },
        IoDescriptor {
            typecode: typecode::SHUTDOWN,
            io_base: shutdown_area.as_ptr() as u64,
            irq: None,
        },
        IoDescriptor {
            typecode: typecode::CPUSTATUS,
            io_base: cpu0_area.as_ptr() as u64,
            irq: None,
        },
    ];

    console::clear_captured();
    boot::kernel_init(&BootInfo {
        descriptors: &descriptors,
        bootargs,
        directmap_offset: arena.as_ptr() as u64,
        kernel_image_end: PhysAddr::new(0x200),
        boot_memory_end: PhysAddr::new((pages * PAGE_SIZE) as u64),
    });

    Machine { shutdown_area }
}

/// Attaches a terminal to the booted machine.
fn attach_terminal(irq: u32) -> SerialHandle {
    let inner = Arc::new(Mutex::new(SerialPortInner::default()));
    let mask = interrupt::irq_mask(irq);
    let port = SerialPort {
        inner: Arc::clone(&inner),
        irq_mask: mask,
    };
    let desc = IoDescriptor {
        typecode: typecode::TTY,
        io_base: 0,
        irq: Some(irq),
    };
    device::register(TtyDriver::init_device(&desc, Box::new(port)));
    SerialHandle {
        inner,
        irq_mask: mask,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn boot_mount_selftest_and_halt() {
    let _g = serialize();

    let machine = boot_machine("randomseed=42 testconsole");

    // Attach a disk with a formatted volume and a terminal with input
    // already waiting, then let the startup thread run.
    device::register(ramdisk::create_disk_device_with_image(
        32,
        Some(3),
        &format_image("root", 32),
    ));
    let terminal = attach_terminal(4);
    terminal.inject(b"hi");

    boot::init_startup_thread(0);

    // The startup thread mounted the volume before halting.
    let log = console::captured();
    assert!(log.contains("KUDOS"), "banner missing:\n{log}");
    assert!(log.contains("Mounting filesystems"));
    assert!(log.contains("Mounted filesystem volume [root]"));
    assert!(log.contains("Startup fallback code ends."));
    assert!(log.contains("System shutdown complete"));

    // The console self-test echoed our input over the terminal.
    let tty_out = terminal.output();
    assert!(tty_out.contains("Hello user! Press any key."));
    assert!(tty_out.contains("You said: 'hi'"));

    // Halt drained the VFS and wrote the power-off magic.
    assert_eq!(vfs::filecount(None), Err(kudos_fs::VfsError::Unusable));
    assert_eq!(machine.shutdown_area[0], POWEROFF_SHUTDOWN_MAGIC);
}

#[test]
fn boot_brings_all_subsystems_up() {
    let _g = serialize();

    let _machine = boot_machine("randomseed=7");

    // The static allocator is retired; the frame pool took over.
    let (total, free, reserved) =
        kudos_mm::physmem::with(|p| (p.total_pages(), p.free_pages(), p.reserved_pages()));
    assert_eq!(total, 64);
    assert_eq!(free + reserved, total - 16, "16 heap pages are allocated");

    // The kernel heap serves allocations.
    let block = kudos_mm::heap::kmalloc(256);
    assert!(!block.is_null());
    unsafe { kudos_mm::heap::kfree(block) };

    // The startup thread is current and the VFS answers.
    assert_ne!(kudos_sched::thread::current(), kudos_sched::IDLE_THREAD);
    assert_eq!(vfs::filecount(None).unwrap(), 0);

    // Metadevices resolve through the registry.
    assert!(device::get(typecode::RTC, 0).is_some());
    assert!(device::get(typecode::SHUTDOWN, 0).is_some());
    assert_eq!(kudos_drivers::metadev::rtc_get_clockspeed(), 100_000_000);
    assert_eq!(kudos_drivers::metadev::meminfo_get_pages(), 64);
}

#[test]
fn vfs_survives_a_boot_then_file_round_trip() {
    let _g = serialize();

    boot_machine("");
    device::register(ramdisk::create_disk_device_with_image(
        32,
        Some(3),
        &format_image("disk", 32),
    ));
    vfs::mount_all();

    vfs::create("[disk]hello", 5).unwrap();
    let fd = vfs::open("[disk]hello").unwrap();
    assert_eq!(vfs::write(fd, b"world").unwrap(), 5);
    vfs::seek(fd, 0).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(vfs::read(fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"world");
    vfs::close(fd).unwrap();

    let before = vfs::getfree("disk").unwrap();
    vfs::remove("[disk]hello").unwrap();
    assert!(vfs::getfree("disk").unwrap() > before);
}
