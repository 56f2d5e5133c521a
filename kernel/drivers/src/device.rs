//! Device registry.
//!
//! Bus enumeration hands every discovered IO descriptor to the matching
//! driver's init function; initialized devices land in a fixed table
//! and are looked up by typecode. A device couples the descriptor data
//! with its driver state — an enum keyed by the typecode, so the
//! capability view (block device, character device) is a checked
//! downcast rather than an opaque pointer.

use alloc::sync::Arc;

use kudos_core::config::MAX_DEVICES;
use kudos_core::sync::SpinLock;
use kudos_core::{kprintln, kwarn};

use planck_noalloc::vec::ArrayVec;

use crate::disk::DiskDriver;
use crate::gbd::BlockDevice;
use crate::metadev::{self, CpuStatusDriver};
use crate::tty::{CharDevice, TtyDriver};

/// Device typecodes, as reported by bus enumeration.
pub mod typecode {
    /// Terminal device.
    pub const TTY: u32 = 0x201;
    /// Disk device.
    pub const DISK: u32 = 0x301;
    /// Network interface.
    pub const NIC: u32 = 0x401;
    /// Memory information metadevice.
    pub const MEMINFO: u32 = 0x101;
    /// Real time clock metadevice.
    pub const RTC: u32 = 0x102;
    /// Software shutdown metadevice.
    pub const SHUTDOWN: u32 = 0x103;
    /// CPU status metadevice; the low byte is the CPU number.
    pub const CPUSTATUS: u32 = 0xc00;
    /// Mask that strips the CPU number off a CPUSTATUS typecode.
    pub const CPU_MASK: u32 = 0xffff_ff00;
}

/// One device as described by bus enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoDescriptor {
    /// Device typecode.
    pub typecode: u32,
    /// Base address of the device's IO area.
    pub io_base: u64,
    /// IRQ number, if the device generates interrupts.
    pub irq: Option<u32>,
}

/// Driver-private state, keyed by the device's typecode.
#[derive(Clone)]
pub enum DriverState {
    /// A request-queued disk driver.
    Disk(Arc<DiskDriver>),
    /// An interrupt-driven terminal driver.
    Tty(Arc<TtyDriver>),
    /// The real time clock; state is the IO area alone.
    Rtc,
    /// The memory information device; state is the IO area alone.
    MemInfo,
    /// Per-CPU status device.
    CpuStatus(Arc<CpuStatusDriver>),
    /// The software shutdown device; state is the IO area alone.
    Shutdown,
}

/// An initialized device: descriptor data plus driver state.
#[derive(Clone)]
pub struct Device {
    /// Device typecode.
    pub typecode: u32,
    /// Base address of the device's IO area.
    pub io_base: u64,
    /// The driver bound to this device.
    pub driver: DriverState,
}

impl Device {
    /// The device's generic block interface, if it has one.
    pub fn block_device(&self) -> Option<Arc<dyn BlockDevice>> {
        match &self.driver {
            DriverState::Disk(disk) => Some(Arc::clone(disk) as Arc<dyn BlockDevice>),
            _ => None,
        }
    }

    /// The device's generic character interface, if it has one.
    pub fn char_device(&self) -> Option<Arc<dyn CharDevice>> {
        match &self.driver {
            DriverState::Tty(tty) => Some(Arc::clone(tty) as Arc<dyn CharDevice>),
            _ => None,
        }
    }
}

/// A driver table entry.
pub struct DriverEntry {
    /// Typecode this driver serves.
    pub typecode: u32,
    /// Human-readable driver name.
    pub name: &'static str,
    /// Initialization function; `None` means the device is unusable.
    pub init: fn(&IoDescriptor) -> Option<Device>,
}

/// All drivers this kernel knows how to initialize.
pub static AVAILABLE_DRIVERS: &[DriverEntry] = &[
    DriverEntry {
        typecode: typecode::TTY,
        name: "Console",
        init: crate::tty::probe,
    },
    DriverEntry {
        typecode: typecode::RTC,
        name: "System RTC",
        init: metadev::rtc_init,
    },
    DriverEntry {
        typecode: typecode::MEMINFO,
        name: "System memory information",
        init: metadev::meminfo_init,
    },
    DriverEntry {
        typecode: typecode::SHUTDOWN,
        name: "System shutdown",
        init: metadev::shutdown_init,
    },
    DriverEntry {
        typecode: typecode::CPUSTATUS,
        name: "CPU status",
        init: metadev::cpustatus_init,
    },
    DriverEntry {
        typecode: typecode::DISK,
        name: "Disk",
        init: crate::disk::probe,
    },
];

static DEVICES: SpinLock<ArrayVec<Device, MAX_DEVICES>> = SpinLock::new(ArrayVec::new());

fn find_driver(typecode: u32) -> Option<&'static DriverEntry> {
    let typecode = if typecode & typecode::CPU_MASK == typecode::CPUSTATUS {
        typecode::CPUSTATUS
    } else {
        typecode
    };
    AVAILABLE_DRIVERS.iter().find(|d| d.typecode == typecode)
}

/// Initializes all device drivers from the enumerated descriptors.
///
/// Devices without a known driver are reported and skipped. The table
/// stops filling at `MAX_DEVICES`.
pub fn init(descriptors: &[IoDescriptor]) {
    metadev::reset_instances();
    let mut table = DEVICES.lock();
    table.clear();

    for desc in descriptors {
        if desc.typecode == 0 {
            continue;
        }
        let Some(driver) = find_driver(desc.typecode) else {
            kwarn!(
                "unknown hardware device type {:#05x} at {:#010x}",
                desc.typecode,
                desc.io_base
            );
            continue;
        };
        match desc.irq {
            Some(irq) => kprintln!(
                "Device: Type {:#05x} at {:#010x} irq {:#x} driver '{}'",
                desc.typecode,
                desc.io_base,
                irq,
                driver.name
            ),
            None => kprintln!(
                "Device: Type {:#05x} at {:#010x} no irq  driver '{}'",
                desc.typecode,
                desc.io_base,
                driver.name
            ),
        }
        if let Some(device) = (driver.init)(desc) {
            if table.try_push(device).is_err() {
                break;
            }
        }
    }
}

/// Registers an already initialized device, outside bus enumeration.
pub fn register(device: Device) {
    let mut table = DEVICES.lock();
    assert!(table.try_push(device).is_ok(), "device table is full");
}

/// Returns the `n`:th device of the given typecode, counting from 0.
pub fn get(typecode: u32, n: usize) -> Option<Device> {
    let table = DEVICES.lock();
    table
        .iter()
        .filter(|d| d.typecode == typecode)
        .nth(n)
        .cloned()
}

/// Number of initialized devices.
pub fn count() -> usize {
    DEVICES.lock().len()
}
