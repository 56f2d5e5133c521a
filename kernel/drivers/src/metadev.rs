//! Metadevices: RTC, memory information, CPU status, shutdown.
//!
//! Non-peripheral devices with trivial IO areas. RTC, meminfo and
//! shutdown are single-instance; a second one is a hardware failure.
//! The CPU status devices exist once per CPU and double as the way to
//! count CPUs during bring-up.

use alloc::sync::Arc;

use kudos_core::kprintln;
use kudos_core::sync::{IrqSpinLock, SpinLock};

use crate::device::{Device, DriverState, IoDescriptor, typecode};
use crate::interrupt;

/// Shutdown magic for a normal halt.
pub const DEFAULT_SHUTDOWN_MAGIC: u32 = 0xdead_c0de;
/// Shutdown magic that also powers the machine off.
pub const POWEROFF_SHUTDOWN_MAGIC: u32 = 0x0bad_f00d;

/// Saved single-instance metadevices.
static SYSTEM_RTC: SpinLock<Option<Device>> = SpinLock::new(None);
static SYSTEM_MEMINFO: SpinLock<Option<Device>> = SpinLock::new(None);
static SYSTEM_SHUTDOWN: SpinLock<Option<Device>> = SpinLock::new(None);

/// Forgets the single-instance devices. Called when the bus is
/// re-enumerated from scratch.
pub(crate) fn reset_instances() {
    *SYSTEM_RTC.lock() = None;
    *SYSTEM_MEMINFO.lock() = None;
    *SYSTEM_SHUTDOWN.lock() = None;
}

fn read_port(io_base: u64, word: usize) -> u32 {
    // SAFETY: The word offsets index the device's own IO area.
    unsafe { (io_base as *const u32).add(word).read_volatile() }
}

fn write_port(io_base: u64, word: usize, value: u32) {
    // SAFETY: As above.
    unsafe { (io_base as *mut u32).add(word).write_volatile(value) }
}

// ---------------------------------------------------------------------------
// RTC
// ---------------------------------------------------------------------------

/// Initializes the real time clock.
pub fn rtc_init(desc: &IoDescriptor) -> Option<Device> {
    let mut saved = SYSTEM_RTC.lock();
    assert!(saved.is_none(), "hardware failure: multiple RTC devices");
    let device = Device {
        typecode: desc.typecode,
        io_base: desc.io_base,
        driver: DriverState::Rtc,
    };
    *saved = Some(device.clone());
    Some(device)
}

/// Milliseconds since system startup, from the RTC's MSEC port.
pub fn rtc_get_msec() -> u32 {
    let saved = SYSTEM_RTC.lock();
    let rtc = saved.as_ref().expect("RTC not initialized");
    read_port(rtc.io_base, 0)
}

/// Machine clock speed in Hz, from the RTC's CLKSPD port.
pub fn rtc_get_clockspeed() -> u32 {
    let saved = SYSTEM_RTC.lock();
    let rtc = saved.as_ref().expect("RTC not initialized");
    read_port(rtc.io_base, 1)
}

// ---------------------------------------------------------------------------
// Meminfo
// ---------------------------------------------------------------------------

/// Initializes the memory information device.
pub fn meminfo_init(desc: &IoDescriptor) -> Option<Device> {
    let mut saved = SYSTEM_MEMINFO.lock();
    assert!(saved.is_none(), "hardware failure: multiple MEMINFO devices");
    let device = Device {
        typecode: desc.typecode,
        io_base: desc.io_base,
        driver: DriverState::MemInfo,
    };
    *saved = Some(device.clone());
    Some(device)
}

/// Number of physical memory pages, from the meminfo PAGES port.
pub fn meminfo_get_pages() -> u32 {
    let saved = SYSTEM_MEMINFO.lock();
    let meminfo = saved.as_ref().expect("MEMINFO not initialized");
    read_port(meminfo.io_base, 0)
}

// ---------------------------------------------------------------------------
// CPU status
// ---------------------------------------------------------------------------

/// Commands of the CPU status device.
mod cpu_cmd {
    pub const RAISE_IRQ: u32 = 0x00;
    pub const CLEAR_IRQ: u32 = 0x01;
}

/// IRQ-raised bit of the CPU status device.
const CPU_STATUS_IRQ: u32 = 1 << 1;

/// Driver state of one CPU status device.
pub struct CpuStatusDriver {
    io_base: u64,
    /// Serializes IRQ generate/clear against the interrupt handler.
    lock: IrqSpinLock<()>,
}

/// Initializes a CPU status device and registers its interrupt handler.
pub fn cpustatus_init(desc: &IoDescriptor) -> Option<Device> {
    let driver = Arc::new(CpuStatusDriver {
        io_base: desc.io_base,
        lock: IrqSpinLock::new(()),
    });

    if let Some(irq) = desc.irq {
        let handler = Arc::clone(&driver);
        interrupt::register(interrupt::irq_mask(irq), move || handler.handle_interrupt());
    }

    Some(Device {
        typecode: desc.typecode,
        io_base: desc.io_base,
        driver: DriverState::CpuStatus(driver),
    })
}

/// Counts CPU status devices in an enumerated descriptor set: one per
/// CPU.
pub fn cpustatus_count(descriptors: &[IoDescriptor]) -> usize {
    descriptors
        .iter()
        .filter(|d| d.typecode & typecode::CPU_MASK == typecode::CPUSTATUS)
        .count()
}

impl CpuStatusDriver {
    /// Generates an inter-CPU interrupt on this device's CPU.
    pub fn generate_irq(&self) {
        let _held = self.lock.lock();
        write_port(self.io_base, 1, cpu_cmd::RAISE_IRQ);
    }

    fn handle_interrupt(&self) {
        if read_port(self.io_base, 0) & CPU_STATUS_IRQ == 0 {
            // Not this CPU's device.
            return;
        }
        let _held = self.lock.lock();
        write_port(self.io_base, 1, cpu_cmd::CLEAR_IRQ);
    }
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Initializes the software shutdown device.
pub fn shutdown_init(desc: &IoDescriptor) -> Option<Device> {
    let mut saved = SYSTEM_SHUTDOWN.lock();
    assert!(
        saved.is_none(),
        "hardware failure: multiple SHUTDOWN devices"
    );
    let device = Device {
        typecode: desc.typecode,
        io_base: desc.io_base,
        driver: DriverState::Shutdown,
    };
    *saved = Some(device.clone());
    Some(device)
}

/// Shuts the machine down by writing `magic` to the shutdown port.
///
/// Usable even before the device table is up (the kernel must always be
/// able to panic); without an initialized shutdown device the failure is
/// reported on the console.
pub fn shutdown(magic: u32) {
    let saved = SYSTEM_SHUTDOWN.lock();
    match saved.as_ref() {
        Some(dev) => write_port(dev.io_base, 0, magic),
        None => kprintln!("Shutdown failed. Hardware failure!"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_glue;

    fn descriptor(typecode: u32, area: &'static [u32]) -> IoDescriptor {
        IoDescriptor {
            typecode,
            io_base: area.as_ptr() as u64,
            irq: None,
        }
    }

    #[test]
    fn rtc_ports_read_back() {
        let _g = test_glue::serialize();
        test_glue::reset_kernel();

        let area: &'static [u32] = vec![123_456u32, 100_000_000].leak();
        rtc_init(&descriptor(typecode::RTC, area)).unwrap();
        assert_eq!(rtc_get_msec(), 123_456);
        assert_eq!(rtc_get_clockspeed(), 100_000_000);
    }

    #[test]
    fn meminfo_reports_pages() {
        let _g = test_glue::serialize();
        test_glue::reset_kernel();

        let area: &'static [u32] = vec![4096u32].leak();
        meminfo_init(&descriptor(typecode::MEMINFO, area)).unwrap();
        assert_eq!(meminfo_get_pages(), 4096);
    }

    #[test]
    fn shutdown_writes_magic() {
        let _g = test_glue::serialize();
        test_glue::reset_kernel();

        let area = vec![0u32; 1].leak();
        let desc = IoDescriptor {
            typecode: typecode::SHUTDOWN,
            io_base: area.as_mut_ptr() as u64,
            irq: None,
        };
        shutdown_init(&desc).unwrap();
        shutdown(POWEROFF_SHUTDOWN_MAGIC);
        assert_eq!(area[0], POWEROFF_SHUTDOWN_MAGIC);
    }

    #[test]
    fn cpustatus_counts_cpus() {
        let cpus = [
            IoDescriptor {
                typecode: typecode::CPUSTATUS,
                io_base: 0,
                irq: None,
            },
            IoDescriptor {
                typecode: typecode::CPUSTATUS | 1,
                io_base: 0,
                irq: None,
            },
            IoDescriptor {
                typecode: typecode::RTC,
                io_base: 0,
                irq: None,
            },
        ];
        assert_eq!(cpustatus_count(&cpus), 2);
    }

    #[test]
    #[should_panic(expected = "multiple RTC")]
    fn double_rtc_init_panics() {
        let _g = test_glue::serialize();
        test_glue::reset_kernel();

        let area: &'static [u32] = vec![0u32, 0].leak();
        rtc_init(&descriptor(typecode::RTC, area)).unwrap();
        rtc_init(&descriptor(typecode::RTC, area)).unwrap();
    }
}
