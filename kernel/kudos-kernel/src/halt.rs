//! System halt.

use kudos_core::kprintln;
use kudos_drivers::metadev;

/// Halts the kernel: drains and unmounts the VFS, then writes the
/// shutdown magic to the shutdown device.
pub fn halt_kernel() {
    kprintln!("Kernel: System shutdown started...");

    kudos_fs::vfs::deinit();

    kprintln!("Kernel: System shutdown complete, powering off");
    metadev::shutdown(metadev::POWEROFF_SHUTDOWN_MAGIC);
}
