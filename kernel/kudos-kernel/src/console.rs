//! Kernel console.
//!
//! Registers the global print function behind `kprint!`/`kprintln!`.
//! Output goes through one spin lock held for the whole formatted write,
//! so concurrent printers never interleave within a single invocation.
//!
//! On the bare target the sink is the polling terminal port: it busy
//! waits on the port status and never depends on interrupts, which is
//! what makes it safe for panic messages. On the host the sink is an
//! in-memory buffer the tests can read back.

use core::fmt::{self, Write as _};

use kudos_core::log;
use kudos_core::sync::SpinLock;

struct ConsoleState {
    /// IO area of the polling terminal port, when one exists.
    io_base: Option<u64>,
    #[cfg(not(target_os = "none"))]
    captured: alloc::vec::Vec<u8>,
}

static CONSOLE: SpinLock<ConsoleState> = SpinLock::new(ConsoleState {
    io_base: None,
    #[cfg(not(target_os = "none"))]
    captured: alloc::vec::Vec::new(),
});

/// Status and data words of the polling terminal port.
const REG_STATUS: usize = 0;
const REG_DATA: usize = 2;
const STATUS_WBUSY: u32 = 1 << 1;

impl ConsoleState {
    fn put_byte(&mut self, byte: u8) {
        if let Some(io_base) = self.io_base {
            let base = io_base as *mut u32;
            // SAFETY: The port registers lie within the terminal IO area
            // found during bus enumeration.
            unsafe {
                while base.add(REG_STATUS).read_volatile() & STATUS_WBUSY != 0 {
                    core::hint::spin_loop();
                }
                base.add(REG_DATA).write_volatile(byte as u32);
            }
        }
        #[cfg(not(target_os = "none"))]
        self.captured.push(byte);
    }
}

impl fmt::Write for ConsoleState {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.put_byte(byte);
        }
        Ok(())
    }
}

fn console_print(args: fmt::Arguments<'_>) {
    let mut console = CONSOLE.lock();
    let _ = console.write_fmt(args);
}

/// Brings up the kernel console over the polling port at `io_base` (if
/// any) and registers it as the global print function.
pub fn init(io_base: Option<u64>) {
    CONSOLE.lock().io_base = io_base;
    // SAFETY: `console_print` only takes the console lock and writes
    // bytes; safe from any context.
    unsafe { log::set_print_fn(console_print) };
}

/// Returns everything printed so far (host only).
#[cfg(not(target_os = "none"))]
pub fn captured() -> alloc::string::String {
    let console = CONSOLE.lock();
    alloc::string::String::from_utf8_lossy(&console.captured).into_owned()
}

/// Clears the captured output (host only).
#[cfg(not(target_os = "none"))]
pub fn clear_captured() {
    CONSOLE.lock().captured.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use kudos_core::{kprint, kprintln};
    use std::sync::{Mutex, MutexGuard};

    static GUARD: Mutex<()> = Mutex::new(());

    fn serialize() -> MutexGuard<'static, ()> {
        GUARD.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn prints_are_captured() {
        let _g = serialize();
        init(None);
        clear_captured();

        kprint!("alpha {}", 1);
        kprintln!(" beta");
        assert_eq!(captured(), "alpha 1 beta\n");
    }

    #[test]
    fn concurrent_prints_never_interleave() {
        let _g = serialize();
        init(None);
        clear_captured();

        let mut handles = Vec::new();
        for tag in 0..4u8 {
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    kprintln!("writer-{tag} says a complete line of text");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let output = captured();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 400);
        for line in lines {
            // Every line is exactly one call's output: no torn lines.
            assert!(line.starts_with("writer-"));
            assert!(line.ends_with("says a complete line of text"));
        }
    }
}
