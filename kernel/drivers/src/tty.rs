//! Interrupt-driven terminal driver.
//!
//! Byte-stream reads and writes over bounded circular buffers. Writers
//! fill the write buffer and kick the port once; the interrupt handler
//! streams the rest out as the port drains, and wakes writers when the
//! buffer empties. Reads block until the handler has moved input from
//! the port into the read buffer.
//!
//! This driver serves user terminals. Kernel diagnostics go through the
//! polling console instead, so a half-drained write buffer can never
//! swallow a panic message.

use alloc::boxed::Box;
use alloc::sync::Arc;

use kudos_core::config::TTY_BUF_SIZE;
use kudos_core::intr;
use kudos_core::sync::IrqSpinLock;
use kudos_sched::{Resource, sleepq, thread};

use planck_noalloc::ringbuf::RingBuf;

use crate::device::{Device, DriverState, IoDescriptor, typecode};
use crate::interrupt;

/// A generic character device: byte-stream reads and writes, both of
/// which may block.
pub trait CharDevice: Send + Sync {
    /// Writes `buf` to the device, blocking as needed. Returns the
    /// number of bytes written.
    fn write(&self, buf: &[u8]) -> usize;

    /// Reads at most `buf.len()` bytes, blocking until at least one is
    /// available. Returns the number of bytes read.
    fn read(&self, buf: &mut [u8]) -> usize;
}

/// The hardware half of the terminal driver.
pub trait SerialController: Send {
    /// True if the port can accept a byte right now.
    fn write_ready(&self) -> bool;

    /// Hands one byte to the port.
    fn put_byte(&mut self, byte: u8);

    /// True if the port has input waiting.
    fn read_avail(&self) -> bool;

    /// Takes one byte of input from the port.
    fn get_byte(&mut self) -> u8;

    /// Returns and clears the port's (write, read) interrupt latches.
    fn poll_and_clear_irq(&mut self) -> (bool, bool);
}

struct TtyState {
    port: Box<dyn SerialController>,
    write_buf: RingBuf<u8, TTY_BUF_SIZE>,
    read_buf: RingBuf<u8, TTY_BUF_SIZE>,
}

/// An interrupt-driven terminal.
pub struct TtyDriver {
    state: IrqSpinLock<TtyState>,
}

impl TtyDriver {
    /// Initializes a terminal over `port`, registering its interrupt
    /// handler, and returns the device table entry.
    pub fn init_device(desc: &IoDescriptor, port: Box<dyn SerialController>) -> Device {
        let driver = Arc::new(TtyDriver {
            state: IrqSpinLock::new(TtyState {
                port,
                write_buf: RingBuf::new(),
                read_buf: RingBuf::new(),
            }),
        });

        if let Some(irq) = desc.irq {
            let handler = Arc::clone(&driver);
            interrupt::register(interrupt::irq_mask(irq), move || handler.handle_interrupt());
        }

        Device {
            typecode: typecode::TTY,
            io_base: desc.io_base,
            driver: DriverState::Tty(driver),
        }
    }

    /// Sleep key for "the write buffer drained".
    fn write_resource(&self) -> Resource {
        Resource(self as *const TtyDriver as usize)
    }

    /// Sleep key for "the read buffer has data".
    fn read_resource(&self) -> Resource {
        Resource(self as *const TtyDriver as usize + 1)
    }

    fn handle_interrupt(&self) {
        let mut state = self.state.lock();
        let (wirq, rirq) = state.port.poll_and_clear_irq();

        if wirq {
            while state.port.write_ready() {
                match state.write_buf.pop() {
                    Some(byte) => state.port.put_byte(byte),
                    None => break,
                }
            }
            if state.write_buf.is_empty() {
                sleepq::wake_all(self.write_resource());
            }
        }

        if rirq {
            while state.port.read_avail() {
                let byte = state.port.get_byte();
                // Input beyond the buffer bound is dropped.
                let _ = state.read_buf.try_push(byte);
            }
            sleepq::wake_all(self.read_resource());
        }
    }
}

impl CharDevice for TtyDriver {
    fn write(&self, buf: &[u8]) -> usize {
        let st = intr::disable();
        let mut state = self.state.lock();

        let mut written = 0;
        while written < buf.len() {
            while !state.write_buf.is_empty() {
                // Buffer still draining; wait for the handler to empty
                // it. Queue first, then release the device, then yield.
                sleepq::add(self.write_resource());
                drop(state);
                thread::switch();
                state = self.state.lock();
            }

            while !state.write_buf.is_full() && written < buf.len() {
                state.write_buf.push(buf[written]);
                written += 1;
            }

            // Kick an idle port with one byte; its completion interrupt
            // streams out the rest. A busy port will interrupt by
            // itself.
            if state.port.write_ready() {
                if let Some(byte) = state.write_buf.pop() {
                    state.port.put_byte(byte);
                }
            }
        }

        drop(state);
        intr::restore(st);
        written
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        let st = intr::disable();
        let mut state = self.state.lock();

        while state.read_buf.is_empty() {
            sleepq::add(self.read_resource());
            drop(state);
            thread::switch();
            state = self.state.lock();
        }

        let mut count = 0;
        while count < buf.len() {
            match state.read_buf.pop() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }

        drop(state);
        intr::restore(st);
        count
    }
}

// ---------------------------------------------------------------------------
// Memory-mapped controller (real hardware)
// ---------------------------------------------------------------------------

/// Status bits of the memory-mapped terminal IO area.
mod status {
    pub const RAVAIL: u32 = 1 << 0;
    pub const WBUSY: u32 = 1 << 1;
    pub const RIRQ: u32 = 1 << 2;
    pub const WIRQ: u32 = 1 << 3;
}

/// Command codes of the memory-mapped terminal IO area.
mod cmd {
    pub const CLEAR_RIRQ: u32 = 0x1;
    pub const CLEAR_WIRQ: u32 = 0x2;
}

const REG_STATUS: usize = 0;
const REG_COMMAND: usize = 1;
const REG_DATA: usize = 2;

/// A serial controller speaking through a memory-mapped IO area.
pub struct MemMappedSerial {
    io_base: *mut u32,
}

// SAFETY: The IO area belongs to this controller alone; the owning
// driver serializes access behind its spin lock.
unsafe impl Send for MemMappedSerial {}

impl MemMappedSerial {
    /// Creates a controller over the IO area at `io_base`.
    pub fn new(io_base: u64) -> Self {
        Self {
            io_base: io_base as *mut u32,
        }
    }

    fn read_reg(&self, reg: usize) -> u32 {
        // SAFETY: The register offsets are within the device IO area.
        unsafe { self.io_base.add(reg).read_volatile() }
    }

    fn write_reg(&self, reg: usize, value: u32) {
        // SAFETY: As above.
        unsafe { self.io_base.add(reg).write_volatile(value) }
    }
}

impl SerialController for MemMappedSerial {
    fn write_ready(&self) -> bool {
        self.read_reg(REG_STATUS) & status::WBUSY == 0
    }

    fn put_byte(&mut self, byte: u8) {
        self.write_reg(REG_DATA, byte as u32);
    }

    fn read_avail(&self) -> bool {
        self.read_reg(REG_STATUS) & status::RAVAIL != 0
    }

    fn get_byte(&mut self) -> u8 {
        self.read_reg(REG_DATA) as u8
    }

    fn poll_and_clear_irq(&mut self) -> (bool, bool) {
        let st = self.read_reg(REG_STATUS);
        let wirq = st & status::WIRQ != 0;
        let rirq = st & status::RIRQ != 0;
        if wirq {
            self.write_reg(REG_COMMAND, cmd::CLEAR_WIRQ);
        }
        if rirq {
            self.write_reg(REG_COMMAND, cmd::CLEAR_RIRQ);
        }
        (wirq, rirq)
    }
}

/// Driver-table entry point: binds the memory-mapped controller at the
/// descriptor's IO area.
pub fn probe(desc: &IoDescriptor) -> Option<Device> {
    Some(TtyDriver::init_device(
        desc,
        Box::new(MemMappedSerial::new(desc.io_base)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_glue;
    use std::sync::Mutex as StdMutex;

    /// Host stand-in for the serial port: output is captured, input is
    /// injected, transfers complete instantly and latch the IRQ.
    struct HostSerial {
        inner: Arc<StdMutex<HostSerialInner>>,
        irq_mask: u32,
    }

    #[derive(Default)]
    struct HostSerialInner {
        tx: Vec<u8>,
        rx: std::collections::VecDeque<u8>,
        wirq: bool,
        rirq: bool,
    }

    #[derive(Clone)]
    struct HostSerialHandle {
        inner: Arc<StdMutex<HostSerialInner>>,
        irq_mask: u32,
    }

    impl HostSerialHandle {
        fn inject(&self, data: &[u8]) {
            {
                let mut inner = self.inner.lock().unwrap();
                inner.rx.extend(data);
                inner.rirq = true;
            }
            interrupt::raise(self.irq_mask);
        }

        fn output(&self) -> Vec<u8> {
            self.inner.lock().unwrap().tx.clone()
        }
    }

    fn host_serial(irq: u32) -> (HostSerial, HostSerialHandle) {
        let inner = Arc::new(StdMutex::new(HostSerialInner::default()));
        let mask = interrupt::irq_mask(irq);
        (
            HostSerial {
                inner: Arc::clone(&inner),
                irq_mask: mask,
            },
            HostSerialHandle {
                inner,
                irq_mask: mask,
            },
        )
    }

    impl SerialController for HostSerial {
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

    fn noop(_arg: usize) {}

    fn become_thread() {
        let tid = kudos_sched::thread::create(noop, 0).unwrap();
        kudos_sched::thread::run(tid);
        kudos_sched::thread::switch();
    }

    fn tty_device(irq: u32) -> (Arc<TtyDriver>, HostSerialHandle) {
        let (serial, handle) = host_serial(irq);
        let desc = IoDescriptor {
            typecode: typecode::TTY,
            io_base: 0,
            irq: Some(irq),
        };
        let device = TtyDriver::init_device(&desc, Box::new(serial));
        let DriverState::Tty(driver) = device.driver else {
            unreachable!()
        };
        (driver, handle)
    }

    #[test]
    fn write_streams_out_through_the_interrupt_path() {
        let _g = test_glue::serialize();
        test_glue::reset_kernel();
        become_thread();

        let (tty, handle) = tty_device(4);
        let n = tty.write(b"hello, terminal");
        assert_eq!(n, 15);
        // The completion interrupt drained the buffer.
        let prev = intr::enable();
        assert_eq!(handle.output(), b"hello, terminal");
        assert!(tty.state.lock().write_buf.is_empty());
        intr::restore(prev);
    }

    #[test]
    fn large_write_cycles_the_buffer() {
        let _g = test_glue::serialize();
        test_glue::reset_kernel();
        become_thread();

        let (tty, handle) = tty_device(4);
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let n = tty.write(&data);
        assert_eq!(n, data.len());
        let prev = intr::enable();
        assert_eq!(handle.output(), data);
        intr::restore(prev);
    }

    #[test]
    fn read_returns_injected_input() {
        let _g = test_glue::serialize();
        test_glue::reset_kernel();
        become_thread();

        let (tty, handle) = tty_device(4);
        handle.inject(b"keys");
        // Deliver the input interrupt.
        let prev = intr::enable();
        intr::restore(prev);

        let mut buf = [0u8; 16];
        let n = tty.read(&mut buf);
        assert_eq!(&buf[..n], b"keys");
    }

    #[test]
    fn read_caps_at_buffer_len() {
        let _g = test_glue::serialize();
        test_glue::reset_kernel();
        become_thread();

        let (tty, handle) = tty_device(4);
        handle.inject(b"abcdef");
        let prev = intr::enable();
        intr::restore(prev);

        let mut buf = [0u8; 4];
        assert_eq!(tty.read(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        // The rest stays buffered for the next read.
        assert_eq!(tty.read(&mut buf), 2);
        assert_eq!(&buf[..2], b"ef");
    }
}
