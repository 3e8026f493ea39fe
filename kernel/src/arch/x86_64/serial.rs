// =============================================================================
// Opal — Serial UART Driver (COM1)
// =============================================================================
//
// Polled 16550 UART output. This is the first device the kernel brings up:
// it needs no memory allocation, no interrupts, and no page tables, so it
// works from the very first instruction and keeps working through crashes.
//
// COM1 lives at I/O port base 0x3F8. We configure 115200 baud, 8 data bits,
// no parity, 1 stop bit (8N1) — the configuration QEMU and most serial
// tools expect.
//
// The global port is wrapped in a SpinLock so concurrent kprintln! calls
// from different cores don't interleave characters.
// =============================================================================

use core::fmt;

use x86_64::instructions::port::Port;

use crate::sync::SpinLock;

/// Base I/O port for COM1. Standardized on all x86 PCs.
const COM1_BASE: u16 = 0x3F8;

/// Line Status Register: Transmit Holding Register Empty.
const LSR_TX_EMPTY: u8 = 1 << 5;

/// A polled 16550 UART.
pub struct SerialPort {
    data: Port<u8>,
    int_enable: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    /// Creates an uninitialized handle for the UART at `base`.
    pub const fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            int_enable: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_status: Port::new(base + 5),
        }
    }

    /// Programs the UART for 115200 baud 8N1 with FIFOs enabled.
    ///
    /// Must be called once before the first write.
    pub fn init(&mut self) {
        // SAFETY: Port writes to the standard COM1 register block; only
        // reachable in ring 0 on the bare-metal target.
        unsafe {
            self.int_enable.write(0x00); // no interrupts, we poll
            self.line_ctrl.write(0x80); // DLAB on
            self.data.write(0x01); // divisor low: 115200 baud
            self.int_enable.write(0x00); // divisor high
            self.line_ctrl.write(0x03); // 8N1, DLAB off
            self.fifo_ctrl.write(0xC7); // enable + clear FIFOs, 14-byte threshold
            self.modem_ctrl.write(0x0B); // DTR + RTS + OUT2
        }
    }

    /// Writes one byte, spinning until the transmit register is free.
    fn write_byte(&mut self, byte: u8) {
        // SAFETY: Same port block as init(); polling LSR before writing
        // the data register is the documented 16550 TX protocol.
        unsafe {
            while self.line_status.read() & LSR_TX_EMPTY == 0 {
                core::hint::spin_loop();
            }
            self.data.write(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            // Serial consoles expect CRLF line endings.
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// The global COM1 port, shared by the logger and the panic handler.
pub static SERIAL: SpinLock<SerialPort> = SpinLock::new(SerialPort::new(COM1_BASE));

static SERIAL_INIT: spin::Once = spin::Once::new();

/// One-time UART initialization, called at the top of `_start`.
/// Idempotent; safe to reach again from early fault paths.
pub fn init() {
    SERIAL_INIT.call_once(|| SERIAL.lock().init());
}
