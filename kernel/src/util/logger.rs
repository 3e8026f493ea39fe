// =============================================================================
// Opal — Kernel Logger
// =============================================================================
//
// Two output layers share the serial port:
//
//   kprint!/kprintln!  — direct formatted output, available from the first
//                        instruction of `_start`; used by early boot code
//                        and the panic handler.
//   `log` facade       — the memory manager and other subsystems emit
//                        diagnostics through log::{info,warn,error}; a
//                        static serial-backed sink is installed at boot.
//
// The facade needs no allocation, so installing it is safe before any
// allocator exists. Hosted test builds never install the sink and the log
// macros become no-ops.
// =============================================================================

use core::fmt;
use core::fmt::Write;

use crate::arch::serial::SERIAL;

/// Sends formatted text to the serial console. Use the `kprint!`/
/// `kprintln!` macros instead of calling this directly.
///
/// The serial lock makes each call atomic: messages from different cores
/// don't interleave characters, though their order is unspecified.
#[doc(hidden)]
pub fn _kprint(args: fmt::Arguments) {
    let mut serial = SERIAL.lock();
    let _ = serial.write_fmt(args);
}

/// Prints formatted text to the kernel console.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::util::logger::_kprint(format_args!($($arg)*))
    };
}

/// Prints formatted text followed by a newline to the kernel console.
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::util::logger::_kprint(format_args!("{}\n", format_args!($($arg)*)))
    };
}

// =============================================================================
// `log` facade sink
// =============================================================================

struct SerialLog;

static SERIAL_LOG: SerialLog = SerialLog;

impl log::Log for SerialLog {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            kprintln!("[{:>5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Installs the serial-backed `log` sink. Called once from `_start`,
/// before any subsystem emits diagnostics.
pub fn init() {
    if log::set_logger(&SERIAL_LOG).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}
