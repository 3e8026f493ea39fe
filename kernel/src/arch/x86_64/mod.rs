// =============================================================================
// Opal — x86_64 Support
// =============================================================================
//
//   boot.rs   — Limine request/response wiring
//   cpu.rs    — privileged instruction wrappers (CR3, INVLPG, HLT)
//   serial.rs — 16550 UART driver for the boot console
// =============================================================================

pub mod boot;
pub mod cpu;
pub mod serial;
