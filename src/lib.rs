//! Emulation core for vintage 8-bit microprocessor systems
//!
//! This crate provides the shared machinery for cycle-accurate emulation of
//! several late-1970s microprocessors (National SC/MP-II and SC/MP-III,
//! Signetics 2650) together with their peripheral chips (RCA CDP1854 UART,
//! DEC DC319 UART, RCA CDP1878 counter/timer, NEC uPD765 floppy controller
//! and the RCA CDP18S651 host adapter for it).
//!
//! # Architecture
//!
//! - `scheduler`: virtual-time clock and ordered event dispatch
//! - `interrupt`: wire-OR and priority interrupt controllers
//! - `memory`: flat byte store with per-address attribute flags
//! - `device`: the uniform peripheral capability trait and binding tables
//! - `bus`: the shared system core handed to devices and CPUs
//! - `cpu`: the CPU contract plus the three processor cores
//! - `peripherals`: the chip emulations
//!
//! All "concurrency" is cooperative: the CPU run loop is the only runner,
//! and devices make forward progress only through scheduled events
//! dispatched between instructions. No part of the core blocks, panics on
//! simulated faults, or touches the host OS; disk images and consoles are
//! reached only through the collaborator traits in `diskimage` and
//! `console`.

pub mod bus;
pub mod console;
pub mod cpu;
pub mod device;
pub mod diskimage;
pub mod hexfile;
pub mod interrupt;
pub mod memory;
pub mod peripherals;
pub mod scheduler;

#[cfg(test)]
mod fdc_integration_test;
#[cfg(test)]
mod system_integration_test;

/// Route the crate's log stream into the test harness, so
/// `RUST_LOG=emucore=trace cargo test` shows the FDC command trace and
/// friends. Safe to call from every test; only the first call wins.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub use bus::{Bus, Context, System};
pub use cpu::{Cpu, StopCode};
pub use device::{Device, DeviceId};
pub use scheduler::EventQueue;
