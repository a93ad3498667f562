//! CPU contract and shared execution state
//!
//! Every processor core implements [`Cpu`]: architectural reset, the run
//! loop, register-file introspection and crystal-frequency control. The
//! run loop contract is the same for every model:
//!
//! 1. dispatch due events, 2. take a pending interrupt if the model allows
//! it, 3. stop on a breakpoint at the PC (except on the very first
//! iteration, so a stopped machine can be resumed over its own
//! breakpoint), 4. fetch, 5. execute, 6. bill the instruction's microcycle
//! cost to the event queue, 7. count down `max_steps`.
//!
//! Simulated faults never panic: they are recorded in the stop code and
//! returned from `run`, with two configuration flags deciding whether an
//! illegal opcode or an illegal I/O reference stops the machine or is
//! silently stepped over.

pub mod ins8060;
pub mod ins8070;
pub mod s2650;

pub use ins8060::Ins8060;
pub use ins8070::Ins8070;
pub use s2650::S2650;

use crate::bus::System;

/// Why the run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopCode {
    /// Still running (never returned; the in-loop resting state)
    #[default]
    None,
    /// The requested number of instructions was executed
    Finished,
    /// A halt instruction was executed
    Halt,
    /// An illegal opcode was fetched (and stop-on-illegal is set)
    IllegalOpcode,
    /// An unimplemented or illegal I/O reference (and stop-on-illegal-I/O)
    IllegalIo,
    /// A branch-to-self with interrupts disabled can never terminate
    EndlessLoop,
    /// The PC reached an address with the BREAK attribute
    Breakpoint,
    /// The console reported its break keystroke
    ConsoleBreak,
}

/// Execution state every core carries: stop bookkeeping and the
/// illegal-reference policy flags.
#[derive(Debug)]
pub struct CpuCommon {
    /// Reason the run loop last stopped
    pub stop_code: StopCode,
    /// Address of the last opcode fetched, for diagnostics
    pub last_pc: u16,
    /// Stop on illegal opcodes (else step over them silently)
    pub stop_on_illegal_opcode: bool,
    /// Stop on illegal I/O references (else read 0xFF / drop writes)
    pub stop_on_illegal_io: bool,
}

impl CpuCommon {
    pub fn new() -> Self {
        Self {
            stop_code: StopCode::None,
            last_pc: 0,
            stop_on_illegal_opcode: true,
            stop_on_illegal_io: true,
        }
    }

    /// Architectural reset of the bookkeeping (policy flags persist).
    pub fn clear(&mut self) {
        self.stop_code = StopCode::None;
        self.last_pc = 0;
    }

    /// Record an illegal opcode at the current instruction.
    pub fn illegal_opcode(&mut self, opcode: u8) {
        log::warn!(
            "illegal opcode {opcode:#04X} at {:#06X}",
            self.last_pc
        );
        if self.stop_on_illegal_opcode {
            self.stop_code = StopCode::IllegalOpcode;
        }
    }

    /// Record an illegal or unimplemented I/O reference.
    pub fn illegal_io(&mut self) {
        log::warn!("illegal I/O reference at {:#06X}", self.last_pc);
        if self.stop_on_illegal_io {
            self.stop_code = StopCode::IllegalIo;
        }
    }
}

impl Default for CpuCommon {
    fn default() -> Self {
        Self::new()
    }
}

/// The capability set every processor core implements.
pub trait Cpu {
    /// Part number, e.g. "INS8060".
    fn name(&self) -> &'static str;

    /// One-line description for messages.
    fn description(&self) -> &'static str;

    /// Architectural reset. Clears the attached devices too, so every
    /// always-on polling event is re-armed.
    fn clear(&mut self, sys: &mut System);

    /// Execute up to `max_steps` instructions; 0 means run until some
    /// stop condition arises.
    fn run(&mut self, sys: &mut System, max_steps: u32) -> StopCode;

    /// Address of the next instruction to execute, as the UI should show
    /// it (pre-increment models compensate here).
    fn get_pc(&self) -> u16;

    /// Force the next instruction address.
    fn set_pc(&mut self, addr: u16);

    /// Read an internal register by model-specific id.
    fn get_register(&self, reg: u16) -> u16;

    /// Write an internal register by model-specific id.
    fn set_register(&mut self, reg: u16, value: u16);

    /// Width of a register in bits (0 for unknown ids).
    fn register_size(&self, reg: u16) -> u32;

    /// Simulated crystal frequency in Hz.
    fn crystal_frequency(&self) -> u32;

    /// Change the simulated crystal frequency.
    fn set_crystal_frequency(&mut self, hz: u32);

    /// The last stop code returned from `run`.
    fn stop_code(&self) -> StopCode;

    /// Address of the last opcode fetched.
    fn last_pc(&self) -> u16;
}
