//! Generic programmable timer engine
//!
//! The down-counter at the heart of chips like the 8253/4, 8155/6, NSC810
//! and CDP1878. Not much use by itself; a timer chip emulation owns one or
//! more of these and drives them from its own event callback.
//!
//! Each timer consists of three registers:
//!
//! - `jam`: loaded by the write methods; the value the count restarts from
//! - `count`: the live counter, decremented every clock period
//! - `hold`: mirrors the count after every decrement unless frozen, so
//!   the read methods never see a count mid-update
//!
//! Three modes: STOPPED (nothing happens), ONESHOT (count to the 0x0000 to
//! 0xFFFF rollover, then stop), REPEAT (roll over, reload from jam, keep
//! counting). The gate input pauses counting without cancelling the clock.
//! When the rollover happens, [`Timer::tick`] reports a terminal count and
//! the owning device decides what that means: a status bit, an interrupt,
//! an output strobe.
//!
//! Loading the jam register while the timer runs is legal but takes effect
//! only on the next reload. Careful with the split high/low writes while
//! running - a reload between the two calls loads a mixed value.

use crate::bus::Context;
use crate::scheduler::{hz_to_ns, ns_to_hz, EventParam};

/// What the timer does when the count rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerMode {
    /// The timer does nothing and the count does not change
    #[default]
    Stopped,
    /// Count down to the rollover, then stop
    OneShot,
    /// Count down, reload from jam, count again
    Repeat,
}

impl TimerMode {
    /// Mode name for state dumps.
    pub fn as_str(self) -> &'static str {
        match self {
            TimerMode::Stopped => "STOPPED",
            TimerMode::OneShot => "ONE SHOT",
            TimerMode::Repeat => "CLOCK DIVIDER",
        }
    }
}

/// One down-counter unit.
#[derive(Debug)]
pub struct Timer {
    /// Unit index within the parent chip (for messages)
    index: usize,
    /// Event parameter the parent schedules this timer's ticks with
    param: EventParam,
    mode: TimerMode,
    /// Gate input: counting is paused while disabled
    enabled: bool,
    /// Holding register frozen for a two-byte read
    frozen: bool,
    jam: u16,
    count: u16,
    hold: u16,
    /// Counting period in nanoseconds
    period: u64,
    /// Interrupt enable; stored here for the parent's convenience, this
    /// engine itself never touches interrupts
    ien: bool,
}

impl Timer {
    /// Create a stopped timer. `param` is the event parameter the parent
    /// device will see this timer's clock ticks arrive with.
    pub fn new(index: usize, param: EventParam, period: u64) -> Self {
        Self {
            index,
            param,
            mode: TimerMode::Stopped,
            enabled: true,
            frozen: false,
            jam: 0,
            count: 0,
            hold: 0,
            period,
            ien: false,
        }
    }

    /// Unit index within the parent chip.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The event parameter this timer's ticks carry.
    pub fn param(&self) -> EventParam {
        self.param
    }

    /// Set the counting period in nanoseconds.
    pub fn set_period(&mut self, period: u64) {
        assert!(period != 0);
        self.period = period;
    }

    /// Set the counting period from a clock frequency.
    pub fn set_clock(&mut self, hz: u64) {
        assert!(hz != 0);
        self.set_period(hz_to_ns(hz));
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn clock(&self) -> u64 {
        ns_to_hz(self.period)
    }

    pub fn set_mode(&mut self, mode: TimerMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    pub fn set_ien(&mut self, ien: bool) {
        self.ien = ien;
    }

    pub fn ien(&self) -> bool {
        self.ien
    }

    /// Reset: registers cleared, gate enabled, hold unfrozen, counter
    /// stopped, pending tick cancelled.
    pub fn clear(&mut self, ctx: &mut Context) {
        self.mode = TimerMode::Stopped;
        self.enabled = true;
        self.frozen = false;
        self.jam = 0;
        self.count = 0;
        self.hold = 0;
        self.ien = false;
        ctx.cancel(self.param);
    }

    /// Start counting, assuming a mode has been selected. With `jam` the
    /// count register reloads first; without it counting resumes from
    /// wherever it left off.
    pub fn start(&mut self, ctx: &mut Context, jam: bool) {
        assert!(self.mode != TimerMode::Stopped);
        if jam {
            self.jam_count();
        }
        ctx.schedule(self.param, self.period);
    }

    /// Stop by cancelling the pending clock tick. Deliberately changes
    /// nothing else: `start(false)` resumes the count.
    pub fn stop(&mut self, ctx: &mut Context) {
        self.mode = TimerMode::Stopped;
        ctx.cancel(self.param);
    }

    /// Load the full jam register.
    pub fn write(&mut self, value: u16) {
        self.jam = value;
    }

    /// Load the high byte of the jam register.
    pub fn write_high(&mut self, value: u8) {
        self.jam = (self.jam & 0x00FF) | ((value as u16) << 8);
    }

    /// Load the low byte of the jam register.
    pub fn write_low(&mut self, value: u8) {
        self.jam = (self.jam & 0xFF00) | value as u16;
    }

    /// Copy the jam register into the count register.
    pub fn jam_count(&mut self) {
        self.count = self.jam;
    }

    /// Freeze (or thaw) the holding register for reading.
    pub fn freeze(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    /// Read the holding register.
    pub fn read(&self) -> u16 {
        self.hold
    }

    /// High byte of the holding register.
    pub fn read_high(&self) -> u8 {
        (self.hold >> 8) as u8
    }

    /// Low byte of the holding register.
    pub fn read_low(&self) -> u8 {
        self.hold as u8
    }

    /// Gate input: enable or pause counting.
    pub fn enable(&mut self, gate: bool) {
        self.enabled = gate;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The counting step, called from the parent's event callback when
    /// this timer's tick arrives. Returns true on terminal count (the
    /// 0x0000 to 0xFFFF rollover). The reload or stop happens *before*
    /// the return so the caller may restart the timer if it wants.
    pub fn tick(&mut self, ctx: &mut Context) -> bool {
        let mut terminal = false;
        if self.enabled {
            self.count = self.count.wrapping_sub(1);
            if !self.frozen {
                self.hold = self.count;
            }
            if self.count == 0xFFFF {
                if self.mode == TimerMode::Repeat {
                    self.count = self.jam;
                } else {
                    self.mode = TimerMode::Stopped;
                }
                terminal = true;
                if self.mode == TimerMode::Stopped {
                    // One-shot expired: dismiss without rescheduling.
                    return terminal;
                }
            }
        }
        // Gate off or still counting: just keep the clock running.
        ctx.schedule(self.param, self.period);
        terminal
    }

    /// State dump for the parent's show method.
    pub fn show(&self) -> String {
        format!(
            "Timer{}: {}, Jam=0x{:04X}, Count=0x{:04X}, Hold=0x{:04X}\n\
             \tEnabled={}, Frozen={}, IEN={}, Period={}ns ({}Hz)\n",
            self.index,
            self.mode.as_str(),
            self.jam,
            self.count,
            self.hold,
            self.enabled as u8,
            self.frozen as u8,
            self.ien as u8,
            self.period,
            self.clock()
        )
    }
}
