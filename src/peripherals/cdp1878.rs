//! RCA CDP1878 dual counter/timer
//!
//! Two identical 16-bit down-counters sharing one status register. The
//! chip fills an entire COSMAC I/O group (port 1, the group select, is
//! conveniently unused), so the register addresses are fixed:
//!
//! | Port | Read          | Write             |
//! |------|---------------|-------------------|
//! | 2    | counter A LSB | jam A LSB         |
//! | 3    | counter B LSB | jam B LSB         |
//! | 4    | status        | control A         |
//! | 5    | status        | control B         |
//! | 6    | counter A MSB | jam A MSB         |
//! | 7    | counter B MSB | jam B MSB         |
//!
//! Each counter is assumed to be driven by a fixed-frequency clock set
//! with `set_clock_a`/`set_clock_b`. Any write to a control register
//! clears that timer's status bit. The timeout, strobe and one-shot modes
//! all emulate as one-shot; rate mode as repeat; PWM is not implemented.
//!
//! The timer outputs and the interrupt request can each be wired to a CPU
//! sense input; the per-timer outputs are not affected by the interrupt
//! enable bits.

use crate::bus::Context;
use crate::device::Device;
use crate::interrupt::SimpleInterrupt;
use crate::peripherals::timer::{Timer, TimerMode};
use crate::scheduler::EventParam;

/// Register ports (the chip owns ports 2..=7).
pub mod ports {
    pub const BASE: u16 = 2;
    pub const COUNT: u16 = 6;
    pub const COUNTER_A_LSB: u16 = 2;
    pub const COUNTER_B_LSB: u16 = 3;
    pub const CONTROL_A: u16 = 4;
    pub const STATUS_A: u16 = 4;
    pub const CONTROL_B: u16 = 5;
    pub const STATUS_B: u16 = 5;
    pub const COUNTER_A_MSB: u16 = 6;
    pub const COUNTER_B_MSB: u16 = 7;
}

/// Status register bits.
pub mod sts {
    /// Timer A reached terminal count
    pub const A: u8 = 0x80;
    /// Timer B reached terminal count
    pub const B: u8 = 0x40;
}

/// Control register bits (identical for both timers).
pub mod ctl {
    pub const MODE_MASK: u8 = 0x07;
    /// Gate polarity select (unimplemented)
    pub const GPOLARITY: u8 = 0x08;
    /// Interrupt enable
    pub const IEN: u8 = 0x10;
    /// Start (set) or stop (clear) the timer
    pub const START: u8 = 0x20;
    /// Freeze the holding register
    pub const FREEZE: u8 = 0x40;
    /// Reload the count from the jam register on start
    pub const JAM: u8 = 0x80;
}

/// Timer mode field values.
pub mod mode {
    pub const NOCHANGE: u8 = 0;
    pub const TIMEOUT: u8 = 1;
    pub const STROBE: u8 = 2;
    pub const ONESHOT: u8 = 3;
    pub const RATE: u8 = 4;
    pub const PWM: u8 = 5;
}

/// Event parameters for the two timer clocks.
pub const EVENT_TIMER_A: EventParam = b'A' as EventParam;
pub const EVENT_TIMER_B: EventParam = b'B' as EventParam;

/// Sense pin index meaning "not wired".
pub const NO_SENSE: u16 = u16::MAX;

/// The dual counter/timer.
pub struct Cdp1878 {
    timer_a: Timer,
    timer_b: Timer,
    status: u8,
    irq: bool,
    irq_mask: u32,
    /// Chip enable: when off the registers vanish from the bus
    enabled: bool,
    sense_int: u16,
    sense_a: u16,
    sense_b: u16,
}

impl Cdp1878 {
    /// Create the chip, optionally naming the sense pins its interrupt
    /// and timer outputs are wired to.
    pub fn new(sense_int: u16, sense_a: u16, sense_b: u16) -> Self {
        Self {
            timer_a: Timer::new(0, EVENT_TIMER_A, 1000),
            timer_b: Timer::new(1, EVENT_TIMER_B, 1000),
            status: 0,
            irq: false,
            irq_mask: 0,
            enabled: true,
            sense_int,
            sense_a,
            sense_b,
        }
    }

    /// Attach the interrupt output to the wire-OR controller.
    pub fn attach_interrupt(&mut self, irq: &mut SimpleInterrupt) {
        self.irq_mask = irq.allocate_mask();
    }

    /// Hand the interrupt slot back (detaching the device).
    pub fn release_interrupt(&mut self, irq: &mut SimpleInterrupt) {
        if self.irq_mask != 0 {
            irq.release_mask(self.irq_mask);
            self.irq_mask = 0;
        }
    }

    /// Clock frequency for timer A.
    pub fn set_clock_a(&mut self, hz: u64) {
        self.timer_a.set_clock(hz);
    }

    /// Clock frequency for timer B.
    pub fn set_clock_b(&mut self, hz: u64) {
        self.timer_b.set_clock(hz);
    }

    /// Enable or disable the whole chip.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Gate input for timer A.
    pub fn timer_gate_a(&mut self, enable: bool) {
        self.timer_a.enable(enable);
    }

    /// Gate input for timer B.
    pub fn timer_gate_b(&mut self, enable: bool) {
        self.timer_b.enable(enable);
    }

    /// Current status byte (without the read side effects).
    pub fn status(&self) -> u8 {
        self.status
    }

    /// Recompute the interrupt request from the status bits and the
    /// per-timer interrupt enables. Returns the status byte.
    fn update_status(&mut self, ctx: &mut Context) -> u8 {
        self.irq = (self.status & sts::A != 0 && self.timer_a.ien())
            || (self.status & sts::B != 0 && self.timer_b.ien());
        if self.irq_mask != 0 {
            ctx.bus.irq.request(self.irq_mask, self.irq && self.enabled);
        }
        self.status
    }

    /// Write a control register. Any control write clears the associated
    /// timer's status bit, even one that otherwise does nothing.
    fn load_control(&mut self, ctx: &mut Context, which: EventParam, data: u8) {
        self.status &= if which == EVENT_TIMER_A {
            !sts::A
        } else {
            !sts::B
        };
        self.update_status(ctx);

        let timer = if which == EVENT_TIMER_A {
            &mut self.timer_a
        } else {
            &mut self.timer_b
        };
        match data & ctl::MODE_MASK {
            mode::NOCHANGE => {}
            mode::TIMEOUT | mode::STROBE | mode::ONESHOT => {
                // All three count down once and stop; near enough.
                timer.set_mode(TimerMode::OneShot);
            }
            mode::RATE => timer.set_mode(TimerMode::Repeat),
            other => {
                // PWM and the reserved codes.
                log::warn!("CDP1878 timer mode {other} not implemented");
            }
        }

        timer.set_ien(data & ctl::IEN != 0);
        if data & ctl::START != 0 {
            timer.start(ctx, data & ctl::JAM != 0);
        } else {
            timer.stop(ctx);
        }
        timer.freeze(data & ctl::FREEZE != 0);
    }

    /// A timer clock tick arrived: count, and latch the status bit on
    /// terminal count.
    fn timer_tick(&mut self, ctx: &mut Context, which: EventParam) {
        let (timer, bit) = if which == EVENT_TIMER_A {
            (&mut self.timer_a, sts::A)
        } else {
            (&mut self.timer_b, sts::B)
        };
        if timer.tick(ctx) {
            self.status |= bit;
            self.update_status(ctx);
        }
    }
}

impl Device for Cdp1878 {
    fn name(&self) -> &'static str {
        "CTC"
    }

    fn reset(&mut self, ctx: &mut Context) {
        self.timer_a.clear(ctx);
        self.timer_b.clear(ctx);
        self.status = 0;
        self.update_status(ctx);
    }

    fn read(&mut self, ctx: &mut Context, port: u16) -> u8 {
        if !self.enabled {
            return 0xFF;
        }
        match port {
            // One status register, readable at either address.
            ports::STATUS_A | ports::STATUS_B => self.update_status(ctx),
            //   The byte lanes come back crossed: the MSB ports read the
            // low half of the holding register and vice versa.
            ports::COUNTER_A_MSB => self.timer_a.read_low(),
            ports::COUNTER_A_LSB => self.timer_a.read_high(),
            ports::COUNTER_B_MSB => self.timer_b.read_low(),
            ports::COUNTER_B_LSB => self.timer_b.read_high(),
            _ => 0xFF,
        }
    }

    fn write(&mut self, ctx: &mut Context, port: u16, data: u8) {
        if !self.enabled {
            return;
        }
        match port {
            ports::COUNTER_A_MSB => self.timer_a.write_high(data),
            ports::COUNTER_A_LSB => self.timer_a.write_low(data),
            ports::COUNTER_B_MSB => self.timer_b.write_high(data),
            ports::COUNTER_B_LSB => self.timer_b.write_low(data),
            ports::CONTROL_A => self.load_control(ctx, EVENT_TIMER_A, data),
            ports::CONTROL_B => self.load_control(ctx, EVENT_TIMER_B, data),
            _ => {}
        }
    }

    fn sense(&mut self, ctx: &mut Context, pin: u16, default: u8) -> u8 {
        self.update_status(ctx);
        if !self.enabled {
            return default;
        }
        if pin == self.sense_int {
            self.irq as u8
        } else if pin == self.sense_a {
            (self.status & sts::A != 0) as u8
        } else if pin == self.sense_b {
            (self.status & sts::B != 0) as u8
        } else {
            default
        }
    }

    fn event(&mut self, ctx: &mut Context, param: EventParam) {
        match param {
            EVENT_TIMER_A | EVENT_TIMER_B => self.timer_tick(ctx, param),
            other => log::warn!("CDP1878 stray event {other}"),
        }
    }

    fn show(&self) -> String {
        if !self.enabled {
            return "CTC DISABLED\n".into();
        }
        format!("{}\n{}", self.timer_a.show(), self.timer_b.show())
    }
}
