//! RCA CDP1854 UART
//!
//! The typical console terminal interface of COSMAC systems: two
//! registers, four ways to use them.
//!
//! | Offset | Read | Write |
//! |--------|------|-------|
//! | 0      | RBR (receiver buffer)  | THR (transmitter holding) |
//! | 1      | STS (status)           | CTL (control)             |
//!
//! Interrupt behavior worth spelling out: the DA interrupt is level
//! sensitive and drops when the RBR is read; the THRE interrupt latches on
//! the THRE 0-to-1 edge and clears on a *status read*, though the THRE
//! bit itself stays set until a new byte is loaded. The transmitter shift
//! register is double buffered on real silicon, so TSRE lags THRE; the
//! SBC1802 power-on self test actually checks the lag, so the first status
//! read after a transmit finds THRE set with TSRE still clear, and only
//! the next one shows both.
//!
//! And one genuine 1854 oddity: while the BREAK bit is set in the control
//! register the entire transmitter is inhibited - THR writes do nothing at
//! all.

use crate::bus::Context;
use crate::device::Device;
use crate::interrupt::SimpleInterrupt;
use crate::peripherals::uart::{ConsoleHandle, RxPoll, Uart, EVENT_BRKDONE, EVENT_RXREADY, EVENT_TXDONE};
use crate::scheduler::EventParam;

/// Register offsets from the base port.
pub mod regs {
    /// Receiver buffer (read) / transmitter holding (write)
    pub const RBR: u16 = 0;
    pub const THR: u16 = 0;
    /// Status (read) / control (write)
    pub const STS: u16 = 1;
    pub const CTL: u16 = 1;
    /// Number of ports occupied
    pub const COUNT: u16 = 2;
}

/// Status register bits.
pub mod sts {
    /// Transmitter holding register empty
    pub const THRE: u8 = 0x80;
    /// Transmitter shift register empty
    pub const TSRE: u8 = 0x40;
    /// Peripheral status input (unused)
    pub const PSI: u8 = 0x20;
    /// External status (unused)
    pub const ES: u8 = 0x10;
    /// Framing error
    pub const FE: u8 = 0x08;
    /// Parity error
    pub const PE: u8 = 0x04;
    /// Receiver overrun
    pub const OE: u8 = 0x02;
    /// Receiver data available
    pub const DA: u8 = 0x01;
}

/// Control register bits.
pub mod ctl {
    /// Transmit request
    pub const TR: u8 = 0x80;
    /// Force break (inhibits the transmitter!)
    pub const BREAK: u8 = 0x40;
    /// Interrupt enable
    pub const IE: u8 = 0x20;
    /// Word length select
    pub const WLS2: u8 = 0x10;
    pub const WLS1: u8 = 0x08;
    /// Stop bit select
    pub const SBS: u8 = 0x04;
    /// Even parity enable
    pub const EPE: u8 = 0x02;
    /// Parity inhibit
    pub const PI: u8 = 0x01;
}

/// Sense pin index meaning "not wired".
pub const NO_SENSE: u16 = u16::MAX;

/// The CDP1854 register file on top of the generic UART engine.
pub struct Cdp1854 {
    uart: Uart,
    base: u16,
    rbr: u8,
    thr: u8,
    sts: u8,
    ctl: u8,
    /// Current interrupt request level
    irq: bool,
    /// THRE edge interrupt flip-flop
    thre_irq: bool,
    irq_mask: u32,
    /// Sense pin wired to the IRQ output
    sense_irq: u16,
    /// Sense pin wired to the raw RXD line (break detection)
    sense_brk: u16,
}

impl Cdp1854 {
    /// Create a CDP1854 at `base` talking to `console`. The IRQ output
    /// and the RXD line can each be wired to a CPU sense pin.
    pub fn new(base: u16, console: Option<ConsoleHandle>, sense_irq: u16, sense_brk: u16) -> Self {
        Self {
            uart: Uart::new(console),
            base,
            rbr: 0,
            thr: 0,
            sts: 0,
            ctl: 0,
            irq: false,
            thre_irq: false,
            irq_mask: 0,
            sense_irq,
            sense_brk,
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

    /// Timing access for system configuration.
    pub fn uart_mut(&mut self) -> &mut Uart {
        &mut self.uart
    }

    /// True while this UART requests an interrupt.
    pub fn is_interrupting(&self) -> bool {
        self.irq
    }

    fn request_interrupt(&mut self, ctx: &mut Context, level: bool) {
        if self.irq_mask != 0 {
            ctx.bus.irq.request(self.irq_mask, level);
        }
    }

    /// Install a new status byte and work out the interrupt side effects.
    /// An interrupt is requested when IE is set and either DA is set
    /// (level sensitive) or THRE made a 0-to-1 transition (latched in
    /// `thre_irq` until a status read).
    fn update_status(&mut self, ctx: &mut Context, new: u8) {
        let da_irq = new & sts::DA != 0;
        if new & sts::THRE != 0 && self.sts & sts::THRE == 0 {
            self.thre_irq = true;
        }
        self.irq = self.ctl & ctl::IE != 0 && (da_irq || self.thre_irq);
        let level = self.irq;
        self.request_interrupt(ctx, level);
        self.sts = new;
    }

    /// Status read: clears the THRE interrupt request (not the bit), and
    /// plays the TSRE-lags-THRE trick - the value returned is from
    /// *before* TSRE catches up.
    fn read_sts(&mut self, ctx: &mut Context) -> u8 {
        self.thre_irq = false;
        let sts = self.sts;
        self.update_status(ctx, sts);
        //   A break condition looks like a continuous stream of framing
        // errors for as long as it lasts.
        if self.uart.is_receiving_break() {
            self.sts |= sts::FE;
        }
        let old = self.sts;
        if self.sts & sts::THRE != 0 {
            self.sts |= sts::TSRE;
        }
        old
    }

    /// A received byte lands in the RBR. DA already set means the
    /// firmware never read the last byte: overrun.
    fn update_rbr(&mut self, ctx: &mut Context, data: u8) {
        self.rbr = data;
        let sts = self.sts;
        if sts & sts::DA != 0 {
            self.update_status(ctx, sts | sts::OE);
        } else {
            self.update_status(ctx, sts | sts::DA);
        }
    }

    /// RBR read clears DA and OE (and with them the receive interrupt).
    fn read_rbr(&mut self, ctx: &mut Context) -> u8 {
        let sts = self.sts & !(sts::DA | sts::OE);
        self.update_status(ctx, sts);
        self.rbr
    }

    /// THR write: clears THRE/TSRE and their interrupt, starts the
    /// transmitter. Unless BREAK is set, in which case the whole
    /// transmitter is inhibited and nothing happens at all.
    fn write_thr(&mut self, ctx: &mut Context, data: u8) {
        if self.ctl & ctl::BREAK != 0 {
            return;
        }
        self.thr = data;
        self.thre_irq = false;
        let sts = self.sts & !(sts::THRE | sts::TSRE);
        self.update_status(ctx, sts);
        self.uart.start_transmitter(ctx, data, false);
    }

    /// CTL write. The TR bit re-raises the THRE interrupt if THRE is
    /// currently set, and while TR is being set no other bit is written.
    fn write_ctl(&mut self, ctx: &mut Context, data: u8) {
        if data & ctl::TR != 0 {
            if self.sts & sts::THRE != 0 {
                self.thre_irq = true;
                let sts = self.sts;
                self.update_status(ctx, sts);
            }
            self.ctl |= ctl::TR;
        } else {
            let old = self.ctl;
            self.ctl = data;
            // An IE change re-evaluates the interrupt request.
            if (self.ctl ^ old) & ctl::IE != 0 {
                let sts = self.sts;
                self.update_status(ctx, sts);
            }
            // A BREAK change is pushed out on the serial line.
            if (self.ctl ^ old) & ctl::BREAK != 0 {
                if let Some(console) = self.uart.console() {
                    console
                        .borrow_mut()
                        .send_serial_break(self.ctl & ctl::BREAK != 0);
                }
            }
        }
    }

    /// TXDONE: the character has left; THRE sets (TSRE lags, see
    /// `read_sts`). A transmitter inhibited by BREAK never finishes.
    fn transmitter_done(&mut self, ctx: &mut Context) {
        if self.ctl & ctl::BREAK == 0 {
            let sts = self.sts | sts::THRE;
            self.update_status(ctx, sts);
        }
    }
}

impl Device for Cdp1854 {
    fn name(&self) -> &'static str {
        "SLU"
    }

    fn reset(&mut self, ctx: &mut Context) {
        self.rbr = 0;
        self.thr = 0;
        self.ctl = 0;
        self.sts = sts::THRE | sts::TSRE;
        self.irq = false;
        self.thre_irq = false;
        self.request_interrupt(ctx, false);
        self.uart.reset(ctx);
    }

    fn read(&mut self, ctx: &mut Context, port: u16) -> u8 {
        match port - self.base {
            regs::RBR => self.read_rbr(ctx),
            regs::STS => self.read_sts(ctx),
            _ => 0xFF,
        }
    }

    fn write(&mut self, ctx: &mut Context, port: u16, data: u8) {
        match port - self.base {
            regs::THR => self.write_thr(ctx, data),
            regs::CTL => self.write_ctl(ctx, data),
            _ => {}
        }
    }

    fn sense(&mut self, _ctx: &mut Context, pin: u16, default: u8) -> u8 {
        if pin == self.sense_irq {
            self.irq as u8
        } else if pin == self.sense_brk {
            //   The raw RXD line: normally high, low for the duration of
            // a break. MicroDOS watches this to catch BREAK on the
            // terminal.
            (!self.uart.is_receiving_break()) as u8
        } else {
            default
        }
    }

    fn event(&mut self, ctx: &mut Context, param: EventParam) {
        match param {
            EVENT_TXDONE => self.transmitter_done(ctx),
            EVENT_RXREADY => {
                // The 1854 receiver is never "busy": a new byte on top of
                // an unread one is exactly what the OE bit reports.
                if let RxPoll::Byte(data) = self.uart.receiver_ready(ctx, false) {
                    self.update_rbr(ctx, data);
                }
            }
            EVENT_BRKDONE => self.uart.receiving_break_done(ctx),
            other => log::warn!("CDP1854 stray event {other}"),
        }
    }

    fn show(&self) -> String {
        format!(
            "RBR=0x{:02X} THR=0x{:02X} STS=0x{:02X} CTL=0x{:02X} IRQ={}\n{}",
            self.rbr, self.thr, self.sts, self.ctl, self.irq as u8, self.uart.show()
        )
    }
}
