//! DEC DC319 UART
//!
//! A very DEC-specific device: software compatible with the PDP-11 KL11
//! console interface. Four logical registers, each 16 bits wide, mapped
//! onto an 8-bit bus as even/odd byte pairs:
//!
//! | Offset | Register |
//! |--------|----------|
//! | 0,1    | RXCSR (receiver control/status)   |
//! | 2,3    | RXBUF (receiver buffer, read only)|
//! | 4,5    | TXCSR (transmitter control/status)|
//! | 6,7    | TXBUF (transmitter buffer)        |
//!
//! Only RXBUF uses its upper byte (the error flags); every other upper
//! byte reads as zero. The receiver interrupts on channel B and the
//! transmitter on channel A. Loopback (XMIT_MAINT) routes transmitted
//! bytes straight into the receiver, and is also the only way a
//! transmitted BREAK becomes observable - the power-on self test does
//! exactly that.
//!
//! BCLR (INIT) clears only the two IE bits, MAINT and BREAK; it touches
//! neither RCV_DONE nor XMIT_READY on the real chip, although clearing the
//! IE bits removes any interrupt request. We additionally force the two
//! status bits to their idle state for reproducible simulations.

use crate::bus::Context;
use crate::device::Device;
use crate::interrupt::SimpleInterrupt;
use crate::peripherals::uart::{ConsoleHandle, RxPoll, Uart, EVENT_BRKDONE, EVENT_RXREADY, EVENT_TXDONE};
use crate::scheduler::EventParam;

/// Register offsets from the base port (even bytes; odd is the upper
/// half of the pair).
pub mod regs {
    pub const RXCSR: u16 = 0;
    pub const RXBUF: u16 = 2;
    pub const TXCSR: u16 = 4;
    pub const TXBUF: u16 = 6;
    /// Number of ports occupied
    pub const COUNT: u16 = 8;
}

/// Receiver CSR bits (low byte).
pub mod rxcsr {
    /// A character is waiting in RXBUF
    pub const RCV_DONE: u8 = 0x80;
    /// Receiver interrupt enable
    pub const RCV_IE: u8 = 0x40;
}

/// Transmitter CSR bits (low byte).
pub mod txcsr {
    /// The transmitter can take a character
    pub const XMIT_READY: u8 = 0x80;
    /// Transmitter interrupt enable
    pub const XMIT_IE: u8 = 0x40;
    /// Maintenance (loopback) mode
    pub const XMIT_MAINT: u8 = 0x04;
    /// Transmit a break
    pub const XMIT_BREAK: u8 = 0x01;
}

/// Receiver buffer error flags (upper byte of RXBUF).
pub mod rbuf {
    /// Master error: set with any other error bit
    pub const ERR: u16 = 0x8000;
    /// Overrun: RCV_DONE was still set when the next byte arrived
    pub const OVER: u16 = 0x4000;
    /// Break received (loopback only)
    pub const BREAK: u16 = 0x2000;
}

/// The DC319 register file on top of the generic UART engine.
pub struct Dc319 {
    uart: Uart,
    base: u16,
    rx_csr: u16,
    rx_buf: u16,
    tx_csr: u16,
    tx_buf: u16,
    /// Channel A (transmitter) and channel B (receiver) masks
    irq_mask_a: u32,
    irq_mask_b: u32,
}

impl Dc319 {
    pub fn new(base: u16, console: Option<ConsoleHandle>) -> Self {
        Self {
            uart: Uart::new(console),
            base,
            rx_csr: 0,
            rx_buf: 0,
            tx_csr: 0,
            tx_buf: 0,
            irq_mask_a: 0,
            irq_mask_b: 0,
        }
    }

    /// Attach both interrupt channels to the wire-OR controller.
    pub fn attach_interrupt(&mut self, irq: &mut SimpleInterrupt) {
        self.irq_mask_a = irq.allocate_mask();
        self.irq_mask_b = irq.allocate_mask();
    }

    /// Hand both interrupt slots back (detaching the device).
    pub fn release_interrupt(&mut self, irq: &mut SimpleInterrupt) {
        if self.irq_mask_a != 0 {
            irq.release_mask(self.irq_mask_a);
            self.irq_mask_a = 0;
        }
        if self.irq_mask_b != 0 {
            irq.release_mask(self.irq_mask_b);
            self.irq_mask_b = 0;
        }
    }

    /// Timing access for system configuration.
    pub fn uart_mut(&mut self) -> &mut Uart {
        &mut self.uart
    }

    fn request_tx_interrupt(&mut self, ctx: &mut Context, level: bool) {
        if self.irq_mask_a != 0 {
            ctx.bus.irq.request(self.irq_mask_a, level);
        }
    }

    fn request_rx_interrupt(&mut self, ctx: &mut Context, level: bool) {
        if self.irq_mask_b != 0 {
            ctx.bus.irq.request(self.irq_mask_b, level);
        }
    }

    /// A received byte lands in RXBUF. Only the OVERRUN and master error
    /// flags are modeled; the DC319 does no parity at all.
    fn update_rbr(&mut self, ctx: &mut Context, data: u8) {
        self.rx_buf = data as u16;
        if self.rx_csr & rxcsr::RCV_DONE as u16 != 0 {
            self.rx_buf |= rbuf::OVER | rbuf::ERR;
        }
        self.rx_csr |= rxcsr::RCV_DONE as u16;
        if self.rx_csr & rxcsr::RCV_IE as u16 != 0 {
            self.request_rx_interrupt(ctx, true);
        }
    }

    /// RXBUF read: clears RCV_DONE and any receive interrupt. The data
    /// and error flags stay; the CPU can reread them until the next
    /// character lands.
    fn read_rx_buf(&mut self, ctx: &mut Context) -> u8 {
        self.rx_csr &= !(rxcsr::RCV_DONE as u16);
        //   Always drop the request: if RCV_IE was cleared since the
        // character arrived we must not leave the request dangling.
        self.request_rx_interrupt(ctx, false);
        self.rx_buf as u8
    }

    /// RXCSR write: only RCV_IE is writable, and flipping it updates the
    /// interrupt request against the current RCV_DONE.
    fn write_rx_csr(&mut self, ctx: &mut Context, data: u8) {
        let old = self.rx_csr as u8 & rxcsr::RCV_IE;
        let new = data & rxcsr::RCV_IE;
        self.rx_csr = (self.rx_csr & !(rxcsr::RCV_IE as u16)) | new as u16;
        if old ^ new != 0 {
            let level = new != 0 && self.rx_csr & rxcsr::RCV_DONE as u16 != 0;
            self.request_rx_interrupt(ctx, level);
        }
    }

    /// TXBUF write: drops XMIT_READY, clears the transmit interrupt, and
    /// starts the transmitter - except in loopback, where the byte goes
    /// around to the receiver when TXDONE fires instead.
    fn write_tx_buf(&mut self, ctx: &mut Context, data: u8) {
        self.tx_buf = data as u16;
        self.tx_csr &= !(txcsr::XMIT_READY as u16);
        self.request_tx_interrupt(ctx, false);
        let loopback = self.tx_csr & txcsr::XMIT_MAINT as u16 != 0;
        self.uart.start_transmitter(ctx, data, loopback);
    }

    /// TXCSR write: XMIT_IE, XMIT_BREAK and XMIT_MAINT are the writable
    /// bits. A BREAK edge goes out on the serial line; an IE edge
    /// re-evaluates the transmit interrupt.
    fn write_tx_csr(&mut self, ctx: &mut Context, data: u8) {
        const WRITABLE: u8 = txcsr::XMIT_IE | txcsr::XMIT_BREAK | txcsr::XMIT_MAINT;
        let new = data & WRITABLE;
        let old = self.tx_csr as u8;
        self.tx_csr = (self.tx_csr & !(WRITABLE as u16)) | new as u16;
        if (new ^ old) & txcsr::XMIT_BREAK != 0 {
            if let Some(console) = self.uart.console() {
                console
                    .borrow_mut()
                    .send_serial_break(self.tx_csr & txcsr::XMIT_BREAK as u16 != 0);
            }
        }
        if (new ^ old) & txcsr::XMIT_IE != 0 {
            let level = self.tx_csr & txcsr::XMIT_READY as u16 != 0
                && self.tx_csr & txcsr::XMIT_IE as u16 != 0;
            self.request_tx_interrupt(ctx, level);
        }
    }

    /// TXDONE: the character is out, XMIT_READY sets. In loopback the
    /// byte recirculates into the receiver, picking up the BREAK flag if
    /// one is being "transmitted".
    fn transmitter_done(&mut self, ctx: &mut Context) {
        if self.tx_csr & txcsr::XMIT_MAINT as u16 != 0 {
            let data = self.tx_buf as u8;
            self.update_rbr(ctx, data);
            if self.tx_csr & txcsr::XMIT_BREAK as u16 != 0 {
                self.rx_buf |= rbuf::BREAK;
            }
        }
        self.tx_csr |= txcsr::XMIT_READY as u16;
        if self.tx_csr & txcsr::XMIT_IE as u16 != 0 {
            self.request_tx_interrupt(ctx, true);
        }
    }
}

impl Device for Dc319 {
    fn name(&self) -> &'static str {
        "DLU"
    }

    fn reset(&mut self, ctx: &mut Context) {
        // BCLR per the datasheet: only the IE, MAINT and BREAK bits.
        self.rx_csr &= !(rxcsr::RCV_IE as u16);
        self.tx_csr &=
            !((txcsr::XMIT_IE | txcsr::XMIT_MAINT | txcsr::XMIT_BREAK) as u16);
        // And for reproducibility: receiver empty, transmitter idle.
        self.tx_csr |= txcsr::XMIT_READY as u16;
        self.rx_csr &= !(rxcsr::RCV_DONE as u16);
        self.request_rx_interrupt(ctx, false);
        self.request_tx_interrupt(ctx, false);
        self.uart.reset(ctx);
    }

    fn read(&mut self, ctx: &mut Context, port: u16) -> u8 {
        match port - self.base {
            regs::RXCSR => self.rx_csr as u8,
            regs::RXBUF => self.read_rx_buf(ctx),
            3 => (self.rx_buf >> 8) as u8,
            regs::TXCSR => self.tx_csr as u8,
            regs::TXBUF => self.tx_buf as u8,
            // Every other upper byte reads as zero.
            1 | 5 | 7 => 0,
            _ => 0xFF,
        }
    }

    fn write(&mut self, ctx: &mut Context, port: u16, data: u8) {
        match port - self.base {
            regs::RXCSR => self.write_rx_csr(ctx, data),
            regs::TXCSR => self.write_tx_csr(ctx, data),
            regs::TXBUF => self.write_tx_buf(ctx, data),
            // RXBUF is read only; odd bytes are not writable at all.
            _ => {}
        }
    }

    fn event(&mut self, ctx: &mut Context, param: EventParam) {
        match param {
            EVENT_TXDONE => self.transmitter_done(ctx),
            EVENT_RXREADY => {
                if let RxPoll::Byte(data) = self.uart.receiver_ready(ctx, false) {
                    self.update_rbr(ctx, data);
                }
            }
            EVENT_BRKDONE => self.uart.receiving_break_done(ctx),
            other => log::warn!("DC319 stray event {other}"),
        }
    }

    fn show(&self) -> String {
        format!(
            "RXCSR={:06o} RXBUF={:06o}\nTXCSR={:06o} TXBUF={:06o}\n{}",
            self.rx_csr, self.rx_buf, self.tx_csr, self.tx_buf, self.uart.show()
        )
    }
}
