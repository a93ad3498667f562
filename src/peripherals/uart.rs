//! Generic UART-to-console engine
//!
//! The event scheduling and console plumbing shared by every UART chip.
//! A chip emulation owns a [`Uart`] and drives it: register semantics stay
//! in the chip, timing and console traffic live here.
//!
//! Three event types exist. TXDONE fires one character time after a byte
//! is loaded into the transmitter; RXREADY is the always-armed receive
//! poll that reads the console keyboard; BRKDONE ends a received serial
//! break. After reset exactly one RXREADY chain is running - without it
//! nothing could ever be typed into the simulation.
//!
//! Character reception is paced by the poll interval on purpose: a real
//! terminal cannot outtype a hardware UART, but a simulated CPU is far
//! slower than a real keyboard, so input is metered out one byte per poll.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bus::Context;
use crate::console::Console;
use crate::scheduler::{hz_to_ns, ms_to_ns, EventParam};

/// Transmitter-done event.
pub const EVENT_TXDONE: EventParam = 1;
/// Receiver poll event.
pub const EVENT_RXREADY: EventParam = 2;
/// Received-break-over event.
pub const EVENT_BRKDONE: EventParam = 3;

/// Default speed: 2000 characters per second, a little over 19.2k baud.
pub const DEFAULT_SPEED: u64 = 2000;

/// Shared console handle. The core is single threaded; the test bench or
/// front end keeps the other reference.
pub type ConsoleHandle = Rc<RefCell<dyn Console>>;

/// What the receiver poll produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxPoll {
    /// Nothing arrived
    Idle,
    /// One byte arrived and should go into the receiver buffer register
    Byte(u8),
}

/// The engine: delays, break state and the console connection.
pub struct Uart {
    /// Time to send one character, in ns
    character_time: u64,
    /// Receiver poll interval, in ns
    polling_interval: u64,
    /// How long a received break asserts, in ns
    break_time: u64,
    /// True while a received break is in progress
    receiving_break: bool,
    console: Option<ConsoleHandle>,
}

impl Uart {
    /// Create an engine talking to `console` (or to nothing).
    pub fn new(console: Option<ConsoleHandle>) -> Self {
        Self {
            character_time: hz_to_ns(DEFAULT_SPEED),
            polling_interval: hz_to_ns(DEFAULT_SPEED),
            // Roughly one character time at 110 baud.
            break_time: ms_to_ns(100),
            receiving_break: false,
            console,
        }
    }

    /// Time to send one character, in nanoseconds.
    pub fn character_delay(&self) -> u64 {
        self.character_time
    }

    /// Receiver poll interval, in nanoseconds.
    pub fn poll_delay(&self) -> u64 {
        self.polling_interval
    }

    pub fn set_character_delay(&mut self, ns: u64) {
        self.character_time = ns;
    }

    pub fn set_poll_delay(&mut self, ns: u64) {
        self.polling_interval = ns;
    }

    /// Duration of a received serial break.
    pub fn break_delay(&self) -> u64 {
        self.break_time
    }

    pub fn set_break_delay(&mut self, ns: u64) {
        self.break_time = ns;
    }

    /// The console this UART is wired to.
    pub fn console(&self) -> Option<&ConsoleHandle> {
        self.console.as_ref()
    }

    /// True while a received break is asserted.
    pub fn is_receiving_break(&self) -> bool {
        self.receiving_break
    }

    /// Hardware reset: clear the break state, drop any in-flight events
    /// and re-arm the receiver poll. Without that first poll event the
    /// keyboard would be dead forever.
    pub fn reset(&mut self, ctx: &mut Context) {
        self.receiving_break = false;
        if let Some(console) = &self.console {
            console.borrow_mut().send_serial_break(false);
        }
        ctx.cancel(EVENT_TXDONE);
        ctx.cancel(EVENT_BRKDONE);
        ctx.cancel(EVENT_RXREADY);
        ctx.schedule(EVENT_RXREADY, self.polling_interval);
    }

    /// A byte was loaded into the transmitter holding register. Sends it
    /// to the console (unless looped back) and schedules TXDONE.
    ///
    /// A badly behaved program can load a second byte before the first
    /// finished. What the silicon does then is not entirely clear; we
    /// assume the first byte is trashed and the done flag sets one full
    /// character time after the second - hence the cancel, so at most one
    /// TXDONE is ever pending.
    pub fn start_transmitter(&mut self, ctx: &mut Context, data: u8, loopback: bool) {
        if !loopback {
            if let Some(console) = &self.console {
                console.borrow_mut().raw_write(&[data]);
            }
        }
        ctx.cancel(EVENT_TXDONE);
        ctx.schedule(EVENT_TXDONE, self.character_time);
    }

    /// The receiver poll. Checks for the console break key (which stops
    /// the whole simulation), starts a received-break window when the
    /// operator sends one, and otherwise reads at most one byte when the
    /// chip's receiver isn't busy. Always re-arms itself.
    pub fn receiver_ready(&mut self, ctx: &mut Context, rx_busy: bool) -> RxPoll {
        let mut result = RxPoll::Idle;
        if let Some(console) = self.console.clone() {
            let mut console = console.borrow_mut();
            if console.is_console_break() {
                ctx.bus.break_requested = true;
            }
            //   A serial break (not to be confused with the console break
            // above) puts the receiver into a break window for a fixed
            // time. Further break requests during the window are ignored.
            if console.is_receiving_serial_break() && !self.receiving_break {
                self.receiving_break = true;
                ctx.schedule(EVENT_BRKDONE, self.break_time);
            }
            //   A UART in a break condition can't receive anything, so
            // only poll for data outside the window.
            if !self.receiving_break && !rx_busy {
                let mut byte = [0u8; 1];
                if console.raw_read(&mut byte) > 0 {
                    result = RxPoll::Byte(byte[0]);
                }
            }
        }
        ctx.schedule(EVENT_RXREADY, self.polling_interval);
        result
    }

    /// End the received-break window. Usually called when BRKDONE fires,
    /// but safe to call early - any pending BRKDONE is cancelled.
    pub fn receiving_break_done(&mut self, ctx: &mut Context) {
        ctx.cancel(EVENT_BRKDONE);
        self.receiving_break = false;
    }

    /// Settings summary for chip show methods.
    pub fn show(&self) -> String {
        format!(
            "Transmit speed {} cps, Receive speed {} cps\n",
            crate::scheduler::ns_to_hz(self.polling_interval),
            crate::scheduler::ns_to_hz(self.character_time)
        )
    }
}
