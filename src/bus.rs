//! The shared system core
//!
//! [`Bus`] bundles everything the original emulator kept in top-level
//! globals: the event queue, main memory, the wire-OR interrupt line, the
//! DMA pointer and the console-break latch. [`System`] owns a `Bus` plus
//! the device binding tables and provides the dispatch helpers the CPU run
//! loop uses: draining due events, port reads and writes, sense polls and
//! flag updates.
//!
//! Devices never see the `System` - they are handed a [`Context`], which
//! is the bus plus their own identity, so they can schedule and cancel
//! their events without holding a scheduler pointer of their own.

use crate::device::{DeviceId, DeviceMap};
use crate::interrupt::SimpleInterrupt;
use crate::memory::{MemFlags, Memory};
use crate::scheduler::{EventParam, EventQueue};

/// The host-side DMA pointer.
///
/// Devices reach memory only through the two transfer routines here, each
/// of which performs exactly one memory access and advances the pointer -
/// the same contract the COSMAC exposes through its R0 DMA register.
#[derive(Debug, Default)]
pub struct DmaChannel {
    addr: u16,
}

impl DmaChannel {
    /// Current transfer address.
    pub fn pointer(&self) -> u16 {
        self.addr
    }

    /// Load the transfer address.
    pub fn set_pointer(&mut self, addr: u16) {
        self.addr = addr;
    }
}

/// Everything shared between the CPU and the devices.
pub struct Bus {
    /// Virtual time and pending events
    pub events: EventQueue,
    /// Main memory
    pub memory: Memory,
    /// Wire-OR interrupt line
    pub irq: SimpleInterrupt,
    /// DMA pointer and transfer engine
    pub dma: DmaChannel,
    /// Latched when a console reports its break keystroke; the CPU run
    /// loop consumes it and stops with `StopCode::ConsoleBreak`.
    pub break_requested: bool,
}

impl Bus {
    /// Create a bus with `mem_size` bytes of RAM.
    pub fn new(mem_size: usize) -> Self {
        Self {
            events: EventQueue::new(),
            memory: Memory::new(mem_size, MemFlags::RAM),
            irq: SimpleInterrupt::new(),
            dma: DmaChannel::default(),
            break_requested: false,
        }
    }

    /// DMA one byte from a device into memory and advance the pointer.
    pub fn dma_input(&mut self, value: u8) {
        let addr = self.dma.addr;
        self.memory.cpu_write(addr, value);
        self.dma.addr = addr.wrapping_add(1);
    }

    /// DMA one byte from memory to a device and advance the pointer.
    pub fn dma_output(&mut self) -> u8 {
        let addr = self.dma.addr;
        let value = self.memory.cpu_read(addr);
        self.dma.addr = addr.wrapping_add(1);
        value
    }
}

/// A device's view of the system: the bus plus its own identity, so event
/// scheduling is addressed correctly without the device storing an id.
pub struct Context<'a> {
    /// The shared system core
    pub bus: &'a mut Bus,
    /// The device currently being called
    pub id: DeviceId,
}

impl<'a> Context<'a> {
    /// Build a context for device `id`.
    pub fn new(bus: &'a mut Bus, id: DeviceId) -> Self {
        Self { bus, id }
    }

    /// Current virtual time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.bus.events.current_time()
    }

    /// Schedule a future event for this device.
    pub fn schedule(&mut self, param: EventParam, delay: u64) {
        self.bus.events.schedule(self.id, param, delay);
    }

    /// Cancel this device's pending events with a matching parameter.
    pub fn cancel(&mut self, param: EventParam) {
        self.bus.events.cancel(self.id, param);
    }

    /// True if this device has a pending event with a matching parameter.
    pub fn is_pending(&self, param: EventParam) -> bool {
        self.bus.events.is_pending(self.id, param)
    }
}

/// A bus plus its devices: the complete emulated system minus the CPU.
pub struct System {
    pub bus: Bus,
    pub devices: DeviceMap,
}

impl System {
    /// Create a system with `mem_size` bytes of RAM and no devices.
    pub fn new(mem_size: usize) -> Self {
        Self {
            bus: Bus::new(mem_size),
            devices: DeviceMap::new(),
        }
    }

    /// Dispatch every event whose time has arrived. The CPU calls this
    /// before each instruction fetch.
    ///
    /// Each callback observes the virtual clock at the exact time its
    /// event was scheduled for, not at the instruction boundary that
    /// happened to trigger the dispatch. A handler that reschedules
    /// itself therefore stays phase-locked to its own period - the UART
    /// poll chain and the timer tick chain never drift.
    pub fn do_events(&mut self) {
        let horizon = self.bus.events.current_time();
        loop {
            self.bus.events.jump_ahead(horizon);
            let Some(ev) = self.bus.events.pop_due() else {
                break;
            };
            self.bus.events.rewind(ev.time);
            if let Some(dev) = self.devices.get_mut(ev.device) {
                let mut ctx = Context::new(&mut self.bus, ev.device);
                dev.event(&mut ctx, ev.param);
            }
        }
        self.bus.events.jump_ahead(horizon);
    }

    /// Reset every registered device (part of the CPU's master clear).
    pub fn reset_devices(&mut self) {
        for id in 0..self.devices.len() {
            if let Some(dev) = self.devices.get_mut(id) {
                let mut ctx = Context::new(&mut self.bus, id);
                dev.reset(&mut ctx);
            }
        }
    }

    /// Read the device registered for input at `port`. `None` when no
    /// input-capable device claims the port.
    pub fn dev_read(&mut self, port: u16) -> Option<u8> {
        let id = self.devices.input_at(port)?;
        let dev = self.devices.get_mut(id)?;
        let mut ctx = Context::new(&mut self.bus, id);
        Some(dev.read(&mut ctx, port))
    }

    /// Write the device registered for output at `port`. Returns false
    /// when no output-capable device claims the port.
    pub fn dev_write(&mut self, port: u16, value: u8) -> bool {
        let Some(id) = self.devices.output_at(port) else {
            return false;
        };
        let Some(dev) = self.devices.get_mut(id) else {
            return false;
        };
        let mut ctx = Context::new(&mut self.bus, id);
        dev.write(&mut ctx, port, value);
        true
    }

    /// Poll the sense input `pin`; `default` when nothing drives it.
    pub fn sense(&mut self, pin: u16, default: u8) -> u8 {
        let Some(id) = self.devices.sense_at(pin) else {
            return default;
        };
        let Some(dev) = self.devices.get_mut(id) else {
            return default;
        };
        let mut ctx = Context::new(&mut self.bus, id);
        dev.sense(&mut ctx, pin, default)
    }

    /// Drive the flag output `pin` to `level`; dropped when nothing
    /// listens.
    pub fn set_flag(&mut self, pin: u16, level: u8) {
        let Some(id) = self.devices.flag_at(pin) else {
            return;
        };
        let Some(dev) = self.devices.get_mut(id) else {
            return;
        };
        let mut ctx = Context::new(&mut self.bus, id);
        dev.flag(&mut ctx, pin, level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceMode};
    use std::cell::RefCell;
    use std::rc::Rc;

    type Trace = Rc<RefCell<Vec<(EventParam, u64)>>>;

    /// Records event dispatch order and optionally chains a follow-up.
    struct Probe {
        fired: Trace,
        chain: bool,
    }

    impl Device for Probe {
        fn name(&self) -> &'static str {
            "PROBE"
        }
        fn reset(&mut self, ctx: &mut Context) {
            ctx.schedule(99, 1000);
        }
        fn read(&mut self, _ctx: &mut Context, port: u16) -> u8 {
            port as u8
        }
        fn event(&mut self, ctx: &mut Context, param: EventParam) {
            self.fired.borrow_mut().push((param, ctx.now()));
            if self.chain && param == 1 {
                // An already-due follow-up must fire in the same pass.
                ctx.schedule(2, 0);
                self.chain = false;
            }
        }
    }

    fn probe_system(chain: bool) -> (System, DeviceId, Trace) {
        let mut sys = System::new(0x100);
        let fired: Trace = Rc::new(RefCell::new(Vec::new()));
        let id = sys.devices.add(Box::new(Probe {
            fired: fired.clone(),
            chain,
        }));
        sys.devices.map_ports(id, DeviceMode::Inout, 0x10, 2);
        (sys, id, fired)
    }

    #[test]
    fn test_event_dispatch_order_and_time() {
        let (mut sys, id, fired) = probe_system(false);
        sys.bus.events.schedule(id, 2, 300);
        sys.bus.events.schedule(id, 1, 100);
        sys.bus.events.add_time(500);
        sys.do_events();

        // Earliest first, each observing its own scheduled time even
        // though the clock had already advanced to 500.
        assert_eq!(*fired.borrow(), vec![(1, 100), (2, 300)]);
        assert_eq!(sys.bus.events.current_time(), 500);
    }

    #[test]
    fn test_reschedule_from_callback_is_drift_free() {
        /// Reschedules itself every 100 ns.
        struct Metronome {
            fired: Trace,
        }
        impl Device for Metronome {
            fn name(&self) -> &'static str {
                "TICK"
            }
            fn reset(&mut self, ctx: &mut Context) {
                ctx.schedule(0, 100);
            }
            fn event(&mut self, ctx: &mut Context, param: EventParam) {
                self.fired.borrow_mut().push((param, ctx.now()));
                ctx.schedule(0, 100);
            }
        }

        let mut sys = System::new(0x100);
        let fired: Trace = Rc::new(RefCell::new(Vec::new()));
        sys.devices.add(Box::new(Metronome {
            fired: fired.clone(),
        }));
        sys.reset_devices();

        // Advance in ragged steps, the way a CPU bills instructions.
        for dt in [137, 93, 260, 41, 77] {
            sys.bus.events.add_time(dt);
            sys.do_events();
        }
        // The tick chain stayed phase-locked to its period.
        let times: Vec<u64> = fired.borrow().iter().map(|&(_, t)| t).collect();
        assert_eq!(times, vec![100, 200, 300, 400, 500, 600]);
    }

    #[test]
    fn test_chained_event_fires_same_pass() {
        let (mut sys, id, fired) = probe_system(true);
        sys.bus.events.schedule(id, 1, 100);
        sys.bus.events.add_time(100);
        sys.do_events();
        assert!(!sys.bus.events.is_pending(id, 2));
        assert_eq!(*fired.borrow(), vec![(1, 100), (2, 100)]);
    }

    #[test]
    fn test_reset_devices_arms_events() {
        let (mut sys, id, _fired) = probe_system(false);
        sys.reset_devices();
        assert!(sys.bus.events.is_pending(id, 99));
    }

    #[test]
    fn test_port_dispatch() {
        let (mut sys, _id, _fired) = probe_system(false);
        assert_eq!(sys.dev_read(0x10), Some(0x10));
        assert_eq!(sys.dev_read(0x11), Some(0x11));
        assert_eq!(sys.dev_read(0x12), None);
        assert!(sys.dev_write(0x10, 0xAA));
        assert!(!sys.dev_write(0x40, 0xAA));
    }

    #[test]
    fn test_sense_default_when_unwired() {
        let (mut sys, _id, _fired) = probe_system(false);
        assert_eq!(sys.sense(7, 1), 1);
        assert_eq!(sys.sense(7, 0), 0);
    }

    #[test]
    fn test_dma_channel() {
        let mut bus = Bus::new(0x100);
        bus.dma.set_pointer(0x20);
        bus.dma_input(0x11);
        bus.dma_input(0x22);
        assert_eq!(bus.memory.cpu_read(0x20), 0x11);
        assert_eq!(bus.memory.cpu_read(0x21), 0x22);
        assert_eq!(bus.dma.pointer(), 0x22);

        bus.dma.set_pointer(0x20);
        assert_eq!(bus.dma_output(), 0x11);
        assert_eq!(bus.dma_output(), 0x22);
    }

    #[test]
    fn test_dma_pointer_wraps() {
        let mut bus = Bus::new(0x10000);
        bus.dma.set_pointer(0xFFFF);
        bus.dma_input(0x5A);
        assert_eq!(bus.dma.pointer(), 0x0000);
    }
}
