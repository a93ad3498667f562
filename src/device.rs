//! Peripheral device contract and binding tables
//!
//! Every peripheral implements the [`Device`] trait: reset, port-space
//! read/write, sense-pin polling, flag-pin notification, and the event
//! callback dispatched by the scheduler. Devices never touch memory or CPU
//! state directly - everything goes through the [`crate::bus::Context`]
//! they are handed, which carries the scheduler, the interrupt line, the
//! DMA channel and the device's own identity.
//!
//! # Data flow direction
//!
//! Devices may be input only, output only, or both ("INOUT"). The
//! designation refers to register access, not the device itself: a printer
//! is INOUT because it has writable control registers and a readable
//! status register. It is perfectly legal for two different devices to
//! share a port number as long as one is input and the other is output -
//! think LEDs and switches on the same address.
//!
//! # Sense and flags
//!
//! Besides registers, devices may drive a sense output (a single-bit CPU
//! input, like SENSE A/B on the SC/MP or the 2650 SENSE pin) and receive a
//! flag input (a single-bit CPU output). Bindings for both are unique per
//! pin.

use std::collections::HashMap;

use crate::bus::Context;
use crate::scheduler::EventParam;

/// Stable handle for a registered device.
pub type DeviceId = usize;

/// Register-access direction of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Registers may only be read
    Input,
    /// Registers may only be written
    Output,
    /// Registers respond to both reads and writes
    Inout,
}

/// The capability set every peripheral implements.
pub trait Device {
    /// Short identifier for messages and state dumps (e.g. "SLU", "FDC").
    fn name(&self) -> &'static str;

    /// Restore power-on state. Required to re-arm any always-on polling
    /// events and to leave stale scheduler entries cancelled.
    fn reset(&mut self, ctx: &mut Context);

    /// Port-space read. Called only for ports inside the device's
    /// registered range.
    fn read(&mut self, ctx: &mut Context, port: u16) -> u8 {
        let _ = (ctx, port);
        0xFF
    }

    /// Port-space write. Called only for ports inside the device's
    /// registered range.
    fn write(&mut self, ctx: &mut Context, port: u16, value: u8) {
        let _ = (ctx, port, value);
    }

    /// Current level of an output wired to a CPU sense input.
    fn sense(&mut self, ctx: &mut Context, pin: u16, default: u8) -> u8 {
        let _ = (ctx, pin);
        default
    }

    /// A CPU flag output wired to this device changed level.
    fn flag(&mut self, ctx: &mut Context, pin: u16, level: u8) {
        let _ = (ctx, pin, level);
    }

    /// Dispatch point from the event queue.
    fn event(&mut self, ctx: &mut Context, param: EventParam);

    /// Human-readable state dump for diagnostics.
    fn show(&self) -> String {
        format!("{}: no state dump implemented", self.name())
    }
}

/// Binding tables mapping ports, sense pins and flag pins to devices.
///
/// All bindings are established at system construction; a conflicting
/// claim is a configuration error and panics immediately rather than
/// producing a half-wired machine.
#[derive(Default)]
pub struct DeviceMap {
    devices: Vec<Box<dyn Device>>,
    inputs: HashMap<u16, DeviceId>,
    outputs: HashMap<u16, DeviceId>,
    senses: HashMap<u16, DeviceId>,
    flags: HashMap<u16, DeviceId>,
}

impl DeviceMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and return its handle. The device serves no
    /// ports until `map_ports` (and friends) bind it.
    pub fn add(&mut self, device: Box<dyn Device>) -> DeviceId {
        self.devices.push(device);
        self.devices.len() - 1
    }

    /// Bind `count` consecutive ports starting at `first` to `id`.
    ///
    /// # Panics
    /// Panics if any port in the range is already claimed for the same
    /// direction - two input devices on one port is a configuration
    /// error.
    pub fn map_ports(&mut self, id: DeviceId, mode: DeviceMode, first: u16, count: u16) {
        assert!(id < self.devices.len(), "unknown device id {id}");
        for port in first..first + count {
            if mode != DeviceMode::Output {
                let old = self.inputs.insert(port, id);
                assert!(old.is_none(), "input port {port:#06X} claimed twice");
            }
            if mode != DeviceMode::Input {
                let old = self.outputs.insert(port, id);
                assert!(old.is_none(), "output port {port:#06X} claimed twice");
            }
        }
    }

    /// Bind a CPU sense input pin to `id`.
    ///
    /// # Panics
    /// Panics if the pin is already assigned.
    pub fn map_sense(&mut self, id: DeviceId, pin: u16) {
        assert!(id < self.devices.len(), "unknown device id {id}");
        let old = self.senses.insert(pin, id);
        assert!(old.is_none(), "sense pin {pin} assigned twice");
    }

    /// Bind a CPU flag output pin to `id`.
    ///
    /// # Panics
    /// Panics if the pin is already assigned.
    pub fn map_flag(&mut self, id: DeviceId, pin: u16) {
        assert!(id < self.devices.len(), "unknown device id {id}");
        let old = self.flags.insert(pin, id);
        assert!(old.is_none(), "flag pin {pin} assigned twice");
    }

    /// Device serving reads at `port`, if any.
    pub fn input_at(&self, port: u16) -> Option<DeviceId> {
        self.inputs.get(&port).copied()
    }

    /// Device serving writes at `port`, if any.
    pub fn output_at(&self, port: u16) -> Option<DeviceId> {
        self.outputs.get(&port).copied()
    }

    /// Device wired to sense pin `pin`, if any.
    pub fn sense_at(&self, pin: u16) -> Option<DeviceId> {
        self.senses.get(&pin).copied()
    }

    /// Device wired to flag pin `pin`, if any.
    pub fn flag_at(&self, pin: u16) -> Option<DeviceId> {
        self.flags.get(&pin).copied()
    }

    /// Mutable access to a registered device.
    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut (dyn Device + '_)> {
        match self.devices.get_mut(id) {
            Some(dev) => Some(dev.as_mut()),
            None => None,
        }
    }

    /// Shared access to a registered device.
    pub fn get(&self, id: DeviceId) -> Option<&dyn Device> {
        self.devices.get(id).map(|dev| dev.as_ref())
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True when no devices are registered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;

    struct Dummy;
    impl Device for Dummy {
        fn name(&self) -> &'static str {
            "DUMMY"
        }
        fn reset(&mut self, _ctx: &mut Context) {}
        fn event(&mut self, _ctx: &mut Context, _param: EventParam) {}
    }

    #[test]
    fn test_port_binding() {
        let mut map = DeviceMap::new();
        let a = map.add(Box::new(Dummy));
        let b = map.add(Box::new(Dummy));
        map.map_ports(a, DeviceMode::Inout, 2, 2);
        map.map_ports(b, DeviceMode::Input, 4, 1);

        assert_eq!(map.input_at(2), Some(a));
        assert_eq!(map.output_at(3), Some(a));
        assert_eq!(map.input_at(4), Some(b));
        assert_eq!(map.output_at(4), None);
        assert_eq!(map.input_at(9), None);
    }

    #[test]
    fn test_shared_port_opposite_directions() {
        // LEDs (output) and switches (input) on the same port is legal.
        let mut map = DeviceMap::new();
        let leds = map.add(Box::new(Dummy));
        let switches = map.add(Box::new(Dummy));
        map.map_ports(leds, DeviceMode::Output, 4, 1);
        map.map_ports(switches, DeviceMode::Input, 4, 1);
        assert_eq!(map.output_at(4), Some(leds));
        assert_eq!(map.input_at(4), Some(switches));
    }

    #[test]
    #[should_panic]
    fn test_conflicting_input_ports_panic() {
        let mut map = DeviceMap::new();
        let a = map.add(Box::new(Dummy));
        let b = map.add(Box::new(Dummy));
        map.map_ports(a, DeviceMode::Input, 2, 1);
        map.map_ports(b, DeviceMode::Inout, 2, 1);
    }

    #[test]
    #[should_panic]
    fn test_conflicting_sense_pins_panic() {
        let mut map = DeviceMap::new();
        let a = map.add(Box::new(Dummy));
        let b = map.add(Box::new(Dummy));
        map.map_sense(a, 3);
        map.map_sense(b, 3);
    }

    #[test]
    fn test_default_device_methods() {
        let mut map = DeviceMap::new();
        let a = map.add(Box::new(Dummy));
        let mut bus = Bus::new(0x100);
        let mut ctx = Context::new(&mut bus, a);
        let dev = map.get_mut(a).unwrap();
        assert_eq!(dev.read(&mut ctx, 0), 0xFF);
        dev.write(&mut ctx, 0, 0x55);
        assert_eq!(dev.sense(&mut ctx, 0, 1), 1);
        dev.flag(&mut ctx, 0, 1);
        assert!(dev.show().contains("DUMMY"));
    }
}
