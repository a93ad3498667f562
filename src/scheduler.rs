//! Virtual-time event queue
//!
//! I/O devices use the event queue to schedule something that needs to
//! happen after an interval of simulated time - an I/O done interrupt, a
//! character arriving on a serial port, a floppy seek completing. A device
//! calls [`EventQueue::schedule`] and its `event` callback is invoked, with
//! the parameter it supplied, when that time arrives.
//!
//! A side function of the queue, albeit a critical one, is that it also
//! owns the simulated clock. The CPU core bills the cost of every executed
//! instruction here via [`EventQueue::add_time`], and drains expired events
//! (through `System::do_events`) before each fetch so that every due event
//! fires between instructions.
//!
//! Virtual time is a monotonically increasing nanosecond counter. It never
//! moves backwards; the only way to zero it is [`EventQueue::clear`].

use crate::device::DeviceId;

/// Nanoseconds per second, as a u64 for delay arithmetic.
pub const NS_PER_SEC: u64 = 1_000_000_000;

/// Convert a frequency in Hz to a period in nanoseconds.
#[inline]
pub const fn hz_to_ns(hz: u64) -> u64 {
    NS_PER_SEC / hz
}

/// Convert a period in nanoseconds to a frequency in Hz.
#[inline]
pub const fn ns_to_hz(ns: u64) -> u64 {
    NS_PER_SEC / ns
}

/// Convert milliseconds to nanoseconds.
#[inline]
pub const fn ms_to_ns(ms: u64) -> u64 {
    ms * 1_000_000
}

/// Convert microseconds to nanoseconds.
#[inline]
pub const fn us_to_ns(us: u64) -> u64 {
    us * 1_000
}

/// Opaque per-event parameter, interpreted only by the target device.
pub type EventParam = u32;

/// A pending event. Immutable once enqueued; identity for cancellation and
/// pending tests is the (device, param) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Absolute virtual time at which the event fires
    pub time: u64,
    /// Target device in the system's device map
    pub device: DeviceId,
    /// Parameter handed back to the device's event callback
    pub param: EventParam,
}

/// Schedule events to occur at some simulated time in the future.
#[derive(Debug, Default)]
pub struct EventQueue {
    /// Current simulation time in nanoseconds
    now: u64,
    /// Pending events ordered by time; ties keep insertion (FIFO) order
    queue: Vec<Event>,
}

impl EventQueue {
    /// Create an empty queue with virtual time zero.
    pub fn new() -> Self {
        Self {
            now: 0,
            queue: Vec::new(),
        }
    }

    /// Return the current simulated time in nanoseconds.
    #[inline]
    pub fn current_time(&self) -> u64 {
        self.now
    }

    /// Advance the simulated time by `delta` nanoseconds without
    /// dispatching anything. The CPU calls this after every instruction.
    #[inline]
    pub fn add_time(&mut self, delta: u64) -> u64 {
        self.now += delta;
        self.now
    }

    /// Jump ahead (forward only!) to the specified absolute time.
    pub fn jump_ahead(&mut self, time: u64) -> u64 {
        if time > self.now {
            self.now = time;
        }
        self.now
    }

    /// Return the absolute time of the earliest pending event, or
    /// `u64::MAX` when the queue is empty.
    pub fn next_event_time(&self) -> u64 {
        self.queue.first().map_or(u64::MAX, |ev| ev.time)
    }

    /// Schedule an event for `delay` nanoseconds from now. Multiple events
    /// for the same (device, param) pair may coexist.
    pub fn schedule(&mut self, device: DeviceId, param: EventParam, delay: u64) {
        let ev = Event {
            time: self.now + delay,
            device,
            param,
        };
        // Insert after every event with time <= ev.time so that events at
        // the same timestamp fire in the order they were scheduled.
        let at = self.queue.partition_point(|e| e.time <= ev.time);
        self.queue.insert(at, ev);
    }

    /// Cancel every pending event matching the (device, param) pair.
    /// Silently does nothing if there are none.
    pub fn cancel(&mut self, device: DeviceId, param: EventParam) {
        self.queue
            .retain(|e| !(e.device == device && e.param == param));
    }

    /// True if at least one event matching the (device, param) pair is
    /// still pending.
    pub fn is_pending(&self, device: DeviceId, param: EventParam) -> bool {
        self.queue
            .iter()
            .any(|e| e.device == device && e.param == param)
    }

    /// Cancel every pending event for one device, whatever the
    /// parameter. Device resets use this to leave their scheduler slots
    /// clean.
    pub fn cancel_all_for(&mut self, device: DeviceId) {
        self.queue.retain(|e| e.device != device);
    }

    /// Drop every pending event without touching the virtual time.
    pub fn cancel_all(&mut self) {
        self.queue.clear();
    }

    /// Drop every pending event AND reset the virtual time to zero. This
    /// is the only way the clock ever goes backwards.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.now = 0;
    }

    /// Remove and return the earliest event whose time has arrived, or
    /// `None` if nothing is due yet. `System::do_events` loops on this so
    /// that handlers scheduled by other handlers at an already-expired
    /// time still fire in the same dispatch pass.
    pub fn pop_due(&mut self) -> Option<Event> {
        if self.queue.first()?.time <= self.now {
            Some(self.queue.remove(0))
        } else {
            None
        }
    }

    /// Wind the clock back to an already-passed instant for the duration
    /// of an event callback, so the handler observes the exact time it
    /// was scheduled for and its own `schedule` calls measure from there
    /// rather than from wherever the CPU's instruction boundary landed.
    /// The dispatcher jumps the clock forward again immediately after.
    pub(crate) fn rewind(&mut self, time: u64) {
        debug_assert!(time <= self.now);
        self.now = time;
    }

    /// Number of pending events (diagnostics only).
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when no events are pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
