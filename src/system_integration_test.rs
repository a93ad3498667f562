//! End-to-end system scenarios: a CPU, the bus, and live peripherals
//! cooperating through the event queue.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bus::System;
use crate::console::BufferedConsole;
use crate::cpu::s2650::S2650;
use crate::cpu::{Cpu, StopCode};
use crate::device::DeviceMode;
use crate::peripherals::cdp1854::{self, Cdp1854};
use crate::peripherals::cdp1878::{self, Cdp1878};
use crate::peripherals::uart::ConsoleHandle;

/// CDP1854 at ports 2/3, like the MS2000 console SLU.
const SLU_BASE: u16 = 2;

fn console_system() -> (System, S2650, Rc<RefCell<BufferedConsole>>) {
    crate::init_test_logging();
    let console = Rc::new(RefCell::new(BufferedConsole::new()));
    let mut sys = System::new(0x8000);
    let mut slu = Cdp1854::new(
        SLU_BASE,
        Some(console.clone() as ConsoleHandle),
        cdp1854::NO_SENSE,
        cdp1854::NO_SENSE,
    );
    slu.attach_interrupt(&mut sys.bus.irq);
    let id = sys.devices.add(Box::new(slu));
    sys.devices
        .map_ports(id, DeviceMode::Inout, SLU_BASE, cdp1854::regs::COUNT);
    let mut cpu = S2650::new();
    cpu.clear(&mut sys);
    sys.reset_devices();
    (sys, cpu, console)
}

fn load(sys: &mut System, base: u16, program: &[u8]) {
    for (i, &b) in program.iter().enumerate() {
        sys.bus.memory.ui_write(base + i as u16, b);
    }
}

/// The classic echo: wait for a character, read it, transmit it, spin.
/// One byte fed into the console keyboard must reappear in the console
/// output within a polling interval plus a character time, with THRE set
/// once the transmitter finishes.
#[test]
fn test_uart_echo() {
    let (mut sys, mut cpu, console) = console_system();
    load(
        &mut sys,
        0,
        &[
            0x57, 0x03, // wait:  REDE,R3 status
            0xF7, 0x01, //        TMI,R3 DA
            0x98, 0x7A, //        BCFR,0 wait
            0x55, 0x02, //        REDE,R1 data
            0xD5, 0x02, //        WRTE,R1 data
            0x1B, 0x7E, // spin:  BCTR,UN spin
        ],
    );
    console.borrow_mut().type_input(&[0x41]);

    assert_eq!(cpu.run(&mut sys, 4000), StopCode::Finished);

    assert_eq!(console.borrow().output(), &[0x41]);
    let sts = sys.dev_read(SLU_BASE + cdp1854::regs::STS).unwrap();
    assert_ne!(sts & cdp1854::sts::THRE, 0);
    // Poll interval + character time at the default 2000 cps.
    assert!(sys.bus.events.current_time() >= 1_000_000);
}

/// Timer one-shot: jam 5 at 1000 ns per count raises STS_A and the
/// interrupt when the count rolls over; a status read plus a control
/// write clears both.
#[test]
fn test_timer_one_shot_scenario() {
    crate::init_test_logging();
    let mut sys = System::new(0x100);
    let mut ctc = Cdp1878::new(cdp1878::NO_SENSE, cdp1878::NO_SENSE, cdp1878::NO_SENSE);
    ctc.set_clock_a(1_000_000);
    ctc.attach_interrupt(&mut sys.bus.irq);
    let id = sys.devices.add(Box::new(ctc));
    sys.devices.map_ports(
        id,
        DeviceMode::Inout,
        cdp1878::ports::BASE,
        cdp1878::ports::COUNT,
    );
    sys.reset_devices();

    sys.dev_write(cdp1878::ports::COUNTER_A_MSB, 0x00);
    sys.dev_write(cdp1878::ports::COUNTER_A_LSB, 0x05);
    sys.dev_write(
        cdp1878::ports::CONTROL_A,
        cdp1878::mode::ONESHOT | cdp1878::ctl::IEN | cdp1878::ctl::START | cdp1878::ctl::JAM,
    );

    // Five counts pass; the rollover (and the interrupt) land on the
    // sixth.
    sys.bus.events.add_time(5000);
    sys.do_events();
    assert!(!sys.bus.irq.is_any_requested());
    sys.bus.events.add_time(1000);
    sys.do_events();
    assert_ne!(
        sys.dev_read(cdp1878::ports::STATUS_A).unwrap() & cdp1878::sts::A,
        0
    );
    assert!(sys.bus.irq.is_any_requested());

    // Status read, then a control write: STS_A and the request go away.
    sys.dev_write(cdp1878::ports::CONTROL_A, cdp1878::mode::NOCHANGE);
    assert_eq!(
        sys.dev_read(cdp1878::ports::STATUS_A).unwrap() & cdp1878::sts::A,
        0
    );
    assert!(!sys.bus.irq.is_any_requested());
}

/// Breakpoint semantics: `run(0)` stops with the PC on the marked
/// address, and a second `run(0)` gets past it before stopping there
/// again.
#[test]
fn test_breakpoint_loop_scenario() {
    let (mut sys, mut cpu, _console) = console_system();
    load(
        &mut sys,
        0,
        &[
            0x05, 0x00, // LODI,R1 0
            0xC0, // NOP            <- breakpoint here
            0x1F, 0x00, 0x00, // BCTA,UN 0
        ],
    );
    sys.bus.memory.set_break(0x02, true);

    assert_eq!(cpu.run(&mut sys, 0), StopCode::Breakpoint);
    assert_eq!(cpu.get_pc(), 0x02);
    let first_stop_time = sys.bus.events.current_time();

    // Without clearing the breakpoint, the loop must come all the way
    // around before stopping at the same place.
    assert_eq!(cpu.run(&mut sys, 0), StopCode::Breakpoint);
    assert_eq!(cpu.get_pc(), 0x02);
    assert!(sys.bus.events.current_time() > first_stop_time);
}

/// The console break key stops the run loop with its own stop code.
#[test]
fn test_console_break_scenario() {
    let (mut sys, mut cpu, console) = console_system();
    load(&mut sys, 0, &[0x1B, 0x7E]); // BCTR,UN self
    console.borrow_mut().press_console_break();

    assert_eq!(cpu.run(&mut sys, 0), StopCode::ConsoleBreak);
    // The break was consumed; a further run just spins out its steps.
    assert_eq!(cpu.run(&mut sys, 10), StopCode::Finished);
}

/// Elapsed virtual time equals the documented cycle costs times the
/// cycle time, across a mix of instructions.
#[test]
fn test_cycle_accounting() {
    let (mut sys, mut cpu, _console) = console_system();
    load(
        &mut sys,
        0,
        &[
            0x05, 0x12, // LODI,R1    2 cycles
            0x85, 0x01, // ADDI,R1    2 cycles
            0x0B, 0x10, // LODR,R3    3 cycles
            0x40, // HALT             2 cycles
        ],
    );
    assert_eq!(cpu.run(&mut sys, 0), StopCode::Halt);
    // 9 processor cycles at 3 us each (1 MHz crystal, 3 clocks/cycle).
    assert_eq!(sys.bus.events.current_time(), 9 * 3000);
}

/// Device events interleave with execution: a UART poll fires between
/// instructions, never mid-instruction, and observes its exact scheduled
/// time.
#[test]
fn test_events_fire_between_instructions() {
    let (mut sys, mut cpu, console) = console_system();
    console.borrow_mut().type_input(b"x");
    // A long spin: each BCTR is 9 us of virtual time.
    load(&mut sys, 0, &[0x1B, 0x7E]);
    cpu.run(&mut sys, 200);
    // 200 steps = 1.8 ms: at least three 500 us polls have fired, and
    // the byte shows up in the receiver with DA set.
    let sts = sys.dev_read(SLU_BASE + cdp1854::regs::STS).unwrap();
    assert_ne!(sts & cdp1854::sts::DA, 0);
    assert_eq!(
        sys.dev_read(SLU_BASE + cdp1854::regs::RBR).unwrap(),
        b'x'
    );
}
