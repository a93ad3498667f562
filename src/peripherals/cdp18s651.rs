//! RCA CDP18S651 floppy diskette interface
//!
//! The MS2000 development system's disk controller: an NEC uPD765 with an
//! external data separator and some random logic that runs the COSMAC DMA
//! channel, counts transferred bytes and switches the drive motors. The
//! uPD765 emulation lives in [`crate::peripherals::upd765`]; this module
//! is the rest of the board.
//!
//! Port map (the board takes over its whole I/O group; everything else
//! reads 0xFF):
//!
//! | Port | Read          | Write        |
//! |------|---------------|--------------|
//! | 4    | uPD765 status | DMA control  |
//! | 5    | uPD765 data   | uPD765 data  |
//! | 7    | -             | DMA count    |
//!
//! The DMA count register counts 128-byte blocks: writing it loads the
//! block count and resets the byte counter, and when both run out the
//! board asserts Terminal Count at the uPD765. The local interrupt enable
//! gates the CPU interrupt, but the IRQ sense pin sees the uPD765 request
//! regardless.
//!
//! The MS2000 ran exactly one diskette format - 512-byte sectors, 9 per
//! track, 70 tracks, single sided - and MicroDOS knows no other, so all
//! four units get that geometry.

use std::path::Path;

use crate::bus::Context;
use crate::device::Device;
use crate::interrupt::SimpleInterrupt;
use crate::peripherals::upd765::{FdcHost, Upd765};
use crate::scheduler::EventParam;

/// Port assignments.
pub mod ports {
    /// uPD765 main status register (read only)
    pub const STATUS: u16 = 4;
    /// DMA control register (write only)
    pub const DMACTL: u16 = 4;
    /// uPD765 data register (read/write)
    pub const DATA: u16 = 5;
    /// DMA block count (write only)
    pub const DMACNT: u16 = 7;
}

/// DMA control register bits.
pub mod dmactl {
    /// No DMA operation
    pub const NODMA: u8 = 0x00;
    /// DMA read with CRC check
    pub const CRCREAD: u8 = 0x01;
    /// DMA read (no CRC)
    pub const DMAREAD: u8 = 0x02;
    /// DMA write
    pub const DMAWRITE: u8 = 0x03;
    /// Mask for the mode field
    pub const DMAMASK: u8 = 0x03;
    /// Assert uPD765 terminal count
    pub const TC: u8 = 0x04;
    /// Drive motor enable
    pub const MOTOR: u8 = 0x08;
    /// Master interrupt enable
    pub const IE: u8 = 0x10;
}

/// The DMACNT register counts in 128-byte blocks.
pub const DMA_BLOCK_SIZE: u8 = 128;

/// MicroDOS diskette geometry.
pub const SECTOR_SIZE: u16 = 512;
pub const SECTORS_PER_TRACK: u16 = 9;
pub const TRACKS_PER_DISK: u16 = 70;
pub const NUMBER_OF_HEADS: u16 = 1;

/// Sense pin index meaning "not wired".
pub const NO_SENSE: u16 = u16::MAX;

/// The board-level state: DMA plumbing and the interrupt gate. Split from
/// the uPD765 so the controller can call back into it mid-transfer.
struct BoardDma {
    dma_control: u8,
    dma_count_h: u8,
    dma_count_l: u8,
    /// The raw uPD765 interrupt request (before the IE gate)
    irq: bool,
    irq_mask: u32,
}

impl BoardDma {
    /// Count one transferred byte; true when the programmed count is
    /// exhausted and Terminal Count should be asserted.
    fn count_byte(&mut self) -> bool {
        self.dma_count_l = self.dma_count_l.wrapping_sub(1);
        if self.dma_count_l != 0 {
            return false;
        }
        self.dma_count_l = DMA_BLOCK_SIZE;
        self.dma_count_h = self.dma_count_h.wrapping_sub(1);
        self.dma_count_h == 0
    }
}

impl FdcHost for BoardDma {
    fn dma_read(&mut self, ctx: &mut Context) -> (u8, bool) {
        let mode = self.dma_control & dmactl::DMAMASK;
        if mode != dmactl::DMAREAD && mode != dmactl::CRCREAD {
            return (0xFF, false);
        }
        let data = ctx.bus.dma_output();
        (data, self.count_byte())
    }

    fn dma_write(&mut self, ctx: &mut Context, data: u8) -> bool {
        if self.dma_control & dmactl::DMAMASK != dmactl::DMAWRITE {
            return false;
        }
        ctx.bus.dma_input(data);
        self.count_byte()
    }

    fn interrupt(&mut self, ctx: &mut Context, asserted: bool) {
        self.irq = asserted;
        let gated = asserted && self.dma_control & dmactl::IE != 0;
        if self.irq_mask != 0 {
            ctx.bus.irq.request(self.irq_mask, gated);
        }
    }
}

/// The complete floppy interface.
pub struct Cdp18s651 {
    fdc: Upd765,
    board: BoardDma,
    sense_irq: u16,
    sense_motor: u16,
}

impl Cdp18s651 {
    /// Create the interface with the fixed MicroDOS geometry on all four
    /// units. The IRQ and motor-on outputs can each be wired to a CPU
    /// sense pin.
    pub fn new(sense_irq: u16, sense_motor: u16) -> Self {
        let mut fdc = Upd765::new();
        for unit in 0..crate::peripherals::upd765::MAX_UNIT {
            fdc.set_geometry(
                unit,
                SECTOR_SIZE,
                SECTORS_PER_TRACK,
                TRACKS_PER_DISK,
                NUMBER_OF_HEADS,
            );
        }
        Self {
            fdc,
            board: BoardDma {
                dma_control: 0,
                dma_count_h: 0,
                dma_count_l: 0,
                irq: false,
                irq_mask: 0,
            },
            sense_irq,
            sense_motor,
        }
    }

    /// Attach the interrupt output to the wire-OR controller.
    pub fn attach_interrupt(&mut self, irq: &mut SimpleInterrupt) {
        self.board.irq_mask = irq.allocate_mask();
    }

    /// Hand the interrupt slot back (detaching the device).
    pub fn release_interrupt(&mut self, irq: &mut SimpleInterrupt) {
        if self.board.irq_mask != 0 {
            irq.release_mask(self.board.irq_mask);
            self.board.irq_mask = 0;
        }
    }

    /// Attach a drive to an image file.
    pub fn attach(&mut self, unit: usize, path: &Path, write_lock: bool) -> bool {
        self.fdc.attach(unit, path, write_lock)
    }

    /// Direct access to the controller, for configuration and state
    /// inspection.
    pub fn fdc_mut(&mut self) -> &mut Upd765 {
        &mut self.fdc
    }

    pub fn fdc(&self) -> &Upd765 {
        &self.fdc
    }

    /// True while the drive motor is switched on.
    pub fn is_motor_on(&self) -> bool {
        self.board.dma_control & dmactl::MOTOR != 0
    }
}

impl Device for Cdp18s651 {
    fn name(&self) -> &'static str {
        "FDC"
    }

    fn reset(&mut self, ctx: &mut Context) {
        self.board.dma_control = 0;
        self.board.dma_count_h = 0;
        self.board.dma_count_l = 0;
        self.board.interrupt(ctx, false);
        self.fdc.reset();
        // Stale transfer or seek events must not outlive the reset.
        ctx.bus.events.cancel_all_for(ctx.id);
    }

    fn read(&mut self, ctx: &mut Context, port: u16) -> u8 {
        match port {
            ports::DATA => self.fdc.read_data(ctx, &mut self.board),
            ports::STATUS => self.fdc.read_status(),
            _ => 0xFF,
        }
    }

    fn write(&mut self, ctx: &mut Context, port: u16, data: u8) {
        match port {
            ports::DATA => self.fdc.write_data(ctx, &mut self.board, data),
            ports::DMACNT => {
                log::debug!("CDP18S651 DMACNT={data}");
                self.board.dma_count_h = data;
                self.board.dma_count_l = DMA_BLOCK_SIZE;
            }
            ports::DMACTL => {
                log::debug!("CDP18S651 DMACTL=0x{data:02X}");
                let old = self.board.dma_control;
                self.board.dma_control = data;
                // An IE flip re-gates the pending interrupt request.
                if (old ^ data) & dmactl::IE != 0 {
                    let level = self.board.irq;
                    self.board.interrupt(ctx, level);
                }
                // A 0-to-1 edge on TC aborts whatever is in progress.
                if old & dmactl::TC == 0 && data & dmactl::TC != 0 {
                    self.fdc.terminal_count();
                }
            }
            _ => {}
        }
    }

    fn sense(&mut self, _ctx: &mut Context, pin: u16, default: u8) -> u8 {
        if pin == self.sense_irq {
            //   The IRQ flag output bypasses the interrupt enable; the
            // firmware polls it while interrupts are masked.
            self.board.irq as u8
        } else if pin == self.sense_motor {
            self.is_motor_on() as u8
        } else {
            default
        }
    }

    fn event(&mut self, ctx: &mut Context, param: EventParam) {
        self.fdc.event(ctx, &mut self.board, param);
    }

    fn show(&self) -> String {
        let mode = match self.board.dma_control & dmactl::DMAMASK {
            dmactl::CRCREAD => "CRC READ",
            dmactl::DMAREAD => "DMA READ",
            dmactl::DMAWRITE => "DMA WRITE",
            _ => "NO DMA",
        };
        format!(
            "CDP18S651 Floppy Diskette Interface\n  DMACTL=0x{:02X} ({mode}), DMACNT={}/{}, IRQ={}\n\n{}",
            self.board.dma_control,
            self.board.dma_count_h,
            self.board.dma_count_l,
            self.board.irq as u8,
            self.fdc.show()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::System;
    use crate::device::{DeviceId, DeviceMode};
    use crate::peripherals::upd765::{cmd, st0, sts, ROTATIONAL_DELAY, TRANSFER_DELAY};

    fn fdc_system() -> (System, DeviceId, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut sys = System::new(0x10000);
        let mut fdc = Cdp18s651::new(10, 11);
        fdc.attach_interrupt(&mut sys.bus.irq);
        assert!(fdc.attach(0, &dir.path().join("unit0.img"), false));
        fdc.fdc_mut().set_step_delay(1_000_000);
        let id = sys.devices.add(Box::new(fdc));
        sys.devices.map_ports(id, DeviceMode::Inout, 2, 6);
        sys.devices.map_sense(id, 10);
        sys.devices.map_sense(id, 11);
        (sys, id, dir)
    }

    fn run(sys: &mut System, dt: u64) {
        sys.bus.events.add_time(dt);
        sys.do_events();
    }

    fn send_command(sys: &mut System, bytes: &[u8]) {
        for &b in bytes {
            sys.dev_write(ports::DATA, b);
        }
    }

    #[test]
    fn test_status_and_data_ports() {
        let (mut sys, _id, _dir) = fdc_system();
        assert_eq!(
            sys.dev_read(ports::STATUS).unwrap() & sts::DATA_REQUEST,
            sts::DATA_REQUEST
        );
        // Unused ports in the group float.
        assert_eq!(sys.dev_read(3).unwrap(), 0xFF);
    }

    #[test]
    fn test_motor_and_irq_sense() {
        let (mut sys, _id, _dir) = fdc_system();
        assert_eq!(sys.sense(11, 0), 0);
        sys.dev_write(ports::DMACTL, dmactl::MOTOR);
        assert_eq!(sys.sense(11, 0), 1);

        // A completed seek raises the IRQ flag even with IE off.
        send_command(&mut sys, &[cmd::SEEK, 0x00, 2]);
        run(&mut sys, 2_000_000);
        assert_eq!(sys.sense(10, 0), 1);
        assert!(!sys.bus.irq.is_any_requested());
    }

    #[test]
    fn test_ie_gates_the_cpu_interrupt() {
        let (mut sys, _id, _dir) = fdc_system();
        sys.dev_write(ports::DMACTL, dmactl::IE);
        send_command(&mut sys, &[cmd::SEEK, 0x00, 2]);
        run(&mut sys, 2_000_000);
        assert!(sys.bus.irq.is_any_requested());

        // Dropping IE drops the request; the raw flag stays up.
        sys.dev_write(ports::DMACTL, 0);
        assert!(!sys.bus.irq.is_any_requested());
        assert_eq!(sys.sense(10, 0), 1);

        // And raising it again brings the request back.
        sys.dev_write(ports::DMACTL, dmactl::IE);
        assert!(sys.bus.irq.is_any_requested());
    }

    #[test]
    fn test_dma_read_sector_to_memory() {
        let (mut sys, id, dir) = fdc_system();
        // Plant a pattern in C/H/S 0/0/1 through a second image handle.
        let pattern: Vec<u8> = (0..512).map(|i| (255 - i % 256) as u8).collect();
        {
            let mut img = crate::diskimage::DiskImage::new(512);
            img.set_geometry(512, 9, 70, 1);
            img.open(&dir.path().join("unit0.img")).unwrap();
            img.write_sector(0, 0, 1, &pattern).unwrap();
        }

        // Program the DMA: write direction (FDC to memory), 4 blocks of
        // 128 = one 512-byte sector, target address 0x2000.
        sys.bus.dma.set_pointer(0x2000);
        sys.dev_write(ports::DMACTL, dmactl::DMAWRITE);
        sys.dev_write(ports::DMACNT, 4);
        send_command(
            &mut sys,
            &[cmd::READ_SECTOR | cmd::MFM_MODE, 0x00, 0, 0, 1, 2, 9, 0x2A, 0xFF],
        );

        run(&mut sys, ROTATIONAL_DELAY + 512 * TRANSFER_DELAY);
        // Terminal count ended the transfer after exactly one sector.
        for (i, &expect) in pattern.iter().enumerate() {
            assert_eq!(sys.bus.memory.cpu_read(0x2000 + i as u16), expect);
        }
        assert_eq!(sys.bus.memory.cpu_read(0x2200), 0);
        assert_eq!(sys.bus.dma.pointer(), 0x2200);

        // The result packet reports a normal termination.
        let st = sys.dev_read(ports::DATA).unwrap();
        assert_eq!(st & 0xC0, st0::IC_NORMAL);
        let _ = id;
    }

    #[test]
    fn test_dma_write_sector_from_memory() {
        let (mut sys, _id, dir) = fdc_system();
        let payload: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        for (i, &b) in payload.iter().enumerate() {
            sys.bus.memory.ui_write(0x3000 + i as u16, b);
        }

        sys.bus.dma.set_pointer(0x3000);
        sys.dev_write(ports::DMACTL, dmactl::DMAREAD);
        sys.dev_write(ports::DMACNT, 4);
        send_command(
            &mut sys,
            &[cmd::WRITE_SECTOR | cmd::MFM_MODE, 0x00, 0, 0, 2, 2, 9, 0x2A, 0xFF],
        );
        run(&mut sys, ROTATIONAL_DELAY + 512 * TRANSFER_DELAY);

        let mut img = crate::diskimage::DiskImage::new(512);
        img.set_geometry(512, 9, 70, 1);
        img.open(&dir.path().join("unit0.img")).unwrap();
        let mut back = vec![0u8; 512];
        img.read_sector(0, 0, 2, &mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_tc_bit_aborts_command_entry() {
        let (mut sys, _id, _dir) = fdc_system();
        send_command(&mut sys, &[cmd::READ_SECTOR, 0x00, 0]);
        assert_ne!(sys.dev_read(ports::STATUS).unwrap() & sts::FDC_BUSY, 0);
        sys.dev_write(ports::DMACTL, dmactl::TC);
        assert_eq!(sys.dev_read(ports::STATUS).unwrap() & sts::FDC_BUSY, 0);
        // Only the 0-to-1 edge pulses terminal count; rewriting the same
        // value is harmless.
        sys.dev_write(ports::DMACTL, dmactl::TC);
    }

    #[test]
    fn test_reset_clears_board_and_events() {
        let (mut sys, id, _dir) = fdc_system();
        sys.dev_write(ports::DMACTL, dmactl::IE | dmactl::MOTOR);
        send_command(&mut sys, &[cmd::SEEK, 0x00, 30]);
        sys.reset_devices();
        assert_eq!(sys.sense(11, 0), 0);
        assert!(!sys.bus.irq.is_any_requested());
        // The seek-done event died with the reset.
        run(&mut sys, 60_000_000);
        assert_eq!(sys.sense(10, 0), 0);
        let _ = id;
    }
}
