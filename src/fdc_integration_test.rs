//! End-to-end floppy scenarios: the CDP18S651 board driven through its
//! registers, with DMA in and out of main memory.

use crate::bus::System;
use crate::device::DeviceMode;
use crate::peripherals::cdp18s651::{dmactl, ports, Cdp18s651, DMA_BLOCK_SIZE};
use crate::peripherals::upd765::{cmd, st0, st1, sts, ROTATIONAL_DELAY, TRANSFER_DELAY};

const SENSE_IRQ: u16 = 10;
const SENSE_MOTOR: u16 = 11;
const STEP_DELAY: u64 = 1_000_000;

struct Machine {
    sys: System,
    _dir: tempfile::TempDir,
}

impl Machine {
    /// An MS2000-flavored setup: 64K of RAM and the floppy board with
    /// unit 0 attached to a fresh image.
    fn new() -> Self {
        crate::init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let mut sys = System::new(0x10000);
        let mut board = Cdp18s651::new(SENSE_IRQ, SENSE_MOTOR);
        board.attach_interrupt(&mut sys.bus.irq);
        assert!(board.attach(0, &dir.path().join("unit0.img"), false));
        board.fdc_mut().set_step_delay(STEP_DELAY);
        let fdc = sys.devices.add(Box::new(board));
        sys.devices.map_ports(fdc, DeviceMode::Inout, 2, 6);
        sys.devices.map_sense(fdc, SENSE_IRQ);
        sys.devices.map_sense(fdc, SENSE_MOTOR);
        sys.reset_devices();
        Self { sys, _dir: dir }
    }

    fn run(&mut self, dt: u64) {
        self.sys.bus.events.add_time(dt);
        self.sys.do_events();
    }

    fn command(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.sys.dev_write(ports::DATA, b);
        }
    }

    fn result(&mut self, n: usize) -> Vec<u8> {
        (0..n)
            .map(|_| self.sys.dev_read(ports::DATA).unwrap())
            .collect()
    }

    fn status(&mut self) -> u8 {
        self.sys.dev_read(ports::STATUS).unwrap()
    }

    /// Program the DMA engine: direction, block count, memory address.
    fn setup_dma(&mut self, mode: u8, blocks: u8, addr: u16) {
        self.sys.bus.dma.set_pointer(addr);
        self.sys
            .dev_write(ports::DMACTL, mode | dmactl::MOTOR | dmactl::IE);
        self.sys.dev_write(ports::DMACNT, blocks);
    }

    /// Seek and consume the completion interrupt via SENSE INTERRUPT.
    fn seek(&mut self, track: u8) {
        self.command(&[cmd::SEEK, 0x00, track]);
        self.run(70 * STEP_DELAY);
        assert_eq!(self.sys.sense(SENSE_IRQ, 0), 1);
        self.command(&[cmd::SENSE_INTERRUPT]);
        let result = self.result(2);
        assert_eq!(result[0], st0::SEEK_END);
        assert_eq!(result[1], track);
    }
}

/// Scenario: SEEK to track 40, wait out the stepping, then SENSE
/// INTERRUPT reports SEEK_END for drive 0 at track 40.
#[test]
fn test_seek_then_sense_interrupt() {
    let mut m = Machine::new();
    m.command(&[cmd::SEEK, 0x00, 40]);

    // Stepping is in progress: drive busy, controller free.
    let status = m.status();
    assert_ne!(status & sts::FDD0_BUSY, 0);
    assert_eq!(status & sts::FDC_BUSY, 0);
    assert_eq!(m.sys.sense(SENSE_IRQ, 0), 0);

    m.run(40 * STEP_DELAY);
    assert_eq!(m.sys.sense(SENSE_IRQ, 0), 1);
    assert_eq!(m.status() & sts::FDD0_BUSY, 0);

    m.command(&[cmd::SENSE_INTERRUPT]);
    let result = m.result(2);
    assert_eq!(result[0], st0::SEEK_END | 0x00);
    assert_eq!(result[1], 40);
    // The data register read dropped the interrupt line.
    assert_eq!(m.sys.sense(SENSE_IRQ, 0), 0);
}

/// Scenario: READ SECTOR with DMA and terminal count after exactly one
/// sector delivers 512 bytes in order and a normal-termination result.
#[test]
fn test_read_sector_via_dma() {
    let mut m = Machine::new();
    // Pattern 0,1,2,...,511 (mod 256) in C/H/S 0/0/1.
    let pattern: Vec<u8> = (0..512u16).map(|i| i as u8).collect();
    write_sector_directly(&mut m, 0, 0, 1, &pattern);

    m.setup_dma(dmactl::DMAWRITE, 4, 0x1000);
    m.command(&[
        cmd::READ_SECTOR | cmd::MFM_MODE,
        0x00,
        0,
        0,
        1,
        2,
        9,
        0x2A,
        0xFF,
    ]);
    assert_ne!(m.status() & sts::FDC_BUSY, 0);

    m.run(ROTATIONAL_DELAY + 512 * TRANSFER_DELAY);

    // Exactly 512 bytes landed, in order.
    for (i, &expect) in pattern.iter().enumerate() {
        assert_eq!(m.sys.bus.memory.cpu_read(0x1000 + i as u16), expect);
    }
    assert_eq!(m.sys.bus.dma.pointer(), 0x1000 + 512);
    // DMA terminal count ended the command; the result shows a normal
    // termination with the final sector still 1.
    assert!(m.sys.bus.irq.is_any_requested());
    let result = m.result(7);
    assert_eq!(result[0] & 0xC0, st0::IC_NORMAL);
    assert_eq!(result[1], 0);
    assert_eq!(result[5], 1);
    assert_eq!(m.status() & sts::FDC_BUSY, 0);
}

/// Scenario: write a sector out of memory, read it back into a different
/// buffer, and compare the two memory regions.
#[test]
fn test_write_then_read_round_trip() {
    let mut m = Machine::new();
    let payload: Vec<u8> = (0..512u32).map(|i| (i * 13 % 256) as u8).collect();
    for (i, &b) in payload.iter().enumerate() {
        m.sys.bus.memory.ui_write(0x2000 + i as u16, b);
    }

    m.seek(5);

    // WRITE SECTOR C=5 H=0 R=3 from 0x2000.
    m.setup_dma(dmactl::DMAREAD, 4, 0x2000);
    m.command(&[
        cmd::WRITE_SECTOR | cmd::MFM_MODE,
        0x00,
        5,
        0,
        3,
        2,
        9,
        0x2A,
        0xFF,
    ]);
    m.run(ROTATIONAL_DELAY + 512 * TRANSFER_DELAY);
    let result = m.result(7);
    assert_eq!(result[0] & 0xC0, st0::IC_NORMAL);

    // READ it back to 0x4000.
    m.setup_dma(dmactl::DMAWRITE, 4, 0x4000);
    m.command(&[
        cmd::READ_SECTOR | cmd::MFM_MODE,
        0x00,
        5,
        0,
        3,
        2,
        9,
        0x2A,
        0xFF,
    ]);
    m.run(ROTATIONAL_DELAY + 512 * TRANSFER_DELAY);
    let result = m.result(7);
    assert_eq!(result[0] & 0xC0, st0::IC_NORMAL);

    for i in 0..512u16 {
        assert_eq!(
            m.sys.bus.memory.cpu_read(0x2000 + i),
            m.sys.bus.memory.cpu_read(0x4000 + i),
        );
    }
}

/// A multi-sector read without terminal count runs to the end of the
/// cylinder and reports it.
#[test]
fn test_multi_sector_read_to_end_of_cylinder() {
    let mut m = Machine::new();
    for sector in 8..=9 {
        let fill: Vec<u8> = vec![sector as u8; 512];
        write_sector_directly(&mut m, 0, 0, sector, &fill);
    }

    // A generous DMA count: the cylinder ends before it does.
    m.setup_dma(dmactl::DMAWRITE, 255, 0x1000);
    m.command(&[
        cmd::READ_SECTOR | cmd::MFM_MODE,
        0x00,
        0,
        0,
        8,
        2,
        9,
        0x2A,
        0xFF,
    ]);
    m.run(2 * ROTATIONAL_DELAY + 2 * 512 * TRANSFER_DELAY + ROTATIONAL_DELAY);

    let result = m.result(7);
    assert_eq!(result[0] & 0xC0, st0::IC_NORMAL);
    assert_eq!(result[1] & st1::END_OF_CYL, st1::END_OF_CYL);
    // Sectors 8 and 9 both arrived.
    assert_eq!(m.sys.bus.memory.cpu_read(0x1000), 8);
    assert_eq!(m.sys.bus.memory.cpu_read(0x1000 + 511), 8);
    assert_eq!(m.sys.bus.memory.cpu_read(0x1000 + 512), 9);
    assert_eq!(m.sys.bus.memory.cpu_read(0x1000 + 1023), 9);
}

/// The main status register tracks the controller phases: DATA_OUT
/// appears only while results are waiting.
#[test]
fn test_main_status_phases() {
    let mut m = Machine::new();
    assert_eq!(m.status(), sts::DATA_REQUEST);

    // Mid-command: still accepting bytes, controller busy.
    m.command(&[cmd::SENSE_DRIVE_STATUS]);
    let status = m.status();
    assert_ne!(status & sts::FDC_BUSY, 0);
    assert_ne!(status & sts::DATA_REQUEST, 0);
    assert_eq!(status & sts::DATA_OUT, 0);

    // Result phase: data flows outward.
    m.command(&[0x00]);
    let status = m.status();
    assert_ne!(status & sts::DATA_OUT, 0);
    assert_ne!(status & sts::DATA_REQUEST, 0);

    m.result(1);
    assert_eq!(m.status(), sts::DATA_REQUEST);
}

/// An unimplemented opcode answers INVALID COMMAND without interrupting.
#[test]
fn test_unimplemented_command_scenario() {
    let mut m = Machine::new();
    m.sys.dev_write(ports::DMACTL, dmactl::IE);
    m.command(&[cmd::READ_SECTOR_ID, 0x00]);
    assert!(!m.sys.bus.irq.is_any_requested());
    let result = m.result(1);
    assert_eq!(result[0] & 0xC0, st0::IC_INVCMD);
}

/// The DMA counter asserts terminal count mid-transfer: a two-block
/// count stops a sector read after 256 bytes.
#[test]
fn test_short_dma_count_truncates_transfer() {
    let mut m = Machine::new();
    let pattern: Vec<u8> = (0..512u16).map(|i| (i ^ 0x55) as u8).collect();
    write_sector_directly(&mut m, 0, 0, 1, &pattern);

    m.setup_dma(dmactl::DMAWRITE, 2, 0x1000);
    m.command(&[
        cmd::READ_SECTOR | cmd::MFM_MODE,
        0x00,
        0,
        0,
        1,
        2,
        9,
        0x2A,
        0xFF,
    ]);
    m.run(ROTATIONAL_DELAY + 512 * TRANSFER_DELAY);

    let result = m.result(7);
    assert_eq!(result[0] & 0xC0, st0::IC_NORMAL);
    // Exactly 2 * 128 bytes were stored.
    assert_eq!(
        m.sys.bus.dma.pointer(),
        0x1000 + 2 * DMA_BLOCK_SIZE as u16
    );
    assert_eq!(m.sys.bus.memory.cpu_read(0x1000 + 255), pattern[255]);
    assert_eq!(m.sys.bus.memory.cpu_read(0x1000 + 256), 0);
}

/// Reset during a pending seek leaves no stale events or requests.
#[test]
fn test_reset_is_idempotent() {
    let mut m = Machine::new();
    m.sys.dev_write(ports::DMACTL, dmactl::IE | dmactl::MOTOR);
    m.command(&[cmd::SEEK, 0x00, 60]);
    m.sys.reset_devices();
    m.sys.reset_devices();
    assert!(m.sys.bus.events.is_empty());
    assert!(!m.sys.bus.irq.is_any_requested());
    assert_eq!(m.sys.sense(SENSE_MOTOR, 0), 0);
    assert_eq!(m.status(), sts::DATA_REQUEST);
}

/// Plant sector contents by writing the image file behind the board's
/// back, through a second handle on the same file.
fn write_sector_directly(m: &mut Machine, cyl: u16, head: u16, sector: u16, data: &[u8]) {
    let mut img = crate::diskimage::DiskImage::new(512);
    img.set_geometry(512, 9, 70, 1);
    img.open(&m._dir.path().join("unit0.img")).unwrap();
    img.write_sector(cyl, head, sector, data).unwrap();
}
