//! NEC uPD765 floppy diskette controller
//!
//! The command protocol works in phases. In the command phase the host
//! writes bytes to the data register; the low five bits of the first byte
//! select the command and fix how many more bytes follow (1, 2, 3, 4, 6
//! or 9). In the execution phase the controller seeks, transfers data or
//! gathers status. In the result phase it serves result bytes one at a
//! time until the host has read them all and the state returns to IDLE.
//!
//! Command summary (from the uPD765 datasheet):
//!
//! | Opcode | Name              | Cmd | Result | Notes |
//! |--------|-------------------|-----|--------|-------|
//! | 0x03   | SPECIFY           | 3   | none   | no interrupt |
//! | 0x04   | SENSE DRIVE STATUS| 2   | 1 (ST3)| |
//! | 0x07   | RECALIBRATE       | 2   | none   | interrupt when done |
//! | 0x08   | SENSE INTERRUPT   | 1   | 2      | ST0 + track |
//! | 0x0F   | SEEK              | 3   | none   | interrupt when done |
//! | 0x06   | READ SECTOR       | 9   | 7      | MT/MF/SK modifiers |
//! | 0x05   | WRITE SECTOR      | 9   | 7      | |
//!
//! READ TRACK, the DELETED variants, READ ID, FORMAT TRACK and the SCANs
//! answer INVALID COMMAND.
//!
//! The chip does not count transferred bytes - it keeps moving data until
//! the host asserts Terminal Count. Seeks overlap: up to four units can be
//! stepping at once while the controller accepts further commands, and the
//! host learns which one finished by issuing SENSE INTERRUPT afterward.
//!
//! This is not a [`crate::device::Device`]; a board-level adapter (the
//! CDP18S651 here) wraps it, forwards register access, and implements the
//! [`FdcHost`] callbacks for DMA and the interrupt line.

use std::path::Path;

use crate::bus::Context;
use crate::diskimage::DiskImage;
use crate::scheduler::{ms_to_ns, us_to_ns, EventParam};

/// Drives supported.
pub const MAX_UNIT: usize = 4;
/// Longest possible command packet.
pub const MAX_COMMAND: usize = 9;
/// Longest possible result packet.
pub const MAX_RESULT: usize = 7;
/// Longest sector size ever.
pub const MAX_SECTOR_SIZE: usize = 1024;
/// Initial sector size until the geometry changes it.
pub const SECTOR_SIZE: u16 = 512;
/// 13 us per byte in MFM mode.
pub const TRANSFER_DELAY: u64 = us_to_ns(13);
/// 300 RPM is 200 ms per revolution; half of that on average.
pub const ROTATIONAL_DELAY: u64 = ms_to_ns(100);

/// Event parameters. Starting at 100 keeps clear of anything the board
/// adapter uses for itself. Each unit gets its own SEEK_DONE code.
pub const EVENT_READ_DATA: EventParam = 100;
pub const EVENT_WRITE_DATA: EventParam = 101;
pub const EVENT_SEEK_DONE: EventParam = 110;

/// Main status register bits.
pub mod sts {
    pub const FDD0_BUSY: u8 = 0x01;
    pub const FDD1_BUSY: u8 = 0x02;
    pub const FDD2_BUSY: u8 = 0x04;
    pub const FDD3_BUSY: u8 = 0x08;
    /// Read or write command in progress
    pub const FDC_BUSY: u8 = 0x10;
    /// Programmed I/O mode selected
    pub const NONDMA: u8 = 0x20;
    /// Data flows from the FDC to the CPU
    pub const DATA_OUT: u8 = 0x40;
    /// Data register ready for a transfer
    pub const DATA_REQUEST: u8 = 0x80;
}

/// Status register 0 bits.
pub mod st0 {
    pub const IC_NORMAL: u8 = 0x00;
    pub const IC_ABNORMAL: u8 = 0x40;
    pub const IC_INVCMD: u8 = 0x80;
    pub const IC_NOT_READY: u8 = 0xC0;
    pub const SEEK_END: u8 = 0x20;
    pub const UNIT_CHECK: u8 = 0x10;
    pub const NOT_READY: u8 = 0x08;
    pub const HEAD_SELECT: u8 = 0x04;
    pub const UNIT_SELECT: u8 = 0x03;
}

/// Status register 1 bits.
pub mod st1 {
    pub const END_OF_CYL: u8 = 0x80;
    pub const DATA_ERROR: u8 = 0x20;
    pub const TIMEOUT: u8 = 0x10;
    pub const NO_DATA: u8 = 0x04;
    pub const WRT_PROTECT: u8 = 0x02;
    pub const NO_AM: u8 = 0x01;
}

/// Status register 2 bits.
pub mod st2 {
    pub const DDATA: u8 = 0x40;
    pub const CRC_ERROR: u8 = 0x20;
    pub const WRONG_CYL: u8 = 0x10;
    pub const SEEK_EQUAL: u8 = 0x08;
    pub const SEEK_ERROR: u8 = 0x04;
    pub const BAD_CYLINDER: u8 = 0x02;
    pub const NOT_DATA: u8 = 0x01;
}

/// Status register 3 bits.
pub mod st3 {
    pub const ERR_SIGNAL: u8 = 0x80;
    pub const WRT_PROTECT: u8 = 0x40;
    pub const READY: u8 = 0x20;
    pub const TRACK_0: u8 = 0x10;
    pub const DOUBLE_SIDED: u8 = 0x08;
    pub const HEAD_SELECT: u8 = 0x04;
    pub const UNIT_SELECT: u8 = 0x03;
}

/// Command opcodes (low five bits of the first command byte).
pub mod cmd {
    pub const READ_TRACK: u8 = 0x02;
    pub const SPECIFY: u8 = 0x03;
    pub const SENSE_DRIVE_STATUS: u8 = 0x04;
    pub const WRITE_SECTOR: u8 = 0x05;
    pub const READ_SECTOR: u8 = 0x06;
    pub const RECALIBRATE: u8 = 0x07;
    pub const SENSE_INTERRUPT: u8 = 0x08;
    pub const WRITE_DELETED: u8 = 0x09;
    pub const READ_SECTOR_ID: u8 = 0x0A;
    pub const READ_DELETED: u8 = 0x0C;
    pub const FORMAT_TRACK: u8 = 0x0D;
    pub const SEEK: u8 = 0x0F;
    pub const SCAN_EQUAL: u8 = 0x11;
    pub const SCAN_LE: u8 = 0x19;
    pub const SCAN_GE: u8 = 0x1D;
    pub const MASK: u8 = 0x1F;
    /// Modifier bits in the top three positions.
    pub const MULTI_TRACK: u8 = 0x80;
    pub const MFM_MODE: u8 = 0x40;
    pub const SKIP_DELETED: u8 = 0x20;
}

/// Controller state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FdcState {
    /// Waiting for a command
    #[default]
    Idle,
    /// Accumulating command bytes
    ReadCommand,
    /// Executing a command
    Busy,
    /// Serving result bytes
    SendResult,
    /// Accepting data bytes (programmed I/O, not implemented)
    ReadData,
    /// Serving data bytes (programmed I/O, not implemented)
    SendData,
}

impl FdcState {
    pub fn as_str(self) -> &'static str {
        match self {
            FdcState::Idle => "IDLE",
            FdcState::ReadCommand => "READ COMMAND",
            FdcState::Busy => "BUSY",
            FdcState::SendResult => "SEND RESULT",
            FdcState::ReadData => "READ DATA",
            FdcState::SendData => "SEND DATA",
        }
    }
}

/// What the board adapter does for the controller: one byte of DMA in
/// either direction, and the interrupt line. The `bool` in the DMA results
/// reports that the transfer counter expired - the adapter's way of
/// asserting Terminal Count mid-transfer.
pub trait FdcHost {
    /// Transfer one byte from memory to the FDC (disk write).
    fn dma_read(&mut self, ctx: &mut Context) -> (u8, bool);
    /// Transfer one byte from the FDC to memory (disk read).
    fn dma_write(&mut self, ctx: &mut Context, data: u8) -> bool;
    /// Drive the interrupt line.
    fn interrupt(&mut self, ctx: &mut Context, asserted: bool);
}

/// The uPD765 controller proper.
pub struct Upd765 {
    state: FdcState,
    main_status: u8,
    st: [u8; 4],
    no_dma: bool,

    command_length: usize,
    result_length: usize,
    command: [u8; MAX_COMMAND],
    result: [u8; MAX_RESULT],

    /// Cursor into the command, result or sector buffer
    current_byte: usize,
    /// Length of the data currently in the sector buffer
    data_length: usize,
    buffer: [u8; MAX_SECTOR_SIZE],

    write_lock: [bool; MAX_UNIT],
    unit: usize,
    head: u8,
    sector: u8,
    size_code: u8,
    track: [u8; MAX_UNIT],
    seeking: [bool; MAX_UNIT],
    images: [DiskImage; MAX_UNIT],

    step_delay: u64,
    rotational_delay: u64,
    transfer_delay: u64,
    head_load_delay: u64,
    head_unload_delay: u64,
}

impl Upd765 {
    /// Create a controller with no drives attached. The step and head
    /// load/unload delays start at zero; unless the operator sets them
    /// first, the values from the guest's SPECIFY command are used.
    pub fn new() -> Self {
        Self {
            state: FdcState::Idle,
            main_status: 0,
            st: [0; 4],
            no_dma: false,
            command_length: 0,
            result_length: 0,
            command: [0; MAX_COMMAND],
            result: [0; MAX_RESULT],
            current_byte: 0,
            data_length: 0,
            buffer: [0; MAX_SECTOR_SIZE],
            write_lock: [false; MAX_UNIT],
            unit: 0,
            head: 0,
            sector: 0,
            size_code: 0,
            track: [0; MAX_UNIT],
            seeking: [false; MAX_UNIT],
            images: std::array::from_fn(|_| DiskImage::new(SECTOR_SIZE)),
            step_delay: 0,
            rotational_delay: ROTATIONAL_DELAY,
            transfer_delay: TRANSFER_DELAY,
            head_load_delay: 0,
            head_unload_delay: 0,
        }
    }

    /// Reset every register and state flag (a bus CLEAR).
    pub fn reset(&mut self) {
        self.state = FdcState::Idle;
        self.st = [0; 4];
        self.command = [0; MAX_COMMAND];
        self.result = [0; MAX_RESULT];
        self.write_lock = [false; MAX_UNIT];
        self.track = [0; MAX_UNIT];
        self.seeking = [false; MAX_UNIT];
        self.buffer = [0; MAX_SECTOR_SIZE];
        self.main_status = 0;
        self.current_byte = 0;
        self.command_length = 0;
        self.result_length = 0;
        self.data_length = 0;
        self.unit = 0;
        self.head = 0;
        self.sector = 0;
        self.size_code = 0;
        self.no_dma = false;
    }

    // --- drive management -------------------------------------------------

    /// Set the geometry for one drive. Must precede `attach`.
    pub fn set_geometry(&mut self, unit: usize, sector_size: u16, sectors: u16, tracks: u16, heads: u16) {
        self.images[unit].set_geometry(sector_size, sectors, tracks, heads);
    }

    /// Attach a drive to an image file; the drive comes online at once.
    pub fn attach(&mut self, unit: usize, path: &Path, write_lock: bool) -> bool {
        if self.images[unit].is_open() {
            self.detach(unit);
        }
        if self.images[unit].open(path).is_err() {
            return false;
        }
        self.write_lock[unit] = write_lock || self.images[unit].is_read_only();
        log::debug!(
            "floppy unit {unit} attached to {} size {} sectors",
            path.display(),
            self.images[unit].capacity()
        );
        true
    }

    /// Take a drive offline.
    pub fn detach(&mut self, unit: usize) {
        if self.images[unit].is_open() {
            log::debug!("floppy unit {unit} detached");
            self.images[unit].close();
        }
    }

    /// Take every drive offline.
    pub fn detach_all(&mut self) {
        for unit in 0..MAX_UNIT {
            self.detach(unit);
        }
    }

    /// True if the drive is online.
    pub fn is_attached(&self, unit: usize) -> bool {
        self.images[unit].is_open()
    }

    /// Set or clear a drive's write lock. A read-only image file forces
    /// the lock on regardless.
    pub fn set_write_lock(&mut self, unit: usize, lock: bool) {
        self.write_lock[unit] = lock;
        if self.is_attached(unit) && self.images[unit].is_read_only() {
            self.write_lock[unit] = true;
        }
    }

    pub fn is_write_locked(&self, unit: usize) -> bool {
        self.write_lock[unit]
    }

    /// True while a drive is stepping.
    pub fn is_seeking(&self, unit: usize) -> bool {
        self.seeking[unit]
    }

    /// Current head position of a drive.
    pub fn current_track(&self, unit: usize) -> u8 {
        self.track[unit]
    }

    /// Controller state, for diagnostics.
    pub fn state(&self) -> FdcState {
        self.state
    }

    /// Extended status byte `n` as of the last update.
    pub fn status_byte(&self, n: usize) -> u8 {
        self.st[n]
    }

    // --- timing parameters ------------------------------------------------

    pub fn set_step_delay(&mut self, ns: u64) {
        self.step_delay = ns;
    }
    pub fn set_rotational_delay(&mut self, ns: u64) {
        self.rotational_delay = ns;
    }
    pub fn set_transfer_delay(&mut self, ns: u64) {
        self.transfer_delay = ns;
    }
    pub fn step_delay(&self) -> u64 {
        self.step_delay
    }
    pub fn rotational_delay(&self) -> u64 {
        self.rotational_delay
    }
    pub fn transfer_delay(&self) -> u64 {
        self.transfer_delay
    }

    // --- command helpers --------------------------------------------------

    fn current_command(&self) -> u8 {
        self.command[0] & cmd::MASK
    }

    fn is_multi_track(&self) -> bool {
        self.command[0] & cmd::MULTI_TRACK != 0
    }

    fn is_mfm(&self) -> bool {
        self.command[0] & cmd::MFM_MODE != 0
    }

    fn sectors_per_track(&self) -> u8 {
        self.images[self.unit].sectors() as u8
    }

    fn heads(&self) -> u16 {
        self.images[self.unit].heads()
    }

    fn sector_size(&self) -> usize {
        self.images[self.unit].sector_size() as usize
    }

    /// How many bytes the command that starts with `first` occupies.
    fn command_length_of(first: u8) -> usize {
        match first & cmd::MASK {
            cmd::READ_TRACK
            | cmd::READ_SECTOR
            | cmd::WRITE_SECTOR
            | cmd::READ_DELETED
            | cmd::WRITE_DELETED
            | cmd::SCAN_EQUAL
            | cmd::SCAN_LE
            | cmd::SCAN_GE => 9,
            cmd::FORMAT_TRACK => 6,
            cmd::READ_SECTOR_ID | cmd::RECALIBRATE | cmd::SENSE_DRIVE_STATUS => 2,
            cmd::SEEK => 3,
            cmd::SPECIFY => 3,
            _ => 1,
        }
    }

    // --- status synthesis -------------------------------------------------

    /// Build ST0 around an interrupt code, filling in NOT READY and the
    /// selected head and unit.
    fn update_st0(&mut self, interrupt_code: u8) -> u8 {
        let mut status = interrupt_code;
        if !self.is_attached(self.unit) {
            status |= st0::NOT_READY;
        }
        if self.head != 0 {
            status |= st0::HEAD_SELECT;
        }
        status |= self.unit as u8 & st0::UNIT_SELECT;
        self.st[0] = status;
        status
    }

    /// Build ST3 from drive state.
    fn update_st3(&mut self) -> u8 {
        let mut status = self.unit as u8 & st3::UNIT_SELECT;
        if self.head != 0 {
            status |= st3::HEAD_SELECT;
        }
        if self.heads() > 1 {
            status |= st3::DOUBLE_SIDED;
        }
        if self.track[self.unit] == 0 {
            status |= st3::TRACK_0;
        }
        if self.is_write_locked(self.unit) {
            status |= st3::WRT_PROTECT;
        }
        if self.is_attached(self.unit) {
            status |= st3::READY;
        }
        self.st[3] = status;
        status
    }

    /// Read the main status register, assembled on every read from the
    /// live controller state.
    pub fn read_status(&mut self) -> u8 {
        let mut status = 0;
        for (unit, bit) in [sts::FDD0_BUSY, sts::FDD1_BUSY, sts::FDD2_BUSY, sts::FDD3_BUSY]
            .into_iter()
            .enumerate()
        {
            if self.seeking[unit] {
                status |= bit;
            }
        }
        if self.state != FdcState::Idle {
            status |= sts::FDC_BUSY;
        }
        match self.state {
            FdcState::Idle | FdcState::ReadCommand => status |= sts::DATA_REQUEST,
            FdcState::SendResult => status |= sts::DATA_OUT | sts::DATA_REQUEST,
            _ => {}
        }
        self.main_status = status;
        status
    }

    // --- result plumbing --------------------------------------------------

    /// Start serving `length` result bytes. Always interrupts - there is
    /// data for the host.
    fn send_result(&mut self, ctx: &mut Context, host: &mut dyn FdcHost, length: usize) {
        self.result_length = length;
        self.current_byte = 0;
        host.interrupt(ctx, true);
        self.state = FdcState::SendResult;
    }

    /// Fill in and send the seven-byte result used by the read and write
    /// commands. ST0 (and any ST1/ST2 error bits) must already be set.
    fn send_result_type1(&mut self, ctx: &mut Context, host: &mut dyn FdcHost) {
        self.result[0] = self.st[0];
        self.result[1] = self.st[1];
        self.result[2] = self.st[2];
        self.result[3] = self.track[self.unit];
        self.result[4] = self.head;
        self.result[5] = self.sector;
        self.result[6] = self.size_code;
        self.send_result(ctx, host, 7);
    }

    // --- simple commands --------------------------------------------------

    /// Invalid command: a one-byte ST0 result with the INVALID code, and
    /// no interrupt.
    fn do_invalid(&mut self, command: u8) {
        log::debug!("uPD765 INVALID COMMAND 0x{command:02X}");
        self.update_st0(st0::IC_INVCMD);
        self.result[0] = self.st[0];
        self.result_length = 1;
        self.current_byte = 0;
        self.state = FdcState::SendResult;
    }

    /// SPECIFY: head and step timing plus the DMA mode. The decoded
    /// delays are used only where the operator has not already set one.
    /// No result, no interrupt.
    fn do_specify(&mut self) {
        let step = ms_to_ns((0x10 - ((self.command[1] >> 4) & 0x0F)) as u64);
        let unload = ms_to_ns((((self.command[1] & 0x0F) as u64) + 1) * 16);
        let load = ms_to_ns(((((self.command[2] >> 1) & 0x7F) as u64) + 1) * 2);
        self.no_dma = self.command[2] & 0x01 != 0;
        log::debug!(
            "uPD765 SPECIFY SRT={}ms HUT={}ms HLT={}ms NODMA={}",
            step / 1_000_000,
            unload / 1_000_000,
            load / 1_000_000,
            self.no_dma
        );
        if self.step_delay == 0 {
            self.step_delay = step;
        }
        if self.head_load_delay == 0 {
            self.head_load_delay = load;
        }
        if self.head_unload_delay == 0 {
            self.head_unload_delay = unload;
        }
        self.state = FdcState::Idle;
    }

    /// SENSE INTERRUPT: why did you interrupt me? ST0 plus the current
    /// track - the official epilogue of SEEK and RECALIBRATE.
    fn do_sense_interrupt(&mut self, ctx: &mut Context, host: &mut dyn FdcHost) {
        self.result[0] = self.st[0];
        self.result[1] = self.track[self.unit];
        log::debug!(
            "uPD765 SENSE INTERRUPT ST0=0x{:02X} track={}",
            self.result[0],
            self.result[1]
        );
        self.send_result(ctx, host, 2);
    }

    /// SENSE DRIVE STATUS: the only command that returns ST3.
    fn do_sense_drive_status(&mut self, ctx: &mut Context, host: &mut dyn FdcHost) {
        self.unit = (self.command[1] & 0x03) as usize;
        self.head = (self.command[1] >> 2) & 0x01;
        self.result[0] = self.update_st3();
        log::debug!(
            "uPD765 SENSE DRIVE STATUS unit={} ST3=0x{:02X}",
            self.unit,
            self.result[0]
        );
        self.send_result(ctx, host, 1);
    }

    // --- seek and recalibrate ---------------------------------------------

    /// Start the selected unit stepping. Overlapped: the controller
    /// returns to IDLE at once and only interrupts when the seek
    /// completes.
    fn seek_track(&mut self, ctx: &mut Context, target: u8) {
        if !self.is_attached(self.unit) {
            self.update_st0(st0::IC_ABNORMAL);
        } else {
            let current = self.track[self.unit];
            let steps = current.abs_diff(target) as u64;
            self.track[self.unit] = target;
            self.seeking[self.unit] = true;
            ctx.schedule(
                EVENT_SEEK_DONE + self.unit as EventParam,
                steps * self.step_delay,
            );
        }
        self.state = FdcState::Idle;
    }

    /// A unit finished stepping: interrupt, no result packet. The host is
    /// expected to ask with SENSE INTERRUPT.
    fn seek_done(&mut self, ctx: &mut Context, host: &mut dyn FdcHost, unit: usize) {
        self.unit = unit;
        self.seeking[unit] = false;
        self.update_st0(st0::IC_NORMAL | st0::SEEK_END);
        host.interrupt(ctx, true);
    }

    fn do_recalibrate(&mut self, ctx: &mut Context) {
        self.unit = (self.command[1] & 0x03) as usize;
        log::debug!("uPD765 RECALIBRATE unit={}", self.unit);
        self.seek_track(ctx, 0);
    }

    fn do_seek(&mut self, ctx: &mut Context) {
        self.unit = (self.command[1] & 0x03) as usize;
        self.head = (self.command[1] >> 2) & 0x01;
        log::debug!(
            "uPD765 SEEK unit={} new track={} head={}",
            self.unit,
            self.command[2],
            self.head
        );
        let target = self.command[2];
        self.seek_track(ctx, target);
    }

    // --- read and write sectors -------------------------------------------
    //
    //   The flow for the data transfer commands: command setup schedules
    // the first data event after the rotational delay (head load delays
    // are not modeled). Each data event transfers one byte, with the
    // transfer delay between bytes of a sector and the rotational delay
    // between sectors, until the host asserts Terminal Count or the
    // cylinder runs out. The concluding event sends the result packet and
    // schedules nothing further.

    /// Pull the unit, head, sector and size out of a 9-byte command and
    /// sanity check them against the drive. On failure the status
    /// registers describe the problem and the caller sends the result at
    /// once.
    fn setup_command_type1(&mut self, write: bool) -> bool {
        self.st[1] = 0;
        self.st[2] = 0;

        //   The command carries the head twice - a bit in the head/unit
        // byte and a whole byte of its own. Warn when they disagree.
        self.unit = (self.command[1] & 0x03) as usize;
        self.head = (self.command[1] >> 2) & 0x01;
        if self.head != self.command[3] {
            log::warn!("uPD765 type 1 command Head/Unit and HeadSelect disagree");
        }

        if !self.is_attached(self.unit) {
            self.update_st0(st0::IC_ABNORMAL | st0::NOT_READY);
            return false;
        }

        if write && self.is_write_locked(self.unit) {
            self.st[1] = st1::WRT_PROTECT;
            self.update_st0(st0::IC_ABNORMAL);
            return false;
        }

        // The command names a track; the head had better be there.
        if self.track[self.unit] != self.command[2] {
            self.update_st0(st0::IC_ABNORMAL);
            self.st[2] = st2::BAD_CYLINDER;
            return false;
        }

        //   Geometry disagreements are only warned about; real software
        // gets these right and the transfer proceeds regardless.
        if self.command[4] == 0 || self.command[4] > self.sectors_per_track() {
            log::warn!(
                "uPD765 type 1 command sector {} disagrees with geometry",
                self.command[4]
            );
        }
        self.sector = self.command[4];
        if self.command[6] != self.sectors_per_track() {
            log::warn!(
                "uPD765 type 1 command track length {} disagrees with geometry",
                self.command[6]
            );
        }

        //   Partial sector transfers are not implemented, so a size code
        // of zero (which would make DataLength relevant) is out.
        if self.command[5] == 0 || self.command[5] > 3 {
            log::warn!("uPD765 type 1 command size code {} invalid", self.command[5]);
        }
        self.size_code = self.command[5];
        let size = 128usize << self.size_code;
        if size != self.sector_size() {
            log::warn!("uPD765 type 1 command sector size {size} disagrees with geometry");
        }

        true
    }

    fn do_read_sector(&mut self, ctx: &mut Context, host: &mut dyn FdcHost) {
        if !self.setup_command_type1(false) {
            self.send_result_type1(ctx, host);
        } else {
            // Mark the buffer empty; the first event loads a sector.
            self.data_length = self.sector_size();
            self.current_byte = self.data_length + 1;
            ctx.schedule(EVENT_READ_DATA, self.rotational_delay);
        }
    }

    /// Advance to the next sector after a full buffer. Returns false at
    /// the end of the cylinder (reported in ST1), flipping heads first if
    /// the command asked for multi-track.
    fn advance_sector(&mut self) -> bool {
        self.sector += 1;
        if self.sector > self.sectors_per_track() {
            self.sector = 1;
            if !self.is_multi_track() || self.heads() == 1 {
                self.st[1] = st1::END_OF_CYL;
                return false;
            }
            self.head ^= 1;
            if self.head == self.command[3] {
                // Both heads done: that's the whole cylinder.
                self.st[1] = st1::END_OF_CYL;
                return false;
            }
        }
        true
    }

    /// One READ SECTOR data event: refill the buffer from the image when
    /// empty, push one byte to the host, schedule the next event.
    fn read_transfer(&mut self, ctx: &mut Context, host: &mut dyn FdcHost) {
        // The host may have aborted the transfer while we were away.
        if self.state != FdcState::Busy {
            self.update_st0(st0::IC_NORMAL);
            self.send_result_type1(ctx, host);
            return;
        }

        if self.current_byte >= self.data_length {
            let (cyl, head, sector) = (self.track[self.unit] as u16, self.head as u16, self.sector as u16);
            let size = self.sector_size();
            if let Err(err) =
                self.images[self.unit].read_sector(cyl, head, sector, &mut self.buffer)
            {
                log::warn!("uPD765 error reading unit {}: {err}", self.unit);
                // Fake a data (CRC) error and give up on the transfer.
                self.st[1] = st1::DATA_ERROR;
                self.update_st0(st0::IC_ABNORMAL);
                self.send_result_type1(ctx, host);
                return;
            }
            log::debug!(
                "uPD765 reading sector C/H/S = {}/{}/{} size {}",
                cyl,
                head,
                sector,
                size
            );
            self.data_length = size;
            self.current_byte = 0;
        }

        // Move one byte to the host.
        if self.no_dma {
            // Programmed I/O transfers are not implemented.
            log::warn!("uPD765 programmed I/O mode not implemented");
            self.update_st0(st0::IC_ABNORMAL);
            self.send_result_type1(ctx, host);
            return;
        }
        let tc = host.dma_write(ctx, self.buffer[self.current_byte]);
        self.current_byte += 1;
        if tc {
            self.state = FdcState::Idle;
        }

        // The host has seen enough: success.
        if self.state != FdcState::Busy {
            self.update_st0(st0::IC_NORMAL);
            self.send_result_type1(ctx, host);
            return;
        }

        // Sector exhausted: step to the next one (or finish the cylinder).
        // The buffer stays marked empty so the next event reloads it.
        let between_sectors = self.current_byte >= self.data_length;
        if between_sectors && !self.advance_sector() {
            self.update_st0(st0::IC_NORMAL);
            self.send_result_type1(ctx, host);
            return;
        }

        //   Next event: a fresh sector waits for the rotational delay,
        // bytes within a sector for the transfer delay (doubled in single
        // density).
        let delay = if between_sectors {
            self.rotational_delay
        } else if self.is_mfm() {
            self.transfer_delay
        } else {
            self.transfer_delay * 2
        };
        ctx.schedule(EVENT_READ_DATA, delay);
    }

    fn do_write_sector(&mut self, ctx: &mut Context, host: &mut dyn FdcHost) {
        if !self.setup_command_type1(true) {
            self.send_result_type1(ctx, host);
        } else {
            self.data_length = self.sector_size();
            self.current_byte = 0;
            ctx.schedule(EVENT_WRITE_DATA, self.rotational_delay);
        }
    }

    /// One WRITE SECTOR data event: pull one byte from the host; when the
    /// buffer fills, put the sector on the image and advance.
    fn write_transfer(&mut self, ctx: &mut Context, host: &mut dyn FdcHost) {
        if self.no_dma {
            log::warn!("uPD765 programmed I/O mode not implemented");
            self.update_st0(st0::IC_ABNORMAL);
            self.send_result_type1(ctx, host);
            return;
        }
        let (data, tc) = host.dma_read(ctx);
        self.buffer[self.current_byte] = data;
        self.current_byte += 1;
        if tc {
            self.state = FdcState::Idle;
        }

        if self.current_byte >= self.data_length {
            let (cyl, head, sector) = (self.track[self.unit] as u16, self.head as u16, self.sector as u16);
            let size = self.sector_size();
            if let Err(err) =
                self.images[self.unit].write_sector(cyl, head, sector, &self.buffer)
            {
                log::warn!("uPD765 error writing unit {}: {err}", self.unit);
                // Fake an equipment check and give up on the transfer.
                self.update_st0(st0::IC_ABNORMAL | st0::UNIT_CHECK);
                self.send_result_type1(ctx, host);
                return;
            }
            log::debug!(
                "uPD765 writing sector C/H/S = {}/{}/{} size {}",
                cyl,
                head,
                sector,
                size
            );
            self.data_length = size;
            self.current_byte = 0;
            if !self.advance_sector() {
                self.update_st0(st0::IC_NORMAL);
                self.send_result_type1(ctx, host);
                return;
            }
        }

        if self.state != FdcState::Busy {
            self.update_st0(st0::IC_NORMAL);
            self.send_result_type1(ctx, host);
            return;
        }

        let delay = if self.current_byte == 0 {
            self.rotational_delay
        } else if self.is_mfm() {
            self.transfer_delay
        } else {
            self.transfer_delay * 2
        };
        ctx.schedule(EVENT_WRITE_DATA, delay);
    }

    // --- register access --------------------------------------------------

    /// Decode and execute the command sitting in the command buffer.
    fn do_command(&mut self, ctx: &mut Context, host: &mut dyn FdcHost) {
        self.state = FdcState::Busy;
        match self.current_command() {
            cmd::SPECIFY => self.do_specify(),
            cmd::RECALIBRATE => self.do_recalibrate(ctx),
            cmd::SEEK => self.do_seek(ctx),
            cmd::SENSE_INTERRUPT => self.do_sense_interrupt(ctx, host),
            cmd::READ_SECTOR => self.do_read_sector(ctx, host),
            cmd::WRITE_SECTOR => self.do_write_sector(ctx, host),
            cmd::SENSE_DRIVE_STATUS => self.do_sense_drive_status(ctx, host),
            // READ TRACK, the DELETED variants, READ ID, FORMAT TRACK
            // and the SCANs are not implemented.
            _ => self.do_invalid(self.command[0]),
        }
    }

    /// Host read of the data register. Serves result bytes; reading
    /// always clears the interrupt request.
    pub fn read_data(&mut self, ctx: &mut Context, host: &mut dyn FdcHost) -> u8 {
        let mut data = 0xFF;
        if self.state == FdcState::SendResult {
            data = self.result[self.current_byte];
            self.current_byte += 1;
            if self.current_byte == self.result_length {
                self.state = FdcState::Idle;
            }
        } else if self.state == FdcState::SendData {
            // Programmed I/O is not implemented.
        }
        host.interrupt(ctx, false);
        data
    }

    /// Host write of the data register: either the start of a command,
    /// the next byte of one, or (in states that take no data) ignored.
    pub fn write_data(&mut self, ctx: &mut Context, host: &mut dyn FdcHost, data: u8) {
        match self.state {
            FdcState::Idle => {
                self.command[0] = data;
                self.current_byte = 1;
                self.command_length = Self::command_length_of(data);
                self.state = FdcState::ReadCommand;
                if self.command_length == 1 {
                    self.do_command(ctx, host);
                }
            }
            FdcState::ReadCommand => {
                self.command[self.current_byte] = data;
                self.current_byte += 1;
                if self.current_byte >= self.command_length {
                    self.do_command(ctx, host);
                }
            }
            FdcState::ReadData => {
                // Programmed I/O is not implemented.
            }
            other => {
                log::warn!(
                    "uPD765 received 0x{data:02X} when state is {}",
                    other.as_str()
                );
            }
        }
    }

    /// The Terminal Count input: stop whatever is going on and return to
    /// IDLE, ready for the next command. The normal way to end a read or
    /// write - the chip itself never counts bytes.
    pub fn terminal_count(&mut self) {
        self.state = FdcState::Idle;
    }

    /// Scheduler dispatch for the controller's events.
    pub fn event(&mut self, ctx: &mut Context, host: &mut dyn FdcHost, param: EventParam) {
        match param {
            EVENT_READ_DATA => self.read_transfer(ctx, host),
            EVENT_WRITE_DATA => self.write_transfer(ctx, host),
            p if (EVENT_SEEK_DONE..EVENT_SEEK_DONE + MAX_UNIT as EventParam).contains(&p) => {
                self.seek_done(ctx, host, (p - EVENT_SEEK_DONE) as usize)
            }
            other => log::warn!("uPD765 stray event {other}"),
        }
    }

    /// State dump for diagnostics.
    pub fn show(&self) -> String {
        use std::fmt::Write;
        let mut out = String::from("uPD765 Floppy Diskette Controller\n");
        for unit in 0..MAX_UNIT {
            let img = &self.images[unit];
            let _ = writeln!(
                out,
                "  Unit {}: {} bytes/sector, {} sectors, {} tracks, {} head(s){}",
                unit,
                img.sector_size(),
                img.sectors(),
                img.cylinders(),
                img.heads(),
                if img.is_open() {
                    if self.write_lock[unit] {
                        " (attached, WRITE LOCKED)"
                    } else {
                        " (attached)"
                    }
                } else {
                    " (not attached)"
                }
            );
        }
        let _ = writeln!(out, "  Current State: {}", self.state.as_str());
        let _ = writeln!(
            out,
            "  Status: main=0x{:02X}, ST0=0x{:02X}, ST1=0x{:02X}, ST2=0x{:02X}, ST3=0x{:02X}",
            self.main_status, self.st[0], self.st[1], self.st[2], self.st[3]
        );
        out
    }
}

impl Default for Upd765 {
    fn default() -> Self {
        Self::new()
    }
}
