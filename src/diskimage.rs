//! Disk image file collaborator
//!
//! The floppy controller reads and writes fixed-geometry byte-stream image
//! files through this module. A sector (cyl, head, sec) with geometry
//! (H heads, S sectors/track, B bytes/sector) lives at file offset
//! `((cyl*H + head)*S + (sec-1)) * B`; sector numbers start at 1.
//!
//! Geometry must be set before a file is attached. Files shorter than the
//! CHS capacity are extended on open; longer files keep their tail, it is
//! just unreachable. A file the host cannot write forces the image
//! read-only regardless of how it was opened.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Host-side image file failures. These never reach the simulation
/// directly; the FDC converts transfer failures into status-register bits.
#[derive(Debug, Error)]
pub enum DiskImageError {
    #[error("image geometry has not been set")]
    NoGeometry,
    #[error("no image file is attached")]
    NotAttached,
    #[error("sector address C/H/S {0}/{1}/{2} outside geometry")]
    BadAddress(u16, u16, u16),
    #[error("image file is read only")]
    ReadOnly,
    #[error("image file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A CHS-addressed disk image file.
#[derive(Debug, Default)]
pub struct DiskImage {
    file: Option<File>,
    path: PathBuf,
    read_only: bool,
    sector_size: u16,
    sectors: u16,
    cylinders: u16,
    heads: u16,
}

impl DiskImage {
    /// Create a detached image with the given sector size and no further
    /// geometry.
    pub fn new(sector_size: u16) -> Self {
        Self {
            sector_size,
            ..Self::default()
        }
    }

    /// Set the drive geometry. Must happen before `open`.
    pub fn set_geometry(&mut self, sector_size: u16, sectors: u16, cylinders: u16, heads: u16) {
        self.sector_size = sector_size;
        self.sectors = sectors;
        self.cylinders = cylinders;
        self.heads = heads;
    }

    pub fn sector_size(&self) -> u16 {
        self.sector_size
    }
    pub fn sectors(&self) -> u16 {
        self.sectors
    }
    pub fn cylinders(&self) -> u16 {
        self.cylinders
    }
    pub fn heads(&self) -> u16 {
        self.heads
    }

    /// Capacity implied by the geometry, in sectors.
    pub fn chs_capacity(&self) -> u32 {
        self.cylinders as u32 * self.heads as u32 * self.sectors as u32
    }

    /// True when a file is attached.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// True when the attached file cannot be written.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Path of the attached file (empty when detached).
    pub fn file_name(&self) -> &Path {
        &self.path
    }

    /// Length of the attached file in bytes.
    pub fn file_length(&self) -> u64 {
        self.file
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map_or(0, |m| m.len())
    }

    /// Capacity of the attached file, in whole sectors.
    pub fn capacity(&self) -> u32 {
        if self.sector_size == 0 {
            return 0;
        }
        (self.file_length() / self.sector_size as u64) as u32
    }

    /// Attach an image file, creating it if necessary and extending it to
    /// the CHS capacity when it is shorter.
    pub fn open(&mut self, path: &Path) -> Result<(), DiskImageError> {
        if self.sector_size == 0 || self.chs_capacity() == 0 {
            return Err(DiskImageError::NoGeometry);
        }
        self.close();

        // Try read/write first; fall back to a read-only attachment.
        let (file, read_only) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
        {
            Ok(f) => (f, false),
            Err(_) => (OpenOptions::new().read(true).open(path)?, true),
        };

        let full = self.chs_capacity() as u64 * self.sector_size as u64;
        if !read_only && file.metadata()?.len() < full {
            file.set_len(full)?;
        }

        log::debug!(
            "disk image {} attached, {} sectors of {} bytes{}",
            path.display(),
            self.chs_capacity(),
            self.sector_size,
            if read_only { " (read only)" } else { "" }
        );
        self.file = Some(file);
        self.path = path.to_path_buf();
        self.read_only = read_only;
        Ok(())
    }

    /// Detach the image file, if any.
    pub fn close(&mut self) {
        self.file = None;
        self.path.clear();
        self.read_only = false;
    }

    fn offset(&self, cyl: u16, head: u16, sec: u16) -> Result<u64, DiskImageError> {
        if cyl >= self.cylinders || head >= self.heads || sec == 0 || sec > self.sectors {
            return Err(DiskImageError::BadAddress(cyl, head, sec));
        }
        let index = (cyl as u64 * self.heads as u64 + head as u64) * self.sectors as u64
            + (sec as u64 - 1);
        Ok(index * self.sector_size as u64)
    }

    /// Read one sector into `buf` (must hold at least a sector).
    pub fn read_sector(
        &mut self,
        cyl: u16,
        head: u16,
        sec: u16,
        buf: &mut [u8],
    ) -> Result<(), DiskImageError> {
        let offset = self.offset(cyl, head, sec)?;
        let size = self.sector_size as usize;
        let file = self.file.as_mut().ok_or(DiskImageError::NotAttached)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..size])?;
        Ok(())
    }

    /// Write one sector from `buf` (must hold at least a sector).
    pub fn write_sector(
        &mut self,
        cyl: u16,
        head: u16,
        sec: u16,
        buf: &[u8],
    ) -> Result<(), DiskImageError> {
        if self.read_only {
            return Err(DiskImageError::ReadOnly);
        }
        let offset = self.offset(cyl, head, sec)?;
        let size = self.sector_size as usize;
        let file = self.file.as_mut().ok_or(DiskImageError::NotAttached)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf[..size])?;
        Ok(())
    }
}
