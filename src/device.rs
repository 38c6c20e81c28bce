// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The block-device layer.
//!
//! A [`BlockDriver`] is the contract of the underlying device:
//! it answers the two geometry queries, seeks to an absolute
//! byte offset, and transfers exactly one I/O unit per call at
//! the current position.  [`Disk`] adapts that rigid interface
//! into reads and writes of arbitrary byte ranges by windowing
//! them to block boundaries, and for writes, reading the
//! surrounding range first and overlaying the new bytes.

use crate::layout::DEFAULT_SECTOR_SIZE;
use crate::result::{Error, Result};

use std::cell::RefCell;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

/// The driver contract for a fixed-I/O-size block device.
pub trait BlockDriver {
    /// Returns the device capacity, in bytes.
    fn capacity(&self) -> Result<usize>;

    /// Returns the device's transfer unit, in bytes.
    fn sector_size(&self) -> Result<usize>;

    /// Positions the device at an absolute byte offset.
    fn seek(&mut self, off: usize) -> Result<()>;

    /// Reads exactly one I/O unit at the current position.
    fn read_sector(&mut self, bs: &mut [u8]) -> Result<()>;

    /// Writes exactly one I/O unit at the current position.
    fn write_sector(&mut self, bs: &[u8]) -> Result<()>;

    /// Releases the device.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn round_down(value: usize, round: usize) -> usize {
    value - value % round
}

fn round_up(value: usize, round: usize) -> usize {
    round_down(value + round - 1, round)
}

/// A block device plus the geometry published to the rest of
/// the system: the driver's I/O unit and the filesystem block
/// size, which is twice the I/O unit.
pub struct Disk {
    drv: Box<dyn BlockDriver>,
    size: usize,
    io_size: usize,
    block_size: usize,
}

impl Disk {
    /// Queries the driver's geometry and wraps it.
    pub fn new(drv: Box<dyn BlockDriver>) -> Result<Disk> {
        let size = drv.capacity()?;
        let io_size = drv.sector_size()?;
        if io_size == 0 || size % io_size != 0 {
            log::error!("disk: bad geometry: {size} bytes, {io_size} I/O unit");
            return Err(Error::Io);
        }
        let block_size = io_size * 2;
        Ok(Disk { drv, size, io_size, block_size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn io_size(&self) -> usize {
        self.io_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Reads `bs.len()` bytes at `off`, neither of which need be
    /// aligned.
    pub fn read_at(&mut self, off: usize, bs: &mut [u8]) -> Result<()> {
        if bs.is_empty() {
            return Ok(());
        }
        let start = round_down(off, self.block_size);
        let end = round_up(off + bs.len(), self.block_size);
        let mut scratch = vec![0u8; end - start];
        self.fill(start, &mut scratch)?;
        let bias = off - start;
        bs.copy_from_slice(&scratch[bias..bias + bs.len()]);
        Ok(())
    }

    /// Writes `bs` at `off` by reading the surrounding aligned
    /// range, overlaying the new bytes, and writing it back.
    pub fn write_at(&mut self, off: usize, bs: &[u8]) -> Result<()> {
        if bs.is_empty() {
            return Ok(());
        }
        let start = round_down(off, self.block_size);
        let end = round_up(off + bs.len(), self.block_size);
        let mut scratch = vec![0u8; end - start];
        self.fill(start, &mut scratch)?;
        let bias = off - start;
        scratch[bias..bias + bs.len()].copy_from_slice(bs);
        self.drv.seek(start)?;
        for sector in scratch.chunks(self.io_size) {
            self.drv.write_sector(sector)?;
        }
        Ok(())
    }

    fn fill(&mut self, start: usize, scratch: &mut [u8]) -> Result<()> {
        self.drv.seek(start)?;
        for sector in scratch.chunks_mut(self.io_size) {
            self.drv.read_sector(sector)?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.drv.close()
    }
}

/// An in-memory block device.  The image is shared between
/// handles, so a test can unmount a filesystem and remount the
/// same device through a second handle.
pub struct RamDisk {
    image: Rc<RefCell<Vec<u8>>>,
    sector: usize,
    pos: usize,
}

impl RamDisk {
    /// Returns a zero-filled device of `size` bytes transferring
    /// `sector` bytes per I/O.
    pub fn new(size: usize, sector: usize) -> RamDisk {
        assert!(sector > 0 && size % sector == 0);
        let image = Rc::new(RefCell::new(vec![0u8; size]));
        RamDisk { image, sector, pos: 0 }
    }

    /// Returns a second handle onto the same image, positioned
    /// at the start.
    pub fn handle(&self) -> RamDisk {
        RamDisk { image: Rc::clone(&self.image), sector: self.sector, pos: 0 }
    }
}

impl BlockDriver for RamDisk {
    fn capacity(&self) -> Result<usize> {
        Ok(self.image.borrow().len())
    }

    fn sector_size(&self) -> Result<usize> {
        Ok(self.sector)
    }

    fn seek(&mut self, off: usize) -> Result<()> {
        if off > self.image.borrow().len() {
            return Err(Error::Io);
        }
        self.pos = off;
        Ok(())
    }

    fn read_sector(&mut self, bs: &mut [u8]) -> Result<()> {
        let image = self.image.borrow();
        let end = self.pos + bs.len();
        if bs.len() != self.sector || end > image.len() {
            return Err(Error::Io);
        }
        bs.copy_from_slice(&image[self.pos..end]);
        drop(image);
        self.pos = end;
        Ok(())
    }

    fn write_sector(&mut self, bs: &[u8]) -> Result<()> {
        let mut image = self.image.borrow_mut();
        let end = self.pos + bs.len();
        if bs.len() != self.sector || end > image.len() {
            return Err(Error::Io);
        }
        image[self.pos..end].copy_from_slice(bs);
        drop(image);
        self.pos = end;
        Ok(())
    }
}

fn from_io(e: std::io::Error) -> Error {
    log::error!("block driver: {e}");
    Error::Io
}

/// A block device backed by a regular file, the usual shape of
/// the device path handed to the mount invocation.
pub struct FileDisk {
    file: fs::File,
    size: usize,
    sector: usize,
}

impl FileDisk {
    /// Opens the device file at `path` for read/write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileDisk> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(from_io)?;
        let size = file.metadata().map_err(from_io)?.len() as usize;
        Ok(FileDisk { file, size, sector: DEFAULT_SECTOR_SIZE })
    }
}

impl BlockDriver for FileDisk {
    fn capacity(&self) -> Result<usize> {
        Ok(self.size)
    }

    fn sector_size(&self) -> Result<usize> {
        Ok(self.sector)
    }

    fn seek(&mut self, off: usize) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(off as u64))
            .map(drop)
            .map_err(from_io)
    }

    fn read_sector(&mut self, bs: &mut [u8]) -> Result<()> {
        if bs.len() != self.sector {
            return Err(Error::Io);
        }
        self.file.read_exact(bs).map_err(from_io)
    }

    fn write_sector(&mut self, bs: &[u8]) -> Result<()> {
        if bs.len() != self.sector {
            return Err(Error::Io);
        }
        self.file.write_all(bs).map_err(from_io)
    }

    fn close(&mut self) -> Result<()> {
        self.file.sync_all().map_err(from_io)
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockDriver, Disk, FileDisk, RamDisk};

    fn disk() -> Disk {
        // 16 sectors of 16 bytes; 32-byte blocks.
        Disk::new(Box::new(RamDisk::new(256, 16))).unwrap()
    }

    #[test]
    fn geometry() {
        let disk = disk();
        assert_eq!(disk.size(), 256);
        assert_eq!(disk.io_size(), 16);
        assert_eq!(disk.block_size(), 32);
    }

    #[test]
    fn unaligned_write_preserves_neighbors() {
        let mut disk = disk();
        let backdrop = [0xaau8; 64];
        disk.write_at(0, &backdrop).unwrap();
        disk.write_at(13, b"hello").unwrap();

        let mut bs = [0u8; 64];
        disk.read_at(0, &mut bs).unwrap();
        assert_eq!(&bs[..13], &backdrop[..13]);
        assert_eq!(&bs[13..18], b"hello");
        assert_eq!(&bs[18..], &backdrop[18..]);
    }

    #[test]
    fn range_spanning_blocks() {
        let mut disk = disk();
        let data: Vec<u8> = (0..100u8).collect();
        // 27..127 crosses three block boundaries.
        disk.write_at(27, &data).unwrap();
        let mut back = vec![0u8; 100];
        disk.read_at(27, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn out_of_range_is_io_error() {
        let mut disk = disk();
        let mut bs = [0u8; 16];
        assert!(disk.read_at(250, &mut bs).is_err());
    }

    #[test]
    fn file_disk_round_trip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(4096).unwrap();
        let mut disk = Disk::new(Box::new(FileDisk::open(tmp.path()).unwrap()))
            .unwrap();
        assert_eq!(disk.io_size(), 512);
        disk.write_at(700, b"durable").unwrap();
        disk.close().unwrap();

        let mut disk = Disk::new(Box::new(FileDisk::open(tmp.path()).unwrap()))
            .unwrap();
        let mut bs = [0u8; 7];
        disk.read_at(700, &mut bs).unwrap();
        assert_eq!(&bs, b"durable");
    }

    #[test]
    fn sector_discipline() {
        let mut dev = RamDisk::new(256, 16);
        let mut short = [0u8; 8];
        assert!(dev.read_sector(&mut short).is_err());
        dev.seek(240).unwrap();
        let mut sector = [0u8; 16];
        dev.read_sector(&mut sector).unwrap();
        assert!(dev.read_sector(&mut sector).is_err());
    }
}
