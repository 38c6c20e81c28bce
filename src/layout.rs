// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The on-disk layout.
//!
//! The device is carved into five contiguous regions, in blocks:
//!
//! | Super | Inode Map | Data Map | Inode Table | Data |
//!
//! A block is twice the driver's I/O unit.  Inode numbers index
//! the inode table densely; data-block numbers index the data
//! region densely.  All records are tightly packed and
//! host-endian, decoded field by field rather than transmuted.

use crate::result::{Error, Result};

use static_assertions::const_assert;
use static_assertions::const_assert_eq;

/// Magic number identifying a formatted volume.
pub const MAGIC: u32 = 0x2011_0520;

/// The inode number of the root directory.
pub const ROOT_INO: u32 = 0;

/// Maximum length of a file name, in bytes.  On disk a name is
/// NUL-terminated, or unterminated if it fills the field.
pub const MAX_NAME_LEN: usize = 128;

/// Blocks in each fixed region.
pub const SUPER_BLOCKS: usize = 1;
pub const IMAP_BLOCKS: usize = 1;
pub const DMAP_BLOCKS: usize = 1;
pub const ITAB_BLOCKS: usize = 256;
pub const DATA_BLOCKS: usize = 3837;

/// Inode records stored in one block of the inode table.
pub const INODES_PER_BLOCK: usize = 16;

/// Direct data blocks per file; there is no indirection, so this
/// caps the file size at `BLOCKS_PER_FILE * block_size` bytes.
pub const BLOCKS_PER_FILE: usize = 6;

/// Sizes of the packed on-disk records, in bytes.
pub const DISK_SUPER_SIZE: usize = 60;
pub const DISK_INODE_SIZE: usize = 44;
pub const DISK_DENTRY_SIZE: usize = 136;

/// The driver's usual I/O unit; blocks are twice this.
pub const DEFAULT_SECTOR_SIZE: usize = 512;

// The canonical device is 4096 blocks of 1 KiB.
const_assert_eq!(
    SUPER_BLOCKS + IMAP_BLOCKS + DMAP_BLOCKS + ITAB_BLOCKS + DATA_BLOCKS,
    4096
);
const_assert!(INODES_PER_BLOCK * DISK_INODE_SIZE <= 2 * DEFAULT_SECTOR_SIZE);
const_assert!(DISK_SUPER_SIZE <= 2 * DEFAULT_SECTOR_SIZE);
const_assert!(DISK_DENTRY_SIZE <= 2 * DEFAULT_SECTOR_SIZE);

/// The type of a filesystem object, as stored in inode and
/// dentry records.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum FileType {
    Regular,
    Dir,
}

impl FileType {
    pub(crate) fn from_raw(raw: u32) -> FileType {
        match raw {
            1 => FileType::Dir,
            _ => FileType::Regular,
        }
    }

    pub(crate) fn raw(self) -> u32 {
        match self {
            FileType::Regular => 0,
            FileType::Dir => 1,
        }
    }

    /// Returns the `ls -l` character for the file type.
    pub(crate) fn as_char(self) -> char {
        match self {
            FileType::Regular => '-',
            FileType::Dir => 'd',
        }
    }
}

fn get_u32(bs: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes([bs[off], bs[off + 1], bs[off + 2], bs[off + 3]])
}

fn put_u32(bs: &mut [u8], off: usize, value: u32) {
    bs[off..off + 4].copy_from_slice(&value.to_ne_bytes());
}

fn get_i32(bs: &[u8], off: usize) -> i32 {
    i32::from_ne_bytes([bs[off], bs[off + 1], bs[off + 2], bs[off + 3]])
}

fn put_i32(bs: &mut [u8], off: usize, value: i32) {
    bs[off..off + 4].copy_from_slice(&value.to_ne_bytes());
}

/// The super block: region offsets and sizes, capacities, the
/// root inode number and the usage counter, plus the runtime
/// device geometry published to the rest of the system.  The
/// runtime fields are rederived from the driver on every mount
/// and are not persisted.
#[derive(Clone, Debug)]
pub struct SuperBlock {
    pub disk_size: usize,
    pub io_size: usize,
    pub block_size: usize,

    pub super_off: usize,
    pub super_blocks: usize,
    pub imap_off: usize,
    pub imap_blocks: usize,
    pub dmap_off: usize,
    pub dmap_blocks: usize,
    pub itab_off: usize,
    pub itab_blocks: usize,
    pub data_off: usize,
    pub data_blocks: usize,

    pub max_ino: usize,
    pub max_file_blocks: usize,
    pub root_ino: u32,
    pub usage: u32,
}

impl SuperBlock {
    /// Returns the default geometry for an unformatted device.
    pub fn format(disk_size: usize, io_size: usize) -> SuperBlock {
        let bs = io_size * 2;
        let super_off = 0;
        let imap_off = super_off + SUPER_BLOCKS * bs;
        let dmap_off = imap_off + IMAP_BLOCKS * bs;
        let itab_off = dmap_off + DMAP_BLOCKS * bs;
        let data_off = itab_off + ITAB_BLOCKS * bs;
        SuperBlock {
            disk_size,
            io_size,
            block_size: bs,
            super_off,
            super_blocks: SUPER_BLOCKS,
            imap_off,
            imap_blocks: IMAP_BLOCKS,
            dmap_off,
            dmap_blocks: DMAP_BLOCKS,
            itab_off,
            itab_blocks: ITAB_BLOCKS,
            data_off,
            data_blocks: DATA_BLOCKS,
            max_ino: ITAB_BLOCKS * INODES_PER_BLOCK,
            max_file_blocks: BLOCKS_PER_FILE,
            root_ino: ROOT_INO,
            usage: 0,
        }
    }

    /// Decodes a persisted super record, adopting its geometry
    /// verbatim.  Returns `None` if the magic does not match, in
    /// which case the volume is not (yet) one of ours.
    pub fn decode(
        bs: &[u8],
        disk_size: usize,
        io_size: usize,
    ) -> Option<SuperBlock> {
        if get_u32(bs, 0) != MAGIC {
            return None;
        }
        Some(SuperBlock {
            disk_size,
            io_size,
            block_size: io_size * 2,
            super_off: get_u32(bs, 4) as usize,
            super_blocks: get_u32(bs, 8) as usize,
            imap_off: get_u32(bs, 12) as usize,
            imap_blocks: get_u32(bs, 16) as usize,
            dmap_off: get_u32(bs, 20) as usize,
            dmap_blocks: get_u32(bs, 24) as usize,
            itab_off: get_u32(bs, 28) as usize,
            itab_blocks: get_u32(bs, 32) as usize,
            data_off: get_u32(bs, 36) as usize,
            data_blocks: get_u32(bs, 40) as usize,
            max_ino: get_u32(bs, 44) as usize,
            max_file_blocks: get_u32(bs, 48) as usize,
            root_ino: get_u32(bs, 52),
            usage: get_u32(bs, 56),
        })
    }

    /// Encodes the persisted fields into a super record.
    pub fn encode(&self, bs: &mut [u8]) {
        put_u32(bs, 0, MAGIC);
        put_u32(bs, 4, self.super_off as u32);
        put_u32(bs, 8, self.super_blocks as u32);
        put_u32(bs, 12, self.imap_off as u32);
        put_u32(bs, 16, self.imap_blocks as u32);
        put_u32(bs, 20, self.dmap_off as u32);
        put_u32(bs, 24, self.dmap_blocks as u32);
        put_u32(bs, 28, self.itab_off as u32);
        put_u32(bs, 32, self.itab_blocks as u32);
        put_u32(bs, 36, self.data_off as u32);
        put_u32(bs, 40, self.data_blocks as u32);
        put_u32(bs, 44, self.max_ino as u32);
        put_u32(bs, 48, self.max_file_blocks as u32);
        put_u32(bs, 52, self.root_ino);
        put_u32(bs, 56, self.usage);
    }

    /// Returns the byte offset of the given inode's record in
    /// the inode table.
    pub fn ino_offset(&self, ino: u32) -> usize {
        let ino = ino as usize;
        self.itab_off
            + (ino / INODES_PER_BLOCK) * self.block_size
            + (ino % INODES_PER_BLOCK) * DISK_INODE_SIZE
    }

    /// Returns the byte offset of the given data block.
    pub fn data_offset(&self, block: u32) -> usize {
        self.data_off + block as usize * self.block_size
    }

    /// Returns the number of dentry records that fit in one
    /// data block.
    pub fn dentries_per_block(&self) -> usize {
        self.block_size / DISK_DENTRY_SIZE
    }

    /// Returns the per-file payload cap, in bytes.
    pub fn file_cap(&self) -> usize {
        BLOCKS_PER_FILE * self.block_size
    }
}

/// The storage-resident form of an inode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskInode {
    pub ino: u32,
    pub size: u32,
    pub nlink: u32,
    pub ftype: FileType,
    /// Direct block pointers; `None` is stored as -1.
    pub blocks: [Option<u32>; BLOCKS_PER_FILE],
    /// Number of children; meaningful only for directories.
    pub dir_cnt: u32,
}

impl DiskInode {
    pub fn decode(bs: &[u8]) -> DiskInode {
        let mut blocks = [None; BLOCKS_PER_FILE];
        for (k, slot) in blocks.iter_mut().enumerate() {
            let raw = get_i32(bs, 16 + k * 4);
            if raw >= 0 {
                *slot = Some(raw as u32);
            }
        }
        DiskInode {
            ino: get_u32(bs, 0),
            size: get_u32(bs, 4),
            nlink: get_u32(bs, 8),
            ftype: FileType::from_raw(get_u32(bs, 12)),
            blocks,
            dir_cnt: get_u32(bs, 40),
        }
    }

    pub fn encode(&self, bs: &mut [u8]) {
        put_u32(bs, 0, self.ino);
        put_u32(bs, 4, self.size);
        put_u32(bs, 8, self.nlink);
        put_u32(bs, 12, self.ftype.raw());
        for (k, slot) in self.blocks.iter().enumerate() {
            put_i32(bs, 16 + k * 4, slot.map_or(-1, |b| b as i32));
        }
        put_u32(bs, 40, self.dir_cnt);
    }
}

/// The storage-resident form of a directory entry.  Dentry
/// records are packed end to end in the data blocks of the
/// directory that contains them.
#[derive(Clone)]
pub struct DiskDentry {
    pub name: [u8; MAX_NAME_LEN],
    pub ino: u32,
    pub ftype: FileType,
}

impl DiskDentry {
    /// Builds a record from an in-memory name, truncating it to
    /// the field size.
    pub fn new(name: &str, ino: u32, ftype: FileType) -> DiskDentry {
        let bs = name.as_bytes();
        let n = usize::min(bs.len(), MAX_NAME_LEN);
        let mut name = [0u8; MAX_NAME_LEN];
        name[..n].copy_from_slice(&bs[..n]);
        DiskDentry { name, ino, ftype }
    }

    pub fn decode(bs: &[u8]) -> DiskDentry {
        let mut name = [0u8; MAX_NAME_LEN];
        name.copy_from_slice(&bs[..MAX_NAME_LEN]);
        DiskDentry {
            name,
            ino: get_u32(bs, MAX_NAME_LEN),
            ftype: FileType::from_raw(get_u32(bs, MAX_NAME_LEN + 4)),
        }
    }

    pub fn encode(&self, bs: &mut [u8]) {
        bs[..MAX_NAME_LEN].copy_from_slice(&self.name);
        put_u32(bs, MAX_NAME_LEN, self.ino);
        put_u32(bs, MAX_NAME_LEN + 4, self.ftype.raw());
    }

    /// Returns the stored name, up to the first NUL.
    pub fn name(&self) -> &[u8] {
        if let Some(nul) = self.name.iter().position(|&b| b == 0u8) {
            &self.name[..nul]
        } else {
            &self.name
        }
    }
}

/// Clamps a name to the on-disk field size, respecting UTF-8
/// character boundaries.
pub(crate) fn clamp_name(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(Error::Inval);
    }
    if name.len() <= MAX_NAME_LEN {
        return Ok(name.into());
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    Ok(name[..end].into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn super_round_trip() {
        let sb = SuperBlock::format(4 << 20, DEFAULT_SECTOR_SIZE);
        let mut bs = [0u8; DISK_SUPER_SIZE];
        sb.encode(&mut bs);
        let back = SuperBlock::decode(&bs, 4 << 20, DEFAULT_SECTOR_SIZE)
            .expect("magic matches");
        assert_eq!(back.itab_off, 3 * 1024);
        assert_eq!(back.data_off, 259 * 1024);
        assert_eq!(back.data_blocks, DATA_BLOCKS);
        assert_eq!(back.max_ino, 4096);
        assert_eq!(back.root_ino, ROOT_INO);
    }

    #[test]
    fn super_bad_magic() {
        let bs = [0u8; DISK_SUPER_SIZE];
        assert!(SuperBlock::decode(&bs, 4 << 20, 512).is_none());
    }

    #[test]
    fn inode_offsets() {
        let sb = SuperBlock::format(4 << 20, 512);
        assert_eq!(sb.ino_offset(0), 3 * 1024);
        assert_eq!(sb.ino_offset(15), 3 * 1024 + 15 * DISK_INODE_SIZE);
        assert_eq!(sb.ino_offset(16), 4 * 1024);
        assert_eq!(sb.dentries_per_block(), 7);
    }

    #[test]
    fn inode_record_unassigned_pointers() {
        let rec = DiskInode {
            ino: 9,
            size: 1030,
            nlink: 1,
            ftype: FileType::Regular,
            blocks: [Some(3), Some(17), None, None, None, None],
            dir_cnt: 0,
        };
        let mut bs = [0u8; DISK_INODE_SIZE];
        rec.encode(&mut bs);
        // Unassigned slots persist as -1.
        assert_eq!(i32::from_ne_bytes(bs[24..28].try_into().unwrap()), -1);
        assert_eq!(DiskInode::decode(&bs), rec);
    }

    #[test]
    fn dentry_name_is_nul_trimmed() {
        let mut bs = [0u8; DISK_DENTRY_SIZE];
        DiskDentry::new("passwd", 7, FileType::Regular).encode(&mut bs);
        let back = DiskDentry::decode(&bs);
        assert_eq!(back.name(), b"passwd");
        assert_eq!(back.ino, 7);
        assert_eq!(back.ftype, FileType::Regular);
    }

    #[test]
    fn dentry_name_fills_field() {
        let long = "x".repeat(MAX_NAME_LEN + 40);
        let clamped = clamp_name(&long).unwrap();
        assert_eq!(clamped.len(), MAX_NAME_LEN);
        let mut bs = [0u8; DISK_DENTRY_SIZE];
        DiskDentry::new(&clamped, 1, FileType::Dir).encode(&mut bs);
        assert_eq!(DiskDentry::decode(&bs).name().len(), MAX_NAME_LEN);
    }

    #[test]
    fn clamp_name_rejects_empty() {
        assert!(clamp_name("").is_err());
        assert_eq!(clamp_name("a").unwrap(), "a");
    }
}
