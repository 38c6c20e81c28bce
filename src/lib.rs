// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small POSIX-style filesystem over a fixed-size block
//! device.
//!
//! The volume is carved into five contiguous regions (super
//! block, inode bitmap, data bitmap, inode table, data region)
//! and files are limited to six direct data blocks each.  The
//! engine keeps a lazily populated dentry/inode tree in memory:
//! the path resolver faults inodes in on first visit, every
//! mutation happens in memory, and a clean unmount is the only
//! durable save point, recursively flushing the tree and then
//! the super block and bitmaps.
//!
//! The host bridge that turns kernel VFS calls into operations,
//! and the block-device driver itself, live elsewhere; this
//! crate defines the driver contract ([`BlockDriver`]) and ships
//! an in-memory and a file-backed implementation.  A mounted
//! volume is a [`Filesystem`] value: constructed by
//! [`Filesystem::mount`], driven through exclusive-reference
//! operation methods, consumed by [`Filesystem::unmount`].
//!
//! ```
//! use bitfs::{FileType, Filesystem, RamDisk};
//!
//! let mut fs = Filesystem::mount(Box::new(RamDisk::new(4 << 20, 512)))?;
//! fs.mkdir("/etc")?;
//! fs.mknod("/etc/motd", FileType::Regular)?;
//! fs.write("/etc/motd", b"welcome\n", 0)?;
//! let mut bs = [0u8; 8];
//! fs.read("/etc/motd", &mut bs, 0)?;
//! assert_eq!(&bs, b"welcome\n");
//! fs.unmount()?;
//! # Ok::<(), bitfs::Error>(())
//! ```

mod bitmap;
mod device;
mod fs;
mod layout;
mod result;

pub use device::{BlockDriver, Disk, FileDisk, RamDisk};
pub use fs::{Amode, DirEntry, FileAttr, Filesystem, Mode};
pub use layout::{BLOCKS_PER_FILE, FileType, MAX_NAME_LEN};
pub use result::{Error, Result};
