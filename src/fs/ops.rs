// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The operation layer: the path-addressed entry points the
//! host bridge calls.  Each operation resolves its path, checks
//! its preconditions, and mutates the in-memory object graph;
//! nothing here touches the disk except through the lazy loader.
//! The bridge turns an `Err` into a negative return value with
//! [`Error::errno`].

use crate::layout::{self, BLOCKS_PER_FILE, FileType};
use crate::result::{Error, Result};

use super::Filesystem;
use super::node::{Binding, Dentry};

use bitflags::bitflags;
use bitstruct::bitstruct;
use core::fmt::{self, Write};

/// File-type nibbles of the mode word, as in `stat(2)`.
const IFDIR: u8 = 0o04;
const IFREG: u8 = 0o10;

bitstruct! {
    /// An `st_mode`-shaped word: the fixed permission bits plus
    /// the file type in bits 12..=15.
    #[derive(Clone, Copy, Eq, PartialEq)]
    pub struct Mode(u16) {
        ox: bool = 0;
        ow: bool = 1;
        or: bool = 2;
        gx: bool = 3;
        gw: bool = 4;
        gr: bool = 5;
        ux: bool = 6;
        uw: bool = 7;
        ur: bool = 8;
        typ: FileType = 12..=15;
    }
}

impl bitstruct::FromRaw<u8, FileType> for Mode {
    fn from_raw(raw: u8) -> FileType {
        match raw {
            IFDIR => FileType::Dir,
            _ => FileType::Regular,
        }
    }
}

impl bitstruct::IntoRaw<u8, FileType> for Mode {
    fn into_raw(typ: FileType) -> u8 {
        match typ {
            FileType::Dir => IFDIR,
            FileType::Regular => IFREG,
        }
    }
}

impl Mode {
    /// Every object carries the same permissions: rwxr-xr-x.
    pub(crate) fn new(typ: FileType) -> Mode {
        Mode(0)
            .with_typ(typ)
            .with_ur(true)
            .with_uw(true)
            .with_ux(true)
            .with_gr(true)
            .with_gx(true)
            .with_or(true)
            .with_ox(true)
    }

    /// Returns the file type encoded in the mode.
    pub fn file_type(self) -> FileType {
        self.typ()
    }

    /// Returns the raw mode word.
    pub fn bits(self) -> u16 {
        self.0
    }
}

// The "Debug" output for a mode is meant to closely resemble
// the first field in the output of `ls -l`.
impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn alt(b: bool, t: char, f: char) -> char {
            if b { t } else { f }
        }
        f.write_char(self.typ().as_char())?;
        f.write_char(alt(self.ur(), 'r', '-'))?;
        f.write_char(alt(self.uw(), 'w', '-'))?;
        f.write_char(alt(self.ux(), 'x', '-'))?;
        f.write_char(alt(self.gr(), 'r', '-'))?;
        f.write_char(alt(self.gw(), 'w', '-'))?;
        f.write_char(alt(self.gx(), 'x', '-'))?;
        f.write_char(alt(self.or(), 'r', '-'))?;
        f.write_char(alt(self.ow(), 'w', '-'))?;
        f.write_char(alt(self.ox(), 'x', '-'))
    }
}

bitflags! {
    /// `access(2)` mode bits.  The empty set is `F_OK`, a bare
    /// existence probe.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Amode: u32 {
        const EXEC = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

/// The stat-shaped result of `getattr`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileAttr {
    pub mode: Mode,
    pub size: u64,
    pub nlink: u32,
    pub blksize: u32,
    pub blocks: u64,
}

/// One `readdir` result: a child's name and type, plus the
/// offset to hand back for the next entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub ftype: FileType,
    pub next: u64,
}

/// Returns the last path component.
fn basename(path: &str) -> Option<&str> {
    path.rsplit('/').find(|c| !c.is_empty())
}

/// Returns the intra-block offset and length of the piece of a
/// transfer that lands in `slot`, for `len` bytes at `off`
/// spanning slots `first..=last`, with `done` bytes already
/// transferred.
fn slice_of(
    slot: usize,
    first: usize,
    last: usize,
    off: usize,
    len: usize,
    done: usize,
    bsize: usize,
) -> (usize, usize) {
    if first == last {
        (off % bsize, len)
    } else if slot == first {
        (off % bsize, bsize - off % bsize)
    } else if slot == last {
        (0, len - done)
    } else {
        (0, bsize)
    }
}

impl Filesystem {
    fn create(&mut self, path: &str, ftype: FileType) -> Result<()> {
        let target = self.lookup(path)?;
        if target.found {
            return Err(Error::Exists);
        }
        let parent = target.dentry;
        let pino = self.ensure_loaded(parent)?;
        if self.node(pino).ftype == FileType::Regular {
            return Err(Error::Unsupported);
        }
        let name = basename(path).ok_or(Error::Inval)?;
        let name = layout::clamp_name(name)?;
        // Names are unique among siblings; on a multi-level miss
        // the resolved directory is not the one the final
        // component was checked against.
        if self.find_child(pino, &name).is_some() {
            return Err(Error::Exists);
        }
        let child = self.dentries.insert(Dentry::new(name, ftype, Some(parent)));
        self.alloc_inode(child)?;
        self.link_dentry(pino, child)
    }

    /// Creates a directory at `path`.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.create(path, FileType::Dir)
    }

    /// Creates a filesystem object at `path`; the bridge reduces
    /// the `mknod` mode to a file type.
    pub fn mknod(&mut self, path: &str, ftype: FileType) -> Result<()> {
        self.create(path, ftype)
    }

    /// Removes the regular file at `path`.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        let target = self.lookup(path)?;
        if !target.found {
            return Err(Error::NotFound);
        }
        let did = target.dentry;
        let ino = self.ensure_loaded(did)?;
        if self.node(ino).ftype == FileType::Dir {
            return Err(Error::IsDir);
        }
        self.drop_inode(ino)?;
        let parent = self.dentries[did].parent.expect("file has a parent");
        let pino = self.ensure_loaded(parent)?;
        self.unlink_dentry(pino, did)
    }

    /// Removes the directory at `path` and everything in it.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let target = self.lookup(path)?;
        if !target.found {
            return Err(Error::NotFound);
        }
        let did = target.dentry;
        let ino = self.ensure_loaded(did)?;
        if self.node(ino).ftype == FileType::Regular {
            return Err(Error::NotDir);
        }
        // Refuses the root.
        self.drop_inode(ino)?;
        let parent = self.dentries[did].parent.expect("directory has a parent");
        let pino = self.ensure_loaded(parent)?;
        self.unlink_dentry(pino, did)
    }

    /// Moves `from` to `to`, which must not already exist.  The
    /// destination is created through `mknod`, its placeholder
    /// inode freed, and its dentry redirected at the source's
    /// inode; the children of a moved directory are re-homed to
    /// the destination dentry, and the source dentry is dropped.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let src = self.lookup(from)?;
        if !src.found {
            return Err(Error::NotFound);
        }
        if src.root {
            return Err(Error::Inval);
        }
        if from == to {
            return Ok(());
        }
        let from_d = src.dentry;
        let from_ino = self.ensure_loaded(from_d)?;
        let ftype = self.node(from_ino).ftype;

        self.mknod(to, ftype)?;
        let dst = self.lookup(to)?;
        let to_d = dst.dentry;
        let placeholder = self.ensure_loaded(to_d)?;
        self.drop_inode(placeholder)?;

        self.dentries[to_d].binding = Binding::InCore(from_ino);
        self.node_mut(from_ino).dentry = to_d;
        // A moved directory's children still name the source
        // dentry as their parent; re-home them before it is
        // released below.
        let mut cur = self.node(from_ino).children;
        while let Some(c) = cur {
            self.dentries[c].parent = Some(to_d);
            cur = self.dentries[c].next;
        }

        let parent = self.dentries[from_d].parent.expect("source has a parent");
        let pino = self.ensure_loaded(parent)?;
        self.unlink_dentry(pino, from_d)
    }

    /// Sets the size of the regular file at `path`.  Data blocks
    /// are neither allocated nor reclaimed.
    pub fn truncate(&mut self, path: &str, size: u64) -> Result<()> {
        let target = self.lookup(path)?;
        if !target.found {
            return Err(Error::NotFound);
        }
        let ino = self.ensure_loaded(target.dentry)?;
        if self.node(ino).ftype == FileType::Dir {
            return Err(Error::IsDir);
        }
        let cap = self.sb.file_cap() as u64;
        self.node_mut(ino).size = u64::min(size, cap) as u32;
        Ok(())
    }

    /// Returns the attributes of the object at `path`.
    pub fn getattr(&mut self, path: &str) -> Result<FileAttr> {
        let target = self.lookup(path)?;
        if !target.found {
            return Err(Error::NotFound);
        }
        let ino = self.ensure_loaded(target.dentry)?;
        let node = self.node(ino);
        let size = match node.ftype {
            FileType::Dir => {
                node.dir_cnt as u64 * layout::DISK_DENTRY_SIZE as u64
            }
            FileType::Regular => node.size as u64,
        };
        let mut attr = FileAttr {
            mode: Mode::new(node.ftype),
            size,
            nlink: 1,
            blksize: self.sb.io_size as u32,
            blocks: 0,
        };
        if target.root {
            attr.size = self.sb.usage as u64;
            attr.blocks = (self.sb.disk_size / self.sb.io_size) as u64;
            attr.nlink = 2;
        }
        Ok(attr)
    }

    /// Returns the `off`-th entry of the directory at `path`,
    /// in reverse insertion order, or `None` past the end.
    pub fn readdir(&mut self, path: &str, off: u64) -> Result<Option<DirEntry>> {
        let target = self.lookup(path)?;
        if !target.found {
            return Err(Error::NotFound);
        }
        let ino = self.ensure_loaded(target.dentry)?;
        let mut cur = self.node(ino).children;
        let mut index = 0;
        while let Some(c) = cur {
            let dentry = &self.dentries[c];
            if index == off {
                return Ok(Some(DirEntry {
                    name: dentry.name.clone(),
                    ftype: dentry.ftype,
                    next: off + 1,
                }));
            }
            index += 1;
            cur = dentry.next;
        }
        Ok(None)
    }

    /// Reads `bs.len()` bytes at `off` from the regular file at
    /// `path`.  Returns the number of bytes copied; the transfer
    /// is clamped to the six direct blocks.
    pub fn read(&mut self, path: &str, bs: &mut [u8], off: usize) -> Result<usize> {
        let target = self.lookup(path)?;
        if !target.found {
            return Err(Error::NotFound);
        }
        let ino = self.ensure_loaded(target.dentry)?;
        let node = self.node(ino);
        if node.ftype == FileType::Dir {
            return Err(Error::IsDir);
        }
        if off > node.size as usize {
            return Err(Error::Seek);
        }
        if bs.is_empty() {
            return Ok(0);
        }
        let bsize = self.sb.block_size;
        let first = off / bsize;
        let last = (off + bs.len() - 1) / bsize;
        let mut done = 0;
        for slot in first..=usize::min(last, BLOCKS_PER_FILE - 1) {
            let (begin, len) =
                slice_of(slot, first, last, off, bs.len(), done, bsize);
            bs[done..done + len]
                .copy_from_slice(&node.data[slot][begin..begin + len]);
            done += len;
        }
        Ok(done)
    }

    /// Writes `bs` at `off` into the regular file at `path`,
    /// allocating absent data blocks on demand.  The file grows
    /// to `max(size, off + len)`, capped at six blocks; bytes
    /// past the cap are silently skipped.
    pub fn write(&mut self, path: &str, bs: &[u8], off: usize) -> Result<usize> {
        let target = self.lookup(path)?;
        if !target.found {
            return Err(Error::NotFound);
        }
        let ino = self.ensure_loaded(target.dentry)?;
        if self.node(ino).ftype == FileType::Dir {
            return Err(Error::IsDir);
        }
        if off > self.node(ino).size as usize {
            return Err(Error::Seek);
        }
        if bs.is_empty() {
            return Ok(0);
        }
        let bsize = self.sb.block_size;
        let first = off / bsize;
        let last = (off + bs.len() - 1) / bsize;
        for slot in first..=usize::min(last, BLOCKS_PER_FILE - 1) {
            if self.node(ino).blocks[slot].is_none() {
                self.alloc_data(ino, slot)?;
            }
        }
        let cap = self.sb.file_cap();
        let node = self.node_mut(ino);
        let mut done = 0;
        for slot in first..=usize::min(last, BLOCKS_PER_FILE - 1) {
            let (begin, len) =
                slice_of(slot, first, last, off, bs.len(), done, bsize);
            node.data[slot][begin..begin + len]
                .copy_from_slice(&bs[done..done + len]);
            done += len;
        }
        node.size = u32::max(node.size, usize::min(off + bs.len(), cap) as u32);
        Ok(bs.len())
    }

    /// Checks accessibility of `path`.  Read, write and execute
    /// probes always pass; only the existence probe (the empty
    /// set, `F_OK`) can be refused.
    pub fn access(&mut self, path: &str, what: Amode) -> Result<()> {
        let target = self.lookup(path)?;
        if what.is_empty() && !target.found {
            return Err(Error::Access);
        }
        Ok(())
    }

    /// File handles carry no state; opening always succeeds.
    pub fn open(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }

    /// See [`Filesystem::open`].
    pub fn opendir(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }

    /// Timestamps are not stored.
    pub fn utimens(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }
}
