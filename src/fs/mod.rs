// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The filesystem engine.
//!
//! A [`Filesystem`] is constructed by [`Filesystem::mount`] and
//! consumed by [`Filesystem::unmount`]; every operation takes it
//! by exclusive reference, which makes the single-threaded
//! discipline of the design checkable instead of implicit.
//!
//! Mount adopts the on-disk geometry when the super block's
//! magic matches, and otherwise formats the volume in memory:
//! default geometry, zeroed bitmaps, and a freshly allocated
//! root inode whose record is flushed immediately so that the
//! lazy loader can read it back.  Everything else stays in
//! memory until unmount, which recursively serializes the
//! dentry/inode tree (freeing it as it goes), then writes the
//! super block and both bitmaps.  A crash before unmount loses
//! all changes since mount; the disk keeps the state of the last
//! clean unmount.
//!
//! Inodes are materialized lazily: a dentry read in from a
//! directory block names its inode but does not load it, and the
//! path resolver faults inodes in on first visit.

mod lookup;
mod node;
mod ops;

pub use ops::{Amode, DirEntry, FileAttr, Mode};

use crate::bitmap::Bitmap;
use crate::device::{BlockDriver, Disk};
use crate::layout::{
    self, BLOCKS_PER_FILE, DiskDentry, DiskInode, FileType, SuperBlock,
};
use crate::result::Result;

use node::{Arena, Binding, Dentry, DentryId, Inode};

use std::collections::HashMap;

/// A mounted volume: the block device, the super block, both
/// allocation bitmaps, and the root of the dentry/inode tree.
pub struct Filesystem {
    pub(crate) disk: Disk,
    pub(crate) sb: SuperBlock,
    pub(crate) imap: Bitmap,
    pub(crate) dmap: Bitmap,
    pub(crate) dentries: Arena,
    pub(crate) inodes: HashMap<u32, Inode>,
    pub(crate) root: DentryId,
    mounted: bool,
}

impl Filesystem {
    /// Mounts the volume behind `drv`, formatting it in memory
    /// first if the super block's magic does not match.
    pub fn mount(drv: Box<dyn BlockDriver>) -> Result<Filesystem> {
        let mut disk = Disk::new(drv)?;
        let mut sbuf = [0u8; layout::DISK_SUPER_SIZE];
        disk.read_at(0, &mut sbuf)?;
        let decoded = SuperBlock::decode(&sbuf, disk.size(), disk.io_size());
        let (sb, is_init) = match decoded {
            Some(sb) => (sb, false),
            None => {
                log::debug!("mount: no magic; device is unformatted");
                (SuperBlock::format(disk.size(), disk.io_size()), true)
            }
        };

        let imap_len = sb.imap_blocks * sb.block_size;
        let dmap_len = sb.dmap_blocks * sb.block_size;
        let (imap, dmap) = if is_init {
            // A fresh volume starts with nothing allocated;
            // whatever the device held before is not ours.
            (
                Bitmap::zeroed(imap_len, sb.max_ino),
                Bitmap::zeroed(dmap_len, sb.data_blocks),
            )
        } else {
            let mut ibytes = vec![0u8; imap_len];
            disk.read_at(sb.imap_off, &mut ibytes)?;
            let mut dbytes = vec![0u8; dmap_len];
            disk.read_at(sb.dmap_off, &mut dbytes)?;
            (
                Bitmap::from_bytes(ibytes, sb.max_ino),
                Bitmap::from_bytes(dbytes, sb.data_blocks),
            )
        };

        let mut dentries = Arena::new();
        let binding = if is_init {
            Binding::Unbound
        } else {
            Binding::OnDisk(sb.root_ino)
        };
        let root = dentries.insert(Dentry {
            name: "/".into(),
            ftype: FileType::Dir,
            binding,
            parent: None,
            next: None,
        });

        let mut fs = Filesystem {
            disk,
            sb,
            imap,
            dmap,
            dentries,
            inodes: HashMap::new(),
            root,
            mounted: false,
        };

        if is_init {
            // Give the root dentry an inode and flush its record
            // so the read-back below finds it on disk.
            let ino = fs.alloc_inode(fs.root)?;
            fs.sb.root_ino = ino;
            fs.sync_inode(ino)?;
        }
        let (root, root_ino) = (fs.root, fs.sb.root_ino);
        fs.read_inode(root, root_ino)?;
        fs.mounted = true;
        log::debug!(
            "mount: {} blocks of {} bytes; {} inodes, {} data blocks in use",
            fs.sb.disk_size / fs.sb.block_size,
            fs.sb.block_size,
            fs.imap.in_use(),
            fs.dmap.in_use(),
        );
        Ok(fs)
    }

    /// Returns whether the volume is mounted.
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Unmounts the volume: flushes the whole tree from the root
    /// down, then the super block and both bitmaps, and closes
    /// the driver.  This is the only durable save point.
    pub fn unmount(mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        let root_ino = self.sb.root_ino;
        self.sync_inode(root_ino)?;

        let mut sbuf = [0u8; layout::DISK_SUPER_SIZE];
        self.sb.encode(&mut sbuf);
        self.disk.write_at(self.sb.super_off, &sbuf)?;
        self.disk.write_at(self.sb.imap_off, self.imap.as_bytes())?;
        self.disk.write_at(self.sb.dmap_off, self.dmap.as_bytes())?;
        log::debug!(
            "unmount: clean; {} inodes, {} data blocks in use",
            self.imap.in_use(),
            self.dmap.in_use(),
        );
        self.disk.close()
    }

    /// Reads the inode record for `ino` and materializes it
    /// behind the dentry `did`.  Directories pull their child
    /// dentry records in as well (but not the children's
    /// inodes); regular files get six zeroed block buffers, and
    /// only the buffers behind assigned pointers are read.
    pub(crate) fn read_inode(&mut self, did: DentryId, ino: u32) -> Result<()> {
        let mut buf = [0u8; layout::DISK_INODE_SIZE];
        let off = self.sb.ino_offset(ino);
        self.disk.read_at(off, &mut buf)?;
        let rec = DiskInode::decode(&buf);

        let mut data = Vec::new();
        if rec.ftype == FileType::Regular {
            data = (0..BLOCKS_PER_FILE)
                .map(|_| vec![0u8; self.sb.block_size])
                .collect();
            for (slot, block) in rec.blocks.iter().enumerate() {
                if let Some(b) = block {
                    let off = self.sb.data_offset(*b);
                    self.disk.read_at(off, &mut data[slot])?;
                }
            }
        }
        self.inodes.insert(
            rec.ino,
            Inode {
                ino: rec.ino,
                size: rec.size,
                nlink: rec.nlink,
                ftype: rec.ftype,
                dentry: did,
                children: None,
                dir_cnt: 0,
                blocks: rec.blocks,
                data,
            },
        );
        self.dentries[did].binding = Binding::InCore(rec.ino);

        if rec.ftype == FileType::Dir {
            // Stream the packed dentry records back out of the
            // directory's data blocks, in block-pointer order.
            // Relinking each child through link_dentry rebuilds
            // dir_cnt to the persisted value.
            let per = self.sb.dentries_per_block();
            let mut remaining = rec.dir_cnt;
            for block in rec.blocks.iter() {
                if remaining == 0 {
                    break;
                }
                let Some(b) = block else { break };
                let base = self.sb.data_offset(*b);
                for k in 0..per {
                    if remaining == 0 {
                        break;
                    }
                    let mut dbuf = [0u8; layout::DISK_DENTRY_SIZE];
                    let off = base + k * layout::DISK_DENTRY_SIZE;
                    self.disk.read_at(off, &mut dbuf)?;
                    let drec = DiskDentry::decode(&dbuf);
                    let name = String::from_utf8_lossy(drec.name()).into_owned();
                    let child = self.dentries.insert(Dentry {
                        name,
                        ftype: drec.ftype,
                        binding: Binding::OnDisk(drec.ino),
                        parent: Some(did),
                        next: None,
                    });
                    self.link_dentry(rec.ino, child)?;
                    remaining -= 1;
                }
            }
        }
        Ok(())
    }

    /// Writes `ino` and everything beneath it back to disk,
    /// consuming the in-memory tree as it goes.  The inode
    /// record is written first; directories then write each
    /// child's dentry record at its slot offset and recurse into
    /// loaded children; regular files write the buffers behind
    /// assigned pointers.  The naming dentry reverts to a lazy
    /// binding; child dentries are released entirely.
    pub(crate) fn sync_inode(&mut self, ino: u32) -> Result<()> {
        let node = self.inodes.remove(&ino).expect("inode loaded");
        let rec = DiskInode {
            ino: node.ino,
            size: node.size,
            nlink: node.nlink,
            ftype: node.ftype,
            blocks: node.blocks,
            dir_cnt: node.dir_cnt,
        };
        let mut buf = [0u8; layout::DISK_INODE_SIZE];
        rec.encode(&mut buf);
        let off = self.sb.ino_offset(ino);
        self.disk.write_at(off, &buf)?;

        match node.ftype {
            FileType::Dir => {
                let mut kids = Vec::new();
                let mut cur = node.children;
                while let Some(c) = cur {
                    kids.push(c);
                    cur = self.dentries[c].next;
                }
                let per = self.sb.dentries_per_block();
                for (index, child) in kids.into_iter().enumerate() {
                    let block =
                        node.blocks[index / per].expect("directory block assigned");
                    let off = self.sb.data_offset(block)
                        + (index % per) * layout::DISK_DENTRY_SIZE;
                    let (drec, binding) = {
                        let dentry = &self.dentries[child];
                        let cino =
                            dentry.binding.ino().expect("child dentry bound");
                        let drec =
                            DiskDentry::new(&dentry.name, cino, dentry.ftype);
                        (drec, dentry.binding)
                    };
                    let mut dbuf = [0u8; layout::DISK_DENTRY_SIZE];
                    drec.encode(&mut dbuf);
                    self.disk.write_at(off, &dbuf)?;
                    if let Binding::InCore(cino) = binding {
                        self.sync_inode(cino)?;
                    }
                    self.dentries.remove(child);
                }
            }
            FileType::Regular => {
                for (slot, block) in node.blocks.iter().enumerate() {
                    if let Some(b) = block {
                        let off = self.sb.data_offset(*b);
                        self.disk.write_at(off, &node.data[slot])?;
                    }
                }
            }
        }
        self.dentries[node.dentry].binding = Binding::OnDisk(ino);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Filesystem;
    use crate::device::{FileDisk, RamDisk};
    use crate::layout::{FileType, ROOT_INO};

    const DEV_SIZE: usize = 4 << 20;

    fn dev() -> RamDisk {
        let _ = env_logger::builder().is_test(true).try_init();
        RamDisk::new(DEV_SIZE, 512)
    }

    #[test]
    fn mount_formats_fresh_device() {
        let fs = Filesystem::mount(Box::new(dev())).unwrap();
        assert!(fs.is_mounted());
        assert_eq!(fs.sb.root_ino, ROOT_INO);
        assert!(fs.imap.test(ROOT_INO));
        assert_eq!(fs.imap.in_use(), 1);
        assert_eq!(fs.dmap.in_use(), 0);
        assert_eq!(fs.sb.block_size, 1024);
        fs.unmount().unwrap();
    }

    #[test]
    fn remount_adopts_persisted_geometry() {
        let dev = dev();
        let fs = Filesystem::mount(Box::new(dev.handle())).unwrap();
        fs.unmount().unwrap();

        // Second mount must find the magic and not reformat.
        let fs = Filesystem::mount(Box::new(dev.handle())).unwrap();
        assert_eq!(fs.sb.itab_off, 3 * 1024);
        assert_eq!(fs.sb.data_off, 259 * 1024);
        assert_eq!(fs.imap.in_use(), 1);
        fs.unmount().unwrap();
    }

    #[test]
    fn tree_survives_remount() {
        let dev = dev();
        let mut fs = Filesystem::mount(Box::new(dev.handle())).unwrap();
        fs.mkdir("/boot").unwrap();
        fs.mkdir("/boot/grub").unwrap();
        fs.mknod("/boot/grub/menu.lst", FileType::Regular).unwrap();
        fs.write("/boot/grub/menu.lst", b"timeout=0", 0).unwrap();
        fs.mknod("/kernel", FileType::Regular).unwrap();
        fs.write("/kernel", &[0x7f; 2000], 0).unwrap();
        fs.unmount().unwrap();

        let mut fs = Filesystem::mount(Box::new(dev.handle())).unwrap();
        let mut bs = [0u8; 9];
        assert_eq!(fs.read("/boot/grub/menu.lst", &mut bs, 0).unwrap(), 9);
        assert_eq!(&bs, b"timeout=0");
        assert_eq!(fs.getattr("/kernel").unwrap().size, 2000);
        let mut bs = [0u8; 2000];
        fs.read("/kernel", &mut bs, 0).unwrap();
        assert!(bs.iter().all(|&b| b == 0x7f));
        fs.unmount().unwrap();
    }

    #[test]
    fn recursive_rmdir_after_remount() {
        let dev = dev();
        let mut fs = Filesystem::mount(Box::new(dev.handle())).unwrap();
        fs.mkdir("/tmp").unwrap();
        fs.mkdir("/tmp/deep").unwrap();
        fs.mknod("/tmp/deep/file", FileType::Regular).unwrap();
        fs.write("/tmp/deep/file", &[1u8; 1500], 0).unwrap();
        fs.unmount().unwrap();

        // The children of /tmp are lazily bound after remount;
        // dropping the directory must fault them in to free
        // their blocks.
        let mut fs = Filesystem::mount(Box::new(dev.handle())).unwrap();
        fs.rmdir("/tmp").unwrap();
        assert_eq!(fs.imap.in_use(), 1);
        assert_eq!(fs.getattr("/tmp").unwrap_err().errno(), -libc::ENOENT);
        fs.unmount().unwrap();

        let mut fs = Filesystem::mount(Box::new(dev.handle())).unwrap();
        assert_eq!(fs.imap.in_use(), 1);
        assert!(fs.readdir("/", 0).unwrap().is_none());
        fs.unmount().unwrap();
    }

    #[test]
    fn file_backed_device_round_trip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(DEV_SIZE as u64).unwrap();

        let mut fs =
            Filesystem::mount(Box::new(FileDisk::open(tmp.path()).unwrap()))
                .unwrap();
        fs.mknod("/disk.id", FileType::Regular).unwrap();
        fs.write("/disk.id", b"0xcafe", 0).unwrap();
        fs.unmount().unwrap();

        let mut fs =
            Filesystem::mount(Box::new(FileDisk::open(tmp.path()).unwrap()))
                .unwrap();
        let mut bs = [0u8; 6];
        fs.read("/disk.id", &mut bs, 0).unwrap();
        assert_eq!(&bs, b"0xcafe");
        fs.unmount().unwrap();
    }

    #[test]
    fn unmount_of_empty_volume_is_stable() {
        let dev = dev();
        for _ in 0..3 {
            let fs = Filesystem::mount(Box::new(dev.handle())).unwrap();
            assert_eq!(fs.imap.in_use(), 1);
            fs.unmount().unwrap();
        }
    }
}
