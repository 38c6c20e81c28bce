// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The path resolver.
//!
//! Walks an absolute `/`-separated path from the root dentry,
//! faulting inodes in from disk the first time a step visits
//! them.  Resolution does not fail as such: a miss returns the
//! dentry of the last component that did resolve, and the
//! caller decides what the miss means (an error for `getattr`,
//! the parent-to-be for `mkdir`).

use crate::layout::FileType;
use crate::result::Result;

use super::Filesystem;
use super::node::DentryId;

/// The outcome of a path walk.  `dentry` always has its inode
/// resident on return.
pub(crate) struct Lookup {
    /// The resolved dentry on a hit; the last valid dentry on a
    /// miss.
    pub dentry: DentryId,
    /// Whether every component resolved.
    pub found: bool,
    /// Whether the path was exactly the root.
    pub root: bool,
}

impl Filesystem {
    pub(crate) fn lookup(&mut self, path: &str) -> Result<Lookup> {
        let mut components = path.split('/').filter(|c| !c.is_empty());
        let mut cur = self.root;
        let Some(mut name) = components.next() else {
            self.ensure_loaded(cur)?;
            return Ok(Lookup { dentry: cur, found: true, root: true });
        };
        loop {
            let ino = self.ensure_loaded(cur)?;
            if self.node(ino).ftype == FileType::Regular {
                // Descent through a regular file; hand back the
                // file's own dentry.
                log::debug!("lookup: {name}: not a directory");
                return Ok(Lookup { dentry: cur, found: false, root: false });
            }
            match self.find_child(ino, name) {
                Some(child) => cur = child,
                None => {
                    log::debug!("lookup: {name}: not found");
                    return Ok(Lookup {
                        dentry: cur,
                        found: false,
                        root: false,
                    });
                }
            }
            match components.next() {
                Some(next) => name = next,
                None => break,
            }
        }
        self.ensure_loaded(cur)?;
        Ok(Lookup { dentry: cur, found: true, root: false })
    }
}
