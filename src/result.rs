// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::fmt;

/// Various errors
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum Error {
    NotFound,
    Exists,
    NotDir,
    IsDir,
    NoSpace,
    Seek,
    Io,
    Inval,
    Unsupported,
    Access,
}

impl Error {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "No such file or directory",
            Self::Exists => "File exists",
            Self::NotDir => "Not a directory",
            Self::IsDir => "Is a directory",
            Self::NoSpace => "No free inodes or data blocks",
            Self::Seek => "Offset exceeds file size",
            Self::Io => "Device I/O error",
            Self::Inval => "Invalid request",
            Self::Unsupported => "Descent through a regular file",
            Self::Access => "Access check refused",
        }
    }

    /// Returns the negated errno value the host bridge hands back
    /// to the kernel for this error.
    pub fn errno(self) -> i32 {
        -match self {
            Self::NotFound => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotDir => libc::ENOTDIR,
            Self::IsDir => libc::EISDIR,
            Self::NoSpace => libc::ENOSPC,
            Self::Seek => libc::ESPIPE,
            Self::Io => libc::EIO,
            Self::Inval => libc::EINVAL,
            Self::Unsupported => libc::ENXIO,
            Self::Access => libc::EACCES,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> core::result::Result<(), fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> core::result::Result<(), fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn errno_is_negative() {
        assert_eq!(Error::NotFound.errno(), -libc::ENOENT);
        assert_eq!(Error::Seek.errno(), -libc::ESPIPE);
        assert_eq!(Error::Unsupported.errno(), -libc::ENXIO);
        assert!(Error::Io.errno() < 0);
    }
}
