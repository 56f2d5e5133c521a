//! Filesystem layer.
//!
//! [`vfs`] mounts concrete filesystems into one namespace addressed by
//! `[volume]filename` pathnames and tracks open files; [`tfs`] is the
//! single-directory on-disk filesystem that lives on a generic block
//! device; [`filesystems`] probes a disk with every known filesystem
//! driver until one accepts it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod filesystems;
pub mod path;
pub mod tfs;
pub mod vfs;

use core::fmt;

use alloc::sync::Arc;

/// Maximum length of volume names and filenames, including the NUL
/// padding byte.
pub const NAME_LENGTH: usize = 16;

/// Result of a filesystem-layer call.
pub type VfsResult<T> = Result<T, VfsError>;

/// Errors of the filesystem layer.
///
/// [`as_code`](VfsError::as_code) gives the numeric contract shared
/// with the syscall surface; success is `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    /// The filesystem does not implement this operation.
    NotSupported,
    /// Catch-all failure (bad path, duplicate name, I/O error).
    Error,
    /// A parameter is out of range.
    InvalidParams,
    /// The file handle is not open.
    NotOpen,
    /// No such file.
    NotFound,
    /// No filesystem with that volume name is mounted.
    NoSuchFs,
    /// A fixed table is full.
    Limit,
    /// The filesystem has open files and cannot be unmounted.
    InUse,
    /// The VFS has been shut down and will never come back.
    Unusable,
}

impl VfsError {
    /// The numeric error code.
    pub const fn as_code(self) -> i32 {
        match self {
            Self::NotSupported => -1,
            Self::Error => -2,
            Self::InvalidParams => -3,
            Self::NotOpen => -4,
            Self::NotFound => -5,
            Self::NoSuchFs => -6,
            Self::Limit => -7,
            Self::InUse => -8,
            Self::Unusable => -9,
        }
    }
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotSupported => "operation not supported",
            Self::Error => "filesystem error",
            Self::InvalidParams => "invalid parameters",
            Self::NotOpen => "file not open",
            Self::NotFound => "not found",
            Self::NoSuchFs => "no such filesystem",
            Self::Limit => "table full",
            Self::InUse => "filesystem in use",
            Self::Unusable => "VFS is shut down",
        };
        f.write_str(msg)
    }
}

/// A NUL-padded fixed-length name, as stored on disk and in the mount
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Name([u8; NAME_LENGTH]);

impl Name {
    /// The empty name.
    pub const EMPTY: Name = Name([0; NAME_LENGTH]);

    /// Builds a name from a string, truncating to the 15 bytes that fit
    /// beside the NUL terminator.
    pub fn from_str(s: &str) -> Name {
        let mut buf = [0u8; NAME_LENGTH];
        let take = s.len().min(NAME_LENGTH - 1);
        buf[..take].copy_from_slice(&s.as_bytes()[..take]);
        Name(buf)
    }

    /// Builds a name from raw on-disk bytes.
    pub fn from_bytes(bytes: &[u8]) -> Name {
        let mut buf = [0u8; NAME_LENGTH];
        let take = bytes.len().min(NAME_LENGTH);
        buf[..take].copy_from_slice(&bytes[..take]);
        // Names are NUL-terminated even if the source was not.
        buf[NAME_LENGTH - 1] = 0;
        Name(buf)
    }

    /// The name as a string slice, up to the first NUL.
    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(NAME_LENGTH);
        core::str::from_utf8(&self.0[..len]).unwrap_or("")
    }

    /// The raw padded bytes.
    pub fn as_bytes(&self) -> &[u8; NAME_LENGTH] {
        &self.0
    }

    /// True for the empty name.
    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete filesystem driver, as mounted into the VFS.
///
/// `fileid`s are filesystem-specific; for TFS they are inode block
/// numbers, so two opens of the same file share an id.
pub trait FileSystem: Send + Sync {
    /// The volume name stored on the medium.
    fn volume_name(&self) -> Name;

    /// Detaches the filesystem from its device after finishing the
    /// operation in flight.
    fn unmount(&self) -> VfsResult<()>;

    /// Opens a file by name, returning its fileid.
    fn open(&self, filename: &str) -> VfsResult<u32>;

    /// Closes an open fileid.
    fn close(&self, fileid: u32) -> VfsResult<()>;

    /// Creates a file of exactly `size` bytes.
    fn create(&self, filename: &str, size: u32) -> VfsResult<()>;

    /// Removes a file by name.
    fn remove(&self, filename: &str) -> VfsResult<()>;

    /// Reads at most `buf.len()` bytes at `offset`. Returns the number
    /// of bytes read; 0 means end of file.
    fn read(&self, fileid: u32, buf: &mut [u8], offset: u32) -> VfsResult<usize>;

    /// Writes at most `buf.len()` bytes at `offset`, never extending
    /// the file. Returns the number of bytes written.
    fn write(&self, fileid: u32, buf: &[u8], offset: u32) -> VfsResult<usize>;

    /// Free space on the volume, in bytes.
    fn getfree(&self) -> VfsResult<u32>;

    /// Number of files in `dirname`.
    fn filecount(&self, dirname: &str) -> VfsResult<usize>;

    /// Name of the `idx`:th file in `dirname`.
    fn file(&self, dirname: &str, idx: usize) -> VfsResult<Name>;
}

/// Shared handle to a mounted filesystem.
pub type FsHandle = Arc<dyn FileSystem>;

#[cfg(test)]
pub(crate) mod test_glue {
    //! Filesystem tests drive the threading, device and VFS globals;
    //! serialize and reset through here.
    use std::sync::{Mutex, MutexGuard};

    static KERNEL_LOCK: Mutex<()> = Mutex::new(());

    pub fn serialize() -> MutexGuard<'static, ()> {
        KERNEL_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reset_kernel() {
        kudos_sched::thread::init();
        kudos_sched::scheduler::init();
        kudos_sched::semaphore::init();
        kudos_drivers::interrupt::init();
        kudos_drivers::device::init(&[]);
        kudos_mm::directmap::set_offset(0);
        crate::vfs::init();
    }

    fn noop(_arg: usize) {}

    /// Puts the test on a real (non-idle) thread so blocking disk I/O
    /// can park it.
    pub fn become_thread() {
        let tid = kudos_sched::thread::create(noop, 0).unwrap();
        kudos_sched::thread::run(tid);
        kudos_sched::thread::switch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_the_contract() {
        assert_eq!(VfsError::NotSupported.as_code(), -1);
        assert_eq!(VfsError::Error.as_code(), -2);
        assert_eq!(VfsError::InvalidParams.as_code(), -3);
        assert_eq!(VfsError::NotOpen.as_code(), -4);
        assert_eq!(VfsError::NotFound.as_code(), -5);
        assert_eq!(VfsError::NoSuchFs.as_code(), -6);
        assert_eq!(VfsError::Limit.as_code(), -7);
        assert_eq!(VfsError::InUse.as_code(), -8);
        assert_eq!(VfsError::Unusable.as_code(), -9);
    }

    #[test]
    fn names_are_nul_padded() {
        let n = Name::from_str("vol");
        assert_eq!(n.as_str(), "vol");
        assert_eq!(&n.as_bytes()[..4], b"vol\0");
        assert!(!n.is_empty());
        assert!(Name::EMPTY.is_empty());
    }

    #[test]
    fn overlong_names_truncate() {
        let n = Name::from_str("averylongfilename-that-overflows");
        assert_eq!(n.as_str().len(), NAME_LENGTH - 1);
    }
}
