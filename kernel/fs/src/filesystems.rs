//! Filesystem autodetection.
//!
//! A table of every filesystem driver this kernel knows, tried in order
//! against a disk until one recognizes what is on it.

use alloc::sync::Arc;

use kudos_core::kprintln;
use kudos_drivers::gbd::BlockDevice;

use crate::{FsHandle, tfs::Tfs};

type ProbeFn = fn(Arc<dyn BlockDevice>, u32) -> Option<FsHandle>;

/// All available filesystem drivers.
static FILESYSTEMS: &[(&str, ProbeFn)] = &[("TFS", probe_tfs)];

fn probe_tfs(disk: Arc<dyn BlockDevice>, sector: u32) -> Option<FsHandle> {
    Tfs::init(disk, sector).map(|fs| fs as FsHandle)
}

/// Tries every known filesystem on `disk`, starting at its first
/// sector. Returns the first driver that accepts the volume.
pub fn try_all(disk: &Arc<dyn BlockDevice>) -> Option<FsHandle> {
    for (name, probe) in FILESYSTEMS {
        if let Some(fs) = probe(Arc::clone(disk), 0) {
            kprintln!("VFS: {} initialized on disk", name);
            return Some(fs);
        }
    }
    None
}
