//! Virtual filesystem.
//!
//! One namespace over all mounted filesystems. Pathnames carry the
//! mountpoint in brackets (`[volume]file`); the mount table resolves
//! the volume, the open-file table tracks fileids and seek positions.
//!
//! Every public call is bracketed by an operation counter. Shutdown
//! (`deinit`) flips the VFS unusable, waits for in-flight operations to
//! drain, then forcibly unmounts everything; afterwards every call
//! fails with [`VfsError::Unusable`], forever.

use alloc::sync::Arc;

use core::array;

use kudos_core::config::{MAX_FILESYSTEMS, MAX_OPEN_FILES};
use kudos_core::sync::SpinLock;
use kudos_core::{kprintln, kwarn};
use kudos_drivers::device::{self, typecode};
use kudos_sched::{Mutex, Semaphore, semaphore};

use crate::{FsHandle, Name, VfsError, VfsResult, filesystems, path};

/// Handle to an entry in the open-file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile(usize);

struct MountEntry {
    fs: FsHandle,
    mountpoint: Name,
}

struct OpenFileEntry {
    fs: FsHandle,
    fileid: u32,
    seek_position: u32,
}

/// Operation counting for the shutdown barrier.
struct OpState {
    ops: usize,
    usable: bool,
}

struct Vfs {
    mounts: Mutex<[Option<MountEntry>; MAX_FILESYSTEMS]>,
    open_files: Mutex<[Option<OpenFileEntry>; MAX_OPEN_FILES]>,
    op_state: Mutex<OpState>,
    /// Signalled by the last draining operation once `deinit` waits.
    unmount_sem: Semaphore,
}

/// The global VFS. `None` until [`init`]; never usable again after
/// [`deinit`] flips the op state.
static VFS: SpinLock<Option<Arc<Vfs>>> = SpinLock::new(None);

fn state() -> VfsResult<Arc<Vfs>> {
    VFS.lock().as_ref().cloned().ok_or(VfsError::Unusable)
}

/// Initializes the VFS. Requires semaphores, so it runs after the
/// synchronization subsystems and before the first mount.
pub fn init() {
    // Retire any previous instance first: dropping it releases its
    // semaphores, which must not race the allocations below.
    drop(VFS.lock().take());

    let vfs = Arc::new(Vfs {
        mounts: Mutex::new(array::from_fn(|_| None)).expect("VFS semaphores"),
        open_files: Mutex::new(array::from_fn(|_| None)).expect("VFS semaphores"),
        op_state: Mutex::new(OpState {
            ops: 0,
            usable: true,
        })
        .expect("VFS semaphores"),
        unmount_sem: semaphore::create(0).expect("VFS semaphores"),
    });
    *VFS.lock() = Some(vfs);

    kprintln!(
        "VFS: Max filesystems: {}, Max open files: {}",
        MAX_FILESYSTEMS,
        MAX_OPEN_FILES
    );
}

/// Starts one VFS operation; fails once the VFS is shut down.
fn start_op(vfs: &Vfs) -> VfsResult<()> {
    let mut op = vfs.op_state.lock();
    if !op.usable {
        return Err(VfsError::Unusable);
    }
    op.ops += 1;
    Ok(())
}

/// Ends one VFS operation, releasing the shutdown barrier when the last
/// one drains.
fn end_op(vfs: &Vfs) {
    let mut op = vfs.op_state.lock();
    op.ops -= 1;
    if !op.usable && op.ops == 0 {
        vfs.unmount_sem.v();
    }
    if !op.usable && op.ops > 0 {
        kprintln!("VFS: {} operations still pending", op.ops);
    }
}

/// Runs `f` as one counted VFS operation.
fn with_op<R>(f: impl FnOnce(&Vfs) -> VfsResult<R>) -> VfsResult<R> {
    let vfs = state()?;
    start_op(&vfs)?;
    let result = f(&vfs);
    end_op(&vfs);
    result
}

/// Shuts the VFS down: waits for in-flight operations, then forcibly
/// unmounts every filesystem. The VFS is permanently unusable after
/// this returns. Open files are not waited for.
pub fn deinit() {
    let Ok(vfs) = state() else {
        return;
    };

    {
        let mut op = vfs.op_state.lock();
        op.usable = false;
    }

    kprintln!("VFS: Entering forceful unmount of all filesystems.");
    let must_wait = {
        let op = vfs.op_state.lock();
        op.ops > 0
    };
    if must_wait {
        kprintln!("VFS: Delaying force unmount until pending operations are done.");
        vfs.unmount_sem.p();
        let op = vfs.op_state.lock();
        assert!(op.ops == 0, "VFS drained with operations still pending");
        kprintln!("VFS: Continuing forceful unmount.");
    }

    let mut mounts = vfs.mounts.lock();
    let _open_files = vfs.open_files.lock();
    for entry in mounts.iter_mut() {
        if let Some(mount) = entry.take() {
            kprintln!("VFS: Forcefully unmounting volume [{}]", mount.mountpoint);
            let _ = mount.fs.unmount();
        }
    }
}

fn find_mount(mounts: &[Option<MountEntry>], name: &str) -> Option<usize> {
    mounts
        .iter()
        .position(|m| m.as_ref().is_some_and(|m| m.mountpoint.as_str() == name))
}

/// Mounts an initialized filesystem at `name`.
///
/// # Errors
///
/// [`VfsError::Limit`] when the mount table is full, [`VfsError::Error`]
/// when the name is already mounted.
pub fn mount(fs: FsHandle, name: &str) -> VfsResult<()> {
    assert!(!name.is_empty());

    with_op(|vfs| {
        let mut mounts = vfs.mounts.lock();

        let Some(row) = mounts.iter().position(Option::is_none) else {
            kwarn!("VFS: maximum mount count exceeded, mount failed");
            return Err(VfsError::Limit);
        };
        if find_mount(&*mounts, name).is_some() {
            kwarn!("VFS: attempt to mount two filesystems with the same name");
            return Err(VfsError::Error);
        }

        mounts[row] = Some(MountEntry {
            fs,
            mountpoint: Name::from_str(name),
        });
        Ok(())
    })
}

/// Probes `disk` for a filesystem and mounts it, under `volumename` if
/// given and otherwise under the name stored on the volume.
pub fn mount_fs(disk: &Arc<dyn kudos_drivers::gbd::BlockDevice>, volumename: Option<&str>) -> VfsResult<()> {
    let Some(fs) = filesystems::try_all(disk) else {
        kprintln!("VFS: No filesystem was found on block device");
        return Err(VfsError::NoSuchFs);
    };

    let stored = fs.volume_name();
    let name = match volumename {
        Some(name) => Name::from_str(name),
        None => stored,
    };
    if name.is_empty() {
        kprintln!("VFS: Unknown filesystem volume name, skipping mounting");
        let _ = fs.unmount();
        return Err(VfsError::InvalidParams);
    }

    match mount(Arc::clone(&fs), name.as_str()) {
        Ok(()) => {
            kprintln!("VFS: Mounted filesystem volume [{}]", name);
            Ok(())
        }
        Err(err) => {
            kprintln!("VFS: Mounting of volume [{}] failed", name);
            let _ = fs.unmount();
            Err(err)
        }
    }
}

/// Mounts every disk in the device table that holds a filesystem.
pub fn mount_all() {
    for n in 0..MAX_FILESYSTEMS {
        let Some(dev) = device::get(typecode::DISK, n) else {
            // No more disks.
            return;
        };
        let Some(disk) = dev.block_device() else {
            kwarn!("VFS: invalid disk driver detected, skipping");
            continue;
        };
        let _ = mount_fs(&disk, None);
    }
}

/// Unmounts the filesystem at `name`.
///
/// # Errors
///
/// [`VfsError::NotFound`] when nothing is mounted there,
/// [`VfsError::InUse`] when it still has open files.
pub fn unmount(name: &str) -> VfsResult<()> {
    with_op(|vfs| {
        let mut mounts = vfs.mounts.lock();
        let Some(row) = find_mount(&*mounts, name) else {
            return Err(VfsError::NotFound);
        };

        let open_files = vfs.open_files.lock();
        let fs = &mounts[row].as_ref().unwrap().fs;
        let busy = open_files
            .iter()
            .flatten()
            .any(|f| Arc::ptr_eq(&f.fs, fs));
        if busy {
            return Err(VfsError::InUse);
        }

        let entry = mounts[row].take().unwrap();
        entry.fs.unmount()?;
        Ok(())
    })
}

fn resolve_fs(mounts: &[Option<MountEntry>], volume: &Name) -> VfsResult<FsHandle> {
    let row = find_mount(mounts, volume.as_str()).ok_or(VfsError::NoSuchFs)?;
    Ok(Arc::clone(&mounts[row].as_ref().unwrap().fs))
}

/// Opens `pathname`, allocating an open-file slot. The seek position
/// starts at 0.
pub fn open(pathname: &str) -> VfsResult<OpenFile> {
    with_op(|vfs| {
        let (volume, filename) = path::parse(pathname)?;

        let mounts = vfs.mounts.lock();
        let mut open_files = vfs.open_files.lock();

        let Some(slot) = open_files.iter().position(Option::is_none) else {
            kwarn!("VFS: maximum number of open files exceeded");
            return Err(VfsError::Limit);
        };
        let fs = resolve_fs(&*mounts, &volume)?;
        drop(open_files);
        drop(mounts);

        let fileid = fs.open(filename.as_str())?;

        let mut open_files = vfs.open_files.lock();
        // The slot may have been taken while the filesystem worked;
        // fall back to any free one.
        let slot = if open_files[slot].is_none() {
            slot
        } else {
            open_files
                .iter()
                .position(Option::is_none)
                .ok_or(VfsError::Limit)?
        };
        open_files[slot] = Some(OpenFileEntry {
            fs,
            fileid,
            seek_position: 0,
        });
        Ok(OpenFile(slot))
    })
}

/// Copies out the filesystem, fileid and seek position of an open file.
fn verify_open(vfs: &Vfs, file: OpenFile) -> VfsResult<(FsHandle, u32, u32)> {
    let open_files = vfs.open_files.lock();
    let entry = open_files
        .get(file.0)
        .and_then(Option::as_ref)
        .ok_or(VfsError::InvalidParams)?;
    Ok((Arc::clone(&entry.fs), entry.fileid, entry.seek_position))
}

/// Closes an open file.
pub fn close(file: OpenFile) -> VfsResult<()> {
    with_op(|vfs| {
        let mut open_files = vfs.open_files.lock();
        let entry = open_files
            .get_mut(file.0)
            .ok_or(VfsError::InvalidParams)?
            .take()
            .ok_or(VfsError::InvalidParams)?;
        drop(open_files);
        entry.fs.close(entry.fileid)
    })
}

/// Sets the seek position of an open file. The position is not checked
/// against the file size.
pub fn seek(file: OpenFile, position: i32) -> VfsResult<()> {
    with_op(|vfs| {
        if position < 0 {
            return Err(VfsError::InvalidParams);
        }
        let mut open_files = vfs.open_files.lock();
        let entry = open_files
            .get_mut(file.0)
            .and_then(Option::as_mut)
            .ok_or(VfsError::InvalidParams)?;
        entry.seek_position = position as u32;
        Ok(())
    })
}

/// Reads from the current seek position, advancing it by the number of
/// bytes read.
pub fn read(file: OpenFile, buffer: &mut [u8]) -> VfsResult<usize> {
    with_op(|vfs| {
        let (fs, fileid, seek_position) = verify_open(vfs, file)?;
        let count = fs.read(fileid, buffer, seek_position)?;

        if count > 0 {
            // Advance under the table lock so concurrent seeks stay
            // consistent.
            let mut open_files = vfs.open_files.lock();
            if let Some(entry) = open_files.get_mut(file.0).and_then(Option::as_mut) {
                entry.seek_position += count as u32;
            }
        }
        Ok(count)
    })
}

/// Writes at the current seek position, advancing it by the number of
/// bytes written.
pub fn write(file: OpenFile, buffer: &[u8]) -> VfsResult<usize> {
    with_op(|vfs| {
        let (fs, fileid, seek_position) = verify_open(vfs, file)?;
        let count = fs.write(fileid, buffer, seek_position)?;

        if count > 0 {
            let mut open_files = vfs.open_files.lock();
            if let Some(entry) = open_files.get_mut(file.0).and_then(Option::as_mut) {
                entry.seek_position += count as u32;
            }
        }
        Ok(count)
    })
}

/// Creates a file of `size` bytes at `pathname`.
pub fn create(pathname: &str, size: i32) -> VfsResult<()> {
    if size < 0 {
        return Err(VfsError::InvalidParams);
    }
    with_op(|vfs| {
        let (volume, filename) = path::parse(pathname)?;
        let mounts = vfs.mounts.lock();
        let fs = resolve_fs(&*mounts, &volume)?;
        fs.create(filename.as_str(), size as u32)
    })
}

/// Removes the file at `pathname`.
pub fn remove(pathname: &str) -> VfsResult<()> {
    with_op(|vfs| {
        let (volume, filename) = path::parse(pathname)?;
        let mounts = vfs.mounts.lock();
        let fs = resolve_fs(&*mounts, &volume)?;
        fs.remove(filename.as_str())
    })
}

/// Free bytes on the volume mounted at `volumename`.
pub fn getfree(volumename: &str) -> VfsResult<u32> {
    with_op(|vfs| {
        let mounts = vfs.mounts.lock();
        let fs = resolve_fs(&*mounts, &Name::from_str(volumename))?;
        fs.getfree()
    })
}

/// With a pathname: file count in that directory. With `None`: number
/// of mounted filesystems.
pub fn filecount(pathname: Option<&str>) -> VfsResult<usize> {
    with_op(|vfs| match pathname {
        None => {
            let mounts = vfs.mounts.lock();
            Ok(mounts.iter().flatten().count())
        }
        Some(pathname) => {
            let (volume, dirname) = path::parse(pathname)?;
            let mounts = vfs.mounts.lock();
            let fs = resolve_fs(&*mounts, &volume)?;
            fs.filecount(dirname.as_str())
        }
    })
}

/// With a pathname: name of the `idx`:th file in that directory. With
/// `None`: name of the `idx`:th mount.
pub fn file(pathname: Option<&str>, idx: usize) -> VfsResult<Name> {
    with_op(|vfs| match pathname {
        None => {
            let mounts = vfs.mounts.lock();
            mounts
                .iter()
                .flatten()
                .nth(idx)
                .map(|m| m.mountpoint)
                .ok_or(VfsError::Error)
        }
        Some(pathname) => {
            let (volume, dirname) = path::parse(pathname)?;
            let mounts = vfs.mounts.lock();
            let fs = resolve_fs(&*mounts, &volume)?;
            fs.file(dirname.as_str(), idx)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_glue;
    use crate::tfs::{TFS_BLOCK_SIZE, TFS_MAGIC};
    use kudos_core::bitmap;
    use kudos_drivers::gbd::BlockDevice;
    use kudos_drivers::ramdisk;

    fn format_image(volume: &str, blocks: u32) -> Vec<u8> {
        let mut image = vec![0u8; blocks as usize * TFS_BLOCK_SIZE];
        image[..4].copy_from_slice(&TFS_MAGIC.to_be_bytes());
        let name = Name::from_str(volume);
        image[4..4 + crate::NAME_LENGTH].copy_from_slice(name.as_bytes());
        let bat = &mut image[TFS_BLOCK_SIZE..2 * TFS_BLOCK_SIZE];
        for b in 0..3 {
            bitmap::set(bat, b);
        }
        image
    }

    fn fresh_disk(volume: &str, blocks: u32) -> Arc<dyn BlockDevice> {
        let device =
            ramdisk::create_disk_device_with_image(blocks, None, &format_image(volume, blocks));
        device.block_device().unwrap()
    }

    fn setup() {
        test_glue::reset_kernel();
        test_glue::become_thread();
    }

    #[test]
    fn mount_and_count() {
        let _g = test_glue::serialize();
        setup();

        assert_eq!(filecount(None).unwrap(), 0);
        mount_fs(&fresh_disk("volA", 16), None).unwrap();
        mount_fs(&fresh_disk("volB", 16), None).unwrap();
        assert_eq!(filecount(None).unwrap(), 2);
        assert_eq!(file(None, 0).unwrap().as_str(), "volA");
        assert_eq!(file(None, 1).unwrap().as_str(), "volB");
        assert_eq!(file(None, 2), Err(VfsError::Error));

        unmount("volA").unwrap();
        assert_eq!(filecount(None).unwrap(), 1);
        assert_eq!(unmount("volA"), Err(VfsError::NotFound));
    }

    #[test]
    fn duplicate_mount_names_are_rejected() {
        let _g = test_glue::serialize();
        setup();

        mount_fs(&fresh_disk("dup", 16), None).unwrap();
        assert_eq!(mount_fs(&fresh_disk("dup", 16), None), Err(VfsError::Error));
        assert_eq!(filecount(None).unwrap(), 1);
    }

    #[test]
    fn empty_volume_name_cannot_mount() {
        let _g = test_glue::serialize();
        setup();

        assert_eq!(
            mount_fs(&fresh_disk("", 16), None),
            Err(VfsError::InvalidParams)
        );
    }

    #[test]
    fn full_file_lifecycle_through_the_vfs() {
        let _g = test_glue::serialize();
        setup();
        mount_fs(&fresh_disk("disk", 32), None).unwrap();

        let free_before = getfree("disk").unwrap();
        create("[disk]hello", 5).unwrap();

        let fd = open("[disk]hello").unwrap();
        assert_eq!(write(fd, b"world").unwrap(), 5);

        // The seek position advanced; rewind and read back.
        seek(fd, 0).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
        // At end of file, reads return 0.
        assert_eq!(read(fd, &mut buf).unwrap(), 0);

        close(fd).unwrap();
        remove("[disk]hello").unwrap();
        assert_eq!(getfree("disk").unwrap(), free_before);
    }

    #[test]
    fn seek_moves_the_read_position() {
        let _g = test_glue::serialize();
        setup();
        mount_fs(&fresh_disk("disk", 32), None).unwrap();

        create("[disk]f", 10).unwrap();
        let fd = open("[disk]f").unwrap();
        write(fd, b"0123456789").unwrap();

        seek(fd, 4).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(read(fd, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"456");

        assert_eq!(seek(fd, -1), Err(VfsError::InvalidParams));
        close(fd).unwrap();
    }

    #[test]
    fn bad_paths_and_unknown_volumes() {
        let _g = test_glue::serialize();
        setup();
        mount_fs(&fresh_disk("disk", 16), None).unwrap();

        // Empty volume name parses but resolves to no filesystem.
        assert_eq!(open("nofile"), Err(VfsError::NoSuchFs));
        // Empty filename fails in the parser.
        assert_eq!(open("[disk]"), Err(VfsError::Error));
        // Unknown volume.
        assert_eq!(open("[other]f"), Err(VfsError::NoSuchFs));
        // Missing file on a valid volume.
        assert_eq!(open("[disk]ghost"), Err(VfsError::NotFound));
    }

    #[test]
    fn unmount_refuses_while_files_are_open() {
        let _g = test_glue::serialize();
        setup();
        mount_fs(&fresh_disk("disk", 16), None).unwrap();
        create("[disk]f", 1).unwrap();

        let fd = open("[disk]f").unwrap();
        assert_eq!(unmount("disk"), Err(VfsError::InUse));
        close(fd).unwrap();
        unmount("disk").unwrap();
    }

    #[test]
    fn operations_on_closed_handles_fail() {
        let _g = test_glue::serialize();
        setup();
        mount_fs(&fresh_disk("disk", 16), None).unwrap();
        create("[disk]f", 1).unwrap();

        let fd = open("[disk]f").unwrap();
        close(fd).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(read(fd, &mut buf), Err(VfsError::InvalidParams));
        assert_eq!(write(fd, &buf), Err(VfsError::InvalidParams));
        assert_eq!(close(fd), Err(VfsError::InvalidParams));
    }

    #[test]
    fn directory_listing_through_the_vfs() {
        let _g = test_glue::serialize();
        setup();
        mount_fs(&fresh_disk("disk", 32), None).unwrap();

        create("[disk]one", 1).unwrap();
        create("[disk]two", 1).unwrap();
        assert_eq!(filecount(Some("[disk]/")).unwrap(), 2);
        assert_eq!(file(Some("[disk]/"), 0).unwrap().as_str(), "one");
        assert_eq!(file(Some("[disk]/"), 1).unwrap().as_str(), "two");
    }

    #[test]
    fn deinit_makes_the_vfs_permanently_unusable() {
        let _g = test_glue::serialize();
        setup();
        mount_fs(&fresh_disk("disk", 16), None).unwrap();
        create("[disk]f", 1).unwrap();

        deinit();

        // Every call from now on reports Unusable.
        assert_eq!(open("[disk]f"), Err(VfsError::Unusable));
        assert_eq!(create("[disk]g", 1), Err(VfsError::Unusable));
        assert_eq!(filecount(None), Err(VfsError::Unusable));
        assert_eq!(unmount("disk"), Err(VfsError::Unusable));
        assert_eq!(getfree("disk"), Err(VfsError::Unusable));

        // Mounting again is also refused.
        let disk = fresh_disk("late", 16);
        let fs = crate::filesystems::try_all(&disk).unwrap();
        assert_eq!(mount(fs, "late"), Err(VfsError::Unusable));

        // A second deinit is a harmless no-op.
        deinit();
    }

    #[test]
    fn mount_all_finds_registered_disks() {
        let _g = test_glue::serialize();
        setup();

        let device = ramdisk::create_disk_device_with_image(16, None, &format_image("auto", 16));
        device::register(device);
        mount_all();
        assert_eq!(filecount(None).unwrap(), 1);
        assert_eq!(file(None, 0).unwrap().as_str(), "auto");
    }
}
