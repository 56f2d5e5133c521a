//! Trivial filesystem (TFS).
//!
//! A single-directory filesystem over 512-byte blocks:
//!
//! | block | contents                                              |
//! |-------|-------------------------------------------------------|
//! | 0     | magic (`3745`) and the 16-byte volume name            |
//! | 1     | allocation bitmap, one bit per device block           |
//! | 2     | directory: 25 entries of `{inode: u32, name: [u8;16]}`|
//! | n     | inode: `u32` filesize plus 127 data block numbers     |
//!
//! All on-disk integers are big-endian; conversion happens in the layout
//! helpers below and nowhere else. A file's id is its inode block
//! number. Every operation takes the volume semaphore on entry, so one
//! volume serves one operation at a time and the three scratch buffers
//! need no further locking.

use alloc::sync::Arc;

use core::cell::UnsafeCell;

use kudos_core::addr::PhysAddr;
use kudos_core::{bitmap, kprintln};
use kudos_drivers::gbd::{BlockDevice, Request};
use kudos_mm::directmap;
use kudos_sched::{Semaphore, semaphore};

use crate::{FileSystem, Name, VfsError, VfsResult};

/// Block size; fixed, and it fixes most other limits of the format.
pub const TFS_BLOCK_SIZE: usize = 512;

/// Magic number in the volume header block.
pub const TFS_MAGIC: u32 = 3745;

/// Block number of the volume header.
pub const TFS_HEADER_BLOCK: u32 = 0;
/// Block number of the allocation bitmap.
pub const TFS_ALLOCATION_BLOCK: u32 = 1;
/// Block number of the directory.
pub const TFS_DIRECTORY_BLOCK: u32 = 2;

/// Bytes of one directory entry: `u32` inode plus 16 name bytes.
const DIRENTRY_SIZE: usize = 20;

/// Directory entries that fit in the directory block.
pub const TFS_MAX_FILES: usize = TFS_BLOCK_SIZE / DIRENTRY_SIZE;

/// Data block numbers that fit in an inode beside the file size.
pub const TFS_BLOCKS_MAX: usize = TFS_BLOCK_SIZE / 4 - 1;

/// Largest representable file: the inode's block table is the limit.
pub const TFS_MAX_FILESIZE: usize = TFS_BLOCKS_MAX * TFS_BLOCK_SIZE;

type Block = [u8; TFS_BLOCK_SIZE];

// ---------------------------------------------------------------------------
// On-disk layout: the only place that byte-swaps
// ---------------------------------------------------------------------------

fn get_u32(block: &Block, offset: usize) -> u32 {
    u32::from_be_bytes(block[offset..offset + 4].try_into().unwrap())
}

fn put_u32(block: &mut Block, offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn dir_inode(dir: &Block, entry: usize) -> u32 {
    get_u32(dir, entry * DIRENTRY_SIZE)
}

fn set_dir_inode(dir: &mut Block, entry: usize, inode: u32) {
    put_u32(dir, entry * DIRENTRY_SIZE, inode);
}

fn dir_name(dir: &Block, entry: usize) -> Name {
    let start = entry * DIRENTRY_SIZE + 4;
    Name::from_bytes(&dir[start..start + crate::NAME_LENGTH])
}

fn set_dir_name(dir: &mut Block, entry: usize, name: &Name) {
    let start = entry * DIRENTRY_SIZE + 4;
    dir[start..start + crate::NAME_LENGTH].copy_from_slice(name.as_bytes());
}

fn inode_filesize(inode: &Block) -> u32 {
    get_u32(inode, 0)
}

fn set_inode_filesize(inode: &mut Block, size: u32) {
    put_u32(inode, 0, size);
}

fn inode_block(inode: &Block, idx: usize) -> u32 {
    get_u32(inode, 4 + idx * 4)
}

fn set_inode_block(inode: &mut Block, idx: usize, block: u32) {
    put_u32(inode, 4 + idx * 4, block);
}

// ---------------------------------------------------------------------------
// Volume state
// ---------------------------------------------------------------------------

struct TfsBuffers {
    inode: Block,
    bat: Block,
    dir: Block,
}

/// One mounted TFS volume.
pub struct Tfs {
    /// First device block of the filesystem.
    startblock: u32,
    /// Blocks the filesystem may use: bounded by the device and by the
    /// bits one allocation block can track.
    totalblocks: u32,
    disk: Arc<dyn BlockDevice>,
    volume_name: Name,
    /// Binary semaphore serializing all operations on this volume.
    lock: Semaphore,
    /// Scratch blocks for disk I/O, guarded by `lock`.
    buffers: UnsafeCell<TfsBuffers>,
}

// SAFETY: The scratch buffers are only touched while the volume
// semaphore is held; everything else is immutable after init.
unsafe impl Send for Tfs {}
unsafe impl Sync for Tfs {}

/// Proof that the volume semaphore is held; releases it on drop.
struct VolumeGuard<'a> {
    volume: &'a Tfs,
}

impl<'a> VolumeGuard<'a> {
    fn buffers(&mut self) -> &mut TfsBuffers {
        // SAFETY: The guard exists only while the volume semaphore is
        // held, which serializes all buffer access.
        unsafe { &mut *self.volume.buffers.get() }
    }
}

impl Drop for VolumeGuard<'_> {
    fn drop(&mut self) {
        self.volume.lock.v();
    }
}

impl Tfs {
    /// Probes `disk` for a TFS volume at `sector` and mounts it.
    ///
    /// Returns `None` when the block size is wrong, the magic does not
    /// match, or resources run out.
    pub fn init(disk: Arc<dyn BlockDevice>, sector: u32) -> Option<Arc<Tfs>> {
        if disk.block_size() as usize != TFS_BLOCK_SIZE {
            return None;
        }

        let Ok(lock) = semaphore::create(1) else {
            kprintln!("tfs_init: could not create a new semaphore");
            return None;
        };

        // Read the header block and check this really is a TFS volume.
        let mut header: Block = [0; TFS_BLOCK_SIZE];
        let phys = directmap::ptr_to_phys(header.as_mut_ptr());
        if disk
            .read_block(Request::new(sector + TFS_HEADER_BLOCK, phys))
            .is_err()
        {
            semaphore::destroy(lock);
            kprintln!("tfs_init: error during disk read, initialization failed");
            return None;
        }
        if get_u32(&header, 0) != TFS_MAGIC {
            semaphore::destroy(lock);
            return None;
        }
        let volume_name = Name::from_bytes(&header[4..4 + crate::NAME_LENGTH]);

        let totalblocks = disk
            .total_blocks()
            .min((8 * TFS_BLOCK_SIZE) as u32);

        Some(Arc::new(Tfs {
            startblock: sector,
            totalblocks,
            disk,
            volume_name,
            lock,
            buffers: UnsafeCell::new(TfsBuffers {
                inode: [0; TFS_BLOCK_SIZE],
                bat: [0; TFS_BLOCK_SIZE],
                dir: [0; TFS_BLOCK_SIZE],
            }),
        }))
    }

    fn acquire(&self) -> VolumeGuard<'_> {
        self.lock.p();
        VolumeGuard { volume: self }
    }

    /// Reads the volume-relative `block` into the buffer at `phys`.
    fn read_block(&self, block: u32, phys: PhysAddr) -> VfsResult<()> {
        self.disk
            .read_block(Request::new(self.startblock + block, phys))
            .map_err(|_| VfsError::Error)
    }

    /// Writes the buffer at `phys` to the volume-relative `block`.
    fn write_block(&self, block: u32, phys: PhysAddr) -> VfsResult<()> {
        self.disk
            .write_block(Request::new(self.startblock + block, phys))
            .map_err(|_| VfsError::Error)
    }

    fn load_dir(&self, guard: &mut VolumeGuard<'_>) -> VfsResult<()> {
        let phys = directmap::ptr_to_phys(guard.buffers().dir.as_mut_ptr());
        self.read_block(TFS_DIRECTORY_BLOCK, phys)
    }

    fn load_bat(&self, guard: &mut VolumeGuard<'_>) -> VfsResult<()> {
        let phys = directmap::ptr_to_phys(guard.buffers().bat.as_mut_ptr());
        self.read_block(TFS_ALLOCATION_BLOCK, phys)
    }

    fn load_inode(&self, guard: &mut VolumeGuard<'_>, block: u32) -> VfsResult<()> {
        let phys = directmap::ptr_to_phys(guard.buffers().inode.as_mut_ptr());
        self.read_block(block, phys)
    }

    fn store_dir(&self, guard: &mut VolumeGuard<'_>) -> VfsResult<()> {
        let phys = directmap::ptr_to_phys(guard.buffers().dir.as_ptr());
        self.write_block(TFS_DIRECTORY_BLOCK, phys)
    }

    fn store_bat(&self, guard: &mut VolumeGuard<'_>) -> VfsResult<()> {
        let phys = directmap::ptr_to_phys(guard.buffers().bat.as_ptr());
        self.write_block(TFS_ALLOCATION_BLOCK, phys)
    }

    fn store_inode(&self, guard: &mut VolumeGuard<'_>, block: u32) -> VfsResult<()> {
        let phys = directmap::ptr_to_phys(guard.buffers().inode.as_ptr());
        self.write_block(block, phys)
    }

    /// Directory slot whose name matches, if any.
    fn find_entry(dir: &Block, filename: &str) -> Option<usize> {
        (0..TFS_MAX_FILES).find(|&i| dir_name(dir, i).as_str() == filename)
    }

    /// Validates a fileid: inode block numbers start above the system
    /// blocks and must lie on the volume.
    fn check_fileid(&self, fileid: u32) -> VfsResult<()> {
        if fileid < 2 || fileid > self.totalblocks {
            return Err(VfsError::Error);
        }
        Ok(())
    }
}

impl FileSystem for Tfs {
    fn volume_name(&self) -> Name {
        self.volume_name
    }

    fn unmount(&self) -> VfsResult<()> {
        // Wait out a possible operation in flight, then retire the
        // semaphore. The volume memory goes when its Arc does.
        self.lock.p();
        semaphore::destroy(self.lock);
        Ok(())
    }

    fn open(&self, filename: &str) -> VfsResult<u32> {
        let mut guard = self.acquire();
        self.load_dir(&mut guard)?;

        let dir = &guard.buffers().dir;
        match Self::find_entry(dir, filename) {
            Some(entry) => Ok(dir_inode(dir, entry)),
            None => Err(VfsError::NotFound),
        }
    }

    fn close(&self, _fileid: u32) -> VfsResult<()> {
        Ok(())
    }

    fn create(&self, filename: &str, size: u32) -> VfsResult<()> {
        let numblocks = (size as usize).div_ceil(TFS_BLOCK_SIZE);
        if numblocks > TFS_BLOCKS_MAX {
            return Err(VfsError::Error);
        }

        let mut guard = self.acquire();
        self.load_dir(&mut guard)?;

        // The file must not exist yet, and the directory must have room.
        let dir = &guard.buffers().dir;
        if Self::find_entry(dir, filename).is_some() {
            return Err(VfsError::Error);
        }
        let Some(entry) = (0..TFS_MAX_FILES).find(|&i| dir_inode(dir, i) == 0) else {
            return Err(VfsError::Error);
        };

        let name = Name::from_str(filename);
        set_dir_name(&mut guard.buffers().dir, entry, &name);

        // Allocate the inode block and the data blocks. A failed
        // allocation abandons the attempt; nothing was written to disk
        // yet, so only the in-memory scratch is dirty.
        self.load_bat(&mut guard)?;
        let total = self.totalblocks as usize;

        let bufs = guard.buffers();
        let Some(inode_block_nr) = bitmap::find_and_set(&mut bufs.bat, total) else {
            return Err(VfsError::Error);
        };
        set_dir_inode(&mut bufs.dir, entry, inode_block_nr as u32);

        set_inode_filesize(&mut bufs.inode, size);
        for i in 0..numblocks {
            let Some(block) = bitmap::find_and_set(&mut bufs.bat, total) else {
                // Disk full; no free block found.
                return Err(VfsError::Error);
            };
            set_inode_block(&mut bufs.inode, i, block as u32);
        }
        for i in numblocks..TFS_BLOCKS_MAX {
            set_inode_block(&mut bufs.inode, i, 0);
        }

        self.store_bat(&mut guard)?;
        self.store_dir(&mut guard)?;
        self.store_inode(&mut guard, inode_block_nr as u32)?;

        // Zero the reserved data blocks. The allocation buffer is free
        // again at this point, so it doubles as the zero source.
        let data_blocks: [u32; TFS_BLOCKS_MAX] = {
            let bufs = guard.buffers();
            core::array::from_fn(|i| inode_block(&bufs.inode, i))
        };
        guard.buffers().bat.fill(0);
        for &block in data_blocks.iter().take(numblocks) {
            let phys = directmap::ptr_to_phys(guard.buffers().bat.as_ptr());
            self.write_block(block, phys)?;
        }

        Ok(())
    }

    fn remove(&self, filename: &str) -> VfsResult<()> {
        let mut guard = self.acquire();
        self.load_dir(&mut guard)?;

        let Some(entry) = Self::find_entry(&guard.buffers().dir, filename) else {
            return Err(VfsError::NotFound);
        };

        self.load_bat(&mut guard)?;
        let inode_block_nr = dir_inode(&guard.buffers().dir, entry);
        self.load_inode(&mut guard, inode_block_nr)?;

        // Free the inode block, then every data block it names.
        let bufs = guard.buffers();
        bitmap::clear(&mut bufs.bat, inode_block_nr as usize);
        for i in 0..TFS_BLOCKS_MAX {
            let block = inode_block(&bufs.inode, i);
            if block == 0 {
                break;
            }
            bitmap::clear(&mut bufs.bat, block as usize);
        }

        set_dir_inode(&mut bufs.dir, entry, 0);
        set_dir_name(&mut bufs.dir, entry, &Name::EMPTY);

        self.store_bat(&mut guard)?;
        self.store_dir(&mut guard)?;
        Ok(())
    }

    fn read(&self, fileid: u32, buf: &mut [u8], offset: u32) -> VfsResult<usize> {
        self.check_fileid(fileid)?;

        let mut guard = self.acquire();
        self.load_inode(&mut guard, fileid)?;

        let filesize = inode_filesize(&guard.buffers().inode) as usize;
        let offset = offset as usize;
        if offset > filesize {
            return Err(VfsError::Error);
        }

        // Read at most what is left of the file.
        let count = buf.len().min(filesize - offset);
        if count == 0 {
            return Ok(0);
        }

        // The allocation buffer serves as the data scratch: nothing in
        // this operation touches the real allocation block.
        let first = offset / TFS_BLOCK_SIZE;
        let last = (offset + count - 1) / TFS_BLOCK_SIZE;
        let mut done = 0;

        for blk in first..=last {
            let block = inode_block(&guard.buffers().inode, blk);
            let phys = directmap::ptr_to_phys(guard.buffers().bat.as_mut_ptr());
            self.read_block(block, phys)?;

            // First and last blocks may be partial.
            let start = if blk == first {
                offset % TFS_BLOCK_SIZE
            } else {
                0
            };
            let take = (TFS_BLOCK_SIZE - start).min(count - done);
            buf[done..done + take]
                .copy_from_slice(&guard.buffers().bat[start..start + take]);
            done += take;
        }

        Ok(done)
    }

    fn write(&self, fileid: u32, buf: &[u8], offset: u32) -> VfsResult<usize> {
        self.check_fileid(fileid)?;

        let mut guard = self.acquire();
        self.load_inode(&mut guard, fileid)?;

        let filesize = inode_filesize(&guard.buffers().inode) as usize;
        let offset = offset as usize;
        if offset > filesize {
            return Err(VfsError::Error);
        }

        // Writes never extend the file.
        let count = buf.len().min(filesize - offset);
        if count == 0 {
            return Ok(0);
        }

        let first = offset / TFS_BLOCK_SIZE;
        let last = (offset + count - 1) / TFS_BLOCK_SIZE;
        let mut done = 0;

        for blk in first..=last {
            let block = inode_block(&guard.buffers().inode, blk);
            let phys = directmap::ptr_to_phys(guard.buffers().bat.as_mut_ptr());

            let start = if blk == first {
                offset % TFS_BLOCK_SIZE
            } else {
                0
            };
            let take = (TFS_BLOCK_SIZE - start).min(count - done);

            // A partial block keeps its surrounding bytes: read before
            // overwriting.
            if take < TFS_BLOCK_SIZE {
                self.read_block(block, phys)?;
            }
            guard.buffers().bat[start..start + take]
                .copy_from_slice(&buf[done..done + take]);
            self.write_block(block, phys)?;
            done += take;
        }

        Ok(done)
    }

    fn getfree(&self) -> VfsResult<u32> {
        let mut guard = self.acquire();
        self.load_bat(&mut guard)?;

        let total = self.totalblocks as usize;
        let allocated = bitmap::count_set(&guard.buffers().bat, total);
        Ok(((total - allocated) * TFS_BLOCK_SIZE) as u32)
    }

    fn filecount(&self, dirname: &str) -> VfsResult<usize> {
        // Only the master directory exists.
        if dirname != "/" {
            return Err(VfsError::NotFound);
        }

        let mut guard = self.acquire();
        self.load_dir(&mut guard)?;

        let dir = &guard.buffers().dir;
        Ok((0..TFS_MAX_FILES).filter(|&i| dir_inode(dir, i) != 0).count())
    }

    fn file(&self, dirname: &str, idx: usize) -> VfsResult<Name> {
        if dirname != "/" {
            return Err(VfsError::Error);
        }

        let mut guard = self.acquire();
        self.load_dir(&mut guard)?;

        let dir = &guard.buffers().dir;
        let mut seen = 0;
        for i in 0..TFS_MAX_FILES {
            if dir_inode(dir, i) != 0 {
                if seen == idx {
                    return Ok(dir_name(dir, i));
                }
                seen += 1;
            }
        }
        Err(VfsError::Error)
    }
}
