//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk structure fills
//! exactly one sector and holds the file's length, a directory flag, and the
//! block map: direct sector pointers, one indirect block, and one
//! doubly-indirect block. A pointer of 0 means the slot is unallocated; every
//! sector covered by the file's length is materialized and zero-filled on
//! allocation, so 0 never appears inside the live range.
//!
//! The crate keeps a table of in-use inodes in memory to provide a place for
//! synchronizing access to inodes used by multiple threads. An in-memory
//! inode carries only bookkeeping (`open_count`, `removed`,
//! `deny_write_count`), never a copy of the disk record; every field access
//! goes back through the buffer cache.
//!
//! Lifecycle: the first open of a sector creates its handle, later opens
//! return the same handle with `open_count` bumped, and the last close frees
//! the handle; if the inode was removed behind it, the last close also
//! truncates the file and gives the inode sector back to the free map.
//! Removal is therefore deferred: unlinking only marks the handle, the
//! destructor work runs when the final reference drops.
//!
//! Writes past the end of the file grow it in place. Growth is serialized by
//! the handle's mutex, which is dropped again before the data copies, so
//! non-extending writers and readers keep flowing; concurrent touches of one
//! sector are serialized by the buffer cache's pins.

use core::convert::TryInto;
use core::mem;
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::bio::BlockData;
use crate::error::FsError;
use crate::filesys::Filesys;
use crate::param::{
    INODE_MAGIC, MAX_FILE_LEN, NDIRECT, NINDIRECT, SECTOR_SIZE,
};

/// On-disk inode structure. Exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub(crate) struct Dinode {
    /// File length in bytes; directories included.
    length: i32,

    /// Nonzero for directories.
    is_dir: u32,

    /// Direct data sector numbers; 0 = unallocated.
    direct: [u32; NDIRECT],

    /// Sector of a block of `NINDIRECT` data sector numbers.
    indirect: u32,

    /// Sector of a block of `NINDIRECT` indirect-block sector numbers.
    doubly_indirect: u32,

    /// Must be `INODE_MAGIC`.
    magic: u32,
}

const_assert!(mem::size_of::<Dinode>() == SECTOR_SIZE);

/// Sector-number table access inside a metadata block.
fn get_entry(data: &BlockData, i: usize) -> u32 {
    u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap())
}

fn set_entry(data: &mut BlockData, i: usize, sector: u32) {
    data[i * 4..i * 4 + 4].copy_from_slice(&sector.to_le_bytes());
}

/// Allocates a sector and zeroes it through the cache.
fn alloc_zeroed(fs: &Filesys) -> Result<u32, FsError> {
    let sector = fs.free_map.allocate(fs)?;
    let _buf = fs.cache.acquire_zeroed(sector);
    Ok(sector)
}

/// Grows or shrinks one indirect block so that its first `want` entries are
/// allocated and the rest are free. Allocates the block itself on first need
/// and frees it when `want` is 0.
///
/// On an allocation failure every sector allocated so far is already
/// recorded in `slot` or in the block, so a later shrink finds and releases
/// it.
fn resize_indirect(fs: &Filesys, slot: &mut u32, want: usize) -> Result<(), FsError> {
    debug_assert!(want <= NINDIRECT);
    if want == 0 && *slot == 0 {
        return Ok(());
    }
    if *slot == 0 {
        *slot = alloc_zeroed(fs)?;
    }

    let mut result = Ok(());
    {
        let mut buf = fs.cache.acquire(*slot, true);
        for i in 0..NINDIRECT {
            let entry = get_entry(buf.data(), i);
            if i < want && entry == 0 {
                match alloc_zeroed(fs) {
                    Ok(sector) => set_entry(buf.data_mut(), i, sector),
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            } else if i >= want && entry != 0 {
                fs.free_map.release(fs, entry);
                set_entry(buf.data_mut(), i, 0);
            }
        }
    }
    result?;

    if want == 0 {
        fs.free_map.release(fs, *slot);
        *slot = 0;
    }
    Ok(())
}

impl Dinode {
    fn new(is_dir: bool) -> Dinode {
        Dinode {
            length: 0,
            is_dir: is_dir as u32,
            direct: [0; NDIRECT],
            indirect: 0,
            doubly_indirect: 0,
            magic: INODE_MAGIC,
        }
    }

    /// Reads the inode stored at `sector` through the cache.
    pub(crate) fn load(fs: &Filesys, sector: u32) -> Dinode {
        let buf = fs.cache.acquire(sector, false);
        let dinode = *LayoutVerified::<&[u8], Dinode>::new(&buf.data()[..])
            .expect("inode sector has the wrong size or alignment");
        assert_eq!(
            dinode.magic, INODE_MAGIC,
            "bad inode magic at sector {}",
            sector
        );
        assert!(dinode.length >= 0, "negative length at sector {}", sector);
        dinode
    }

    /// Writes the inode to `sector` through the cache.
    pub(crate) fn store(&self, fs: &Filesys, sector: u32) {
        let mut buf = fs.cache.acquire_zeroed(sector);
        buf.data_mut().copy_from_slice(self.as_bytes());
    }

    pub(crate) fn len(&self) -> u32 {
        self.length as u32
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    /// Data sector holding byte `pos` of the file. Defined for positions
    /// inside the file; a zero pointer in that range means the volume is
    /// corrupt.
    pub(crate) fn byte_to_sector(&self, fs: &Filesys, pos: u32) -> u32 {
        assert!(
            pos < self.len(),
            "byte_to_sector: position {} outside length {}",
            pos,
            self.len()
        );
        let idx = pos as usize / SECTOR_SIZE;
        let sector = if idx < NDIRECT {
            self.direct[idx]
        } else if idx < NDIRECT + NINDIRECT {
            assert_ne!(self.indirect, 0, "missing indirect block");
            let buf = fs.cache.acquire(self.indirect, false);
            get_entry(buf.data(), idx - NDIRECT)
        } else {
            let idx = idx - NDIRECT - NINDIRECT;
            assert_ne!(self.doubly_indirect, 0, "missing doubly-indirect block");
            let child = {
                let buf = fs.cache.acquire(self.doubly_indirect, false);
                get_entry(buf.data(), idx / NINDIRECT)
            };
            assert_ne!(child, 0, "missing indirect block in doubly-indirect tier");
            let buf = fs.cache.acquire(child, false);
            get_entry(buf.data(), idx % NINDIRECT)
        };
        assert_ne!(sector, 0, "hole inside file length at byte {}", pos);
        sector
    }

    /// Grows or shrinks the file to `new_len` bytes.
    ///
    /// Walks the direct, indirect, and doubly-indirect tiers in order,
    /// allocating zero-filled sectors into the live range and releasing
    /// sectors behind it; backing metadata blocks appear on first need and
    /// disappear when the tier empties. The length is updated only when
    /// everything succeeded.
    ///
    /// On failure the map holds every sector allocated so far, so the caller
    /// rolls back by resizing to the previous length. That is a pure shrink,
    /// which allocates nothing and therefore cannot itself fail.
    pub(crate) fn resize(&mut self, fs: &Filesys, new_len: u32) -> Result<(), FsError> {
        if new_len > MAX_FILE_LEN {
            return Err(FsError::FileTooLarge);
        }
        let needed = (new_len as usize + SECTOR_SIZE - 1) / SECTOR_SIZE;
        trace!("inode: resize {} -> {} bytes ({} sectors)", self.length, new_len, needed);

        for i in 0..NDIRECT {
            let slot = self.direct[i];
            if i < needed && slot == 0 {
                self.direct[i] = alloc_zeroed(fs)?;
            } else if i >= needed && slot != 0 {
                fs.free_map.release(fs, slot);
                self.direct[i] = 0;
            }
        }

        let want = needed.saturating_sub(NDIRECT).min(NINDIRECT);
        resize_indirect(fs, &mut self.indirect, want)?;

        let want = needed.saturating_sub(NDIRECT + NINDIRECT);
        if want > 0 || self.doubly_indirect != 0 {
            if self.doubly_indirect == 0 {
                self.doubly_indirect = alloc_zeroed(fs)?;
            }
            let doubly = self.doubly_indirect;
            for i in 0..NINDIRECT {
                let mut child = {
                    let buf = fs.cache.acquire(doubly, false);
                    get_entry(buf.data(), i)
                };
                let child_want = want.saturating_sub(i * NINDIRECT).min(NINDIRECT);
                let before = child;
                let result = resize_indirect(fs, &mut child, child_want);
                if child != before {
                    let mut buf = fs.cache.acquire(doubly, true);
                    set_entry(buf.data_mut(), i, child);
                }
                result?;
            }
            if want == 0 {
                fs.free_map.release(fs, doubly);
                self.doubly_indirect = 0;
            }
        }

        self.length = new_len as i32;
        Ok(())
    }
}

/// Writes a fresh inode of `length` zero bytes to `sector`.
///
/// The caller owns `sector`; on failure nothing is left allocated and the
/// sector's contents are unspecified.
pub(crate) fn inode_create(
    fs: &Filesys,
    sector: u32,
    length: u32,
    is_dir: bool,
) -> Result<(), FsError> {
    let mut dinode = Dinode::new(is_dir);
    if let Err(e) = dinode.resize(fs, length) {
        dinode
            .resize(fs, 0)
            .expect("shrinking to zero cannot fail");
        return Err(e);
    }
    dinode.store(fs, sector);
    debug!("inode: created sector {} length {} dir {}", sector, length, is_dir);
    Ok(())
}

#[derive(Debug)]
struct InodeMeta {
    open_count: u32,
    removed: bool,
    deny_write_count: u32,
}

/// In-memory handle on an on-disk inode.
///
/// One exists per open sector; see the module doc for the lifecycle.
#[derive(Debug)]
pub struct Inode {
    sector: u32,
    meta: Mutex<InodeMeta>,
}

impl Inode {
    pub fn sector(&self) -> u32 {
        self.sector
    }

    /// Current file length in bytes.
    pub fn len(&self, fs: &Filesys) -> u32 {
        Dinode::load(fs, self.sector).len()
    }

    pub fn is_dir(&self, fs: &Filesys) -> bool {
        Dinode::load(fs, self.sector).is_dir()
    }

    /// Number of outstanding opens on this handle.
    pub fn open_count(&self) -> u32 {
        self.meta.lock().unwrap().open_count
    }

    pub(crate) fn mark_removed(&self) {
        self.meta.lock().unwrap().removed = true;
    }

    /// Blocks writers until a matching `allow_write`. Used to keep running
    /// executables immutable.
    pub fn deny_write(&self) {
        let mut meta = self.meta.lock().unwrap();
        meta.deny_write_count += 1;
        assert!(
            meta.deny_write_count <= meta.open_count,
            "deny_write_count above open_count"
        );
    }

    pub fn allow_write(&self) {
        let mut meta = self.meta.lock().unwrap();
        assert!(meta.deny_write_count > 0, "allow_write without deny_write");
        meta.deny_write_count -= 1;
    }

    /// Copies up to `dst.len()` bytes starting at `offset` into `dst`.
    /// Returns the number of bytes copied, which is short when the read
    /// crosses the end of the file.
    pub fn read_at(&self, fs: &Filesys, dst: &mut [u8], offset: u32) -> usize {
        let dinode = Dinode::load(fs, self.sector);
        let length = dinode.len();
        if offset >= length {
            return 0;
        }
        let n = dst.len().min((length - offset) as usize);

        let mut done = 0;
        while done < n {
            let pos = offset as usize + done;
            let sector = dinode.byte_to_sector(fs, pos as u32);
            let begin = pos % SECTOR_SIZE;
            let chunk = (n - done).min(SECTOR_SIZE - begin);
            let buf = fs.cache.acquire(sector, false);
            dst[done..done + chunk].copy_from_slice(&buf.data()[begin..begin + chunk]);
            done += chunk;
        }
        n
    }

    /// Copies `src` into the file starting at `offset`, growing the file
    /// when the write reaches past its end. Returns the number of bytes
    /// written: 0 when writes are denied or when the file cannot grow far
    /// enough.
    pub fn write_at(&self, fs: &Filesys, src: &[u8], offset: u32) -> usize {
        let meta = self.meta.lock().unwrap();
        if meta.deny_write_count > 0 {
            return 0;
        }

        let end = offset as u64 + src.len() as u64;
        let mut dinode = Dinode::load(fs, self.sector);
        if end > dinode.len() as u64 {
            // Extend while still holding the handle mutex, so concurrent
            // extenders line up and length growth is linearizable.
            let old_len = dinode.len();
            let grown = if end > MAX_FILE_LEN as u64 {
                Err(FsError::FileTooLarge)
            } else {
                dinode.resize(fs, end as u32)
            };
            match grown {
                Ok(()) => dinode.store(fs, self.sector),
                Err(e) => {
                    debug!("inode: extension of sector {} failed: {}", self.sector, e);
                    dinode
                        .resize(fs, old_len)
                        .expect("shrinking back cannot fail");
                    return 0;
                }
            }
        }
        drop(meta);

        let n = src.len();
        let mut done = 0;
        while done < n {
            let pos = offset as usize + done;
            let begin = pos % SECTOR_SIZE;
            let chunk = (n - done).min(SECTOR_SIZE - begin);
            let sector = dinode.byte_to_sector(fs, pos as u32);
            // A whole-sector write does not need the old contents.
            let mut buf = if chunk == SECTOR_SIZE {
                fs.cache.acquire_zeroed(sector)
            } else {
                fs.cache.acquire(sector, true)
            };
            buf.data_mut()[begin..begin + chunk].copy_from_slice(&src[done..done + chunk]);
            done += chunk;
        }
        n
    }
}

/// The open-inode table: at most one `Inode` per sector, shared by every
/// opener. Its lock protects membership only and is never held across I/O.
pub(crate) struct InodeTable {
    list: Mutex<Vec<Arc<Inode>>>,
}

impl InodeTable {
    pub(crate) fn new() -> InodeTable {
        InodeTable {
            list: Mutex::new(Vec::new()),
        }
    }

    /// Finds the handle for `sector` or creates one, and counts the open.
    pub(crate) fn open(&self, sector: u32) -> Arc<Inode> {
        let mut list = self.list.lock().unwrap();
        if let Some(inode) = list.iter().find(|inode| inode.sector == sector) {
            inode.meta.lock().unwrap().open_count += 1;
            return Arc::clone(inode);
        }
        let inode = Arc::new(Inode {
            sector,
            meta: Mutex::new(InodeMeta {
                open_count: 1,
                removed: false,
                deny_write_count: 0,
            }),
        });
        list.push(Arc::clone(&inode));
        inode
    }

    /// Drops one open. The last close unregisters the handle and, if the
    /// inode was removed meanwhile, frees its contents and its sector.
    pub(crate) fn close(&self, fs: &Filesys, inode: Arc<Inode>) {
        let mut list = self.list.lock().unwrap();
        let last = {
            let mut meta = inode.meta.lock().unwrap();
            assert!(meta.open_count > 0, "close of an unopened inode");
            meta.open_count -= 1;
            meta.open_count == 0
        };
        if !last {
            return;
        }
        list.retain(|other| !Arc::ptr_eq(other, &inode));
        drop(list);

        if inode.meta.lock().unwrap().removed {
            debug!("inode: freeing removed inode at sector {}", inode.sector);
            let mut dinode = Dinode::load(fs, inode.sector);
            dinode
                .resize(fs, 0)
                .expect("shrinking to zero cannot fail");
            fs.free_map.release(fs, inode.sector);
        }
    }
}
