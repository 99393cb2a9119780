//! File system facade.
//!
//! Ties the layers together: the buffer cache over the device, the free map
//! in its reserved file, the open-inode table, and path resolution on top of
//! directories. Every operation takes the context explicitly; there are no
//! globals, so several volumes can coexist in one process.
//!
//! On-disk layout: sector 0 holds the free map's inode, sector 1 the root
//! directory's inode, and every other sector is handed out by the free map.
//! There is no superblock; inodes are whole sectors.

use core::mem;
use std::sync::Arc;

use log::{debug, info};
use scopeguard::ScopeGuard;

use crate::bio::BufferCache;
use crate::device::BlockDevice;
use crate::dir::{dir_is_empty, Dir};
use crate::error::FsError;
use crate::file::{File, Handle};
use crate::freemap::FreeMap;
use crate::inode::{inode_create, Dinode, Inode, InodeTable};
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};
use crate::path::{FileName, Path};

pub struct Filesys {
    device: Arc<dyn BlockDevice>,
    pub(crate) cache: BufferCache,
    pub(crate) free_map: FreeMap,
    pub(crate) itable: InodeTable,
}

impl Filesys {
    fn build(device: Arc<dyn BlockDevice>) -> Filesys {
        Filesys {
            cache: BufferCache::new(Arc::clone(&device)),
            free_map: FreeMap::new(device.sector_count()),
            itable: InodeTable::new(),
            device,
        }
    }

    /// Lays a fresh volume down on `device`: the free map file over the
    /// reserved sector 0, and an empty root directory at sector 1.
    pub fn format(device: Arc<dyn BlockDevice>) -> Result<Filesys, FsError> {
        let fs = Filesys::build(device);
        info!("filesys: formatting {} sectors", fs.device.sector_count());

        fs.free_map.mark_used(FREE_MAP_SECTOR);
        fs.free_map.mark_used(ROOT_DIR_SECTOR);
        inode_create(&fs, FREE_MAP_SECTOR, fs.free_map.byte_len(), false)?;
        inode_create(&fs, ROOT_DIR_SECTOR, 0, true)?;

        let root = Dir::new(fs.itable.open(ROOT_DIR_SECTOR));
        let result = root
            .add(&fs, FileName::new(b".").expect("dot name"), ROOT_DIR_SECTOR)
            .and_then(|()| {
                root.add(
                    &fs,
                    FileName::new(b"..").expect("dot-dot name"),
                    ROOT_DIR_SECTOR,
                )
            });
        fs.close_dir(root);
        result?;

        fs.free_map.attach(&fs);
        fs.flush();
        Ok(fs)
    }

    /// Opens the volume already present on `device`.
    ///
    /// Panics when the reserved inodes do not look like a formatted volume;
    /// a corrupt volume is not recoverable here.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Filesys, FsError> {
        let fs = Filesys::build(device);

        let free_map_inode = Dinode::load(&fs, FREE_MAP_SECTOR);
        assert!(
            !free_map_inode.is_dir(),
            "free map inode is marked as a directory"
        );
        assert_eq!(
            free_map_inode.len(),
            fs.free_map.byte_len(),
            "free map length does not match the device size"
        );
        fs.free_map.load(&fs);

        assert!(
            Dinode::load(&fs, ROOT_DIR_SECTOR).is_dir(),
            "root inode is not a directory"
        );
        info!("filesys: mounted, {} sectors in use", fs.free_map.used_count());
        Ok(fs)
    }

    /// Writes all cached dirty state, the free map included, back to the
    /// device. Called at shutdown; idempotent.
    pub fn flush(&self) {
        self.free_map.persist_now(self);
        self.cache.flush();
    }

    /// Opens a fresh handle on the root directory.
    pub fn root_dir(&self) -> Dir {
        Dir::new(self.itable.open(ROOT_DIR_SECTOR))
    }

    /// Creates a zero-filled file of `initial_size` bytes at `path`.
    pub fn create(
        &self,
        path: &str,
        cwd: Option<&Dir>,
        initial_size: u32,
    ) -> Result<(), FsError> {
        let path = Path::new(path);
        let (dir, name) = self.resolve_parent(path, cwd)?;
        let dir = scopeguard::guard(dir, |d| self.close_dir(d));
        if dir.lookup(self, name).is_some() {
            return Err(FsError::Exists);
        }

        let sector = self.free_map.allocate(self)?;
        let sector = scopeguard::guard(sector, |s| self.free_map.release(self, s));
        inode_create(self, *sector, initial_size, false)?;

        if let Err(e) = dir.add(self, name, *sector) {
            let mut dinode = Dinode::load(self, *sector);
            dinode
                .resize(self, 0)
                .expect("shrinking to zero cannot fail");
            return Err(e);
        }
        debug!("filesys: created file at sector {}", *sector);
        ScopeGuard::into_inner(sector);
        Ok(())
    }

    /// Opens the file or directory at `path`.
    pub fn open(&self, path: &str, cwd: Option<&Dir>) -> Result<Handle, FsError> {
        let inode = self.resolve_full(Path::new(path), cwd)?;
        Ok(if inode.is_dir(self) {
            Handle::Dir(Dir::new(inode))
        } else {
            Handle::File(File::new(inode))
        })
    }

    /// Opens another handle on whatever `handle` refers to.
    pub fn reopen(&self, handle: &Handle) -> Handle {
        let inode = self.itable.open(handle.inode().sector());
        match handle {
            Handle::File(_) => Handle::File(File::new(inode)),
            Handle::Dir(_) => Handle::Dir(Dir::new(inode)),
        }
    }

    /// Removes the entry at `path`.
    ///
    /// Files may be removed while open; their sectors are reclaimed on the
    /// last close. A directory must have no other openers and no entries
    /// besides `.` and `..`.
    pub fn remove(&self, path: &str, cwd: Option<&Dir>) -> Result<(), FsError> {
        let path = Path::new(path);
        let (dir, name) = self.resolve_parent(path, cwd)?;
        let dir = scopeguard::guard(dir, |d| self.close_dir(d));
        if name.as_bytes() == b"." || name.as_bytes() == b".." {
            return Err(FsError::InvalidPath);
        }

        let (slot, entry) = dir.lookup_slot(self, name).ok_or(FsError::NotFound)?;
        let inode = self.itable.open(entry.sector());
        let inode = scopeguard::guard(inode, |ip| self.close_inode(ip));

        if inode.is_dir(self) {
            // Our probe open is the 1 in the count.
            if inode.open_count() > 1 {
                return Err(FsError::Busy);
            }
            if !dir_is_empty(self, &inode) {
                return Err(FsError::NotEmpty);
            }
        }

        dir.erase(self, slot, entry);
        inode.mark_removed();
        debug!("filesys: removed entry at sector {}", entry.sector());
        Ok(())
    }

    /// Creates an empty directory at `path`, wired up with `.` and `..`.
    pub fn mkdir(&self, path: &str, cwd: Option<&Dir>) -> Result<(), FsError> {
        let path = Path::new(path);
        let (parent, name) = self.resolve_parent(path, cwd)?;
        let parent = scopeguard::guard(parent, |d| self.close_dir(d));
        if parent.lookup(self, name).is_some() {
            return Err(FsError::Exists);
        }

        let sector = self.free_map.allocate(self)?;
        let sector = scopeguard::guard(sector, |s| self.free_map.release(self, s));
        inode_create(self, *sector, 0, true)?;

        let dir = Dir::new(self.itable.open(*sector));
        let wired = dir
            .add(self, FileName::new(b".").expect("dot name"), *sector)
            .and_then(|()| {
                dir.add(
                    self,
                    FileName::new(b"..").expect("dot-dot name"),
                    parent.inode().sector(),
                )
            })
            .and_then(|()| parent.add(self, name, *sector));

        match wired {
            Ok(()) => {
                self.close_dir(dir);
                debug!("filesys: created directory at sector {}", *sector);
                ScopeGuard::into_inner(sector);
                Ok(())
            }
            Err(e) => {
                // The close below reclaims the contents and the sector.
                ScopeGuard::into_inner(sector);
                dir.inode().mark_removed();
                self.close_dir(dir);
                Err(e)
            }
        }
    }

    /// Repoints `cwd` at the directory named by `path`.
    pub fn chdir(&self, cwd: &mut Dir, path: &str) -> Result<(), FsError> {
        let inode = self.resolve_full(Path::new(path), Some(cwd))?;
        if !inode.is_dir(self) {
            self.close_inode(inode);
            return Err(FsError::NotDirectory);
        }
        let old = mem::replace(cwd, Dir::new(inode));
        self.close_dir(old);
        Ok(())
    }

    /// Closes any handle, undoing a file's outstanding write denial.
    pub fn close(&self, handle: Handle) {
        match handle {
            Handle::File(mut file) => {
                file.allow_write();
                self.close_inode(file.into_inode());
            }
            Handle::Dir(dir) => self.close_dir(dir),
        }
    }

    pub(crate) fn close_dir(&self, dir: Dir) {
        self.close_inode(dir.into_inode());
    }

    pub(crate) fn close_inode(&self, inode: Arc<Inode>) {
        self.itable.close(self, inode);
    }

    /// Walks every component of `path` and returns the opened terminal
    /// inode.
    fn resolve_full(&self, path: &Path, cwd: Option<&Dir>) -> Result<Arc<Inode>, FsError> {
        if path.is_empty() {
            return Err(FsError::InvalidPath);
        }
        let mut dir = scopeguard::guard(self.start_dir(path, cwd), |d| self.close_dir(d));
        let mut rest = path;
        while let Some((next, name)) = rest.skipelem()? {
            rest = next;
            let sector = dir.lookup(self, name).ok_or(FsError::NotFound)?;
            let inode = self.itable.open(sector);
            if rest.is_empty() {
                return Ok(inode);
            }
            if !inode.is_dir(self) {
                self.close_inode(inode);
                return Err(FsError::NotDirectory);
            }
            let old = mem::replace(&mut *dir, Dir::new(inode));
            self.close_dir(old);
        }
        // No components at all: the path was `/` (or all slashes).
        Ok(ScopeGuard::into_inner(dir).into_inode())
    }

    /// Walks everything but the final component and hands back the opened
    /// parent directory together with that name.
    fn resolve_parent<'p>(
        &self,
        path: &'p Path,
        cwd: Option<&Dir>,
    ) -> Result<(Dir, &'p FileName), FsError> {
        let mut dir = scopeguard::guard(self.start_dir(path, cwd), |d| self.close_dir(d));
        let mut rest = path;
        loop {
            match rest.skipelem()? {
                // `/` or an empty path: there is no name to split off.
                None => return Err(FsError::InvalidPath),
                Some((next, name)) => {
                    if next.is_empty() {
                        return Ok((ScopeGuard::into_inner(dir), name));
                    }
                    rest = next;
                    let sector = dir.lookup(self, name).ok_or(FsError::NotFound)?;
                    let inode = self.itable.open(sector);
                    if !inode.is_dir(self) {
                        self.close_inode(inode);
                        return Err(FsError::NotDirectory);
                    }
                    let old = mem::replace(&mut *dir, Dir::new(inode));
                    self.close_dir(old);
                }
            }
        }
    }

    /// Where a walk begins: the root for absolute paths or when the caller
    /// has no current directory, otherwise a fresh open of the caller's one.
    fn start_dir(&self, path: &Path, cwd: Option<&Dir>) -> Dir {
        match cwd {
            Some(cwd) if !path.is_absolute() => {
                Dir::new(self.itable.open(cwd.inode().sector()))
            }
            _ => self.root_dir(),
        }
    }

    /// Cache and device instrumentation, exposed for tests and tuning.
    pub fn cache_hit_rate(&self) -> f32 {
        self.cache.hit_rate()
    }

    pub fn cache_access_count(&self) -> u64 {
        self.cache.access_count()
    }

    pub fn cache_hit_count(&self) -> u64 {
        self.cache.hit_count()
    }

    /// Flushes and invalidates the cache and zeroes its counters.
    pub fn cache_reset(&self) {
        self.cache.reset();
    }

    /// Sector writes the device has absorbed so far.
    pub fn device_write_count(&self) -> u64 {
        self.device.write_count()
    }

    /// Sectors currently marked used in the free map.
    pub fn used_sectors(&self) -> u32 {
        self.free_map.used_count()
    }
}
