//! Directories.
//!
//! A directory is an ordinary file whose contents are a packed array of
//! fixed-size entries. The first two slots always hold `.` and `..`, pointing
//! at the directory itself and its parent (the root's `..` points back at the
//! root). Removing an entry only clears its `in_use` flag; `add` reuses the
//! first cleared slot before growing the file.

use core::mem;
use std::sync::Arc;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::error::FsError;
use crate::filesys::Filesys;
use crate::inode::Inode;
use crate::param::NAME_MAX;
use crate::path::FileName;

/// Size of one on-disk directory entry.
pub(crate) const DIR_ENTRY_SIZE: usize = mem::size_of::<DirEntry>();

/// One on-disk directory entry. Entries may straddle sector boundaries; the
/// inode read/write paths take care of the split.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub(crate) struct DirEntry {
    /// Sector of the named inode.
    inode_sector: u32,

    /// NUL-padded name; always NUL-terminated since names are at most
    /// `NAME_MAX` bytes.
    name: [u8; NAME_MAX + 1],

    /// Nonzero while the slot is live.
    in_use: u8,
}

const_assert!(DIR_ENTRY_SIZE == 20);

impl DirEntry {
    fn empty() -> DirEntry {
        DirEntry {
            inode_sector: 0,
            name: [0; NAME_MAX + 1],
            in_use: 0,
        }
    }

    fn new(name: &FileName, inode_sector: u32) -> DirEntry {
        let mut entry = DirEntry::empty();
        entry.inode_sector = inode_sector;
        entry.name[..name.as_bytes().len()].copy_from_slice(name.as_bytes());
        entry.in_use = 1;
        entry
    }

    pub(crate) fn sector(&self) -> u32 {
        self.inode_sector
    }

    fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&ch| ch == 0)
            .unwrap_or(NAME_MAX);
        &self.name[..len]
    }
}

/// Reads slot `idx` of `dir`, or `None` past the end of the directory file.
fn entry_at(fs: &Filesys, dir: &Inode, idx: u32) -> Option<DirEntry> {
    let mut entry = DirEntry::empty();
    let off = idx * DIR_ENTRY_SIZE as u32;
    if dir.read_at(fs, entry.as_bytes_mut(), off) == DIR_ENTRY_SIZE {
        Some(entry)
    } else {
        None
    }
}

/// True when `dir` holds nothing besides the `.` and `..` sentinels.
pub(crate) fn dir_is_empty(fs: &Filesys, dir: &Inode) -> bool {
    let mut idx = 2;
    while let Some(entry) = entry_at(fs, dir, idx) {
        if entry.in_use != 0 {
            return false;
        }
        idx += 1;
    }
    true
}

/// An open directory handle.
///
/// Wraps the directory's inode and carries the `readdir` cursor.
#[derive(Debug)]
pub struct Dir {
    inode: Arc<Inode>,
    pos: u32,
}

impl Dir {
    pub(crate) fn new(inode: Arc<Inode>) -> Dir {
        Dir { inode, pos: 0 }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub(crate) fn into_inode(self) -> Arc<Inode> {
        self.inode
    }

    /// Looks `name` up and returns the sector of the inode it names.
    /// `.` and `..` hit their sentinel slots like any other entry.
    pub fn lookup(&self, fs: &Filesys, name: &FileName) -> Option<u32> {
        self.lookup_slot(fs, name).map(|(_, entry)| entry.sector())
    }

    pub(crate) fn lookup_slot(&self, fs: &Filesys, name: &FileName) -> Option<(u32, DirEntry)> {
        let mut idx = 0;
        while let Some(entry) = entry_at(fs, &self.inode, idx) {
            if entry.in_use != 0 && entry.name_bytes() == name.as_bytes() {
                return Some((idx, entry));
            }
            idx += 1;
        }
        None
    }

    /// Writes a new entry binding `name` to `sector`, reusing the first free
    /// slot or appending one.
    pub(crate) fn add(&self, fs: &Filesys, name: &FileName, sector: u32) -> Result<(), FsError> {
        if self.lookup_slot(fs, name).is_some() {
            return Err(FsError::Exists);
        }

        let mut idx = 0;
        let slot = loop {
            match entry_at(fs, &self.inode, idx) {
                Some(entry) if entry.in_use == 0 => break idx,
                Some(_) => idx += 1,
                // Append, growing the directory file.
                None => break idx,
            }
        };

        let entry = DirEntry::new(name, sector);
        let off = slot * DIR_ENTRY_SIZE as u32;
        if self.inode.write_at(fs, entry.as_bytes(), off) != DIR_ENTRY_SIZE {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Clears the slot found by `lookup_slot`.
    pub(crate) fn erase(&self, fs: &Filesys, idx: u32, mut entry: DirEntry) {
        entry.in_use = 0;
        let off = idx * DIR_ENTRY_SIZE as u32;
        let written = self.inode.write_at(fs, entry.as_bytes(), off);
        assert_eq!(written, DIR_ENTRY_SIZE, "dir: short write clearing a slot");
    }

    /// Returns the next live entry's name, advancing the cursor past unused
    /// slots. The `.` and `..` sentinels are reported like any other entry.
    pub fn readdir(&mut self, fs: &Filesys) -> Option<String> {
        while let Some(entry) = entry_at(fs, &self.inode, self.pos) {
            self.pos += 1;
            if entry.in_use != 0 {
                return Some(String::from_utf8_lossy(entry.name_bytes()).into_owned());
            }
        }
        None
    }

    /// Rewinds the `readdir` cursor to the first slot.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }
}
