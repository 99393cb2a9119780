//! An on-disk file system over a sector-addressed block device. Five layers:
//!   + Device: fixed-size sector reads and writes.
//!   + Buffer cache: a write-back LRU cache that carries, and synchronizes,
//!     all device traffic.
//!   + Files: inodes with direct, indirect, and doubly-indirect block maps;
//!     files grow in place and shrink on removal.
//!   + Directories: inodes with special contents (a table of named entries).
//!   + Names: paths like /usr/doc/notes.txt for convenient naming.
//!
//! The embedder supplies the block device and keeps the per-process state
//! (descriptor tables of [`Handle`]s and a current directory [`Dir`]), while
//! everything here takes the [`Filesys`] context explicitly, so several
//! volumes can live side by side.
//!
//! ```
//! use std::sync::Arc;
//! use tinyfs::{Filesys, Handle, MemDisk};
//!
//! let fs = Filesys::format(Arc::new(MemDisk::new(1024))).unwrap();
//! fs.create("/notes.txt", None, 0).unwrap();
//! if let Handle::File(mut f) = fs.open("/notes.txt", None).unwrap() {
//!     assert_eq!(f.write(&fs, b"hello"), 5);
//!     f.seek(0);
//!     let mut buf = [0u8; 5];
//!     assert_eq!(f.read(&fs, &mut buf), 5);
//!     assert_eq!(&buf, b"hello");
//!     fs.close(Handle::File(f));
//! }
//! fs.flush();
//! ```

mod bio;
mod device;
mod dir;
mod error;
mod file;
mod filesys;
mod freemap;
mod inode;
pub mod param;
mod path;

pub use crate::device::{BlockDevice, MemDisk};
pub use crate::dir::Dir;
pub use crate::error::FsError;
pub use crate::file::{File, Handle};
pub use crate::filesys::Filesys;
pub use crate::inode::Inode;
pub use crate::path::{FileName, Path};
