use core::fmt;

/// Reasons a file system operation can fail.
///
/// Corruption (a bad inode magic, a hole inside a file's length, counter
/// underflow) is never reported through this type; it panics, since it means
/// the volume or a caller is already broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No entry with the given name.
    NotFound,
    /// An entry with the given name already exists.
    Exists,
    /// An interior path component names something that is not a directory.
    NotDirectory,
    /// Directory still contains entries other than `.` and `..`.
    NotEmpty,
    /// The object is open elsewhere.
    Busy,
    /// The free map cannot satisfy an allocation.
    NoSpace,
    /// A path component is longer than `NAME_MAX`.
    NameTooLong,
    /// Empty path, a NUL byte in a name, or a component where none may be.
    InvalidPath,
    /// The requested length exceeds what the block map can address.
    FileTooLarge,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NotFound => "no such file or directory",
            FsError::Exists => "file exists",
            FsError::NotDirectory => "not a directory",
            FsError::NotEmpty => "directory not empty",
            FsError::Busy => "file or directory is busy",
            FsError::NoSpace => "no space left on device",
            FsError::NameTooLong => "file name too long",
            FsError::InvalidPath => "invalid path",
            FsError::FileTooLarge => "file too large",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for FsError {}
