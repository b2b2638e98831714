//! Error types shared by the allocator, the VFS layer and the ext2 driver.
//!
//! The allocator and the block device report their own narrow errors
//! ([`RegionError`], [`DeviceError`]); both convert into [`FsError`] at the
//! driver boundary so callers only ever see one type.

use onlyerror::Error;

/// Result alias used by the driver.
pub type FsResult<T> = Result<T, FsError>;

/// Result alias used by the VFS layer. Same error type as the driver.
pub type VfsResult<T> = Result<T, FsError>;

/// Failures of the region bitmap allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegionError {
    /// No stride-aligned region of the requested order is free.
    #[error("no free region of the requested order")]
    OutOfSpace,
    /// The requested region already has at least one bit set.
    #[error("region is already allocated")]
    Busy,
}

/// Failures reported by a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The request touches sectors past the end of the device.
    #[error("sector {0} is out of range")]
    OutOfRange(u64),
    /// The buffer is not a whole number of sectors.
    #[error("buffer length {0} is not sector aligned")]
    Unaligned(usize),
    /// The medium failed the transfer.
    #[error("device transfer failed")]
    Transfer,
}

/// Filesystem error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    /// Block device read or write failed.
    #[error("I/O error")]
    Io,
    /// No free inode or data block.
    #[error("no space left on device")]
    NoSpace,
    /// File or directory not found
    #[error("no such file or directory")]
    NotFound,
    /// Name already present in the directory
    #[error("file exists")]
    AlreadyExists,
    /// Not a directory
    #[error("not a directory")]
    NotADirectory,
    /// Is a directory (when expecting file)
    #[error("is a directory")]
    IsADirectory,
    /// Directory still holds entries other than `.` and `..`
    #[error("directory not empty")]
    DirectoryNotEmpty,
    /// Target is in use: current directory, one of its ancestors, or an
    /// occupied bitmap region.
    #[error("resource busy")]
    Busy,
    /// Malformed path syntax
    #[error("invalid path")]
    InvalidPath,
    /// Empty or otherwise unusable file name
    #[error("invalid file name")]
    InvalidName,
    /// Path component too long
    #[error("file name too long")]
    NameTooLong,
    /// Invalid argument
    #[error("invalid argument")]
    InvalidArgument,
    /// File would need blocks past the single indirect block
    #[error("file too large")]
    FileTooLarge,
    /// On-disk structures are inconsistent
    #[error("corrupted filesystem")]
    Corrupted,
    /// Operation table outlived the filesystem it points to
    #[error("filesystem not initialized")]
    NotInitialized,
}

impl FsError {
    /// Convert to errno-style error code
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::Io => -5,                 // EIO
            FsError::NoSpace => -28,           // ENOSPC
            FsError::NotFound => -2,           // ENOENT
            FsError::AlreadyExists => -17,     // EEXIST
            FsError::NotADirectory => -20,     // ENOTDIR
            FsError::IsADirectory => -21,      // EISDIR
            FsError::DirectoryNotEmpty => -39, // ENOTEMPTY
            FsError::Busy => -16,              // EBUSY
            FsError::InvalidPath => -22,       // EINVAL
            FsError::InvalidName => -22,
            FsError::NameTooLong => -36,       // ENAMETOOLONG
            FsError::InvalidArgument => -22,
            FsError::FileTooLarge => -27,      // EFBIG
            FsError::Corrupted => -5,
            FsError::NotInitialized => -22,
        }
    }
}

impl From<RegionError> for FsError {
    fn from(e: RegionError) -> Self {
        match e {
            RegionError::OutOfSpace => FsError::NoSpace,
            RegionError::Busy => FsError::Busy,
        }
    }
}

impl From<DeviceError> for FsError {
    fn from(e: DeviceError) -> Self {
        log::error!("block device failure: {}", e);
        FsError::Io
    }
}
