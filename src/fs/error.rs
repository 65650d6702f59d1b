use core::fmt;

use crate::disk::DiskError;
use crate::errno;

/// Errors seen by filesystem drivers and surfaced to syscalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    ReadError(DiskError),
    WriteError(DiskError),
    InvalidLink,
    AlreadyExists,
    TooLarge,
    NotFound,
    Unknown,
}

impl FsError {
    pub fn read(err: DiskError) -> Self {
        FsError::ReadError(err)
    }

    pub fn write(err: DiskError) -> Self {
        FsError::WriteError(err)
    }

    /// Positive errno for the syscall layer.
    pub fn errno(&self) -> i64 {
        match self {
            FsError::ReadError(_) | FsError::WriteError(_) | FsError::Unknown => errno::EIO,
            FsError::InvalidLink => errno::ELOOP,
            FsError::AlreadyExists => errno::EEXIST,
            FsError::TooLarge => errno::EFBIG,
            FsError::NotFound => errno::ENOENT,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FsError::ReadError(e) => write!(f, "Read error: {}", e),
            FsError::WriteError(e) => write!(f, "Write error: {}", e),
            FsError::InvalidLink => write!(f, "Invalid link"),
            FsError::AlreadyExists => write!(f, "File exists"),
            FsError::TooLarge => write!(f, "File too large"),
            FsError::NotFound => write!(f, "No such file or directory"),
            FsError::Unknown => write!(f, "Unknown filesystem error"),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
