//! Kernel error type
//!
//! Every fallible kernel path returns [`KernResult`]. Errors are only
//! flattened to negative integers at the system-call boundary, through
//! [`KernError::errno`].

use thiserror::Error;

use crate::types::VirtAddr;

/// Errors reported by kernel operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernError {
    #[error("out of kernel memory for control blocks")]
    NoMemory,

    #[error("out of physical frames")]
    NoFrames,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("bad user address {0:#010x}")]
    BadAddress(VirtAddr),

    #[error("region overlaps an existing mapping")]
    Overlap,

    #[error("no such thread, task or program")]
    NotFound,

    #[error("no children to wait for")]
    NoChildren,

    #[error("task has more than one live thread")]
    MultiThreaded,

    #[error("caller does not hold the mutex")]
    NotHolder,

    #[error("thread is not in a wakeable state")]
    NotRunnable,

    #[error("executable name too long")]
    NameTooLong,

    #[error("argument vector too large")]
    ArgsTooLong,
}

impl KernError {
    /// Negative value handed back to user code in `%eax`
    pub const fn errno(self) -> i32 {
        match self {
            KernError::NoMemory => -1,
            KernError::NoFrames => -2,
            KernError::InvalidArgument => -3,
            KernError::BadAddress(_) => -4,
            KernError::Overlap => -5,
            KernError::NotFound => -6,
            KernError::NoChildren => -7,
            KernError::MultiThreaded => -8,
            KernError::NotHolder => -9,
            KernError::NotRunnable => -10,
            KernError::NameTooLong => -11,
            KernError::ArgsTooLong => -12,
        }
    }

    /// Resource exhaustion (recoverable by retrying later)
    pub const fn is_exhaustion(self) -> bool {
        matches!(self, KernError::NoMemory | KernError::NoFrames)
    }
}

/// Result type used throughout the kernel
pub type KernResult<T> = Result<T, KernError>;
