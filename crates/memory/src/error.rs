//! Error types for stratum-memory
//!
//! Heap operations keep C semantics and report failure as `None`; only the
//! virtual memory manager and configuration parsing return [`MemoryError`].

use std::io;

use stratum_system::Errno;
use thiserror::Error;

/// Result alias for memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Memory management errors
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    // --- Virtual memory ---
    /// Address space reservation failed
    #[error("Reserving {bytes} bytes failed: {errno}")]
    Reserve {
        /// Requested size
        bytes: usize,
        /// Host error code
        errno: Errno,
    },

    /// Committing a reserved range failed
    #[error("Committing [{addr:#x}, +{bytes}) failed: {errno}")]
    Commit {
        /// Range start
        addr: usize,
        /// Range size
        bytes: usize,
        /// Host error code
        errno: Errno,
    },

    /// Uncommitting a range failed
    #[error("Uncommitting [{addr:#x}, +{bytes}) failed: {errno}")]
    Uncommit {
        /// Range start
        addr: usize,
        /// Range size
        bytes: usize,
        /// Host error code
        errno: Errno,
    },

    /// Releasing a reservation failed
    #[error("Releasing [{addr:#x}, +{bytes}) failed: {errno}")]
    Release {
        /// Range start
        addr: usize,
        /// Range size
        bytes: usize,
        /// Host error code
        errno: Errno,
    },

    /// Mapping a file failed
    #[error("Mapping {bytes} bytes failed: {errno}")]
    Map {
        /// Requested size
        bytes: usize,
        /// Host error code
        errno: Errno,
    },

    /// Unmapping a file mapping failed
    #[error("Unmapping [{addr:#x}, +{bytes}) failed: {errno}")]
    Unmap {
        /// Range start
        addr: usize,
        /// Range size
        bytes: usize,
        /// Host error code
        errno: Errno,
    },

    /// Null address or zero length handed to a range operation
    #[error("Invalid range [{addr:#x}, +{bytes})")]
    InvalidRange {
        /// Range start
        addr: usize,
        /// Range size
        bytes: usize,
    },

    // --- Limits ---
    /// Configured malloc ceiling would be crossed
    #[error("Malloc limit exceeded for {category}: {requested} bytes requested, {used} used, limit {limit}")]
    LimitExceeded {
        /// Category name, or "total" for the global limit
        category: &'static str,
        /// Requested size
        requested: usize,
        /// Bytes already accounted
        used: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// Size arithmetic overflowed
    #[error("Size overflow during operation: {operation}")]
    SizeOverflow {
        /// Operation that overflowed
        operation: &'static str,
    },

    // --- Configuration ---
    /// Configuration value could not be used
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description
        reason: String,
    },
}

impl MemoryError {
    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Reserve { .. } => "MEM:VM:RESERVE",
            Self::Commit { .. } => "MEM:VM:COMMIT",
            Self::Uncommit { .. } => "MEM:VM:UNCOMMIT",
            Self::Release { .. } => "MEM:VM:RELEASE",
            Self::Map { .. } => "MEM:VM:MAP",
            Self::Unmap { .. } => "MEM:VM:UNMAP",
            Self::InvalidRange { .. } => "MEM:VM:RANGE",
            Self::LimitExceeded { .. } => "MEM:MALLOC:LIMIT",
            Self::SizeOverflow { .. } => "MEM:MALLOC:OVERFLOW",
            Self::InvalidConfig { .. } => "MEM:CONFIG:INVALID",
        }
    }

    /// Check if a smaller or later request might succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Reserve { .. } | Self::Commit { .. } | Self::Map { .. } | Self::LimitExceeded { .. }
        )
    }

    /// Host errno, when the error came from a host call
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Reserve { errno, .. }
            | Self::Commit { errno, .. }
            | Self::Uncommit { errno, .. }
            | Self::Release { errno, .. }
            | Self::Map { errno, .. }
            | Self::Unmap { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Create invalid config error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub(crate) fn reserve(bytes: usize, err: &io::Error) -> Self {
        Self::Reserve {
            bytes,
            errno: Errno::from(err),
        }
    }

    pub(crate) fn commit(addr: usize, bytes: usize, err: &io::Error) -> Self {
        Self::Commit {
            addr,
            bytes,
            errno: Errno::from(err),
        }
    }

    pub(crate) fn uncommit(addr: usize, bytes: usize, err: &io::Error) -> Self {
        Self::Uncommit {
            addr,
            bytes,
            errno: Errno::from(err),
        }
    }

    pub(crate) fn release(addr: usize, bytes: usize, err: &io::Error) -> Self {
        Self::Release {
            addr,
            bytes,
            errno: Errno::from(err),
        }
    }

    pub(crate) fn map(bytes: usize, err: &io::Error) -> Self {
        Self::Map {
            bytes,
            errno: Errno::from(err),
        }
    }

    pub(crate) fn unmap(addr: usize, bytes: usize, err: &io::Error) -> Self {
        Self::Unmap {
            addr,
            bytes,
            errno: Errno::from(err),
        }
    }
}

/// Report a fatal native allocation failure and exit
pub(crate) fn exit_out_of_memory(size: usize, context: &str) -> ! {
    tracing::error!(target: "os::malloc", size, context, "native memory exhausted");
    eprintln!(
        "#\n# There is insufficient memory for the runtime to continue.\n\
         # Native memory allocation ({context}) failed to allocate {size} bytes.\n#"
    );
    std::process::exit(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn codes_are_categorised() {
        let err = MemoryError::reserve(4096, &io::Error::from_raw_os_error(libc::ENOMEM));
        assert_eq!(err.code(), "MEM:VM:RESERVE");
        assert_eq!(err.errno(), Some(Errno(libc::ENOMEM)));
        assert!(err.is_retryable());

        let err = MemoryError::InvalidRange { addr: 0, bytes: 0 };
        assert_eq!(err.code(), "MEM:VM:RANGE");
        assert_eq!(err.errno(), None);
        assert!(!err.is_retryable());
    }

    #[test]
    fn platform_errors_render_errno_name() {
        let err = MemoryError::commit(0x1000, 8192, &io::Error::from_raw_os_error(libc::ENOMEM));
        let text = err.to_string();
        assert!(text.starts_with("Committing [0x1000, +8192) failed: ENOMEM"), "{text}");
    }
}
