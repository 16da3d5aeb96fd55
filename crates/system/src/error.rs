//! Error types for stratum-system
//!
//! Platform failures always carry the host errno so callers (and logs) can
//! render both the symbolic name and the long text through
//! [`Errno`](crate::diagnostics::Errno).

use std::io;

use thiserror::Error;

use crate::diagnostics::Errno;

/// Result alias for host-platform operations
pub type SystemResult<T> = Result<T, SystemError>;

/// Errors raised by the host platform layer
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SystemError {
    /// A host call failed
    #[error("{operation} failed: {errno}")]
    Platform {
        /// Host primitive that failed (`mmap`, `setpriority`, ...)
        operation: &'static str,
        /// Host error code
        errno: Errno,
    },

    /// A path-list element plus the file name would not fit in a host path
    #[error(
        "the VM tried to use a path that exceeds the maximum path length for this system \
         ({length} > {limit}); review path-containing parameters and properties"
    )]
    PathTooLong {
        /// Element length plus file name length
        length: usize,
        /// Host limit
        limit: usize,
    },

    /// Priority outside the range allowed for the thread
    #[error("priority {priority} is not valid for a {kind} thread")]
    InvalidPriority {
        /// Requested abstract priority
        priority: i32,
        /// Thread kind name
        kind: &'static str,
    },

    /// Native priority table failed validation
    #[error("invalid native priority table: {reason}")]
    PriorityTable {
        /// What was wrong with the table
        reason: String,
    },

    /// Configured stack size is below the computed minimum
    #[error("The {kind} specified is too small. Specify at least {min_kib}k")]
    StackTooSmall {
        /// Which stack size setting
        kind: &'static str,
        /// Minimum in KiB
        min_kib: usize,
    },

    /// Capability not available on this host
    #[error("Feature not supported: {feature}")]
    Unsupported {
        /// Capability name
        feature: &'static str,
    },

    /// Signal dispatcher lifecycle problem
    #[error("Signal dispatcher error: {reason}")]
    SignalThread {
        /// Description
        reason: String,
    },
}

impl SystemError {
    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Platform { .. } => "SYS:PLATFORM",
            Self::PathTooLong { .. } => "SYS:PATH:TOO_LONG",
            Self::InvalidPriority { .. } => "SYS:THREAD:PRIORITY",
            Self::PriorityTable { .. } => "SYS:THREAD:PRIORITY_TABLE",
            Self::StackTooSmall { .. } => "SYS:THREAD:STACK",
            Self::Unsupported { .. } => "SYS:UNSUPPORTED",
            Self::SignalThread { .. } => "SYS:SIGNAL",
        }
    }

    /// Host errno, when the error came from a host call
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Platform { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Create a platform error from an [`io::Error`]
    pub fn platform(operation: &'static str, err: &io::Error) -> Self {
        Self::Platform {
            operation,
            errno: Errno::from(err),
        }
    }

    /// Create a platform error from the calling thread's last errno
    pub fn last_os_error(operation: &'static str) -> Self {
        Self::platform(operation, &io::Error::last_os_error())
    }

    /// Create an unsupported-capability error
    pub fn unsupported(feature: &'static str) -> Self {
        Self::Unsupported { feature }
    }
}

/// Attach an operation name to `io::Result`s coming back from the host
pub trait SystemResultExt<T> {
    /// Convert to [`SystemResult`], recording `operation` and the errno
    fn with_operation(self, operation: &'static str) -> SystemResult<T>;
}

impl<T> SystemResultExt<T> for io::Result<T> {
    fn with_operation(self, operation: &'static str) -> SystemResult<T> {
        self.map_err(|e| SystemError::platform(operation, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_error_renders_errno_name_and_text() {
        let err = SystemError::Platform {
            operation: "mmap",
            errno: Errno(libc::ENOMEM),
        };
        assert_eq!(err.to_string(), "mmap failed: ENOMEM (Not enough space)");
        assert_eq!(err.code(), "SYS:PLATFORM");
        assert_eq!(err.errno(), Some(Errno(libc::ENOMEM)));
    }

    #[test]
    fn with_operation_keeps_raw_errno() {
        let res: io::Result<()> = Err(io::Error::from_raw_os_error(libc::EPERM));
        let err = res.with_operation("setpriority").unwrap_err();
        assert_eq!(err.errno(), Some(Errno(libc::EPERM)));
    }

    #[test]
    fn stack_too_small_message() {
        let err = SystemError::StackTooSmall {
            kind: "Java thread stack size",
            min_kib: 136,
        };
        assert_eq!(
            err.to_string(),
            "The Java thread stack size specified is too small. Specify at least 136k"
        );
    }
}
