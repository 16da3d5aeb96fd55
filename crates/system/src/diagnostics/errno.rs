//! errno translation
//!
//! Symbolic names and POSIX-style long descriptions for host error codes.
//! The table is fixed text so output does not depend on the C library's
//! locale-sensitive `strerror`.

use std::fmt;
use std::io;

/// A host error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    /// The calling thread's last errno
    #[must_use]
    pub fn last() -> Self {
        Self::from(&io::Error::last_os_error())
    }

    /// Symbolic name, e.g. `"ENOMEM"`
    #[must_use]
    pub fn name(self) -> &'static str {
        errno_name(self.0)
    }

    /// Long description, e.g. `"Not enough space"`
    #[must_use]
    pub fn description(self) -> &'static str {
        strerror(self.0)
    }
}

impl From<&io::Error> for Errno {
    fn from(err: &io::Error) -> Self {
        Self(err.raw_os_error().unwrap_or(0))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.description())
    }
}

struct Entry {
    value: i32,
    name: &'static str,
    text: &'static str,
}

macro_rules! errno_table {
    ($($(#[$meta:meta])* $e:ident => $text:literal),* $(,)?) => {
        &[
            $(
                $(#[$meta])*
                Entry { value: libc::$e, name: stringify!($e), text: $text },
            )*
        ]
    };
}

static TABLE: &[Entry] = errno_table! {
    E2BIG => "Argument list too long",
    EACCES => "Permission denied",
    EADDRINUSE => "Address in use",
    EADDRNOTAVAIL => "Address not available",
    EAFNOSUPPORT => "Address family not supported",
    EAGAIN => "Resource unavailable, try again",
    EALREADY => "Connection already in progress",
    EBADF => "Bad file descriptor",
    EBADMSG => "Bad message",
    EBUSY => "Device or resource busy",
    ECANCELED => "Operation canceled",
    ECHILD => "No child processes",
    ECONNABORTED => "Connection aborted",
    ECONNREFUSED => "Connection refused",
    ECONNRESET => "Connection reset",
    EDEADLK => "Resource deadlock would occur",
    EDESTADDRREQ => "Destination address required",
    EDOM => "Mathematics argument out of domain of function",
    EEXIST => "File exists",
    EFAULT => "Bad address",
    EFBIG => "File too large",
    EHOSTUNREACH => "Host is unreachable",
    EIDRM => "Identifier removed",
    EILSEQ => "Illegal byte sequence",
    EINPROGRESS => "Operation in progress",
    EINTR => "Interrupted function",
    EINVAL => "Invalid argument",
    EIO => "I/O error",
    EISCONN => "Socket is connected",
    EISDIR => "Is a directory",
    ELOOP => "Too many levels of symbolic links",
    EMFILE => "Too many open files",
    EMLINK => "Too many links",
    EMSGSIZE => "Message too large",
    ENAMETOOLONG => "Filename too long",
    ENETDOWN => "Network is down",
    ENETRESET => "Connection aborted by network",
    ENETUNREACH => "Network unreachable",
    ENFILE => "Too many files open in system",
    ENOBUFS => "No buffer space available",
    ENODEV => "No such device",
    ENOENT => "No such file or directory",
    ENOEXEC => "Executable file format error",
    ENOLCK => "No locks available",
    ENOMEM => "Not enough space",
    ENOMSG => "No message of the desired type",
    ENOPROTOOPT => "Protocol not available",
    ENOSPC => "No space left on device",
    ENOSYS => "Function not supported",
    ENOTCONN => "The socket is not connected",
    ENOTDIR => "Not a directory",
    ENOTEMPTY => "Directory not empty",
    ENOTSOCK => "Not a socket",
    ENOTSUP => "Not supported",
    ENOTTY => "Inappropriate I/O control operation",
    ENXIO => "No such device or address",
    EOPNOTSUPP => "Operation not supported on socket",
    EOVERFLOW => "Value too large to be stored in data type",
    EPERM => "Operation not permitted",
    EPIPE => "Broken pipe",
    EPROTO => "Protocol error",
    EPROTONOSUPPORT => "Protocol not supported",
    EPROTOTYPE => "Protocol wrong type for socket",
    ERANGE => "Result too large",
    EROFS => "Read-only file system",
    ESPIPE => "Invalid seek",
    ESRCH => "No such process",
    ETIMEDOUT => "Connection timed out",
    ETXTBSY => "Text file busy",
    EWOULDBLOCK => "Operation would block",
    EXDEV => "Cross-device link",
    ESTALE => "Reserved",
    EDQUOT => "Reserved",
    EMULTIHOP => "Reserved",
    #[cfg(not(target_os = "openbsd"))]
    ENODATA => "No message is available on the STREAM head read queue",
    ENOLINK => "Reserved",
    #[cfg(not(target_os = "openbsd"))]
    ENOSR => "No STREAM resources",
    #[cfg(not(target_os = "openbsd"))]
    ENOSTR => "Not a STREAM",
    #[cfg(not(target_os = "openbsd"))]
    ETIME => "Stream ioctl() timeout",
};

// Aliased codes (EAGAIN/EWOULDBLOCK, ENOTSUP/EOPNOTSUPP on Linux) resolve to
// the first entry, matching a front-to-back scan.
fn lookup(e: i32) -> Option<&'static Entry> {
    TABLE.iter().find(|entry| entry.value == e)
}

/// Symbolic name of `e`, or `"Unknown errno"`
#[must_use]
pub fn errno_name(e: i32) -> &'static str {
    lookup(e).map_or("Unknown errno", |entry| entry.name)
}

/// Long description of `e`, or `"Unknown error"`
#[must_use]
pub fn strerror(e: i32) -> &'static str {
    lookup(e).map_or("Unknown error", |entry| entry.text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(libc::ENOENT, "ENOENT", "No such file or directory")]
    #[case(libc::EFAULT, "EFAULT", "Bad address")]
    #[case(libc::ENOMEM, "ENOMEM", "Not enough space")]
    #[case(libc::EAGAIN, "EAGAIN", "Resource unavailable, try again")]
    fn known_codes(#[case] e: i32, #[case] name: &str, #[case] text: &str) {
        assert_eq!(errno_name(e), name);
        assert_eq!(strerror(e), text);
    }

    #[rstest]
    #[case(-1)]
    #[case(0)]
    #[case(100_000)]
    fn unknown_codes_fall_back(#[case] e: i32) {
        assert_eq!(errno_name(e), "Unknown errno");
        assert_eq!(strerror(e), "Unknown error");
    }

    #[test]
    fn display_combines_name_and_text() {
        assert_eq!(Errno(libc::EINVAL).to_string(), "EINVAL (Invalid argument)");
    }
}
