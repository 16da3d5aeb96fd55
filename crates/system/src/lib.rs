#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![allow(unsafe_code)] // mmap, sigaction and friends are host FFI
//! # Stratum System
//!
//! Host capabilities for the Stratum runtime layer.
//!
//! This crate provides:
//! - [`platform::Platform`], the capability interface every memory and
//!   thread operation goes through, and its POSIX implementation
//! - Fault-tolerant memory probing ([`probe`])
//! - The signal dispatcher thread ([`signal`])
//! - Thread priorities and stack sizing ([`thread`])
//! - Search-path handling, the shared random generator and machine facts
//! - Crash-report formatters ([`diagnostics`])
//!
//! ## Features
//!
//! - `sysinfo` (default): physical memory and core counts
//! - `serde`: serialization of configuration types
//! - `test-util`: scripted doubles for downstream tests
//!
//! ## Example
//!
//! ```no_run
//! use stratum_system::probe::{HostProbe, is_readable_pointer};
//!
//! let value = 7u32;
//! let probe = HostProbe::global();
//! assert!(is_readable_pointer(probe, &value as *const u32 as usize));
//! assert!(!is_readable_pointer(probe, 0x1));
//! ```

pub mod diagnostics;
pub mod error;
pub mod info;
pub mod path;
pub mod platform;
pub mod probe;
pub mod random;
pub mod signal;
pub mod thread;
pub mod utils;

pub use diagnostics::Errno;
pub use error::{SystemError, SystemResult, SystemResultExt};
pub use platform::{Frame, NativeThreadId, Platform};
pub use probe::{FetchWidth, SafeFetch};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
