//! # Stratum Log
//!
//! Subscriber setup shared by every Stratum crate. The runtime layer itself
//! only ever emits through the `tracing` macros; this crate decides where
//! those events end up.
//!
//! ```rust,no_run
//! fn main() -> stratum_log::LogResult<()> {
//!     let _guard = stratum_log::auto_init()?;
//!
//!     stratum_log::info!(target: "os::vm", size = 4096, "reserved");
//!     Ok(())
//! }
//! ```
//!
//! Component targets used by the runtime layer:
//!
//! | target          | emitted by                                |
//! |-----------------|-------------------------------------------|
//! | `os::malloc`    | native heap facade and malloc ledger      |
//! | `os::vm`        | virtual memory manager                    |
//! | `os::pagesize`  | page size selection traces                |
//! | `os::signal`    | signal dispatcher thread                  |
//! | `os::thread`    | priorities, stack sizes                   |
//! | `os::probe`     | safe-probe and location printing          |

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod builder;
mod config;
mod error;

pub use builder::{LoggerBuilder, LoggerGuard};
pub use config::{Config, DisplayConfig, Format, Level, WriterConfig};
pub use error::{LogError, LogResult};

pub use tracing::{debug, error, info, instrument, span, trace, warn};

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        Config, Level, LogResult, auto_init, debug, error, info, init, init_with, trace, warn,
    };
    pub use tracing::{Span, field};
}

/// Auto-detect and initialize the best logging configuration
///
/// Honors `STRATUM_LOG` / `RUST_LOG` when set, otherwise picks the
/// development preset for debug builds and the production preset for
/// release builds.
pub fn auto_init() -> LogResult<LoggerGuard> {
    if std::env::var("STRATUM_LOG").is_ok() || std::env::var("RUST_LOG").is_ok() {
        init_with(Config::from_env())
    } else if cfg!(debug_assertions) {
        init_with(Config::development())
    } else {
        init_with(Config::production())
    }
}

/// Initialize with default configuration
pub fn init() -> LogResult<LoggerGuard> {
    init_with(Config::default())
}

/// Initialize with custom configuration
pub fn init_with(config: Config) -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(config).build()
}

/// Initialize for tests.
///
/// Safe to call from every test: when a global subscriber is already
/// installed a no-op guard is returned instead of an error.
pub fn init_test() -> LogResult<LoggerGuard> {
    if tracing::dispatcher::has_been_set() {
        return Ok(LoggerGuard::noop());
    }
    match init_with(Config::test()) {
        // Another test thread won the race.
        Err(LogError::Init(_)) => Ok(LoggerGuard::noop()),
        other => other,
    }
}
