//! Machine facts and process-level helpers

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

const M: u64 = 1024 * 1024;
const G: u64 = 1024 * M;

static INITIAL_PROCESSORS: OnceLock<usize> = OnceLock::new();

/// Processors available when this was first asked, fixed for the process
/// lifetime so startup sizing decisions stay consistent
pub fn initial_active_processor_count() -> usize {
    *INITIAL_PROCESSORS.get_or_init(active_processor_count)
}

/// Processors currently available to this process
#[must_use]
pub fn active_processor_count() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Installed physical memory in bytes
#[cfg(feature = "sysinfo")]
#[cfg_attr(docsrs, doc(cfg(feature = "sysinfo")))]
#[must_use]
pub fn physical_memory() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.total_memory()
}

/// Inputs to [`is_server_class_machine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineProfile {
    /// Active processors
    pub processors: usize,
    /// Physical memory in bytes
    pub physical_memory: u64,
    /// Logical processors sharing one physical core
    pub logical_processors_per_package: usize,
}

impl MachineProfile {
    /// Profile of the host
    #[cfg(feature = "sysinfo")]
    #[cfg_attr(docsrs, doc(cfg(feature = "sysinfo")))]
    #[must_use]
    pub fn host() -> Self {
        let processors = active_processor_count();
        let physical = sysinfo::System::physical_core_count().unwrap_or(processors).max(1);
        Self {
            processors,
            physical_memory: physical_memory(),
            logical_processors_per_package: (processors / physical).max(1),
        }
    }
}

/// Overrides for [`is_server_class_machine`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerClassPolicy {
    /// Never treat the machine as server class (checked first)
    pub never: bool,
    /// Always treat the machine as server class
    pub always: bool,
}

/// At least two processors (two packages when hyperthreaded) and about
/// 2 GiB of memory, with 256 MiB of slack for memory the host keeps back
pub fn is_server_class_machine(policy: ServerClassPolicy, profile: &MachineProfile) -> bool {
    const SERVER_PROCESSORS: usize = 2;
    const SERVER_MEMORY: u64 = 2 * G;
    const MISSING_MEMORY: u64 = 256 * M;

    if policy.never {
        return false;
    }
    if policy.always {
        return true;
    }
    if profile.processors < SERVER_PROCESSORS
        || profile.physical_memory < SERVER_MEMORY - MISSING_MEMORY
    {
        return false;
    }
    if profile.logical_processors_per_package > 1 {
        profile.processors / profile.logical_processors_per_package >= SERVER_PROCESSORS
    } else {
        true
    }
}

/// Default pause file for this process: `./vm.paused.<pid>`
#[must_use]
pub fn default_pause_file() -> PathBuf {
    PathBuf::from(format!("./vm.paused.{}", std::process::id()))
}

/// Create the pause file and block until someone deletes it
///
/// Polls every 100 ms. If the file cannot be created a message goes to
/// stderr and the call returns immediately.
pub fn pause(pause_file: Option<&Path>) {
    pause_with_interval(pause_file, Duration::from_millis(100));
}

/// [`pause`] with a custom poll interval
pub fn pause_with_interval(pause_file: Option<&Path>, interval: Duration) {
    let path = pause_file.map_or_else(default_pause_file, Path::to_path_buf);
    if let Err(e) = std::fs::File::create(&path) {
        tracing::debug!(target: "os::thread", path = %path.display(), error = %e, "cannot create pause file");
        eprintln!(
            "Could not open pause file '{}', continuing immediately.",
            path.display()
        );
        return;
    }
    tracing::info!(target: "os::thread", path = %path.display(), "paused; delete the file to continue");
    while std::fs::metadata(&path).is_ok() {
        std::thread::sleep(interval);
    }
}

/// Sleep without any runtime bookkeeping, in slices below one second
pub fn naked_sleep(millis: u64) {
    const LIMIT: u64 = 999;
    let mut remaining = millis;
    while remaining > LIMIT {
        naked_short_sleep(LIMIT);
        remaining -= LIMIT;
    }
    naked_short_sleep(remaining);
}

fn naked_short_sleep(millis: u64) {
    debug_assert!(millis < 1000);
    std::thread::sleep(Duration::from_millis(millis));
}
