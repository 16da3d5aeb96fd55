//! Minimum and initial thread stack sizes

use super::ThreadKind;
use crate::error::{SystemError, SystemResult};
use crate::utils::align_up;

const K: usize = 1024;
const M: usize = K * K;

/// Inputs to the stack size computation
///
/// Sizes are in bytes. A requested size of 0 means "use the default".
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StackConfig {
    /// Host page size
    pub page_size: usize,
    /// Smallest stack the host thread library accepts
    pub os_min_stack: usize,
    /// Guard (yellow/red/reserved) zone size of managed stacks
    pub guard_zone: usize,
    /// Shadow zone size of managed stacks
    pub shadow_zone: usize,
    /// Per-platform minimum for managed threads before zones are added
    pub java_base_min: usize,
    /// Per-platform minimum for compiler threads before zones are added
    pub compiler_base_min: usize,
    /// Per-platform minimum for internal threads
    pub vm_internal_base_min: usize,
    /// Requested managed thread stack size
    pub java_stack_size: usize,
    /// Requested compiler thread stack size
    pub compiler_stack_size: usize,
    /// Requested internal thread stack size
    pub vm_stack_size: usize,
}

impl StackConfig {
    /// Defaults for a 64-bit host with `page_size` pages
    #[must_use]
    pub fn for_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            os_min_stack: libc::PTHREAD_STACK_MIN,
            guard_zone: 4 * page_size,
            shadow_zone: 20 * page_size,
            java_base_min: 64 * K,
            compiler_base_min: 64 * K,
            vm_internal_base_min: 64 * K,
            java_stack_size: 0,
            compiler_stack_size: 0,
            vm_stack_size: 0,
        }
    }
}

/// Validated stack limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSizes {
    /// Minimum managed thread stack
    pub java_min: usize,
    /// Minimum compiler thread stack
    pub compiler_min: usize,
    /// Minimum internal thread stack
    pub vm_internal_min: usize,
    /// Managed stack size used at thread creation (page aligned, 0 = default)
    pub java_stack_size_at_create: usize,
    compiler_stack_size: usize,
    vm_stack_size: usize,
    page_size: usize,
}

/// Compute the per-kind minimum stack sizes and validate requested sizes
///
/// Managed and compiler threads get the guard and shadow zones on top of
/// their base minimum; internal threads do not. Every minimum is page
/// aligned and at least the host minimum.
pub fn set_minimum_stack_sizes(config: &StackConfig) -> SystemResult<StackSizes> {
    let page = config.page_size;
    let zones = config.guard_zone + config.shadow_zone;
    let minimum = |base: usize| align_up(base, page).max(config.os_min_stack);

    let java_min = minimum(config.java_base_min + zones);
    check("Java thread stack size", config.java_stack_size, java_min)?;

    let compiler_min = minimum(config.compiler_base_min + zones);
    check("CompilerThreadStackSize", config.compiler_stack_size, compiler_min)?;

    let vm_internal_min = minimum(config.vm_internal_base_min);
    check("VMThreadStackSize", config.vm_stack_size, vm_internal_min)?;

    let sizes = StackSizes {
        java_min,
        compiler_min,
        vm_internal_min,
        java_stack_size_at_create: align_up(config.java_stack_size, page),
        compiler_stack_size: config.compiler_stack_size,
        vm_stack_size: config.vm_stack_size,
        page_size: page,
    };
    tracing::debug!(
        target: "os::thread",
        java_min = sizes.java_min,
        compiler_min = sizes.compiler_min,
        vm_internal_min = sizes.vm_internal_min,
        "minimum stack sizes"
    );
    Ok(sizes)
}

fn check(kind: &'static str, requested: usize, min: usize) -> SystemResult<()> {
    if requested != 0 && requested < min {
        return Err(SystemError::StackTooSmall {
            kind,
            min_kib: min / K,
        });
    }
    Ok(())
}

impl StackSizes {
    /// Host default for threads of `kind`
    #[must_use]
    pub const fn default_stack_size(kind: ThreadKind) -> usize {
        match kind {
            ThreadKind::Compiler => 4 * M,
            _ => M,
        }
    }

    /// Stack size to create a `kind` thread with
    ///
    /// A zero request picks the configured size for the kind (or the host
    /// default). The result is never below the kind's minimum and is page
    /// aligned.
    #[must_use]
    pub fn initial_stack_size(&self, kind: ThreadKind, requested: usize) -> usize {
        let mut size = if requested == 0 {
            Self::default_stack_size(kind)
        } else {
            requested
        };
        let (configured, min) = match kind {
            ThreadKind::Java => (self.java_stack_size_at_create, self.java_min),
            ThreadKind::Compiler => (self.compiler_stack_size, self.compiler_min),
            ThreadKind::VmInternal | ThreadKind::ConcurrentGc => {
                (self.vm_stack_size, self.vm_internal_min)
            }
        };
        if requested == 0 && configured > 0 {
            size = configured;
        }
        align_up(size.max(min), self.page_size)
    }
}
