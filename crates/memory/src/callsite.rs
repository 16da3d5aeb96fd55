//! Call-site identity for tracked allocations
//!
//! Public entry points are `#[track_caller]`, so [`CallSite::caller`] names
//! the line that asked for memory. Detail-level tracking additionally keeps
//! a short [`CallStack`] of return addresses.

use std::fmt;
use std::panic::Location;

/// Source location that requested a block or region
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite(&'static Location<'static>);

impl CallSite {
    /// Location of the caller of the enclosing `#[track_caller]` chain
    #[track_caller]
    #[inline]
    #[must_use]
    pub fn caller() -> Self {
        Self(Location::caller())
    }

    /// Wrap an explicit location
    #[must_use]
    pub const fn new(location: &'static Location<'static>) -> Self {
        Self(location)
    }

    /// Source file
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    /// Source line
    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.0.file(), self.0.line(), self.0.column())
    }
}

impl fmt::Debug for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallSite({self})")
    }
}

/// Frames kept per stack
pub const MAX_FRAMES: usize = 4;

/// Up to [`MAX_FRAMES`] return addresses, compared and hashed by value
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CallStack {
    frames: [usize; MAX_FRAMES],
    len: u8,
}

impl CallStack {
    /// Stack with no frames
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            frames: [0; MAX_FRAMES],
            len: 0,
        }
    }

    /// Stack from explicit addresses; extra frames are dropped
    #[must_use]
    pub fn from_frames(frames: &[usize]) -> Self {
        let mut stack = Self::empty();
        for &pc in frames.iter().take(MAX_FRAMES) {
            stack.frames[stack.len as usize] = pc;
            stack.len += 1;
        }
        stack
    }

    /// Capture the current thread's return addresses, skipping the innermost `skip` frames
    #[cfg(feature = "stack-capture")]
    #[inline(never)]
    #[must_use]
    pub fn capture(skip: usize) -> Self {
        let mut stack = Self::empty();
        // One extra for this function's own frame.
        let mut to_skip = skip + 1;
        backtrace::trace(|frame| {
            if to_skip > 0 {
                to_skip -= 1;
                return true;
            }
            stack.frames[stack.len as usize] = frame.ip() as usize;
            stack.len += 1;
            (stack.len as usize) < MAX_FRAMES
        });
        stack
    }

    /// Stack capture is compiled out; always empty
    #[cfg(not(feature = "stack-capture"))]
    #[must_use]
    pub fn capture(_skip: usize) -> Self {
        Self::empty()
    }

    /// Captured return addresses, innermost first
    #[must_use]
    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.len as usize]
    }

    /// Check if no frames were captured
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write one line per frame, with a symbol name when one resolves
    pub fn print_on(&self, out: &mut dyn fmt::Write, indent: usize) -> fmt::Result {
        for &pc in self.frames() {
            write!(out, "{:indent$}[{pc:#x}]", "")?;
            if let Some(name) = symbol_name(pc) {
                write!(out, " {name}")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

#[cfg(feature = "stack-capture")]
fn symbol_name(pc: usize) -> Option<String> {
    let mut name = None;
    backtrace::resolve(pc as *mut std::ffi::c_void, |symbol| {
        if name.is_none() {
            name = symbol.name().map(|n| n.to_string());
        }
    });
    name
}

#[cfg(not(feature = "stack-capture"))]
fn symbol_name(_pc: usize) -> Option<String> {
    None
}

impl fmt::Debug for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames().iter().map(|pc| format!("{pc:#x}")))
            .finish()
    }
}
