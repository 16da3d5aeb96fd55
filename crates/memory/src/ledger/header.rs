//! In-band block header and footer
//!
//! ```text
//! outer                 inner                       inner + size
//! | size | marker | f | - | canary | user data ... | footer |
//! |<------------ 16 bytes ------->|                | 2 bytes|
//! ```

use std::mem::size_of;
use std::ptr;

/// Header canary of a live block
pub const LIVE_CANARY: u16 = 0xE99E;
/// Footer canary of a live block
pub const LIVE_FOOTER: u16 = 0xE88E;
/// Header canary of a freed block
pub const DEAD_CANARY: u16 = 0xD99D;
/// Footer canary of a freed block
pub const DEAD_FOOTER: u16 = 0xD88D;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MallocHeader {
    pub(crate) size: u64,
    pub(crate) site_marker: u32,
    pub(crate) flags: u8,
    _unused: u8,
    pub(crate) canary: u16,
}

/// Bytes in front of every tracked block
pub const HEADER_SIZE: usize = size_of::<MallocHeader>();
/// Bytes behind every tracked block
pub const FOOTER_SIZE: usize = size_of::<u16>();

const _: () = assert!(HEADER_SIZE == 16);

impl MallocHeader {
    pub(crate) const fn new(size: usize, site_marker: u32, flags: u8) -> Self {
        Self {
            size: size as u64,
            site_marker,
            flags,
            _unused: 0,
            canary: LIVE_CANARY,
        }
    }

    /// Write a live header at `outer` and a live footer after the user block
    ///
    /// # Safety
    /// `outer` must be valid for `HEADER_SIZE + size + FOOTER_SIZE` bytes.
    pub(crate) unsafe fn install(self, outer: *mut u8) -> *mut u8 {
        // SAFETY: caller guarantees the outer block covers header, data and footer.
        unsafe {
            ptr::write_unaligned(outer.cast::<Self>(), self);
            let inner = outer.add(HEADER_SIZE);
            ptr::write_unaligned(inner.add(self.size as usize).cast::<u16>(), LIVE_FOOTER);
            inner
        }
    }

    /// Header of the block whose user data starts at `inner`
    ///
    /// # Safety
    /// `inner` must come from [`install`](Self::install) on a block that is
    /// still allocated.
    pub(crate) unsafe fn read(inner: *const u8) -> Self {
        // SAFETY: the header sits right before `inner` in the same allocation.
        unsafe { ptr::read_unaligned(inner.sub(HEADER_SIZE).cast::<Self>()) }
    }

    /// Footer canary behind `size` bytes of user data
    ///
    /// # Safety
    /// As for [`read`](Self::read); `size` must be the installed size.
    pub(crate) unsafe fn read_footer(inner: *const u8, size: usize) -> u16 {
        // SAFETY: the footer sits right after the user data.
        unsafe { ptr::read_unaligned(inner.add(size).cast::<u16>()) }
    }

    /// Rewrite both canaries to the live or dead marks
    ///
    /// # Safety
    /// As for [`read_footer`](Self::read_footer).
    pub(crate) unsafe fn set_marks(inner: *mut u8, size: usize, live: bool) {
        let (canary, footer) = if live {
            (LIVE_CANARY, LIVE_FOOTER)
        } else {
            (DEAD_CANARY, DEAD_FOOTER)
        };
        // SAFETY: canary is the last header field; footer follows the data.
        unsafe {
            ptr::write_unaligned(inner.sub(size_of::<u16>()).cast::<u16>(), canary);
            ptr::write_unaligned(inner.add(size).cast::<u16>(), footer);
        }
    }

    /// Outer pointer for `inner`
    pub(crate) fn outer(inner: *mut u8) -> *mut u8 {
        inner.wrapping_sub(HEADER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn install_and_mark() {
        let mut buf = vec![0u8; HEADER_SIZE + 8 + FOOTER_SIZE];
        let outer = buf.as_mut_ptr();
        // SAFETY: buffer covers header, 8 data bytes and footer.
        unsafe {
            let inner = MallocHeader::new(8, 3, 7).install(outer);
            assert_eq!(inner, outer.add(HEADER_SIZE));
            assert_eq!(MallocHeader::outer(inner), outer);

            let header = MallocHeader::read(inner);
            assert_eq!(header.size, 8);
            assert_eq!(header.site_marker, 3);
            assert_eq!(header.flags, 7);
            assert_eq!(header.canary, LIVE_CANARY);
            assert_eq!(MallocHeader::read_footer(inner, 8), LIVE_FOOTER);

            MallocHeader::set_marks(inner, 8, false);
            assert_eq!(MallocHeader::read(inner).canary, DEAD_CANARY);
            assert_eq!(MallocHeader::read_footer(inner, 8), DEAD_FOOTER);
            assert_eq!(MallocHeader::read(inner).size, 8);
        }
    }
}
