//! File mappings through the host platform

#![cfg(unix)]

use std::fs;
use std::io::Write;
use std::os::fd::AsRawFd;

use pretty_assertions::assert_eq;
use stratum_memory::virtual_memory::VirtualMemoryUsage;
use stratum_memory::{MemFlags, MemoryConfig, TrackingLevel, VirtualMemory};

fn tracked() -> VirtualMemory {
    VirtualMemory::host(&MemoryConfig {
        tracking: TrackingLevel::Summary,
        ..MemoryConfig::default()
    })
}

#[test]
fn read_only_image_and_remap() {
    let vm = tracked();
    let page = vm.page_size();
    let mut file = tempfile::tempfile().unwrap();
    let mut contents = vec![b'a'; page];
    contents.extend(std::iter::repeat_n(b'b', page));
    file.write_all(&contents).unwrap();

    // SAFETY: no fixed address; the mapping is private to this test.
    let base = unsafe { vm.map(file.as_raw_fd(), 0, None, page, true, false, MemFlags::Class) }.unwrap();
    // SAFETY: `base` maps `page` readable bytes.
    let view = unsafe { std::slice::from_raw_parts(base as *const u8, page) };
    assert!(view.iter().all(|&b| b == b'a'));
    assert_eq!(vm.tracker().category(MemFlags::Class).committed, page);

    // SAFETY: the old view is not used past this point.
    let again = unsafe { vm.remap(file.as_raw_fd(), page as u64, base, page, true, false) }.unwrap();
    assert_eq!(again, base);
    // SAFETY: as above, now backed by the second page of the file.
    let view = unsafe { std::slice::from_raw_parts(base as *const u8, page) };
    assert!(view.iter().all(|&b| b == b'b'));

    // SAFETY: nothing references the mapping any more.
    unsafe { vm.unmap(base, page) }.unwrap();
    assert_eq!(vm.tracker().total(), VirtualMemoryUsage::default());
}

#[test]
fn shared_mapping_writes_through() {
    let vm = tracked();
    let page = vm.page_size();
    let file = tempfile::NamedTempFile::new().unwrap();

    let base = vm.map_to_file(2 * page, file.as_file().as_raw_fd(), MemFlags::JavaHeap).unwrap();
    assert_eq!(vm.tracker().category(MemFlags::JavaHeap).committed, 2 * page);

    // SAFETY: the mapping is writable and two pages long.
    unsafe {
        std::ptr::write_bytes(base as *mut u8, 0x42, 2 * page);
        vm.unmap(base, 2 * page).unwrap();
    }

    let on_disk = fs::read(file.path()).unwrap();
    assert_eq!(on_disk.len(), 2 * page);
    assert!(on_disk.iter().all(|&b| b == 0x42));
}
