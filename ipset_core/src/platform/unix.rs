//! Unix mapping via mmap(2)

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

pub(super) fn map_readonly(file: &File, len: usize) -> io::Result<*const u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *const u8)
}

pub(super) fn unmap(ptr: *const u8, len: usize) {
    unsafe {
        let _ = libc::munmap(ptr as *mut libc::c_void, len);
    }
}
