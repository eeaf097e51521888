//! Read-only file mappings backing copy-on-write IPsets.

use std::fs::File;
use std::io;

#[cfg(target_os = "windows")]
pub mod windows;
#[cfg(unix)]
pub mod unix;

/// A private, read-only view of a whole file.
///
/// The view is released on drop. Nothing ever writes through it; sets that
/// need to mutate copy the bytes out first.
pub struct MappedRegion {
    ptr: *const u8,
    len: usize,
    #[cfg(target_os = "windows")]
    mapping: windows_sys::Win32::Foundation::HANDLE,
}

// The view is immutable for its whole life and owned by this value.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map the first `len` bytes of `file`.
    pub fn map(file: &File, len: usize) -> io::Result<MappedRegion> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot map an empty file"));
        }
        #[cfg(unix)]
        {
            let ptr = unix::map_readonly(file, len)?;
            Ok(MappedRegion { ptr, len })
        }
        #[cfg(target_os = "windows")]
        {
            let (ptr, mapping) = windows::map_readonly(file, len)?;
            Ok(MappedRegion { ptr, len, mapping })
        }
        #[cfg(not(any(unix, target_os = "windows")))]
        {
            let _ = file;
            Err(io::Error::new(io::ErrorKind::Unsupported, "memory mapping not supported"))
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        unix::unmap(self.ptr, self.len);
        #[cfg(target_os = "windows")]
        windows::unmap(self.ptr, self.mapping);
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion").field("len", &self.len).finish()
    }
}
