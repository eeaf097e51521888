//! Windows mapping via CreateFileMappingW / MapViewOfFile

use std::fs::File;
use std::io;
use std::os::windows::io::AsRawHandle;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_READ, MEMORY_MAPPED_VIEW_ADDRESS,
    PAGE_READONLY,
};

pub(super) fn map_readonly(file: &File, len: usize) -> io::Result<(*const u8, HANDLE)> {
    unsafe {
        let mapping = CreateFileMappingW(
            file.as_raw_handle() as HANDLE,
            std::ptr::null(),
            PAGE_READONLY,
            0,
            0,
            std::ptr::null(),
        );
        if mapping.is_null() {
            return Err(io::Error::last_os_error());
        }
        let view = MapViewOfFile(mapping, FILE_MAP_READ, 0, 0, len);
        if view.Value.is_null() {
            let err = io::Error::last_os_error();
            CloseHandle(mapping);
            return Err(err);
        }
        Ok((view.Value as *const u8, mapping))
    }
}

pub(super) fn unmap(ptr: *const u8, mapping: HANDLE) {
    unsafe {
        UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS { Value: ptr as *mut _ });
        CloseHandle(mapping);
    }
}
