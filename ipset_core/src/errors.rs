//! Error handling and C-ABI error codes for ipset_core

use std::cell::RefCell;
use std::io;
use std::os::raw::c_char;
use std::path::PathBuf;

use thiserror::Error;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok = 0,
    Alloc = 1,
    BadInput = 2,
    FileIo = 3,
    FileType = 4,
    FileHeader = 5,
    Empty = 6,
    Open = 7,
    Ipv6 = 8,
    FileVersion = 9,
    Prefix = 10,
    NotFound = 11,
    RequireClean = 12,
    Corrupt = 13,
    Subset = 14,
    MultiLeaf = 15,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Ok => "Success",
            ErrorCode::Alloc => "Unable to allocate memory",
            ErrorCode::BadInput => "Empty or invalid input value",
            ErrorCode::FileIo => "Error in reading from or writing to the stream",
            ErrorCode::FileType => "Input is not an IPset",
            ErrorCode::FileHeader => "IPset header values are not supported",
            ErrorCode::Empty => "IPset is empty",
            ErrorCode::Open => "Error opening file",
            ErrorCode::Ipv6 => "IPset does not allow IPv6 addresses",
            ErrorCode::FileVersion => "IPset file version is not supported",
            ErrorCode::Prefix => "Prefix value out of range",
            ErrorCode::NotFound => "Value not found in IPset",
            ErrorCode::RequireClean => "Operation requires a clean IPset",
            ErrorCode::Corrupt => "IPset state is inconsistent (corrupt file?)",
            ErrorCode::Subset => "Part of netblock exists in IPset",
            ErrorCode::MultiLeaf => "Netblock spans several child slots",
        }
    }

    /// Same text as [`ErrorCode::as_str`], NUL-terminated for C callers.
    fn as_cstr(self) -> &'static [u8] {
        match self {
            ErrorCode::Ok => b"Success\0",
            ErrorCode::Alloc => b"Unable to allocate memory\0",
            ErrorCode::BadInput => b"Empty or invalid input value\0",
            ErrorCode::FileIo => b"Error in reading from or writing to the stream\0",
            ErrorCode::FileType => b"Input is not an IPset\0",
            ErrorCode::FileHeader => b"IPset header values are not supported\0",
            ErrorCode::Empty => b"IPset is empty\0",
            ErrorCode::Open => b"Error opening file\0",
            ErrorCode::Ipv6 => b"IPset does not allow IPv6 addresses\0",
            ErrorCode::FileVersion => b"IPset file version is not supported\0",
            ErrorCode::Prefix => b"Prefix value out of range\0",
            ErrorCode::NotFound => b"Value not found in IPset\0",
            ErrorCode::RequireClean => b"Operation requires a clean IPset\0",
            ErrorCode::Corrupt => b"IPset state is inconsistent (corrupt file?)\0",
            ErrorCode::Subset => b"Part of netblock exists in IPset\0",
            ErrorCode::MultiLeaf => b"Netblock spans several child slots\0",
        }
    }
}

/// Error type for IPset operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to allocate memory for {0}")]
    Alloc(&'static str),
    #[error("invalid input: {0}")]
    BadInput(&'static str),
    #[error("prefix {prefix} out of range for a {bits}-bit address")]
    Prefix { prefix: u32, bits: u32 },
    #[error("IPset does not allow IPv6 addresses")]
    Ipv6,
    #[error("IPset is empty")]
    Empty,
    #[error("value not found in IPset")]
    NotFound,
    #[error("operation requires a clean IPset")]
    RequireClean,
    #[error("IPset is corrupt: {0}")]
    Corrupt(String),
    #[error("error reading or writing IPset stream: {0}")]
    FileIo(#[from] io::Error),
    #[error("input is not an IPset (format id {0:#04x})")]
    FileType(u8),
    #[error("unsupported IPset header: {0}")]
    FileHeader(String),
    #[error("unsupported IPset file version: {0}")]
    FileVersion(String),
    #[error("error opening '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Alloc(_) => ErrorCode::Alloc,
            Error::BadInput(_) => ErrorCode::BadInput,
            Error::Prefix { .. } => ErrorCode::Prefix,
            Error::Ipv6 => ErrorCode::Ipv6,
            Error::Empty => ErrorCode::Empty,
            Error::NotFound => ErrorCode::NotFound,
            Error::RequireClean => ErrorCode::RequireClean,
            Error::Corrupt(_) => ErrorCode::Corrupt,
            Error::FileIo(_) => ErrorCode::FileIo,
            Error::FileType(_) => ErrorCode::FileType,
            Error::FileHeader(_) => ErrorCode::FileHeader,
            Error::FileVersion(_) => ErrorCode::FileVersion,
            Error::Open { .. } => ErrorCode::Open,
        }
    }

    /// Short reads inside a payload mean the file is truncated.
    pub(crate) fn short_read(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Corrupt("unexpected end of IPset payload".into())
        } else {
            Error::FileIo(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// Thread-local last error for C-ABI
thread_local! {
    static LAST_ERROR: RefCell<ErrorCode> = const { RefCell::new(ErrorCode::Ok) };
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = code);
}

pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| *cell.borrow())
}

#[no_mangle]
pub extern "C" fn ipset_last_error() -> ErrorCode {
    get_last_error()
}

#[no_mangle]
pub extern "C" fn ipset_strerror(code: ErrorCode) -> *const c_char {
    code.as_cstr().as_ptr() as *const c_char
}

// Map internal Error to ErrorCode
pub fn map_error(e: &Error) -> ErrorCode {
    e.code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_keep_their_numbers() {
        assert_eq!(ErrorCode::Ok as i32, 0);
        assert_eq!(ErrorCode::FileVersion as i32, 9);
        assert_eq!(ErrorCode::MultiLeaf as i32, 15);
    }

    #[test]
    fn c_strings_match_rust_strings() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::Alloc,
            ErrorCode::Corrupt,
            ErrorCode::RequireClean,
            ErrorCode::MultiLeaf,
        ] {
            let c = code.as_cstr();
            assert_eq!(&c[..c.len() - 1], code.as_str().as_bytes());
        }
    }

    #[test]
    fn error_maps_to_code() {
        let e = Error::Prefix { prefix: 33, bits: 32 };
        assert_eq!(map_error(&e), ErrorCode::Prefix);
        let e = Error::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(e.code(), ErrorCode::FileIo);
        set_last_error(ErrorCode::Empty);
        assert_eq!(get_last_error(), ErrorCode::Empty);
    }
}
