use crate::{
    errors::{map_error, set_last_error, ErrorCode, Result},
    types::V6Policy,
    IpSet,
};
use ipnet::IpNet;
use std::{
    ffi::{c_void, CStr, CString},
    net::IpAddr,
    ops::ControlFlow,
    os::raw::c_char,
};

/// Opaque handle, owned by the caller until passed to `ipset_destroy`.
pub type IpSetHandle = *mut IpSet;

/// Called once per block or address by `ipset_walk`. Return non-zero to
/// stop the walk.
pub type IpSetWalkFn = unsafe extern "C" fn(cidr: *const c_char, ctx: *mut c_void) -> i32;

// ─────────────────────────── helpers ─────────────────────────────────── //

#[inline]
fn cstr<'a>(p: *const c_char) -> std::result::Result<&'a str, ErrorCode> {
    if p.is_null() {
        return Err(ErrorCode::BadInput);
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| ErrorCode::BadInput)
}

/// "addr/prefix" or a bare address, which means a single host.
#[inline]
fn parse_block(s: &str) -> std::result::Result<(IpAddr, u32), ErrorCode> {
    if let Ok(net) = s.parse::<IpNet>() {
        Ok((net.addr(), u32::from(net.prefix_len())))
    } else if let Ok(ip) = s.parse::<IpAddr>() {
        Ok((ip, if ip.is_ipv6() { 128 } else { 32 }))
    } else {
        Err(ErrorCode::BadInput)
    }
}

#[inline]
fn fail(code: ErrorCode) -> ErrorCode {
    set_last_error(code);
    code
}

/// Record the outcome for `ipset_last_error` and hand back its code.
#[inline]
fn status(r: Result<()>) -> ErrorCode {
    let code = match r {
        Ok(()) => ErrorCode::Ok,
        Err(e) => map_error(&e),
    };
    set_last_error(code);
    code
}

// ─── small helper to turn Result<T,ErrorCode> into early-return ──────────
macro_rules! try_c { ($expr:expr) => { match $expr {
    Ok(v)  => v,
    Err(e) => return fail(e),
}}}

macro_rules! handle { ($h:expr) => { match unsafe { $h.as_ref() } {
    Some(s) => s,
    None => return fail(ErrorCode::BadInput),
}}}

macro_rules! handle_mut { ($h:expr) => { match unsafe { $h.as_mut() } {
    Some(s) => s,
    None => return fail(ErrorCode::BadInput),
}}}

// ───────────────────────── lifetime ──────────────────────────────────── //

/// Create an empty set and store its handle in `*out`.
#[no_mangle]
pub extern "C" fn ipset_create(is_v6: bool, out: *mut IpSetHandle) -> ErrorCode {
    if out.is_null() {
        return fail(ErrorCode::BadInput);
    }
    unsafe { *out = Box::into_raw(Box::new(IpSet::create(is_v6))) };
    status(Ok(()))
}

#[no_mangle]
pub extern "C" fn ipset_destroy(h: IpSetHandle) {
    if !h.is_null() {
        unsafe { drop(Box::from_raw(h)) };
    }
}

// ───────────────────────── population ────────────────────────────────── //

#[no_mangle]
pub extern "C" fn ipset_insert(h: IpSetHandle, cidr_utf8: *const c_char) -> ErrorCode {
    let set = handle_mut!(h);
    let (ip, prefix) = try_c!(cstr(cidr_utf8).and_then(parse_block));
    status(set.insert_addr(ip, prefix))
}

#[no_mangle]
pub extern "C" fn ipset_remove(h: IpSetHandle, cidr_utf8: *const c_char) -> ErrorCode {
    let set = handle_mut!(h);
    let (ip, prefix) = try_c!(cstr(cidr_utf8).and_then(parse_block));
    status(set.remove_addr(ip, prefix))
}

#[no_mangle]
pub extern "C" fn ipset_remove_all(h: IpSetHandle) -> ErrorCode {
    handle_mut!(h).remove_all();
    status(Ok(()))
}

// ───────────────────────── queries ───────────────────────────────────── //

/// `*out_found` is true when the set holds the whole block.
#[no_mangle]
pub extern "C" fn ipset_contains(
    h: IpSetHandle,
    cidr_utf8: *const c_char,
    out_found: *mut bool,
) -> ErrorCode {
    if out_found.is_null() {
        return fail(ErrorCode::BadInput);
    }
    let set = handle!(h);
    let (ip, prefix) = try_c!(cstr(cidr_utf8).and_then(parse_block));
    unsafe { *out_found = set.contains_block(ip, prefix) };
    status(Ok(()))
}

/// Address count as two 64-bit halves.
#[no_mangle]
pub extern "C" fn ipset_count(h: IpSetHandle, out_high: *mut u64, out_low: *mut u64) -> ErrorCode {
    if out_high.is_null() || out_low.is_null() {
        return fail(ErrorCode::BadInput);
    }
    let n = handle!(h).count_addresses();
    unsafe {
        *out_high = (n >> 64) as u64;
        *out_low = n as u64;
    }
    status(Ok(()))
}

#[no_mangle]
pub extern "C" fn ipset_is_v6(h: IpSetHandle, out: *mut bool) -> ErrorCode {
    if out.is_null() {
        return fail(ErrorCode::BadInput);
    }
    unsafe { *out = handle!(h).is_v6() };
    status(Ok(()))
}

/// Call `cb` with each block ("addr/prefix") or address of the set.
/// `policy` is 0 ignore, 1 as-v4, 2 mix, 3 force, 4 only. `cb` must not
/// keep the string.
#[no_mangle]
pub extern "C" fn ipset_walk(
    h: IpSetHandle,
    cidr: bool,
    policy: u8,
    cb: IpSetWalkFn,
    ctx: *mut c_void,
) -> ErrorCode {
    let set = handle!(h);
    let policy = try_c!(V6Policy::from_u8(policy).ok_or(ErrorCode::BadInput));
    let _ = set.walk(cidr, policy, |ip, prefix| {
        let text = if cidr { format!("{}/{}", ip, prefix) } else { ip.to_string() };
        let Ok(text) = CString::new(text) else {
            return ControlFlow::Continue(());
        };
        if unsafe { cb(text.as_ptr(), ctx) } != 0 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    status(Ok(()))
}

// ───────────────────── shape & algebra ───────────────────────────────── //

#[no_mangle]
pub extern "C" fn ipset_clean(h: IpSetHandle) -> ErrorCode {
    status(handle_mut!(h).clean())
}

#[no_mangle]
pub extern "C" fn ipset_mask(h: IpSetHandle, prefix: u32) -> ErrorCode {
    status(handle_mut!(h).mask(prefix))
}

#[no_mangle]
pub extern "C" fn ipset_union(dst: IpSetHandle, src: IpSetHandle) -> ErrorCode {
    if dst == src {
        handle!(dst);
        return status(Ok(()));
    }
    let src = handle!(src);
    status(handle_mut!(dst).union_with(src))
}

#[no_mangle]
pub extern "C" fn ipset_intersect(dst: IpSetHandle, src: IpSetHandle) -> ErrorCode {
    if dst == src {
        handle!(dst);
        return status(Ok(()));
    }
    let src = handle!(src);
    status(handle_mut!(dst).intersect_with(src))
}

#[no_mangle]
pub extern "C" fn ipset_subtract(dst: IpSetHandle, src: IpSetHandle) -> ErrorCode {
    if dst == src {
        handle_mut!(dst).remove_all();
        return status(Ok(()));
    }
    let src = handle!(src);
    status(handle_mut!(dst).subtract(src))
}

// ───────────────────────── files ─────────────────────────────────────── //

#[no_mangle]
pub extern "C" fn ipset_load(path_utf8: *const c_char, out: *mut IpSetHandle) -> ErrorCode {
    if out.is_null() {
        return fail(ErrorCode::BadInput);
    }
    let path = try_c!(cstr(path_utf8));
    match IpSet::load(path) {
        Ok(set) => {
            unsafe { *out = Box::into_raw(Box::new(set)) };
            status(Ok(()))
        }
        Err(e) => status(Err(e)),
    }
}

#[no_mangle]
pub extern "C" fn ipset_save(h: IpSetHandle, path_utf8: *const c_char) -> ErrorCode {
    let set = handle!(h);
    let path = try_c!(cstr(path_utf8));
    status(set.save(path))
}
