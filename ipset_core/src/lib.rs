//! IP address sets over IPv4 and IPv6 with a SiLK-compatible file format.
//!
//! An [`IpSet`] keeps IPv4 content either in a dense /16-level bitmap or in
//! a 16-way radix tree, and IPv6 content in the radix tree. Sets support
//! point and block queries, set algebra, CIDR or per-address walks, and
//! reading and writing IPset files in record versions 2 through 5.
//! Uncompressed RADIX files are mapped and copied only when modified.

pub mod algebra;
pub mod arena;
pub mod bitmap;
pub mod config;
pub mod constants;
pub mod dense;
pub mod errors;
pub(crate) mod format;
pub mod header;
pub mod helpers;
pub mod iobuf;
pub mod ipset;
pub mod iter;
pub mod platform;
pub mod procstream;
pub mod public_api;
pub mod radix;
pub mod telemetry;
pub mod types;

pub use algebra::{intersect_into, intersects_set, intersects_wildcard, subtract_from, union_into};
pub use config::Config;
pub use errors::{Error, ErrorCode, Result};
pub use header::{FileHeader, HeaderEntry, IpSetEntry};
pub use ipset::IpSet;
pub use iter::IpSetIter;
pub use procstream::{process_stream, process_stream_count_ips, process_stream_with_init};
pub use types::{CompMethod, InCoreFormat, IpSetOptions, ProcessParams, RecordVersion, V6Policy};

use once_cell::sync::OnceCell;

// Install metrics recorder when the crate is loaded
#[doc(hidden)]
#[inline(always)]
fn _telemetry_bootstrap() {
    telemetry::init();
}

// NB: reference forces the function to run during `.so` load
#[used]
static _BOOTSTRAP: fn() = _telemetry_bootstrap;

// ---- logging bootstraper -------------------------------------------------
pub(crate) fn ensure_logging() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let _ = env_logger::builder()
            .format_timestamp(None)
            .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
            .try_init();
    });
}
