//! Process-wide settings taken from the environment.

use log::warn;
use once_cell::sync::Lazy;

use crate::constants::{ENV_DESTROY_PRINT, ENV_INCORE_FORMAT, ENV_PRINT_READ_ERROR, ENV_RECORD_VERSION};
use crate::types::{InCoreFormat, RecordVersion};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    /// Write version used when a set's options leave it at DEFAULT.
    pub record_version: RecordVersion,
    /// Representation for new IPv4 sets.
    pub incore_format: InCoreFormat,
    /// Dump the structure of every set to stderr when it is dropped.
    pub destroy_print: bool,
    /// Log the stream name and cause of failed reads.
    pub print_read_error: bool,
}

static CONFIG: Lazy<Config> = Lazy::new(Config::from_env);

impl Config {
    /// Snapshot taken on first use.
    pub fn global() -> &'static Config {
        &CONFIG
    }

    pub fn from_env() -> Config {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Config
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();

        if let Some(v) = lookup(ENV_RECORD_VERSION).filter(|v| !v.trim().is_empty()) {
            match v.trim().parse::<u16>().ok().and_then(RecordVersion::from_u16) {
                Some(rv) => cfg.record_version = rv,
                None => warn!("[CONFIG] ignoring {}={:?}: expected 0, 2, 3, 4 or 5", ENV_RECORD_VERSION, v),
            }
        }

        if let Some(v) = lookup(ENV_INCORE_FORMAT).filter(|v| !v.trim().is_empty()) {
            match v.trim().parse::<InCoreFormat>() {
                Ok(f) => cfg.incore_format = f,
                Err(_) => warn!("[CONFIG] ignoring {}={:?}: expected iptree or radix", ENV_INCORE_FORMAT, v),
            }
        }

        cfg.destroy_print = lookup(ENV_DESTROY_PRINT).is_some_and(|v| !v.is_empty());
        cfg.print_read_error = lookup(ENV_PRINT_READ_ERROR)
            .is_some_and(|v| !v.is_empty() && v.trim() != "0");
        cfg
    }
}
