// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use boot_config::ConfigError;
use boot_sys::SysError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no block devices to boot from")]
    NoDevices,

    #[error("no bootable images found")]
    NoCandidates,

    #[error("no partition with GUID {0}")]
    PartitionNotFound(String),

    #[error("no usable network lease: {0}")]
    NoLease(String),

    #[error("settings file {path:?} is invalid: {reason}")]
    Settings { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sys(#[from] SysError),
}

pub type Result<T> = std::result::Result<T, ResolveError>;
