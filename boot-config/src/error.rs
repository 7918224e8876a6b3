// SPDX-License-Identifier: GPL-3.0-only

use std::io;

use thiserror::Error;

/// Error types for bootloader configuration parsing
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("no scheme registered for {url}")]
    NoSuchScheme { url: String },

    #[error("could not fetch {url}: {reason}")]
    NoSuchFile { url: String, reason: String },

    #[error("not a valid iPXE script")]
    NotIpxeScript,

    /// No config of this format was found.
    #[error("no config found: {0}")]
    NoConfig(String),

    #[error("BLS entry: {0}")]
    Bls(String),

    #[error("ESXi: {0}")]
    Esxi(String),

    #[error("{file}:{line}: {message}")]
    Syntax {
        file: String,
        line: usize,
        message: String,
    },

    #[error(transparent)]
    Sys(#[from] boot_sys::SysError),
}

impl ConfigError {
    /// Locator failures, where another candidate location may still work.
    pub fn is_url_error(&self) -> bool {
        matches!(self, Self::NoSuchScheme { .. } | Self::NoSuchFile { .. })
    }
}

/// Result type alias for config parsing
pub type Result<T> = std::result::Result<T, ConfigError>;
