// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MenuError {
    #[error("terminal error: {0}")]
    Terminal(#[from] std::io::Error),

    /// Preparing an entry failed; the running system is untouched.
    #[error("failed to load {label}: {reason}")]
    Load { label: String, reason: String },

    #[error("failed to run {label}: {reason}")]
    Exec { label: String, reason: String },
}

pub type Result<T> = std::result::Result<T, MenuError>;
