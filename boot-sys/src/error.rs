// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;

/// Error types for system-level boot operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Structural problem in a single GPT copy.
    #[error("{0}")]
    InvalidGpt(String),

    /// Primary and backup GPT disagree; lists every differing field.
    #[error("{0}")]
    GptMismatch(String),

    #[error("mount {source_path:?} on {target:?} ({fs_type}) failed: {reason}")]
    Mount {
        source_path: PathBuf,
        target: PathBuf,
        fs_type: String,
        reason: String,
    },

    #[error("unmount {target:?} failed: {reason}")]
    Unmount { target: PathBuf, reason: String },

    /// Several independent failures from a best-effort pass.
    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<SysError>),

    #[error("kexec failed: {0}")]
    Kexec(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
