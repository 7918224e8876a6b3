// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use boot_sys::SysError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TestingError {
    #[error("fixture io error for {path:?}: {reason}")]
    FixtureIo { path: PathBuf, reason: String },
    #[error("invalid fixture: {0}")]
    InvalidFixture(String),
    #[error(transparent)]
    Sys(#[from] SysError),
}

pub type Result<T> = std::result::Result<T, TestingError>;

pub(crate) fn io_at(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> TestingError {
    let path = path.into();
    move |error| TestingError::FixtureIo {
        path,
        reason: error.to_string(),
    }
}
