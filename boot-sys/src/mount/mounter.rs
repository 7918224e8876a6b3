// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use nix::mount::{MntFlags, MsFlags};
use tracing::debug;

use crate::error::{Result, SysError};

/// The mount(2)/umount2(2) pair, behind a trait so pools can be exercised
/// without privileges.
pub trait Mounter: Send + Sync {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        data: &str,
        flags: MsFlags,
    ) -> Result<()>;

    fn unmount(&self, target: &Path, flags: MntFlags) -> Result<()>;
}

/// Real syscalls. Requires root.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxMounter;

impl Mounter for LinuxMounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        data: &str,
        flags: MsFlags,
    ) -> Result<()> {
        debug!(source = %source.display(), target = %target.display(), fs_type, ?flags, "mount");
        let data = (!data.is_empty()).then_some(data);
        nix::mount::mount(Some(source), target, Some(fs_type), flags, data).map_err(|errno| {
            SysError::Mount {
                source_path: source.to_path_buf(),
                target: target.to_path_buf(),
                fs_type: fs_type.to_string(),
                reason: errno.desc().to_string(),
            }
        })
    }

    fn unmount(&self, target: &Path, flags: MntFlags) -> Result<()> {
        debug!(target = %target.display(), ?flags, "umount");
        nix::mount::umount2(target, flags).map_err(|errno| SysError::Unmount {
            target: target.to_path_buf(),
            reason: errno.desc().to_string(),
        })
    }
}
