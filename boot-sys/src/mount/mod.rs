// SPDX-License-Identifier: GPL-3.0-only

//! Mounting through a narrow syscall contract, and the pool that owns every
//! mount made during resolution.

mod mounter;
mod pool;

pub use mounter::{LinuxMounter, Mounter};
pub use nix::mount::{MntFlags, MsFlags};
pub use pool::{MountPoint, MountPool, parse_proc_filesystems};

/// Flags for probing boot media: read-only, no access-time updates.
pub fn read_only() -> MsFlags {
    MsFlags::MS_RDONLY | MsFlags::MS_NOATIME
}
