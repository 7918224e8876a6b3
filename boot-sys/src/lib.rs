// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for boot discovery
//!
//! This crate talks to the kernel directly:
//! - block device enumeration and filesystem sniffing through sysfs
//! - GPT reading, validation and writing
//! - mounting through a pool that guarantees cleanup
//! - staging and executing the next kernel with kexec
//!
//! Mounting and kexec require root.

pub mod block;
pub mod cmdline;
pub mod error;
pub mod gpt;
pub mod kexec;
pub mod mount;

pub use block::{BlockCatalog, filter_name, filter_names};
pub use cmdline::UpdateFilter;
pub use error::{Result, SysError};
pub use gpt::{Gpt, GptHeader, Partition, PartitionTable};
pub use kexec::{DryRunKexec, Kexec, KexecCall, SystemKexec, load_image};
pub use mount::{LinuxMounter, MountPoint, MountPool, Mounter};

/// Whether the process runs with root privileges.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
