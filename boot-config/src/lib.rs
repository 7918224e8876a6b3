// SPDX-License-Identifier: GPL-3.0-only

//! Bootloader configuration parsers
//!
//! Each parser reads one bootloader's configuration language and normalizes
//! what it finds into [`boot_types::BootImage`] values:
//!
//! - `grub`: GRUB 2 `grub.cfg`, `grubenv` and `search`
//! - `syslinux`: syslinux, isolinux and pxelinux
//! - `bls`: Boot Loader Specification entries
//! - `esxi`: VMware ESXi `boot.cfg` and its two boot banks
//! - `ipxe`: the subset of iPXE scripts used to chain a Linux kernel
//!
//! Files are addressed by URL through [`Schemes`], so the same parsers run
//! against mounted disks and network servers. Kernel and initrd bytes are
//! not read until an image is actually booted.

pub mod bls;
pub mod error;
pub mod esxi;
pub mod grub;
pub mod ipxe;
pub mod locator;
pub mod search;
pub mod shlex;
pub mod syslinux;

pub use bls::BlsContext;
pub use error::{ConfigError, Result};
pub use grub::GrubConfig;
pub use locator::{FileScheme, HttpScheme, MemoryScheme, Scheme, Schemes};
pub use search::{DeviceResolver, NoSearch, PoolResolver, SearchKind};
