// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for boot resolution
//!
//! Every layer of the resolver speaks these types:
//!
//! - **boot-sys**: produces `BlockDevice` values and consumes `ByteSource`s when staging kernels
//! - **boot-config**: every bootloader parser normalizes into `BootImage`
//! - **boot-menu**: wraps each `BootImage` in a menu entry
//!
//! ## Images
//!
//! `BootImage` is a closed sum over `LinuxImage` and `MultibootImage`. Kernel,
//! initrd, device tree and module bytes are `ByteSource`s, which defer all I/O
//! until the first read.

pub mod device;
pub mod image;
pub mod pci;
pub mod source;

pub use device::{BlockDevice, FsType, compose_part_name};
pub use image::{BootImage, ImageSummary, LinuxImage, Module, MultibootImage};
pub use pci::{PciId, PciList, PciListError, parse_hex_u16};
pub use source::{ByteSource, Fetch, INITRD_ALIGN};
