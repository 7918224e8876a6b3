// SPDX-License-Identifier: GPL-3.0-only

//! Fixtures for exercising the boot resolver without root
//!
//! A [`sysfs::FakeSystem`] stands in for `/sys` and `/dev`, a
//! [`mounter::FakeMounter`] serves directory trees in place of filesystems,
//! and a [`kexec::FakeKexec`] records handovers. Disk and superblock builders
//! produce node contents the catalog can sniff.

pub mod disk;
pub mod errors;
pub mod kexec;
pub mod mounter;
pub mod superblock;
pub mod sysfs;
pub mod temp;

pub use disk::GptDisk;
pub use errors::{Result, TestingError};
pub use kexec::FakeKexec;
pub use mounter::{FakeMounter, MountCall};
pub use sysfs::FakeSystem;
pub use temp::TempDir;
