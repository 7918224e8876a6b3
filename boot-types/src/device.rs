// SPDX-License-Identifier: GPL-3.0-only

//! Block device identity
//!
//! Devices are re-enumerated on every run. The only thing attached after
//! creation is the filesystem signature found by sniffing.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Filesystem families recognized by superblock sniffing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    /// FAT12, FAT16 or FAT32
    Vfat,
    /// ext2, ext3 or ext4
    Ext4,
    Xfs,
    Iso9660,
}

impl FsType {
    /// Name passed to mount(2).
    pub fn mount_type(self) -> &'static str {
        match self {
            Self::Vfat => "vfat",
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
            Self::Iso9660 => "iso9660",
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mount_type())
    }
}

/// A block device as seen in `/sys/class/block`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockDevice {
    /// Kernel name, e.g. "sda1" or "nvme0n1p2"
    pub name: String,

    /// Filesystem detected from the on-disk superblock
    pub fs_type: Option<FsType>,

    /// Filesystem UUID (or FAT volume serial) formatted as blkid does
    pub fs_uuid: Option<String>,
}

impl BlockDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fs_type: None,
            fs_uuid: None,
        }
    }

    pub fn with_fs(mut self, fs_type: FsType, fs_uuid: impl Into<String>) -> Self {
        self.fs_type = Some(fs_type);
        self.fs_uuid = Some(fs_uuid.into());
        self
    }

    /// Always `/dev/` + name.
    pub fn device_path(&self) -> PathBuf {
        PathBuf::from("/dev").join(&self.name)
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(fs_type) = self.fs_type {
            write!(f, " ({fs_type}")?;
            if let Some(uuid) = &self.fs_uuid {
                write!(f, " {uuid}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Name of partition `number` on `device`.
///
/// Devices whose name ends in a digit get a `p` separator (`nvme0n1p1`,
/// `mmcblk0p2`, `loop0p1`); the rest are suffixed directly (`sda1`).
pub fn compose_part_name(device: &str, number: usize) -> String {
    if device.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{device}p{number}")
    } else {
        format!("{device}{number}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_partition_names() {
        assert_eq!(compose_part_name("sda", 1), "sda1");
        assert_eq!(compose_part_name("nvme0n1", 1), "nvme0n1p1");
        assert_eq!(compose_part_name("mmcblk0", 12), "mmcblk0p12");
    }

    #[test]
    fn device_path_is_under_dev() {
        let dev = BlockDevice::new("sdb2");
        assert_eq!(dev.device_path(), PathBuf::from("/dev/sdb2"));
    }

    #[test]
    fn serializes_fs_type_lowercase() {
        let dev = BlockDevice::new("sda1").with_fs(FsType::Vfat, "ABCD-1234");
        let json = serde_json::to_string(&dev).expect("serialize");
        assert!(json.contains("\"vfat\""));
    }
}
