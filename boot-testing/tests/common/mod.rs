// SPDX-License-Identifier: GPL-3.0-only
#![allow(dead_code)]

use std::sync::Arc;

use boot_sys::MountPool;
use boot_testing::{FakeMounter, TempDir};

pub const FILESYSTEMS: &[&str] = &["ext4", "vfat", "iso9660"];

/// A directory tree to serve as a filesystem's contents.
pub fn tree(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new("fixture").expect("fixture dir");
    for (path, contents) in files {
        dir.write(path, contents).expect("fixture file");
    }
    dir
}

/// A pool over `mounter` that never reads the host's /proc/filesystems.
pub fn pool(mounter: &Arc<FakeMounter>, root: &TempDir) -> MountPool {
    MountPool::new(mounter.clone(), root.path())
        .with_filesystems(FILESYSTEMS.iter().map(|fs| fs.to_string()).collect())
}

pub fn mount_path(pool: &MountPool, device: &str) -> std::path::PathBuf {
    let source = std::path::Path::new("/dev").join(device);
    pool.mounts()
        .iter()
        .find(|mount| mount.device == source)
        .map(|mount| mount.path.clone())
        .unwrap_or_else(|| panic!("{device} is not mounted"))
}
