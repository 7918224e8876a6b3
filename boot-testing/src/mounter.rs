// SPDX-License-Identifier: GPL-3.0-only

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use boot_sys::mount::{MntFlags, MsFlags};
use boot_sys::{Mounter, SysError};
use tracing::debug;

/// One call seen by [`FakeMounter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Mount {
        source: PathBuf,
        target: PathBuf,
        fs_type: String,
        flags: MsFlags,
    },
    Unmount {
        target: PathBuf,
        flags: MntFlags,
    },
}

struct Fixture {
    dir: PathBuf,
    fs_type: Option<String>,
}

#[derive(Default)]
struct State {
    fixtures: HashMap<PathBuf, Fixture>,
    busy: HashSet<PathBuf>,
    live: HashMap<PathBuf, PathBuf>,
    calls: Vec<MountCall>,
}

/// Mounts by copying a fixture directory into the target, and unmounts by
/// emptying it again. Every call is recorded.
#[derive(Default)]
pub struct FakeMounter {
    state: Mutex<State>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serves `dir` for mounts of `device`. With `fs_type` set, mounting as
    /// any other type fails like the kernel would.
    pub fn with_fixture(
        self,
        device: impl Into<PathBuf>,
        fs_type: Option<&str>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        self.state().fixtures.insert(
            device.into(),
            Fixture {
                dir: dir.into(),
                fs_type: fs_type.map(str::to_string),
            },
        );
        self
    }

    /// Unmounts of `device` fail with EBUSY.
    pub fn with_busy(self, device: impl Into<PathBuf>) -> Self {
        self.state().busy.insert(device.into());
        self
    }

    pub fn calls(&self) -> Vec<MountCall> {
        self.state().calls.clone()
    }

    /// Successful and failed mount attempts of `source`.
    pub fn mount_attempts(&self, source: &Path) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call, MountCall::Mount { source: s, .. } if s == source))
            .count()
    }

    /// Targets currently holding a mount.
    pub fn live_targets(&self) -> Vec<PathBuf> {
        let mut targets: Vec<PathBuf> = self.state().live.keys().cloned().collect();
        targets.sort();
        targets
    }
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&dest)?;
            copy_tree(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

fn empty_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

impl Mounter for FakeMounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        _data: &str,
        flags: MsFlags,
    ) -> boot_sys::Result<()> {
        let mut state = self.state();
        state.calls.push(MountCall::Mount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: fs_type.to_string(),
            flags,
        });
        let failure = |reason: &str| SysError::Mount {
            source_path: source.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: fs_type.to_string(),
            reason: reason.to_string(),
        };

        let fixture = state.fixtures.get(source).ok_or_else(|| failure("no such device"))?;
        if fixture.fs_type.as_deref().is_some_and(|expected| expected != fs_type) {
            return Err(failure("wrong fs type, bad option, bad superblock"));
        }
        copy_tree(&fixture.dir, target)?;
        debug!(source = %source.display(), target = %target.display(), fs_type, "fake mount");
        state.live.insert(target.to_path_buf(), source.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path, flags: MntFlags) -> boot_sys::Result<()> {
        let mut state = self.state();
        state.calls.push(MountCall::Unmount {
            target: target.to_path_buf(),
            flags,
        });
        let failure = |reason: &str| SysError::Unmount {
            target: target.to_path_buf(),
            reason: reason.to_string(),
        };

        let source = state.live.get(target).cloned().ok_or_else(|| failure("not mounted"))?;
        if state.busy.contains(&source) {
            return Err(failure("target is busy"));
        }
        empty_dir(target)?;
        state.live.remove(target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::TempDir;

    #[test]
    fn mount_copies_and_unmount_empties() {
        let fixture = TempDir::new("fixture").expect("fixture");
        fixture.write("boot/grub/grub.cfg", "menuentry X {}\n").expect("write");
        let target = TempDir::new("target").expect("target");

        let mounter = FakeMounter::new().with_fixture("/dev/sda1", Some("ext4"), fixture.path());
        mounter
            .mount(Path::new("/dev/sda1"), target.path(), "ext4", "", MsFlags::MS_RDONLY)
            .expect("mount");
        assert!(target.path().join("boot/grub/grub.cfg").is_file());
        assert_eq!(mounter.live_targets(), vec![target.path().to_path_buf()]);

        mounter.unmount(target.path(), MntFlags::MNT_DETACH).expect("unmount");
        assert_eq!(fs::read_dir(target.path()).expect("read").count(), 0);
        assert!(mounter.live_targets().is_empty());
    }

    #[test]
    fn wrong_type_and_unknown_devices_fail() {
        let fixture = TempDir::new("fixture").expect("fixture");
        let target = TempDir::new("target").expect("target");
        let mounter = FakeMounter::new().with_fixture("/dev/sda1", Some("vfat"), fixture.path());

        assert!(mounter
            .mount(Path::new("/dev/sda1"), target.path(), "ext4", "", MsFlags::empty())
            .is_err());
        assert!(mounter
            .mount(Path::new("/dev/sdb"), target.path(), "vfat", "", MsFlags::empty())
            .is_err());
        assert_eq!(mounter.mount_attempts(Path::new("/dev/sda1")), 1);
        assert!(mounter.live_targets().is_empty());
    }

    #[test]
    fn busy_devices_refuse_unmount() {
        let fixture = TempDir::new("fixture").expect("fixture");
        let target = TempDir::new("target").expect("target");
        let mounter = FakeMounter::new()
            .with_fixture("/dev/sr0", None, fixture.path())
            .with_busy("/dev/sr0");
        mounter
            .mount(Path::new("/dev/sr0"), target.path(), "iso9660", "", MsFlags::empty())
            .expect("mount");
        assert!(mounter.unmount(target.path(), MntFlags::empty()).is_err());
        assert_eq!(mounter.live_targets().len(), 1);
    }
}
