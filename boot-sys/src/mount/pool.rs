// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use boot_types::BlockDevice;
use nix::mount::{MntFlags, MsFlags};
use tracing::{debug, info, warn};

use super::Mounter;
use crate::error::{Result, SysError};

static POOL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A live mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub path: PathBuf,
    pub device: PathBuf,
    pub fs_type: String,
    pub flags: MsFlags,
    pub data: String,
    /// The directory was created by a pool and is removed on unmount.
    pub owned: bool,
}

impl MountPoint {
    /// A mount made elsewhere. Its directory is left in place on unmount.
    pub fn external(path: impl Into<PathBuf>, device: impl Into<PathBuf>, fs_type: &str) -> Self {
        Self {
            path: path.into(),
            device: device.into(),
            fs_type: fs_type.to_string(),
            flags: MsFlags::empty(),
            data: String::new(),
            owned: false,
        }
    }

    /// Unmounts and, when owned, removes the mount directory.
    pub fn unmount(&self, mounter: &dyn Mounter, flags: MntFlags) -> Result<()> {
        mounter.unmount(&self.path, flags)?;
        if self.owned {
            match fs::remove_dir(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Owner of every mount made while resolving boot candidates.
///
/// Mounts land in per-device subdirectories of one private directory that is
/// only created on first use, and only removed once everything beneath it has
/// been unmounted.
pub struct MountPool {
    mounter: Arc<dyn Mounter>,
    parent: PathBuf,
    base: Option<PathBuf>,
    mounts: Vec<MountPoint>,
    filesystems: Option<Vec<String>>,
}

impl MountPool {
    /// A pool whose private directory will be created under `parent`.
    pub fn new(mounter: Arc<dyn Mounter>, parent: impl Into<PathBuf>) -> Self {
        Self {
            mounter,
            parent: parent.into(),
            base: None,
            mounts: Vec::new(),
            filesystems: None,
        }
    }

    /// Overrides the filesystem list used by [`MountPool::try_mount`] instead
    /// of reading `/proc/filesystems`.
    pub fn with_filesystems(mut self, filesystems: Vec<String>) -> Self {
        self.filesystems = Some(filesystems);
        self
    }

    pub fn mounter(&self) -> Arc<dyn Mounter> {
        Arc::clone(&self.mounter)
    }

    /// Live mounts in creation order.
    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }

    /// The private base directory, if it has been created.
    pub fn base_dir(&self) -> Option<&Path> {
        self.base.as_deref()
    }

    fn ensure_base(&mut self) -> Result<PathBuf> {
        if let Some(base) = &self.base {
            return Ok(base.clone());
        }
        let unique = POOL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let base = self
            .parent
            .join(format!("boot-resolver-{}-{unique}", std::process::id()));
        fs::DirBuilder::new()
            .recursive(false)
            .mode(0o700)
            .create(&base)?;
        debug!(path = %base.display(), "created mount pool directory");
        self.base = Some(base.clone());
        Ok(base)
    }

    fn find(&self, device: &Path) -> Option<&MountPoint> {
        self.mounts.iter().find(|mount| mount.device == device)
    }

    /// Mounts `device` with its sniffed filesystem. Mounting a device that is
    /// already in the pool returns the existing mount.
    pub fn mount(&mut self, device: &BlockDevice, flags: MsFlags) -> Result<MountPoint> {
        if let Some(existing) = self.find(&device.device_path()) {
            return Ok(existing.clone());
        }
        let fs_type = device.fs_type.ok_or_else(|| {
            SysError::OperationFailed(format!("no filesystem detected on {}", device.name))
        })?;
        self.mount_as(device, fs_type.mount_type(), flags)
    }

    /// Like [`MountPool::mount`], but when no filesystem was sniffed tries
    /// every block filesystem the kernel supports.
    pub fn try_mount(&mut self, device: &BlockDevice, flags: MsFlags) -> Result<MountPoint> {
        if let Some(existing) = self.find(&device.device_path()) {
            return Ok(existing.clone());
        }
        if let Some(fs_type) = device.fs_type {
            return self.mount_as(device, fs_type.mount_type(), flags);
        }

        let filesystems = self.filesystems()?;
        for fs_type in &filesystems {
            match self.mount_as(device, fs_type, flags) {
                Ok(mount) => return Ok(mount),
                Err(e) => debug!(device = %device.name, fs_type = %fs_type, error = %e, "mount attempt failed"),
            }
        }
        debug!(device = %device.name, tried = filesystems.len(), "no filesystem mounted");
        Err(SysError::OperationFailed(format!(
            "no suitable filesystem for {} (tried {})",
            device.device_path().display(),
            filesystems.join(", ")
        )))
    }

    /// Mounts `device` as `fs_type` in its own subdirectory, removing the
    /// subdirectory again if the mount fails.
    pub fn mount_as(
        &mut self,
        device: &BlockDevice,
        fs_type: &str,
        flags: MsFlags,
    ) -> Result<MountPoint> {
        let source = device.device_path();
        if let Some(existing) = self.find(&source) {
            return Ok(existing.clone());
        }

        let base = self.ensure_base()?;
        let target = base.join(device.name.replace('/', "_"));
        match fs::create_dir(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.mounter.mount(&source, &target, fs_type, "", flags) {
            if let Err(rm) = fs::remove_dir(&target) {
                warn!(path = %target.display(), error = %rm, "could not remove mount directory");
            }
            return Err(e);
        }

        let mount = MountPoint {
            path: target,
            device: source,
            fs_type: fs_type.to_string(),
            flags,
            data: String::new(),
            owned: true,
        };
        debug!(device = %device.name, path = %mount.path.display(), fs_type, "mounted");
        self.mounts.push(mount.clone());
        Ok(mount)
    }

    /// Registers mounts made outside the pool so [`MountPool::unmount_all`]
    /// cleans them up too.
    pub fn add(&mut self, mounts: impl IntoIterator<Item = MountPoint>) {
        self.mounts.extend(mounts);
    }

    /// Unmounts everything. Every mount is attempted even after failures; the
    /// failures are returned together and the failed mounts stay tracked. The
    /// base directory goes away only when nothing is left.
    pub fn unmount_all(&mut self, flags: MntFlags) -> Result<()> {
        let mut errors = Vec::new();
        let mut remaining = Vec::new();

        for mount in self.mounts.drain(..) {
            match mount.unmount(self.mounter.as_ref(), flags) {
                Ok(()) => debug!(path = %mount.path.display(), "unmounted"),
                Err(e) => {
                    warn!(path = %mount.path.display(), error = %e, "unmount failed");
                    errors.push(e);
                    remaining.push(mount);
                }
            }
        }
        self.mounts = remaining;

        if !errors.is_empty() {
            return Err(if errors.len() == 1 {
                errors.remove(0)
            } else {
                SysError::Multiple(errors)
            });
        }

        if let Some(base) = self.base.take() {
            match fs::remove_dir(&base) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    self.base = Some(base);
                    return Err(e.into());
                }
            }
        }
        info!("all mounts released");
        Ok(())
    }

    fn filesystems(&mut self) -> Result<Vec<String>> {
        if let Some(list) = &self.filesystems {
            return Ok(list.clone());
        }
        let list = parse_proc_filesystems(&fs::read_to_string("/proc/filesystems")?);
        self.filesystems = Some(list.clone());
        Ok(list)
    }
}

/// Block filesystems from `/proc/filesystems`, skipping `nodev` entries.
pub fn parse_proc_filesystems(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter(|line| !line.starts_with("nodev"))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use boot_types::FsType;

    #[derive(Default)]
    struct Recorder {
        mounts: Mutex<Vec<(PathBuf, String)>>,
        unmounts: Mutex<Vec<PathBuf>>,
        refuse_fs: HashSet<String>,
        refuse_unmount: HashSet<PathBuf>,
    }

    impl Mounter for Recorder {
        fn mount(
            &self,
            source: &Path,
            target: &Path,
            fs_type: &str,
            _data: &str,
            _flags: MsFlags,
        ) -> Result<()> {
            if self.refuse_fs.contains(fs_type) {
                return Err(SysError::Mount {
                    source_path: source.to_path_buf(),
                    target: target.to_path_buf(),
                    fs_type: fs_type.to_string(),
                    reason: "invalid argument".to_string(),
                });
            }
            self.mounts
                .lock()
                .expect("lock")
                .push((source.to_path_buf(), fs_type.to_string()));
            Ok(())
        }

        fn unmount(&self, target: &Path, _flags: MntFlags) -> Result<()> {
            self.unmounts.lock().expect("lock").push(target.to_path_buf());
            if self.refuse_unmount.contains(target) {
                return Err(SysError::Unmount {
                    target: target.to_path_buf(),
                    reason: "busy".to_string(),
                });
            }
            Ok(())
        }
    }

    fn vfat(name: &str) -> BlockDevice {
        BlockDevice::new(name).with_fs(FsType::Vfat, "1234-5678")
    }

    #[test]
    fn mount_is_idempotent_per_device() {
        let parent = tempfile::tempdir().expect("tempdir");
        let recorder = Arc::new(Recorder::default());
        let mut pool = MountPool::new(recorder.clone(), parent.path());

        let first = pool.mount(&vfat("sda1"), MsFlags::MS_RDONLY).expect("mount");
        let second = pool.mount(&vfat("sda1"), MsFlags::MS_RDONLY).expect("mount");

        assert_eq!(first, second);
        assert_eq!(recorder.mounts.lock().expect("lock").len(), 1);
        assert!(first.path.is_dir());
        assert_eq!(pool.mounts().len(), 1);
    }

    #[test]
    fn failed_mount_removes_its_directory() {
        let parent = tempfile::tempdir().expect("tempdir");
        let recorder = Arc::new(Recorder {
            refuse_fs: HashSet::from(["vfat".to_string()]),
            ..Default::default()
        });
        let mut pool = MountPool::new(recorder, parent.path());

        assert!(pool.mount(&vfat("sdb1"), MsFlags::MS_RDONLY).is_err());
        let base = pool.base_dir().expect("base created").to_path_buf();
        assert!(!base.join("sdb1").exists());
        assert!(pool.mounts().is_empty());
    }

    #[test]
    fn try_mount_walks_filesystems_in_order() {
        let parent = tempfile::tempdir().expect("tempdir");
        let recorder = Arc::new(Recorder {
            refuse_fs: HashSet::from(["ext4".to_string()]),
            ..Default::default()
        });
        let mut pool = MountPool::new(recorder.clone(), parent.path())
            .with_filesystems(vec!["ext4".into(), "iso9660".into(), "vfat".into()]);

        let mount = pool
            .try_mount(&BlockDevice::new("sr0"), MsFlags::MS_RDONLY)
            .expect("mount");
        assert_eq!(mount.fs_type, "iso9660");
        assert_eq!(
            recorder.mounts.lock().expect("lock").as_slice(),
            &[(PathBuf::from("/dev/sr0"), "iso9660".to_string())]
        );
    }

    #[test]
    fn unmount_all_attempts_everything_and_keeps_dir_on_failure() {
        let parent = tempfile::tempdir().expect("tempdir");
        let mut pool = MountPool::new(Arc::new(Recorder::default()), parent.path());
        let a = pool.mount(&vfat("sda1"), MsFlags::MS_RDONLY).expect("mount");
        pool.mount(&vfat("sda2"), MsFlags::MS_RDONLY).expect("mount");
        let base = pool.base_dir().expect("base").to_path_buf();

        let recorder = Arc::new(Recorder {
            refuse_unmount: HashSet::from([a.path.clone(), PathBuf::from("/mnt/ext")]),
            ..Default::default()
        });
        pool.mounter = recorder.clone();
        pool.add([MountPoint::external("/mnt/ext", "/dev/sdc1", "ext4")]);

        let err = pool.unmount_all(MntFlags::MNT_DETACH).expect_err("two failures");
        assert!(matches!(err, SysError::Multiple(ref errors) if errors.len() == 2));
        assert_eq!(recorder.unmounts.lock().expect("lock").len(), 3);
        assert_eq!(pool.mounts().len(), 2);
        assert!(base.is_dir());
        assert!(!base.join("sda2").exists());
    }

    #[test]
    fn unmount_all_removes_base_when_clean() {
        let parent = tempfile::tempdir().expect("tempdir");
        let mut pool = MountPool::new(Arc::new(Recorder::default()), parent.path());
        pool.mount(&vfat("sda1"), MsFlags::MS_RDONLY).expect("mount");
        let base = pool.base_dir().expect("base").to_path_buf();

        pool.unmount_all(MntFlags::MNT_DETACH).expect("clean");
        assert!(!base.exists());
        assert!(pool.mounts().is_empty());
    }

    #[test]
    fn proc_filesystems_skips_nodev() {
        let parsed = parse_proc_filesystems("nodev\tsysfs\nnodev\tproc\n\text4\n\tvfat\n\tiso9660\n");
        assert_eq!(parsed, ["ext4", "vfat", "iso9660"]);
    }
}
