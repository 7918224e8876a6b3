// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use boot_resolver::handover;
use boot_resolver::resolve::{DeviceFilters, Resolver, find_devices};
use boot_sys::mount::{MntFlags, read_only};
use boot_testing::{FakeMounter, FakeSystem, MountCall, TempDir, superblock};
use boot_types::BlockDevice;
use uuid::Uuid;

fn system_with_three_filesystems() -> FakeSystem {
    let system = FakeSystem::new().expect("system");
    system.add_device("sda", &[0u8; 8192]).expect("sda");
    system
        .add_partition("sda", 1, &superblock::fat32(1))
        .expect("sda1");
    system
        .add_partition("sda", 2, &superblock::ext4(Uuid::from_u128(2)))
        .expect("sda2");
    system.add_device("sdb", &superblock::ext4(Uuid::from_u128(3))).expect("sdb");
    system
}

#[test]
fn release_unmounts_everything_resolution_mounted() {
    let system = system_with_three_filesystems();
    let a = common::tree(&[("EFI/BOOT/BOOTX64.EFI", "")]);
    let b = common::tree(&[("grub/grub.cfg", "menuentry A {\nlinux /vmlinuz\n}\n"), ("vmlinuz", "k")]);
    let c = common::tree(&[("data", "")]);
    let mounter = Arc::new(
        FakeMounter::new()
            .with_fixture("/dev/sda1", Some("vfat"), a.path())
            .with_fixture("/dev/sda2", Some("ext4"), b.path())
            .with_fixture("/dev/sdb", Some("ext4"), c.path()),
    );
    let mount_root = TempDir::new("mnt").expect("mount root");
    let mut pool = common::pool(&mounter, &mount_root);
    let catalog = system.catalog();

    let devices = find_devices(&catalog, &DeviceFilters::default()).expect("devices");
    let images = Resolver::new(&catalog, &mut pool)
        .with_bls_rank(None)
        .resolve(&devices);
    assert_eq!(images.len(), 1);
    assert_eq!(pool.mounts().len(), 3);
    let base = pool.base_dir().expect("base dir").to_path_buf();

    handover::release(&mut pool);

    assert!(mounter.live_targets().is_empty());
    assert!(pool.mounts().is_empty());
    assert!(!base.exists());
    assert_eq!(fs::read_dir(mount_root.path()).expect("mount root").count(), 0);

    let unmounts = mounter
        .calls()
        .into_iter()
        .filter(|call| matches!(call, MountCall::Unmount { flags, .. } if *flags == MntFlags::MNT_DETACH))
        .count();
    assert_eq!(unmounts, 3);
}

#[test]
fn mounting_twice_mounts_once() {
    let system = system_with_three_filesystems();
    let c = common::tree(&[("data", "")]);
    let mounter = Arc::new(FakeMounter::new().with_fixture("/dev/sdb", Some("ext4"), c.path()));
    let mount_root = TempDir::new("mnt").expect("mount root");
    let mut pool = common::pool(&mounter, &mount_root);
    let device = system
        .catalog()
        .enumerate()
        .expect("enumerate")
        .into_iter()
        .find(|device| device.name == "sdb")
        .expect("sdb");

    let first = pool.mount(&device, read_only()).expect("first");
    let second = pool.try_mount(&device, read_only()).expect("second");
    assert_eq!(first, second);
    assert_eq!(mounter.mount_attempts(Path::new("/dev/sdb")), 1);
    handover::release(&mut pool);
}

#[test]
fn busy_mount_keeps_base_directory_and_is_retried() {
    let tree = common::tree(&[("data", "")]);
    let other = common::tree(&[("data", "")]);
    let mounter = Arc::new(
        FakeMounter::new()
            .with_fixture("/dev/sdc", Some("ext4"), tree.path())
            .with_fixture("/dev/sdd", Some("ext4"), other.path())
            .with_busy("/dev/sdc"),
    );
    let mount_root = TempDir::new("mnt").expect("mount root");
    let mut pool = common::pool(&mounter, &mount_root);

    pool.mount_as(&BlockDevice::new("sdc"), "ext4", read_only())
        .expect("sdc");
    pool.mount_as(&BlockDevice::new("sdd"), "ext4", read_only())
        .expect("sdd");
    assert!(pool.mount_as(&BlockDevice::new("sde"), "ext4", read_only()).is_err());

    let err = pool.unmount_all(MntFlags::MNT_DETACH).expect_err("sdc is busy");
    assert!(err.to_string().contains("busy"));
    assert_eq!(pool.mounts().len(), 1);
    assert_eq!(mounter.live_targets().len(), 1);
    assert!(pool.base_dir().is_some_and(Path::exists));

    handover::release(&mut pool);
    assert_eq!(pool.mounts().len(), 1);
}
