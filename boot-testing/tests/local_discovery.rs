// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::sync::Arc;

use boot_resolver::handover;
use boot_resolver::resolve::{DeviceFilters, Resolver, find_devices};
use boot_resolver::ResolveError;
use boot_sys::gpt::EFI_SYSTEM_PARTITION;
use boot_testing::{FakeMounter, FakeSystem, GptDisk, TempDir, superblock};
use boot_types::{BootImage, LinuxImage, PciList};
use uuid::Uuid;

const LINUX_FS: Uuid = Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);

fn linux(image: &BootImage) -> &LinuxImage {
    match image {
        BootImage::Linux(image) => image,
        other => panic!("expected linux image, got {other}"),
    }
}

fn disk() -> Vec<u8> {
    GptDisk::new(2048)
        .partition(EFI_SYSTEM_PARTITION, Uuid::from_u128(1), 40, 500, "EFI System")
        .partition(LINUX_FS, Uuid::from_u128(2), 501, 1900, "boot")
        .build()
        .expect("disk")
}

#[test]
fn single_grub_entry_becomes_one_linux_image() {
    let system = FakeSystem::new().expect("system");
    system.add_device("sda", &disk()).expect("sda");
    system
        .add_partition("sda", 1, &superblock::ext4(Uuid::from_u128(0xa1)))
        .expect("sda1");

    let fixture = common::tree(&[
        (
            "boot/grub/grub.cfg",
            "menuentry \"X\" {\n  linux /vmlinuz console=ttyS0\n  initrd /initrd.img\n}\n",
        ),
        ("vmlinuz", "kernel"),
        ("initrd.img", "initrd"),
    ]);
    let mounter = Arc::new(FakeMounter::new().with_fixture("/dev/sda1", Some("ext4"), fixture.path()));
    let mount_root = TempDir::new("mnt").expect("mount root");
    let mut pool = common::pool(&mounter, &mount_root);
    let catalog = system.catalog();

    let devices = find_devices(&catalog, &DeviceFilters::default()).expect("devices");
    let images = Resolver::new(&catalog, &mut pool)
        .with_bls_rank(None)
        .resolve(&devices);

    assert_eq!(images.len(), 1);
    let image = linux(&images[0]);
    let root = common::mount_path(&pool, "sda1");
    assert_eq!(image.name, "X");
    assert_eq!(image.cmdline, "console=ttyS0");
    assert_eq!(image.kernel.local_path(), Some(root.join("vmlinuz").as_path()));
    assert_eq!(
        image.initrd.as_ref().and_then(|initrd| initrd.local_path()),
        Some(root.join("initrd.img").as_path())
    );
    assert_eq!(&*image.kernel.read_all().expect("kernel"), b"kernel");

    handover::release(&mut pool);
    assert!(mounter.live_targets().is_empty());
}

#[test]
fn grub_search_finds_kernel_on_another_partition() {
    let boot_uuid = Uuid::from_u128(0x3f1a228b_510c_4d2e_9a01_deadbeef0042);
    let system = FakeSystem::new().expect("system");
    system.add_device("nvme0n1", &disk()).expect("disk");
    system
        .add_partition("nvme0n1", 1, &superblock::fat32(0x1234_abcd))
        .expect("esp");
    system
        .add_partition("nvme0n1", 2, &superblock::ext4(boot_uuid))
        .expect("boot");

    let esp = common::tree(&[(
        "EFI/fedora/grub.cfg",
        &format!(
            "search --no-floppy --fs-uuid --set=dev {boot_uuid}\n\
             set root=$dev\n\
             menuentry 'Fedora' {{\n  linux ($root)/vmlinuz-6.1 root=/dev/nvme0n1p3 ro\n}}\n"
        ),
    )]);
    let boot = common::tree(&[("vmlinuz-6.1", "kernel")]);
    let mounter = Arc::new(
        FakeMounter::new()
            .with_fixture("/dev/nvme0n1p1", Some("vfat"), esp.path())
            .with_fixture("/dev/nvme0n1p2", Some("ext4"), boot.path()),
    );
    let mount_root = TempDir::new("mnt").expect("mount root");
    let mut pool = common::pool(&mounter, &mount_root);
    let catalog = system.catalog();

    let devices = find_devices(&catalog, &DeviceFilters::default()).expect("devices");
    let images = Resolver::new(&catalog, &mut pool)
        .with_bls_rank(None)
        .resolve(&devices);

    assert_eq!(images.len(), 1);
    let image = linux(&images[0]);
    let boot_root = common::mount_path(&pool, "nvme0n1p2");
    assert_eq!(image.name, "Fedora");
    assert_eq!(
        image.kernel.local_path(),
        Some(boot_root.join("vmlinuz-6.1").as_path())
    );
    assert_eq!(mounter.mount_attempts(std::path::Path::new("/dev/nvme0n1p2")), 1);

    handover::release(&mut pool);
}

#[test]
fn bls_entries_follow_grub_saved_entry() {
    let system = FakeSystem::new().expect("system");
    system.add_device("sda", &disk()).expect("sda");
    system
        .add_partition("sda", 2, &superblock::ext4(Uuid::from_u128(0xb2)))
        .expect("sda2");

    let fixture = common::tree(&[
        ("grub2/grub.cfg", "set timeout=5\nblscfg\n"),
        (
            "grub2/grubenv",
            "# GRUB Environment Block\nsaved_entry=fc-6.1\nkernelopts=root=/dev/sda3 ro\n",
        ),
        (
            "loader/entries/fc-6.1.conf",
            "title Fedora\nversion 6.1\nlinux /vmlinuz-6.1\noptions $kernelopts quiet\n",
        ),
        (
            "loader/entries/fc-6.2.conf",
            "title Fedora\nversion 6.2\nlinux /vmlinuz-6.2\noptions $kernelopts\n",
        ),
        ("vmlinuz-6.1", "old"),
        ("vmlinuz-6.2", "new"),
    ]);
    let mounter = Arc::new(FakeMounter::new().with_fixture("/dev/sda2", Some("ext4"), fixture.path()));
    let mount_root = TempDir::new("mnt").expect("mount root");
    let mut pool = common::pool(&mounter, &mount_root);
    let catalog = system.catalog();

    let devices = find_devices(&catalog, &DeviceFilters::default()).expect("devices");
    let images = Resolver::new(&catalog, &mut pool)
        .with_bls_rank(None)
        .resolve(&devices);

    let labels: Vec<String> = images.iter().map(BootImage::label).collect();
    assert_eq!(labels, ["Fedora 6.1", "Fedora 6.2"]);
    assert_eq!(images[0].rank(), 2);
    assert_eq!(images[0].cmdline(), "root=/dev/sda3 ro quiet");
    assert_eq!(images[1].cmdline(), "root=/dev/sda3 ro");

    handover::release(&mut pool);
}

#[test]
fn blocked_pci_controller_hides_its_disks() {
    let system = FakeSystem::new().expect("system");
    system
        .add_pci_device("sda", 0x8086, 0x2922, &[0u8; 4096])
        .expect("sda");
    system.add_device("vda", &[0u8; 4096]).expect("vda");
    let catalog = system.catalog();

    let filters = DeviceFilters {
        block_pci: Some("8086:2922".parse::<PciList>().expect("list")),
        allow_pci: None,
    };
    let devices = find_devices(&catalog, &filters).expect("devices");
    let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, ["vda"]);

    let filters = DeviceFilters {
        block_pci: None,
        allow_pci: Some("10de:1c82".parse::<PciList>().expect("list")),
    };
    assert!(matches!(
        find_devices(&catalog, &filters),
        Err(ResolveError::NoDevices)
    ));
}

#[test]
fn devices_without_configs_yield_nothing() {
    let system = FakeSystem::new().expect("system");
    system.add_device("sda", &disk()).expect("sda");
    system
        .add_partition("sda", 1, &superblock::xfs(Uuid::from_u128(0xc3)))
        .expect("sda1");
    let empty = common::tree(&[("etc/fstab", "")]);
    let mounter = Arc::new(FakeMounter::new().with_fixture("/dev/sda1", Some("xfs"), empty.path()));
    let mount_root = TempDir::new("mnt").expect("mount root");
    let mut pool = common::pool(&mounter, &mount_root);
    let catalog = system.catalog();

    let devices = find_devices(&catalog, &DeviceFilters::default()).expect("devices");
    let images = Resolver::new(&catalog, &mut pool)
        .with_bls_rank(None)
        .resolve(&devices);
    assert!(images.is_empty());

    handover::release(&mut pool);
    assert!(pool.base_dir().is_none());
}
