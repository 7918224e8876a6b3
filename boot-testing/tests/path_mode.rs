// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::sync::Arc;

use boot_resolver::ResolveError;
use boot_resolver::handover;
use boot_resolver::resolve::{DeviceFilters, explicit_image, find_devices};
use boot_sys::{DryRunKexec, KexecCall, load_image};
use boot_testing::{FakeMounter, FakeSystem, GptDisk, TempDir, superblock};
use uuid::Uuid;

const ROOT_GUID: Uuid = Uuid::from_u128(0x8c6f_11aa_2b3c_4d5e_9f00_0102_0304_0506);
const LINUX_FS: Uuid = Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);

fn system() -> FakeSystem {
    let system = FakeSystem::new().expect("system");
    let disk = GptDisk::new(4096)
        .partition(LINUX_FS, ROOT_GUID, 64, 4000, "root")
        .build()
        .expect("disk");
    system.add_device("vda", &disk).expect("vda");
    system
        .add_partition("vda", 1, &superblock::ext4(Uuid::from_u128(9)))
        .expect("vda1");
    system
}

#[test]
fn explicit_kernel_on_guid_partition_loads() {
    let system = system();
    let fixture = common::tree(&[("boot/vmlinuz", "kernel"), ("boot/initrd", "initrd")]);
    let mounter = Arc::new(FakeMounter::new().with_fixture("/dev/vda1", Some("ext4"), fixture.path()));
    let mount_root = TempDir::new("mnt").expect("mount root");
    let mut pool = common::pool(&mounter, &mount_root);
    let catalog = system.catalog();
    let devices = find_devices(&catalog, &DeviceFilters::default()).expect("devices");

    let image = explicit_image(
        &catalog,
        &mut pool,
        &devices,
        &ROOT_GUID.to_string().to_uppercase(),
        "/boot/vmlinuz",
        Some("boot/initrd"),
        "root=/dev/vda1",
    )
    .expect("image");
    assert_eq!(image.label(), "/boot/vmlinuz from vda1");

    let kexec = DryRunKexec::new();
    load_image(&kexec, &image).expect("load");
    let root = common::mount_path(&pool, "vda1");
    assert_eq!(
        kexec.calls(),
        vec![KexecCall::Linux {
            kernel: root.join("boot/vmlinuz").display().to_string(),
            initrd: Some(root.join("boot/initrd").display().to_string()),
            cmdline: "root=/dev/vda1".to_string(),
            dtb: None,
        }]
    );
    handover::release(&mut pool);
}

#[test]
fn unknown_guid_is_reported() {
    let system = system();
    let mounter = Arc::new(FakeMounter::new());
    let mount_root = TempDir::new("mnt").expect("mount root");
    let mut pool = common::pool(&mounter, &mount_root);
    let catalog = system.catalog();
    let devices = find_devices(&catalog, &DeviceFilters::default()).expect("devices");

    let result = explicit_image(
        &catalog,
        &mut pool,
        &devices,
        &Uuid::from_u128(0xdead).to_string(),
        "/boot/vmlinuz",
        None,
        "",
    );
    assert!(matches!(result, Err(ResolveError::PartitionNotFound(_))));
    assert!(mounter.calls().is_empty());
}
