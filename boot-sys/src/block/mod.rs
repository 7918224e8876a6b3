// SPDX-License-Identifier: GPL-3.0-only

//! Device catalog
//!
//! Enumerates `/sys/class/block`, sniffs each node for a filesystem and offers
//! the narrowing filters boot discovery needs. Filters never fail: a device
//! whose metadata cannot be read is dropped from that filter's result only.

mod sniff;

pub use sniff::{SNIFF_LEN, sniff, sniff_path};

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use boot_types::{BlockDevice, PciId, PciList, compose_part_name, parse_hex_u16};
use tracing::{debug, warn};

use crate::error::{Result, SysError};
use crate::gpt::{self, DEFAULT_BLOCK_SIZE, EFI_SYSTEM_PARTITION, Gpt, Partition};

/// Sysfs `size` files count 512-byte sectors regardless of the logical block size.
const SYSFS_SECTOR: u64 = 512;

/// Read-only view of the machine's block devices.
#[derive(Debug, Clone)]
pub struct BlockCatalog {
    sys_root: PathBuf,
    dev_root: PathBuf,
}

impl BlockCatalog {
    /// The live system: `/sys` and `/dev`.
    pub fn system() -> Self {
        Self::new("/sys", "/dev")
    }

    /// A catalog over an alternate sysfs and device directory, used by tests
    /// and by images staged on disk.
    pub fn new(sys_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
        }
    }

    fn class_block(&self) -> PathBuf {
        self.sys_root.join("class/block")
    }

    /// Node to open for raw reads of `name`.
    pub fn device_node(&self, name: &str) -> PathBuf {
        self.dev_root.join(name)
    }

    /// Lists every block device, sorted by name, with its filesystem sniffed.
    pub fn enumerate(&self) -> Result<Vec<BlockDevice>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.class_block())? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        let devices = names
            .into_iter()
            .map(|name| {
                let node = self.device_node(&name);
                let mut device = BlockDevice::new(name);
                match sniff_path(&node) {
                    Ok(Some((fs_type, uuid))) => {
                        device = device.with_fs(fs_type, uuid);
                    }
                    Ok(None) => debug!(device = %device.name, "no known filesystem signature"),
                    Err(e) => {
                        debug!(device = %device.name, error = %e, "could not read device for sniffing")
                    }
                }
                device
            })
            .collect::<Vec<_>>();

        debug!(count = devices.len(), "enumerated block devices");
        Ok(devices)
    }

    /// Size in bytes as reported by sysfs.
    pub fn size(&self, name: &str) -> Result<u64> {
        let raw = fs::read_to_string(self.class_block().join(name).join("size"))?;
        let sectors = raw
            .trim()
            .parse::<u64>()
            .map_err(|e| SysError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        Ok(sectors * SYSFS_SECTOR)
    }

    fn sysfs_logical_block_size(&self, name: &str) -> io::Result<u64> {
        let dir = self.class_block().join(name);
        // Partitions carry no queue directory of their own; the parent disk does.
        let candidates = [
            dir.join("queue/logical_block_size"),
            dir.join("../queue/logical_block_size"),
        ];
        let mut last_err = io::Error::from(io::ErrorKind::NotFound);
        for path in candidates {
            match fs::read_to_string(&path) {
                Ok(raw) => {
                    return raw
                        .trim()
                        .parse::<u64>()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Logical block size: `BLKSSZGET`, then sysfs, then 512.
    pub fn block_size(&self, name: &str) -> u64 {
        let node = self.device_node(name);
        let ioctl_err = match File::open(&node).and_then(|file| ioctl_logical_block_size(&file)) {
            Ok(size) if size >= DEFAULT_BLOCK_SIZE => return size,
            Ok(size) => io::Error::new(
                io::ErrorKind::InvalidData,
                format!("suspicious block size {size}"),
            ),
            Err(e) => e,
        };
        match self.sysfs_logical_block_size(name) {
            Ok(size) if size >= DEFAULT_BLOCK_SIZE => size,
            Ok(_) | Err(_) => {
                debug!(device = name, ioctl = %ioctl_err, "falling back to 512-byte blocks");
                DEFAULT_BLOCK_SIZE
            }
        }
    }

    /// Reads and validates the primary GPT of `name`.
    pub fn read_gpt(&self, name: &str) -> Result<Gpt> {
        let block_size = self.block_size(name);
        let mut file = File::open(self.device_node(name))?;
        gpt::read_gpt(&mut file, block_size, block_size)
    }

    /// Finds the PCI vendor/device pair backing `name` by walking up its
    /// sysfs device path until a directory holds both `vendor` and `device`.
    pub fn pci_of(&self, name: &str) -> Option<PciId> {
        let stop = self.sys_root.join("devices");
        let mut dir = fs::canonicalize(self.class_block().join(name)).ok()?;
        let stop = fs::canonicalize(&stop).unwrap_or(stop);

        while dir.starts_with(&stop) && dir != stop {
            if let Some(id) = read_pci_id(&dir) {
                return Some(id);
            }
            if !dir.pop() {
                break;
            }
        }
        debug!(device = name, "no backing PCI device");
        None
    }

    /// Drops devices with no addressable blocks.
    pub fn filter_zero_size(&self, devices: &[BlockDevice]) -> Vec<BlockDevice> {
        devices
            .iter()
            .filter(|device| match self.size(&device.name) {
                Ok(size) => size > 0,
                Err(e) => {
                    debug!(device = %device.name, error = %e, "size unreadable");
                    false
                }
            })
            .cloned()
            .collect()
    }

    /// Keeps devices that have every listed partition number.
    pub fn filter_having_partitions(
        &self,
        devices: &[BlockDevice],
        parts: &[usize],
    ) -> Vec<BlockDevice> {
        devices
            .iter()
            .filter(|device| {
                parts.iter().all(|part| {
                    self.class_block()
                        .join(compose_part_name(&device.name, *part))
                        .exists()
                })
            })
            .cloned()
            .collect()
    }

    /// Matches a filesystem UUID or a GPT unique partition GUID.
    pub fn filter_fs_uuid(&self, devices: &[BlockDevice], uuid: &str) -> Vec<BlockDevice> {
        let by_gpt: HashSet<String> = self
            .partitions_by_guid(devices, uuid)
            .into_iter()
            .map(|device| device.name)
            .collect();
        devices
            .iter()
            .filter(|device| {
                by_gpt.contains(&device.name)
                    || device
                        .fs_uuid
                        .as_deref()
                        .is_some_and(|fs_uuid| fs_uuid.eq_ignore_ascii_case(uuid))
            })
            .cloned()
            .collect()
    }

    /// Partitions whose unique GUID is `guid`.
    pub fn partitions_by_guid(&self, devices: &[BlockDevice], guid: &str) -> Vec<BlockDevice> {
        self.filter_gpt(devices, |part| {
            part.unique_guid.to_string().eq_ignore_ascii_case(guid)
        })
    }

    /// Partitions whose type GUID is `guid`.
    pub fn filter_part_type(&self, devices: &[BlockDevice], guid: &str) -> Vec<BlockDevice> {
        self.filter_gpt(devices, |part| {
            part.part_type.to_string().eq_ignore_ascii_case(guid)
        })
    }

    /// Partitions whose GPT name is `label`, ignoring case.
    pub fn filter_part_label(&self, devices: &[BlockDevice], label: &str) -> Vec<BlockDevice> {
        self.filter_gpt(devices, |part| {
            part.name().to_lowercase() == label.to_lowercase()
        })
    }

    pub fn filter_efi_system_partitions(&self, devices: &[BlockDevice]) -> Vec<BlockDevice> {
        self.filter_part_type(devices, &EFI_SYSTEM_PARTITION.to_string())
    }

    /// Collects partition names from every readable GPT in `devices` whose
    /// entry satisfies `matches`, then keeps those names from `devices`.
    fn filter_gpt(
        &self,
        devices: &[BlockDevice],
        matches: impl Fn(&Partition) -> bool,
    ) -> Vec<BlockDevice> {
        let mut names = Vec::new();
        for device in devices {
            let table = match self.read_gpt(&device.name) {
                Ok(table) => table,
                Err(e) => {
                    debug!(device = %device.name, error = %e, "no usable GPT");
                    continue;
                }
            };
            for (index, part) in table.partitions.iter().enumerate() {
                if !part.is_empty() && matches(part) {
                    names.push(compose_part_name(&device.name, index + 1));
                }
            }
        }
        filter_names(devices, &names)
    }

    /// Keeps only devices backed by a listed PCI device. Devices with no PCI
    /// backing are dropped.
    pub fn filter_allow_pci(&self, devices: &[BlockDevice], allow: &PciList) -> Vec<BlockDevice> {
        devices
            .iter()
            .filter(|device| {
                self.pci_of(&device.name)
                    .is_some_and(|id| allow.contains(&id))
            })
            .cloned()
            .collect()
    }

    /// Drops devices backed by a listed PCI device. Devices with no PCI
    /// backing are kept.
    pub fn filter_block_pci(&self, devices: &[BlockDevice], block: &PciList) -> Vec<BlockDevice> {
        devices
            .iter()
            .filter(|device| match self.pci_of(&device.name) {
                Some(id) if block.contains(&id) => {
                    debug!(device = %device.name, pci = %id, "blocked by PCI list");
                    false
                }
                _ => true,
            })
            .cloned()
            .collect()
    }
}

/// Exact name match.
pub fn filter_name(devices: &[BlockDevice], name: &str) -> Vec<BlockDevice> {
    devices
        .iter()
        .filter(|device| device.name == name)
        .cloned()
        .collect()
}

/// Matches any of `names`, which may be bare (`sda1`) or paths
/// (`/dev/sda1`, `/sys/class/block/sda1`).
pub fn filter_names<S: AsRef<str>>(devices: &[BlockDevice], names: &[S]) -> Vec<BlockDevice> {
    let wanted: HashSet<&str> = names
        .iter()
        .map(|name| {
            let name = name.as_ref();
            Path::new(name)
                .file_name()
                .and_then(|base| base.to_str())
                .unwrap_or(name)
        })
        .collect();
    devices
        .iter()
        .filter(|device| wanted.contains(device.name.as_str()))
        .cloned()
        .collect()
}

fn read_pci_id(dir: &Path) -> Option<PciId> {
    let vendor = dir.join("vendor");
    let device = dir.join("device");
    if !fs::metadata(&vendor).is_ok_and(|m| m.is_file())
        || !fs::metadata(&device).is_ok_and(|m| m.is_file())
    {
        return None;
    }
    let read = |path: &Path| {
        let raw = fs::read_to_string(path).ok()?;
        let value = parse_hex_u16(&raw);
        if value.is_none() {
            warn!(path = %path.display(), value = raw.trim(), "unparseable PCI id");
        }
        value
    };
    Some(PciId {
        vendor: read(&vendor)?,
        device: read(&device)?,
    })
}

fn ioctl_logical_block_size(file: &File) -> io::Result<u64> {
    // linux/fs.h: BLKSSZGET = _IO(0x12, 104)
    const BLKSSZGET: libc::c_ulong = 0x1268;
    let mut size: libc::c_int = 0;

    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET as _, &mut size) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(u64::try_from(size).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::os::unix::fs::symlink;

    use uuid::Uuid;

    use crate::gpt::PartitionTable;

    struct FakeSys {
        _dir: tempfile::TempDir,
        catalog: BlockCatalog,
        sys: PathBuf,
        dev: PathBuf,
    }

    impl FakeSys {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let sys = dir.path().join("sys");
            let dev = dir.path().join("dev");
            fs::create_dir_all(sys.join("class/block")).expect("class/block");
            fs::create_dir_all(sys.join("devices")).expect("devices");
            fs::create_dir_all(&dev).expect("dev");
            let catalog = BlockCatalog::new(&sys, &dev);
            Self {
                _dir: dir,
                catalog,
                sys,
                dev,
            }
        }

        /// Adds a device under a PCI function and links it into class/block.
        fn add(&self, name: &str, pci: Option<(&str, &str)>, sectors: u64, node: &[u8]) {
            let func = self.sys.join("devices/pci0000:00/0000:00:1f.2");
            let dir = func.join("host0/block").join(name);
            fs::create_dir_all(&dir).expect("device dir");
            if let Some((vendor, device)) = pci {
                fs::write(func.join("vendor"), format!("{vendor}\n")).expect("vendor");
                fs::write(func.join("device"), format!("{device}\n")).expect("device");
            }
            fs::write(dir.join("size"), format!("{sectors}\n")).expect("size");
            symlink(&dir, self.sys.join("class/block").join(name)).expect("symlink");
            fs::write(self.dev.join(name), node).expect("node");
        }
    }

    fn fat32_image() -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        buf[0x52..0x5a].copy_from_slice(b"FAT32   ");
        buf[0x43..0x47].copy_from_slice(&[0x44, 0x33, 0x22, 0x11]);
        buf
    }

    fn gpt_disk(parts: &[Partition]) -> Vec<u8> {
        let table =
            PartitionTable::create(512, 4096, Uuid::from_u128(7), parts).expect("create table");
        let mut disk = Cursor::new(vec![0u8; 4096 * 512]);
        table.write(&mut disk, 512).expect("write table");
        disk.into_inner()
    }

    #[test]
    fn enumerates_sorted_and_sniffs() {
        let sys = FakeSys::new();
        sys.add("sdb", None, 8, &[0u8; 16]);
        sys.add("sda1", None, 8, &fat32_image());

        let devices = sys.catalog.enumerate().expect("enumerate");
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["sda1", "sdb"]);
        assert_eq!(devices[0].fs_uuid.as_deref(), Some("1122-3344"));
        assert_eq!(devices[1].fs_type, None);
    }

    #[test]
    fn zero_size_devices_are_dropped() {
        let sys = FakeSys::new();
        sys.add("loop0", None, 0, &[]);
        sys.add("sda", None, 2048, &[]);
        let devices = sys.catalog.enumerate().expect("enumerate");
        let kept = sys.catalog.filter_zero_size(&devices);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "sda");
    }

    #[test]
    fn gpt_filters_match_partitions_in_list() {
        let sys = FakeSys::new();
        let esp = Uuid::from_u128(0x1111);
        let parts = [
            Partition::new(EFI_SYSTEM_PARTITION, esp, 34, 1000).with_name("EFI System"),
            Partition::new(Uuid::from_u128(0x99), Uuid::from_u128(0x2222), 1001, 2000)
                .with_name("root"),
        ];
        sys.add("nvme0n1", None, 4096, &gpt_disk(&parts));
        sys.add("nvme0n1p1", None, 966, &fat32_image());
        sys.add("nvme0n1p2", None, 1000, &[]);

        let devices = sys.catalog.enumerate().expect("enumerate");

        let efi = sys.catalog.filter_efi_system_partitions(&devices);
        assert_eq!(filter_name(&efi, "nvme0n1p1").len(), 1);
        assert_eq!(efi.len(), 1);

        let by_label = sys.catalog.filter_part_label(&devices, "ROOT");
        assert_eq!(by_label[0].name, "nvme0n1p2");

        let by_guid = sys
            .catalog
            .partitions_by_guid(&devices, &esp.to_string().to_uppercase());
        assert_eq!(by_guid[0].name, "nvme0n1p1");

        let by_fs = sys.catalog.filter_fs_uuid(&devices, "1122-3344");
        assert_eq!(by_fs[0].name, "nvme0n1p1");
    }

    #[test]
    fn having_partitions_checks_sysfs() {
        let sys = FakeSys::new();
        sys.add("sda", None, 8, &[]);
        sys.add("sda5", None, 8, &[]);
        sys.add("sda6", None, 8, &[]);
        sys.add("sdb", None, 8, &[]);
        sys.add("sdb5", None, 8, &[]);
        let devices = sys.catalog.enumerate().expect("enumerate");
        let having = sys.catalog.filter_having_partitions(&devices, &[5, 6]);
        assert_eq!(having.len(), 1);
        assert_eq!(having[0].name, "sda");
    }

    #[test]
    fn pci_lists_treat_unbacked_devices_differently() {
        let sys = FakeSys::new();
        sys.add("sda", Some(("0x8086", "0x2922")), 8, &[]);
        let virt = sys.sys.join("devices/virtual/block/ram0");
        fs::create_dir_all(&virt).expect("virtual");
        symlink(&virt, sys.sys.join("class/block/ram0")).expect("symlink");
        fs::write(sys.dev.join("ram0"), b"").expect("node");

        let devices = sys.catalog.enumerate().expect("enumerate");
        assert_eq!(
            sys.catalog.pci_of("sda"),
            Some(PciId { vendor: 0x8086, device: 0x2922 })
        );

        let list: PciList = "8086:2922".parse().expect("list");
        let allowed = sys.catalog.filter_allow_pci(&devices, &list);
        assert_eq!(allowed.len(), 1);
        assert_eq!(allowed[0].name, "sda");

        let kept = sys.catalog.filter_block_pci(&devices, &list);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "ram0");
    }

    #[test]
    fn filter_names_accepts_paths() {
        let devices = vec![BlockDevice::new("sda1"), BlockDevice::new("sda2")];
        let found = filter_names(&devices, &["/dev/sda2", "/sys/class/block/sda9"]);
        assert_eq!(found, vec![BlockDevice::new("sda2")]);
    }

    #[test]
    fn block_size_falls_back_to_512_for_regular_files() {
        let sys = FakeSys::new();
        sys.add("sda", None, 8, &[0u8; 512]);
        assert_eq!(sys.catalog.block_size("sda"), 512);
    }
}
