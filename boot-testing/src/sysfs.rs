// SPDX-License-Identifier: GPL-3.0-only

//! A throwaway `/sys` + `/dev` pair for driving the device catalog

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use boot_sys::BlockCatalog;
use boot_types::compose_part_name;

use crate::errors::{Result, io_at};
use crate::temp::TempDir;

const SECTOR: usize = 512;

pub struct FakeSystem {
    root: TempDir,
    sys: PathBuf,
    dev: PathBuf,
}

impl FakeSystem {
    pub fn new() -> Result<Self> {
        let root = TempDir::new("sysfs")?;
        let sys = root.subdir("sys")?;
        root.subdir("sys/class/block")?;
        root.subdir("sys/devices/virtual/block")?;
        let dev = root.subdir("dev")?;
        Ok(Self { root, sys, dev })
    }

    pub fn catalog(&self) -> BlockCatalog {
        BlockCatalog::new(&self.sys, &self.dev)
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn dev_dir(&self) -> &Path {
        &self.dev
    }

    /// A device with no PCI parent. Its size is the node length rounded up
    /// to whole sectors, so an empty node is a zero-size device.
    pub fn add_device(&self, name: &str, node: &[u8]) -> Result<()> {
        let dir = self.sys.join("devices/virtual/block").join(name);
        self.register(name, &dir, node.len().div_ceil(SECTOR) as u64, node)
    }

    /// A disk behind the PCI function `vendor:device`.
    pub fn add_pci_device(&self, name: &str, vendor: u16, device: u16, node: &[u8]) -> Result<()> {
        let bus = self.sys.join("devices/pci0000:00");
        let slot = fs::read_dir(&bus).map(|entries| entries.count()).unwrap_or(0);
        let function = bus.join(format!("0000:00:{:02x}.0", slot + 1));
        fs::create_dir_all(&function).map_err(io_at(&function))?;
        for (file, value) in [("vendor", vendor), ("device", device)] {
            let path = function.join(file);
            fs::write(&path, format!("0x{value:04x}\n")).map_err(io_at(&path))?;
        }
        let dir = function.join("host0/block").join(name);
        self.register(name, &dir, node.len().div_ceil(SECTOR) as u64, node)
    }

    /// Partition `number` of `parent`, nested under the parent's sysfs entry
    /// like the kernel does.
    pub fn add_partition(&self, parent: &str, number: usize, node: &[u8]) -> Result<String> {
        let name = compose_part_name(parent, number);
        let link = self.sys.join("class/block").join(parent);
        let parent_dir = fs::canonicalize(&link).map_err(io_at(&link))?;
        let dir = parent_dir.join(&name);
        fs::write(self.sys_dir_file(&dir, "partition")?, format!("{number}\n"))
            .map_err(io_at(dir.join("partition")))?;
        self.register(&name, &dir, node.len().div_ceil(SECTOR) as u64, node)?;
        Ok(name)
    }

    fn sys_dir_file(&self, dir: &Path, file: &str) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(io_at(dir))?;
        Ok(dir.join(file))
    }

    fn register(&self, name: &str, dir: &Path, sectors: u64, node: &[u8]) -> Result<()> {
        let size = self.sys_dir_file(dir, "size")?;
        fs::write(&size, format!("{sectors}\n")).map_err(io_at(&size))?;
        let link = self.sys.join("class/block").join(name);
        symlink(dir, &link).map_err(io_at(&link))?;
        let node_path = self.dev.join(name);
        fs::write(&node_path, node).map_err(io_at(&node_path))?;
        Ok(())
    }
}
