// SPDX-License-Identifier: GPL-3.0-only

//! VMware ESXi boot banks
//!
//! An installed ESXi disk carries two boot banks on partitions 5 and 6, each
//! with its own `boot.cfg`. The bank's `bootstate` says whether it may be
//! booted and `updated` says which one is newer. Both bootable banks are
//! returned, newest first, so the older one remains as a fallback.

use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use boot_sys::mount::read_only;
use boot_sys::{BlockCatalog, MountPool};
use boot_types::{BlockDevice, ByteSource, Module, MultibootImage, compose_part_name};
use tracing::{debug, info};

use crate::error::{ConfigError, Result};

pub const DEFAULT_TITLE: &str = "VMware ESXi";
const MODULE_SEPARATOR: &str = "---";
const UUID_MAGIC: &[u8] = b"VMWARE FAT16    ";
const UUID_SIZE: usize = 32;
/// ESXi images outrank generic finds.
const ESXI_RANK: i32 = 1;

/// State of a boot bank as recorded in its `boot.cfg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Valid,
    Upgrading,
    Dirty,
    Invalid,
}

impl BootState {
    fn from_value(value: &str) -> std::result::Result<Self, std::num::ParseIntError> {
        if value.is_empty() {
            return Ok(Self::Valid);
        }
        Ok(match value.parse::<i64>()? {
            0 => Self::Valid,
            1 => Self::Upgrading,
            2 => Self::Dirty,
            _ => Self::Invalid,
        })
    }

    pub fn is_bootable(self) -> bool {
        matches!(self, Self::Valid | Self::Upgrading)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsxiModule {
    pub path: PathBuf,
    /// The whole module segment, path included.
    pub cmdline: String,
}

/// Parsed `boot.cfg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub title: String,
    pub kernel: PathBuf,
    pub args: String,
    pub modules: Vec<EsxiModule>,
    pub updated: i64,
    pub bootstate: BootState,
}

fn join_under(dir: &Path, name: &str) -> PathBuf {
    dir.join(name.trim_start_matches('/'))
}

/// Parses `boot.cfg` contents. Paths are taken relative to `dir`.
pub fn parse_boot_cfg(contents: &str, dir: &Path, file: &str) -> Result<BootConfig> {
    let mut config = BootConfig {
        title: DEFAULT_TITLE.to_string(),
        kernel: PathBuf::new(),
        args: String::new(),
        modules: Vec::new(),
        updated: 0,
        bootstate: BootState::Invalid,
    };
    let syntax = |line: usize, message: String| ConfigError::Syntax {
        file: file.to_string(),
        line,
        message,
    };

    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(syntax(index + 1, format!("bad line {line:?}")));
        };
        let value = value.trim();
        match key.trim() {
            "title" => config.title = value.to_string(),
            "kernel" => {
                config.kernel = join_under(dir, value);
                config.args = format!("{value} {}", config.args);
            }
            "kernelopt" => config.args.push_str(value),
            "updated" => {
                config.updated = if value.is_empty() {
                    0
                } else {
                    value
                        .parse()
                        .map_err(|e| syntax(index + 1, format!("updated={value}: {e}")))?
                };
            }
            "bootstate" => {
                config.bootstate = BootState::from_value(value)
                    .map_err(|e| syntax(index + 1, format!("bootstate={value}: {e}")))?;
            }
            "modules" => {
                for segment in value.split(MODULE_SEPARATOR).map(str::trim) {
                    if let Some(path) = segment.split_whitespace().next() {
                        config.modules.push(EsxiModule {
                            path: join_under(dir, path),
                            cmdline: segment.to_string(),
                        });
                    }
                }
            }
            _ => {}
        }
    }
    Ok(config)
}

fn read_boot_cfg(path: &Path) -> Result<BootConfig> {
    let contents = fs::read_to_string(path)?;
    let dir = path.parent().unwrap_or(Path::new("/"));
    parse_boot_cfg(&contents, dir, &path.display().to_string())
}

/// The `bootUUID=` parameter from the magic in the partition's second block.
pub fn read_boot_uuid(node: &Path, block_size: u64) -> Result<String> {
    let file = File::open(node)?;
    let mut data = [0u8; UUID_SIZE];
    file.read_exact_at(&mut data, block_size)?;
    if !data.starts_with(UUID_MAGIC) {
        return Err(ConfigError::Esxi(format!(
            "bad uuid magic {:?}, want {:?}",
            String::from_utf8_lossy(&data[..UUID_MAGIC.len()]),
            String::from_utf8_lossy(UUID_MAGIC)
        )));
    }
    let hex: String = data[UUID_MAGIC.len()..]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();
    Ok(format!("bootUUID={hex}"))
}

fn image(config: &BootConfig, name: &str, boot_uuid: Option<String>) -> Result<MultibootImage> {
    if !config.bootstate.is_bootable() {
        return Err(ConfigError::Esxi(format!(
            "boot state {:?} is not bootable",
            config.bootstate
        )));
    }

    let mut image = MultibootImage::new(
        format!("{} from {name}", config.title),
        ByteSource::file(&config.kernel),
    );
    image.cmdline = config.args.trim().to_string();
    if let Some(uuid) = boot_uuid {
        image.cmdline = format!("{} {uuid}", image.cmdline);
    }
    image.modules = config
        .modules
        .iter()
        .map(|module| Module {
            name: module.path.display().to_string(),
            source: ByteSource::file(&module.path),
            cmdline: module.cmdline.clone(),
        })
        .collect();
    image.rank = ESXI_RANK;
    Ok(image)
}

/// A single `boot.cfg` outside of any boot bank.
pub fn load_config(path: &Path) -> Result<MultibootImage> {
    let config = read_boot_cfg(path).map_err(|e| {
        ConfigError::Esxi(format!("cannot parse config at {}: {e}", path.display()))
    })?;
    image(&config, &format!("config file {}", path.display()), None)
}

struct Bank {
    partition: String,
    config: BootConfig,
}

fn mount_bank(
    catalog: &BlockCatalog,
    pool: &mut MountPool,
    device: &BlockDevice,
    number: usize,
) -> Result<Bank> {
    let partition = compose_part_name(&device.name, number);
    if !catalog.device_node(&partition).exists() {
        return Err(ConfigError::Esxi(format!("{partition} does not exist")));
    }
    let mount = pool.mount_as(&BlockDevice::new(partition.clone()), "vfat", read_only())?;
    let config_file = mount.path.join("boot.cfg");
    let config = read_boot_cfg(&config_file).map_err(|e| {
        ConfigError::Esxi(format!("cannot parse config at {}: {e}", config_file.display()))
    })?;
    Ok(Bank { partition, config })
}

fn bank_image(catalog: &BlockCatalog, device: &BlockDevice, bank: &Bank) -> Result<MultibootImage> {
    let node = catalog.device_node(&bank.partition);
    let uuid = read_boot_uuid(&node, catalog.block_size(&device.name)).map_err(|e| {
        ConfigError::Esxi(format!("cannot add boot uuid of {}: {e}", bank.partition))
    })?;
    image(&bank.config, &node.display().to_string(), Some(uuid))
}

/// Both boot banks of an installed ESXi `device`, the more recently updated
/// one first. Mounts stay registered with `pool`.
pub fn load_disk(
    catalog: &BlockCatalog,
    pool: &mut MountPool,
    device: &BlockDevice,
) -> Result<Vec<MultibootImage>> {
    let bank5 = mount_bank(catalog, pool, device, 5);
    let bank6 = mount_bank(catalog, pool, device, 6);
    if let (Err(e5), Err(e6)) = (&bank5, &bank6) {
        return Err(ConfigError::Esxi(format!(
            "could not mount or read either partition 5 ({e5}) or partition 6 ({e6})"
        )));
    }

    let slot = |bank: &Result<Bank>| -> Option<(i64, Result<MultibootImage>)> {
        let bank = bank.as_ref().ok()?;
        Some((bank.config.updated, bank_image(catalog, device, bank)))
    };
    let (image5, image6) = (slot(&bank5), slot(&bank6));

    let mut ranked: Vec<(i64, MultibootImage)> = Vec::new();
    let mut errors = Vec::new();
    for (number, slot) in [(5, image5), (6, image6)] {
        match slot {
            Some((updated, Ok(image))) => ranked.push((updated, image)),
            Some((_, Err(e))) => errors.push(format!("partition {number} ({e})")),
            None => {}
        }
    }
    if ranked.is_empty() {
        return Err(ConfigError::Esxi(format!(
            "could not read boot configs on {}",
            errors.join(" or ")
        )));
    }

    // Stable: equal counters keep partition 5 first.
    ranked.sort_by(|a, b| b.0.cmp(&a.0));
    let images: Vec<MultibootImage> = ranked.into_iter().map(|(_, image)| image).collect();
    info!(device = %device.name, images = images.len(), "found ESXi boot banks");
    Ok(images)
}

/// An ESXi installer on an iso9660 `device`.
pub fn load_cdrom(pool: &mut MountPool, device: &BlockDevice) -> Result<MultibootImage> {
    let mount = pool.mount_as(device, "iso9660", read_only())?;
    let config_file = mount.path.join("boot.cfg");
    let config = read_boot_cfg(&config_file).map_err(|e| {
        ConfigError::Esxi(format!("cannot parse config from {}: {e}", device.name))
    })?;
    debug!(device = %device.name, "found ESXi installer");
    image(&config, &device.device_path().display().to_string(), None)
}
