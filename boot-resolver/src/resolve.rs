// SPDX-License-Identifier: GPL-3.0-only

//! Local disk discovery
//!
//! Every device first gets a chance at the fixed-layout formats that are read
//! without mounting the whole device. Only when those find nothing is the
//! device mounted read-only and handed to the bootloader config parsers.
//! The merged list is sorted by rank, highest first, keeping discovery order
//! among equals.

use std::cmp::Reverse;
use std::path::Path;

use boot_config::bls::{self, BlsContext};
use boot_config::{ConfigError, PoolResolver, Schemes, esxi, grub, ipxe, syslinux};
use boot_config::locator::dir_file_url;
use boot_sys::mount::read_only;
use boot_sys::{BlockCatalog, MountPool, UpdateFilter};
use boot_types::{BlockDevice, BootImage, ByteSource, FsType, LinuxImage, PciList};
use tracing::{debug, info, warn};

use crate::error::{ResolveError, Result};

/// Local iPXE scripts, relative to a filesystem root.
const IPXE_PROBE_FILES: &[&str] = &["boot.ipxe", "boot/boot.ipxe"];

/// Which devices take part in discovery.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilters {
    pub block_pci: Option<PciList>,
    pub allow_pci: Option<PciList>,
}

/// Enumerates block devices and drops the ones that cannot hold anything
/// bootable or are excluded by PCI lists.
pub fn find_devices(catalog: &BlockCatalog, filters: &DeviceFilters) -> Result<Vec<BlockDevice>> {
    let mut devices = catalog.filter_zero_size(&catalog.enumerate()?);
    if let Some(block) = &filters.block_pci {
        devices = catalog.filter_block_pci(&devices, block);
    }
    if let Some(allow) = &filters.allow_pci {
        devices = catalog.filter_allow_pci(&devices, allow);
    }
    if devices.is_empty() {
        return Err(ResolveError::NoDevices);
    }
    info!(
        devices = ?devices.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
        "block devices"
    );
    Ok(devices)
}

/// Stable sort by descending rank.
pub fn sort_by_rank(images: &mut [BootImage]) {
    images.sort_by_key(|image| Reverse(image.rank()));
}

/// Rewrites the command line of every Linux image through `filter`.
pub fn apply_cmdline_filter(images: &mut [BootImage], filter: &UpdateFilter) {
    if filter.is_noop() {
        return;
    }
    for image in images.iter_mut() {
        if let BootImage::Linux(linux) = image {
            match filter.update_from_proc(&linux.cmdline) {
                Ok(cmdline) => linux.cmdline = cmdline,
                Err(e) => {
                    warn!(image = %linux.label(), error = %e, "could not read running kernel command line");
                    linux.cmdline = filter.update(&linux.cmdline, "");
                }
            }
        }
    }
}

fn looks_like_cdrom(device: &BlockDevice) -> bool {
    device.fs_type == Some(FsType::Iso9660) || device.name.starts_with("sr")
}

/// Logs a parser outcome. Missing configs are expected and stay quiet.
fn collect<T>(format: &str, device: &BlockDevice, result: std::result::Result<T, ConfigError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e @ ConfigError::NoConfig(_)) => {
            debug!(format, device = %device.name, error = %e, "no config");
            None
        }
        Err(e) if e.is_url_error() => {
            debug!(format, device = %device.name, error = %e, "no config");
            None
        }
        Err(e) => {
            warn!(format, device = %device.name, error = %e, "config rejected");
            None
        }
    }
}

/// Runs discovery over a set of devices, keeping every mount in `pool`.
pub struct Resolver<'a> {
    catalog: &'a BlockCatalog,
    pool: &'a mut MountPool,
    schemes: Schemes,
    bls_rank: Option<i32>,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a BlockCatalog, pool: &'a mut MountPool) -> Self {
        Self {
            catalog,
            pool,
            schemes: Schemes::local(),
            bls_rank: bls::rank_from_env(),
        }
    }

    pub fn with_schemes(mut self, schemes: Schemes) -> Self {
        self.schemes = schemes;
        self
    }

    /// Overrides the rank of every BLS image.
    pub fn with_bls_rank(mut self, rank: Option<i32>) -> Self {
        self.bls_rank = rank;
        self
    }

    /// Candidates from every device, highest rank first.
    pub fn resolve(&mut self, devices: &[BlockDevice]) -> Vec<BootImage> {
        let mut images = Vec::new();
        for device in devices {
            let mut found = self.probe_unmounted(device);
            if found.is_empty() {
                found = self.probe_mounted(device, devices);
            }
            if !found.is_empty() {
                info!(device = %device.name, images = found.len(), "found boot images");
            }
            images.extend(found);
        }
        sort_by_rank(&mut images);
        images
    }

    /// Formats with their own fixed partition layout.
    fn probe_unmounted(&mut self, device: &BlockDevice) -> Vec<BootImage> {
        if looks_like_cdrom(device) {
            return match esxi::load_cdrom(self.pool, device) {
                Ok(image) => vec![image.into()],
                Err(e) => {
                    debug!(device = %device.name, error = %e, "not an ESXi installer");
                    Vec::new()
                }
            };
        }
        if device.fs_type.is_some() {
            return Vec::new();
        }
        match esxi::load_disk(self.catalog, self.pool, device) {
            Ok(images) => images.into_iter().map(BootImage::from).collect(),
            Err(e) => {
                debug!(device = %device.name, error = %e, "not an ESXi disk");
                Vec::new()
            }
        }
    }

    fn probe_mounted(&mut self, device: &BlockDevice, devices: &[BlockDevice]) -> Vec<BootImage> {
        let mount = match self.pool.try_mount(device, read_only()) {
            Ok(mount) => mount,
            Err(e) => {
                debug!(device = %device.name, error = %e, "not mountable");
                return Vec::new();
            }
        };
        let root = mount.path.as_path();
        let mut images = Vec::new();

        let grub = {
            let mut search = PoolResolver::new(self.catalog, devices, self.pool);
            collect(
                "grub",
                device,
                grub::parse_local_config(&self.schemes, &mut search, root),
            )
        };
        let mut bls_context = BlsContext {
            rank_override: self.bls_rank,
            ..BlsContext::default()
        };
        if let Some(config) = grub {
            bls_context.saved_entry = config.saved_entry().map(str::to_string);
            bls_context.variables = config.variables;
            images.extend(config.images);
        }

        if let Some(found) = collect("syslinux", device, syslinux::parse_local_config(&self.schemes, root)) {
            images.extend(found);
        }
        if let Some(found) = collect("bls", device, bls::scan_entries(root, &bls_context)) {
            images.extend(found);
        }
        images.extend(self.probe_ipxe(device, root));
        images
    }

    fn probe_ipxe(&self, device: &BlockDevice, root: &Path) -> Vec<BootImage> {
        let mut images = Vec::new();
        for name in IPXE_PROBE_FILES {
            let path = root.join(name);
            if !path.is_file() {
                continue;
            }
            let parsed = dir_file_url(root)
                .and_then(|wd| Ok(wd.join(name)?))
                .and_then(|url| ipxe::parse_config(&self.schemes, &url));
            if let Some(Some(mut image)) = collect("ipxe", device, parsed) {
                image.name = format!("iPXE script {name} on {}", device.name);
                images.push(image.into());
            }
        }
        images
    }
}

/// A single image from explicit paths on the partition with `guid`, for
/// booting a known layout without any bootloader config.
pub fn explicit_image(
    catalog: &BlockCatalog,
    pool: &mut MountPool,
    devices: &[BlockDevice],
    guid: &str,
    kernel: &str,
    initrd: Option<&str>,
    cmdline: &str,
) -> Result<BootImage> {
    let device = catalog
        .partitions_by_guid(devices, guid)
        .into_iter()
        .next()
        .ok_or_else(|| ResolveError::PartitionNotFound(guid.to_string()))?;
    let mount = pool.try_mount(&device, read_only())?;
    let under_root = |name: &str| mount.path.join(name.trim_start_matches('/'));

    let mut image = LinuxImage::new(
        format!("{kernel} from {}", device.name),
        ByteSource::file(under_root(kernel)),
    );
    image.initrd = initrd.map(|initrd| ByteSource::file(under_root(initrd)));
    image.cmdline = cmdline.to_string();
    Ok(image.into())
}
