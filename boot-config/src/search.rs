// SPDX-License-Identifier: GPL-3.0-only

//! Device lookup behind GRUB's `search` command

use std::path::Path;

use boot_sys::mount::read_only;
use boot_sys::{BlockCatalog, MountPool};
use boot_types::BlockDevice;
use tracing::debug;
use url::Url;

use crate::locator::dir_file_url;

/// What a `search` command matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    FsUuid,
    FsLabel,
    File,
}

/// Finds the filesystem a `search` command asks for.
pub trait DeviceResolver {
    /// Root URL of the first filesystem matching `key`, mounting it if
    /// needed.
    fn find(&mut self, kind: SearchKind, key: &str) -> Option<Url>;
}

/// Resolves nothing. For configs fetched over the network.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSearch;

impl DeviceResolver for NoSearch {
    fn find(&mut self, _kind: SearchKind, _key: &str) -> Option<Url> {
        None
    }
}

/// Resolves against the catalog's devices, mounting matches through the pool.
pub struct PoolResolver<'a> {
    catalog: &'a BlockCatalog,
    devices: &'a [BlockDevice],
    pool: &'a mut MountPool,
}

impl<'a> PoolResolver<'a> {
    pub fn new(
        catalog: &'a BlockCatalog,
        devices: &'a [BlockDevice],
        pool: &'a mut MountPool,
    ) -> Self {
        Self {
            catalog,
            devices,
            pool,
        }
    }

    fn mount_url(&mut self, device: &BlockDevice) -> Option<Url> {
        match self.pool.try_mount(device, read_only()) {
            Ok(mount) => dir_file_url(&mount.path).ok(),
            Err(e) => {
                debug!(device = %device.name, error = %e, "search: mount failed");
                None
            }
        }
    }
}

impl DeviceResolver for PoolResolver<'_> {
    fn find(&mut self, kind: SearchKind, key: &str) -> Option<Url> {
        let candidates = match kind {
            SearchKind::FsUuid => self.catalog.filter_fs_uuid(self.devices, key),
            SearchKind::FsLabel => self.catalog.filter_part_label(self.devices, key),
            SearchKind::File => self
                .devices
                .iter()
                .filter(|device| device.fs_type.is_some())
                .cloned()
                .collect(),
        };

        let relative = Path::new(key.trim_start_matches('/'));
        for device in &candidates {
            let Some(url) = self.mount_url(device) else {
                continue;
            };
            if kind != SearchKind::File {
                return Some(url);
            }
            if url
                .to_file_path()
                .is_ok_and(|root| root.join(relative).exists())
            {
                return Some(url);
            }
        }
        debug!(?kind, key, "search: no match");
        None
    }
}
