// SPDX-License-Identifier: GPL-3.0-only

//! Settings file
//!
//! Every key is optional. Command-line flags override what is read here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use boot_menu::MenuOptions;
use boot_sys::UpdateFilter;
use boot_types::PciList;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ResolveError, Result};

pub const DEFAULT_PATH: &str = "/etc/boot-resolver.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub menu: MenuSettings,
    pub devices: DeviceSettings,
    pub cmdline: CmdlineSettings,
    pub netboot: NetbootSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MenuSettings {
    pub initial_timeout_secs: u64,
    pub subsequent_timeout_secs: u64,
    pub allow_edit: bool,
}

impl Default for MenuSettings {
    fn default() -> Self {
        let defaults = MenuOptions::default();
        Self {
            initial_timeout_secs: defaults.initial_timeout.as_secs(),
            subsequent_timeout_secs: defaults.subsequent_timeout.as_secs(),
            allow_edit: defaults.allow_edit,
        }
    }
}

impl MenuSettings {
    pub fn options(&self) -> MenuOptions {
        MenuOptions {
            initial_timeout: Duration::from_secs(self.initial_timeout_secs),
            subsequent_timeout: Duration::from_secs(self.subsequent_timeout_secs),
            allow_edit: self.allow_edit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// PCI devices to skip, `vendor:device,...` in hex.
    pub block_list: Option<String>,
    /// If set, only devices behind these PCI functions are considered.
    pub allow_list: Option<String>,
    /// Where the mount pool creates its private directory.
    pub mount_root: PathBuf,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            block_list: None,
            allow_list: None,
            mount_root: std::env::temp_dir(),
        }
    }
}

fn parse_pci(field: &str, value: Option<&str>) -> Result<Option<PciList>> {
    value
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value.parse::<PciList>().map_err(|e| ResolveError::Settings {
                path: PathBuf::from(field),
                reason: e.to_string(),
            })
        })
        .transpose()
}

impl DeviceSettings {
    pub fn block_pci(&self) -> Result<Option<PciList>> {
        parse_pci("devices.block_list", self.block_list.as_deref())
    }

    pub fn allow_pci(&self) -> Result<Option<PciList>> {
        parse_pci("devices.allow_list", self.allow_list.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmdlineSettings {
    pub append: String,
    pub remove: Vec<String>,
    pub reuse: Vec<String>,
}

impl Default for CmdlineSettings {
    fn default() -> Self {
        Self {
            append: String::new(),
            remove: vec!["console".to_string()],
            reuse: vec!["console".to_string()],
        }
    }
}

impl CmdlineSettings {
    pub fn filter(&self) -> UpdateFilter {
        UpdateFilter::new(self.append.clone(), self.remove.clone(), self.reuse.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetbootSettings {
    /// Bound on a single lease attempt.
    pub timeout_secs: u64,
    pub retries: u32,
    /// Interfaces to try; empty means every non-loopback interface.
    pub interfaces: Vec<String>,
}

impl Default for NetbootSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 3,
            retries: 3,
            interfaces: Vec::new(),
        }
    }
}

impl NetbootSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub dir: PathBuf,
    pub to_file: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/run/boot-resolver"),
            to_file: true,
        }
    }
}

/// Reads settings from `path`, or from [`DEFAULT_PATH`] when `None`. Only
/// the default file may be absent.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let (path, explicit) = match path {
        Some(path) => (path, true),
        None => (Path::new(DEFAULT_PATH), false),
    };

    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound && !explicit => {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Settings::default());
        }
        Err(e) => {
            return Err(ResolveError::Settings {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };
    parse(&raw, path)
}

pub fn parse(raw: &str, path: &Path) -> Result<Settings> {
    toml::from_str(raw).map_err(|e| ResolveError::Settings {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let settings = parse("", Path::new("test.toml")).expect("parse");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.menu.options(), MenuOptions::default());
        assert_eq!(settings.cmdline.remove, ["console"]);
        assert_eq!(settings.netboot.retries, 3);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let settings = parse(
            "[menu]\ninitial_timeout_secs = 2\nallow_edit = true\n\n[devices]\nblock_list = \"8086:1234\"\n",
            Path::new("test.toml"),
        )
        .expect("parse");
        assert_eq!(settings.menu.initial_timeout_secs, 2);
        assert_eq!(settings.menu.subsequent_timeout_secs, 60);
        assert!(settings.menu.allow_edit);
        let block = settings.devices.block_pci().expect("pci").expect("list");
        assert_eq!(block.ids().len(), 1);
        assert!(settings.devices.allow_pci().expect("pci").is_none());
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(parse("[menu]\ninitial_timeout_secs = \"soon\"", Path::new("t.toml")).is_err());

        let settings = parse("[devices]\nallow_list = \"nope\"", Path::new("t.toml")).expect("parse");
        assert!(matches!(settings.devices.allow_pci(), Err(ResolveError::Settings { .. })));
    }

    #[test]
    fn only_the_default_file_may_be_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing.toml");
        assert!(matches!(load(Some(&missing)), Err(ResolveError::Settings { .. })));

        let present = dir.path().join("boot.toml");
        fs::write(&present, "[log]\nto_file = false\n").expect("write");
        assert!(!load(Some(&present)).expect("load").log.to_file);
    }
}
