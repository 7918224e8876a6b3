// SPDX-License-Identifier: GPL-3.0-only

//! SYSLINUX, ISOLINUX and PXELINUX configuration
//!
//! Directives are collected per label while reading, and images are built
//! once the whole file (with its includes) has been seen, since a global
//! `append` may follow the labels that inherit it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use boot_types::{BootImage, ByteSource, LinuxImage, Module, MultibootImage};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ConfigError, Result};
use crate::locator::{Schemes, dir_file_url, resolve_under};

const PROBE_DIRS: &[&str] = &["boot/isolinux", "isolinux", "boot/syslinux", "syslinux", ""];
const PROBE_FILES: &[&str] = &["isolinux.cfg", "syslinux.cfg"];
const MAX_INCLUDE_DEPTH: usize = 8;

/// Resolves `name` against `root` and the working directory `wd` below it.
/// Absolute paths start at `root`, full URLs are taken as-is.
pub fn resolve_in(name: &str, root: &Url, wd: &str) -> Url {
    if name.starts_with('/') || wd.is_empty() {
        resolve_under(name, root)
    } else {
        resolve_under(&format!("{wd}/{name}"), root)
    }
}

#[derive(Debug, Default, Clone)]
struct Label {
    menu_label: Option<String>,
    kernel: Option<String>,
    /// Set by `linux`, which never means mboot.c32 chaining.
    forced_linux: bool,
    initrd: Option<String>,
    append: Option<String>,
    fdt: Option<String>,
}

struct Parser<'a> {
    schemes: &'a Schemes,
    root: Url,
    wd: String,
    global_append: String,
    labels: HashMap<String, Label>,
    declared: Vec<String>,
    current: Option<String>,
    default_entry: Option<String>,
    nerf_default: Option<String>,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(schemes: &'a Schemes, root: Url, wd: &str) -> Self {
        Self {
            schemes,
            root,
            wd: wd.trim_matches('/').to_string(),
            global_append: String::new(),
            labels: HashMap::new(),
            declared: Vec::new(),
            current: None,
            default_entry: None,
            nerf_default: None,
            depth: 0,
        }
    }

    fn url(&self, name: &str) -> Url {
        resolve_in(name, &self.root, &self.wd)
    }

    fn lazy(&self, name: &str) -> Result<ByteSource> {
        self.schemes.lazy_fetch(&self.url(name))
    }

    fn append_file(&mut self, name: &str) -> Result<()> {
        let url = self.url(name);
        debug!(%url, "fetching syslinux config");
        let config = self.schemes.fetch_string(&url)?;
        self.append(&config, url.as_str());
        Ok(())
    }

    fn label(&mut self) -> Option<&mut Label> {
        let current = self.current.as_ref()?;
        self.labels.get_mut(current)
    }

    fn append(&mut self, config: &str, file: &str) {
        for (index, line) in config.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (directive, arg) = match line.split_once(char::is_whitespace) {
                Some((directive, arg)) => (directive.to_lowercase(), arg.trim()),
                None => (line.to_lowercase(), ""),
            };
            let first = arg.split_whitespace().next().unwrap_or("");

            match directive.as_str() {
                "default" => self.default_entry = Some(first.to_string()),
                "nerfdefault" => self.nerf_default = Some(first.to_string()),
                "include" => {
                    if self.depth >= MAX_INCLUDE_DEPTH {
                        warn!(file, line = index + 1, include = arg, "includes nested too deeply");
                        continue;
                    }
                    self.depth += 1;
                    if let Err(e) = self.append_file(arg) {
                        warn!(file, line = index + 1, error = %e, "skipping include");
                    }
                    self.depth -= 1;
                }
                "menu" => {
                    let (sub, rest) = arg.split_once(char::is_whitespace).unwrap_or((arg, ""));
                    match sub.to_lowercase().as_str() {
                        "label" => {
                            if let Some(label) = self.label() {
                                label.menu_label = Some(rest.trim().to_string());
                            }
                        }
                        "default" => self.default_entry = self.current.clone(),
                        _ => {}
                    }
                }
                "label" => {
                    let name = arg.to_string();
                    if !self.labels.contains_key(&name) {
                        self.declared.push(name.clone());
                    }
                    self.labels.insert(name.clone(), Label::default());
                    self.current = Some(name);
                }
                "kernel" | "linux" => {
                    let forced_linux = directive == "linux";
                    match self.label() {
                        Some(label) => {
                            label.kernel = Some(first.to_string());
                            label.forced_linux = forced_linux;
                        }
                        None => debug!(file, line = index + 1, "kernel outside of a label"),
                    }
                }
                "initrd" => {
                    if let Some(label) = self.label() {
                        label.initrd = Some(arg.to_string());
                    }
                }
                "fdt" => {
                    if let Some(label) = self.label() {
                        label.fdt = Some(first.to_string());
                    }
                }
                "append" => {
                    let value = if arg == "-" { String::new() } else { arg.to_string() };
                    match self.label() {
                        Some(label) => label.append = Some(value),
                        None => self.global_append = value,
                    }
                }
                other => debug!(file, line = index + 1, directive = other, "ignoring syslinux directive"),
            }
        }
    }

    fn build(&self, key: &str, label: &Label) -> Result<Option<BootImage>> {
        let Some(kernel) = &label.kernel else {
            debug!(label = key, "label without kernel");
            return Ok(None);
        };
        let name = label.menu_label.clone().unwrap_or_else(|| key.to_string());
        let cmdline = label.append.clone().unwrap_or_else(|| self.global_append.clone());

        let is_mboot = !label.forced_linux
            && kernel
                .rsplit('/')
                .next()
                .is_some_and(|base| base.eq_ignore_ascii_case("mboot.c32"));
        if is_mboot {
            return self.build_multiboot(name, &cmdline).map(Some);
        }

        let mut image = LinuxImage::new(name, self.lazy(kernel)?);
        let initrds: Vec<&str> = match &label.initrd {
            Some(list) => list.split(',').collect(),
            None => cmdline
                .split_whitespace()
                .filter_map(|param| param.strip_prefix("initrd="))
                .flat_map(|list| list.split(','))
                .collect(),
        };
        let initrds = initrds
            .into_iter()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(|path| self.lazy(path))
            .collect::<Result<Vec<_>>>()?;
        if !initrds.is_empty() {
            image.initrd = Some(ByteSource::concat(initrds));
        }
        if let Some(fdt) = &label.fdt {
            image.dtb = Some(self.lazy(fdt)?);
        }
        image.cmdline = cmdline;
        Ok(Some(image.into()))
    }

    /// `append <kernel> <args> --- <module> <args> --- ...`
    fn build_multiboot(&self, name: String, cmdline: &str) -> Result<BootImage> {
        let mut segments = cmdline.split("---").map(str::trim);
        let first = segments.next().unwrap_or("");
        let (kernel, args) = first.split_once(char::is_whitespace).unwrap_or((first, ""));
        if kernel.is_empty() {
            return Err(ConfigError::NoConfig(format!(
                "{name}: mboot.c32 without a kernel to chain"
            )));
        }

        let mut image = MultibootImage::new(name, self.lazy(kernel)?);
        image.cmdline = args.trim().to_string();
        for segment in segments.filter(|segment| !segment.is_empty()) {
            let path = segment.split_whitespace().next().unwrap_or(segment);
            image.modules.push(Module {
                name: path.to_string(),
                source: self.lazy(path)?,
                cmdline: segment.to_string(),
            });
        }
        Ok(image.into())
    }

    fn finish(self) -> Vec<BootImage> {
        let mut order: Vec<&String> = Vec::new();
        for key in self
            .nerf_default
            .iter()
            .chain(self.default_entry.iter())
            .chain(self.declared.iter())
        {
            if self.labels.contains_key(key) && !order.contains(&key) {
                order.push(key);
            }
        }

        let mut images = Vec::new();
        for key in order {
            let Some(label) = self.labels.get(key) else {
                continue;
            };
            match self.build(key, label) {
                Ok(Some(image)) => images.push(image),
                Ok(None) => {}
                Err(e) => warn!(label = key.as_str(), error = %e, "skipping syslinux label"),
            }
        }
        images
    }
}

/// Parses `config_file` found under `root`, with `wd` as the directory
/// (relative to `root`) that relative paths and includes start from.
pub fn parse_config_file(
    schemes: &Schemes,
    config_file: &str,
    root: &Url,
    wd: &str,
) -> Result<Vec<BootImage>> {
    let mut parser = Parser::new(schemes, root.clone(), wd);
    parser.append_file(config_file)?;
    Ok(parser.finish())
}

/// Looks for an isolinux or syslinux config on the filesystem at `root`.
pub fn parse_local_config(schemes: &Schemes, root: &Path) -> Result<Vec<BootImage>> {
    let root_url = dir_file_url(root)?;
    for dir in PROBE_DIRS {
        for file in PROBE_FILES {
            match parse_config_file(schemes, file, &root_url, dir) {
                Err(e) if e.is_url_error() => continue,
                Err(e) => return Err(e),
                Ok(images) => {
                    info!(root = %root.display(), dir, file, images = images.len(), "parsed syslinux config");
                    return Ok(images);
                }
            }
        }
    }
    Err(ConfigError::NoConfig(format!(
        "no valid syslinux config found in {}",
        root.display()
    )))
}

/// PXELINUX config names in lookup order: the hardware address, the IPv4
/// address as uppercase hex with ever shorter prefixes, then `default`.
pub fn pxelinux_candidates(mac: Option<&str>, ip: Option<Ipv4Addr>) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(mac) = mac {
        names.push(format!(
            "pxelinux.cfg/01-{}",
            mac.to_lowercase().replace(':', "-")
        ));
    }
    if let Some(ip) = ip {
        let hex: String = ip.octets().iter().map(|octet| format!("{octet:02X}")).collect();
        for len in (1..=hex.len()).rev() {
            names.push(format!("pxelinux.cfg/{}", &hex[..len]));
        }
    }
    names.push("pxelinux.cfg/default".to_string());
    names
}

/// Tries every PXELINUX config name under `root`/`wd` until one is found.
pub fn parse_pxelinux(
    schemes: &Schemes,
    root: &Url,
    wd: &str,
    mac: Option<&str>,
    ip: Option<Ipv4Addr>,
) -> Result<Vec<BootImage>> {
    for name in pxelinux_candidates(mac, ip) {
        match parse_config_file(schemes, &name, root, wd) {
            Err(e) if e.is_url_error() => {
                debug!(config = name.as_str(), error = %e, "pxelinux config not found");
                continue;
            }
            other => return other,
        }
    }
    Err(ConfigError::NoConfig(format!("no pxelinux config found under {root}")))
}
