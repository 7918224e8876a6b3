// SPDX-License-Identifier: GPL-3.0-only

//! Boot Loader Specification entries
//!
//! One `*.conf` file per entry under `loader/entries`. Entries are ordered
//! by the `default` glob of `loader/loader.conf`, then by identifier, newest
//! (highest sorting) first.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use boot_types::{BootImage, ByteSource, LinuxImage};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};

const ENTRY_DIRS: &[&str] = &["loader/entries", "boot/loader/entries"];
const DEFAULT_RANK: i32 = 1;

/// Environment variable that overrides the rank of every BLS image.
pub const RANK_ENV: &str = "BLS_BOOT_RANK";

/// Rank override from [`RANK_ENV`], if set to an integer.
pub fn rank_from_env() -> Option<i32> {
    env::var(RANK_ENV).ok()?.trim().parse().ok()
}

/// Inputs coming from the surrounding GRUB setup.
#[derive(Debug, Clone, Default)]
pub struct BlsContext {
    /// GRUB variables, for `$kernelopts` and `$tuned_params`.
    pub variables: HashMap<String, String>,
    /// GRUB's `saved_entry`; the entry with this identifier ranks higher.
    pub saved_entry: Option<String>,
    pub rank_override: Option<i32>,
}

/// `key value` pairs in file order. Repeated keys keep every occurrence.
pub fn parse_conf(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(str::trim)
        .filter_map(|line| line.split_once(char::is_whitespace))
        .map(|(key, value)| (key.to_string(), value.trim().to_string()))
        .collect()
}

fn first<'a>(vals: &'a [(String, String)], key: &str) -> Option<&'a str> {
    vals.iter()
        .find(|(k, _)| k == key)
        .map(|(_, value)| value.as_str())
}

/// Entry paths are relative to `loader/` unless absolute.
fn file_path(root: &Path, value: &str) -> PathBuf {
    match value.strip_prefix('/') {
        Some(absolute) => root.join(absolute),
        None => root.join("loader").join(value),
    }
}

fn open(root: &Path, value: &str) -> Result<ByteSource> {
    let path = file_path(root, value);
    if !path.is_file() {
        return Err(ConfigError::Bls(format!("{} does not exist", path.display())));
    }
    Ok(ByteSource::file(path))
}

fn grub_value<'a>(ctx: &'a BlsContext, key: &str) -> Option<&'a str> {
    ctx.variables
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn parse_linux(
    vals: &[(String, String)],
    root: &Path,
    ctx: &BlsContext,
    saved: bool,
) -> Result<LinuxImage> {
    let mut kernel = None;
    let mut initrd = None;
    let mut cmdline: Vec<String> = Vec::new();

    for (key, value) in vals {
        match key.as_str() {
            "linux" => kernel = Some(open(root, value)?),
            "initrd" => {
                let path = value.split_whitespace().next().unwrap_or(value);
                initrd = Some(open(root, path)?);
            }
            "devicetree" => {
                return Err(ConfigError::Bls(
                    "devicetree attribute unsupported for Linux entries".to_string(),
                ));
            }
            "options" => {
                for word in value.split_whitespace() {
                    match word {
                        "$kernelopts" => {
                            let opts = grub_value(ctx, "kernelopts")
                                .or_else(|| {
                                    debug!("kernelopts is empty, trying default_kernelopts");
                                    grub_value(ctx, "default_kernelopts")
                                })
                                .ok_or_else(|| {
                                    ConfigError::Bls("no valid kernelopts is found".to_string())
                                })?;
                            cmdline.push(opts.to_string());
                        }
                        "$tuned_params" => {
                            if let Some(params) = grub_value(ctx, "tuned_params") {
                                cmdline.push(params.to_string());
                            }
                        }
                        word => cmdline.push(word.to_string()),
                    }
                }
            }
            _ => {}
        }
    }

    let kernel = kernel.ok_or_else(|| {
        ConfigError::Bls("malformed Linux config: linux keyword missing".to_string())
    })?;

    let name = ["title", "version"]
        .iter()
        .filter_map(|key| first(vals, key))
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let mut image = LinuxImage::new(name, kernel);
    image.initrd = initrd;
    image.cmdline = cmdline.join(" ");
    image.rank = ctx
        .rank_override
        .unwrap_or(if saved { DEFAULT_RANK + 1 } else { DEFAULT_RANK });
    Ok(image)
}

fn parse_entry(vals: &[(String, String)], root: &Path, ctx: &BlsContext, saved: bool) -> Result<LinuxImage> {
    if first(vals, "linux").is_some() {
        parse_linux(vals, root, ctx, saved)
    } else if first(vals, "multiboot").is_some() {
        Err(ConfigError::Bls("multiboot not yet supported".to_string()))
    } else if first(vals, "efi").is_some() {
        Err(ConfigError::Bls("EFI not yet supported".to_string()))
    } else {
        Err(ConfigError::Bls(
            "neither linux, efi, nor multiboot present in BootLoaderSpec config".to_string(),
        ))
    }
}

/// Shell-style match supporting `*`, `?` and `[...]` classes. Only the most
/// recent `*` is ever revisited, so matching is linear in the pattern times
/// the name.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    /// Length of the class at the start of `pattern` and whether it holds
    /// `c`. `None` when the class is never closed.
    fn class(pattern: &[char], c: char) -> Option<(bool, usize)> {
        let mut i = 1;
        let negate = matches!(pattern.get(i), Some('!' | '^'));
        if negate {
            i += 1;
        }
        let mut matched = false;
        let start = i;
        while i < pattern.len() && (pattern[i] != ']' || i == start) {
            if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
                matched |= pattern[i] <= c && c <= pattern[i + 2];
                i += 3;
            } else {
                matched |= pattern[i] == c;
                i += 1;
            }
        }
        (i < pattern.len()).then_some((matched != negate, i + 1))
    }

    /// Pattern length consumed when the token at the start of `pattern`
    /// matches the single character `c`.
    fn single(pattern: &[char], c: char) -> Option<usize> {
        match pattern.first()? {
            '?' => Some(1),
            '[' => match class(pattern, c) {
                Some((true, len)) => Some(len),
                Some((false, _)) => None,
                None => (c == '[').then_some(1),
            },
            p => (*p == c).then_some(1),
        }
    }

    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    // Pattern position after the last `*` and the name position it resumes from.
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if pattern.get(p) == Some(&'*') {
            p += 1;
            star = Some((p, n));
            continue;
        }
        if let Some(len) = single(&pattern[p.min(pattern.len())..], name[n]) {
            p += len;
            n += 1;
            continue;
        }
        match star {
            Some((after, from)) => {
                p = after;
                n = from + 1;
                star = Some((after, n));
            }
            None => return false,
        }
    }
    pattern[p.min(pattern.len())..].iter().all(|c| *c == '*')
}

fn entry_files(root: &Path) -> Vec<PathBuf> {
    for dir in ENTRY_DIRS {
        let Ok(entries) = fs::read_dir(root.join(dir)) else {
            continue;
        };
        let files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "conf"))
            .collect();
        if !files.is_empty() {
            return files;
        }
    }
    Vec::new()
}

/// Orders identifiers: those matching `pattern` first, each group in
/// descending order.
fn sort_identifiers(pattern: &str, mut identifiers: Vec<String>) -> Vec<String> {
    identifiers.sort_by(|a, b| b.cmp(a));
    let (mut ranked, others): (Vec<String>, Vec<String>) = identifiers
        .into_iter()
        .partition(|ident| glob_match(pattern, ident));
    ranked.extend(others);
    ranked
}

/// Scans the filesystem at `root` for BLS entries. Entries that fail to
/// parse are logged and skipped.
pub fn scan_entries(root: &Path, ctx: &BlsContext) -> Result<Vec<BootImage>> {
    let files = entry_files(root);
    if files.is_empty() {
        return Err(ConfigError::NoConfig(format!(
            "no BootLoaderSpec entries found in {}",
            root.display()
        )));
    }

    let loader_conf = fs::read_to_string(root.join("loader/loader.conf"))
        .map(|contents| parse_conf(&contents))
        .unwrap_or_default();
    let pattern = first(&loader_conf, "default").unwrap_or("*").to_string();

    let mut images: HashMap<String, LinuxImage> = HashMap::new();
    for file in &files {
        let Some(identifier) = file.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        let saved = ctx.saved_entry.as_deref() == Some(identifier.as_str());
        let parsed = fs::read_to_string(file)
            .map_err(ConfigError::from)
            .and_then(|contents| parse_entry(&parse_conf(&contents), root, ctx, saved));
        match parsed {
            Ok(image) => {
                images.insert(identifier, image);
            }
            Err(e) => warn!(entry = %file.display(), error = %e, "skipping BootLoaderSpec entry"),
        }
    }

    let order = sort_identifiers(&pattern, images.keys().cloned().collect());
    let ranked: Vec<BootImage> = order
        .into_iter()
        .filter_map(|ident| images.remove(&ident))
        .map(BootImage::from)
        .collect();
    info!(root = %root.display(), entries = ranked.len(), default = pattern.as_str(), "scanned BootLoaderSpec entries");
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Disk {
        dir: tempfile::TempDir,
    }

    impl Disk {
        fn new() -> Self {
            let disk = Self {
                dir: tempfile::tempdir().expect("tempdir"),
            };
            disk.write("vmlinuz-5.14", "kernel");
            disk.write("initramfs-5.14.img", "initrd");
            disk
        }

        fn write(&self, name: &str, contents: &str) {
            let path = self.dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("mkdir");
            }
            fs::write(path, contents).expect("write");
        }

        fn entry(&self, id: &str, contents: &str) {
            self.write(&format!("loader/entries/{id}.conf"), contents);
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }
    }

    fn ctx(vars: &[(&str, &str)]) -> BlsContext {
        BlsContext {
            variables: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn linux(image: &BootImage) -> &LinuxImage {
        match image {
            BootImage::Linux(image) => image,
            other => panic!("expected linux image, got {other}"),
        }
    }

    #[test]
    fn parses_a_fedora_entry() {
        let disk = Disk::new();
        disk.entry(
            "abc-5.14",
            "# comment\ntitle Fedora Linux\nversion 5.14\nlinux /vmlinuz-5.14\n\
             initrd /initramfs-5.14.img $tuned_initrd\noptions $kernelopts $tuned_params\noptions quiet\n",
        );
        let images = scan_entries(
            disk.root(),
            &ctx(&[("kernelopts", "root=/dev/sda2 ro"), ("tuned_params", "")]),
        )
        .expect("scan");
        let image = linux(&images[0]);
        assert_eq!(image.name, "Fedora Linux 5.14");
        assert_eq!(image.cmdline, "root=/dev/sda2 ro quiet");
        assert_eq!(image.rank, 1);
        assert_eq!(
            image.initrd.as_ref().and_then(|i| i.local_path()),
            Some(disk.root().join("initramfs-5.14.img").as_path())
        );
    }

    #[test]
    fn kernelopts_falls_back_to_default() {
        let disk = Disk::new();
        disk.entry("a", "linux /vmlinuz-5.14\noptions $kernelopts\n");
        let images = scan_entries(disk.root(), &ctx(&[("default_kernelopts", "ro")])).expect("scan");
        assert_eq!(images[0].cmdline(), "ro");

        let images = scan_entries(disk.root(), &ctx(&[])).expect("scan");
        assert!(images.is_empty());
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let disk = Disk::new();
        disk.entry("good", "linux /vmlinuz-5.14\n");
        disk.entry("dtb", "linux /vmlinuz-5.14\ndevicetree /board.dtb\n");
        disk.entry("nolinux", "title Nothing\n");
        disk.entry("mb", "multiboot /xen\n");
        disk.entry("missing", "linux /vmlinuz-missing\n");
        let images = scan_entries(disk.root(), &BlsContext::default()).expect("scan");
        assert_eq!(images.len(), 1);

        let vals = parse_conf("linux /vmlinuz-5.14\ndevicetree /board.dtb\n");
        let err = parse_entry(&vals, disk.root(), &BlsContext::default(), false).expect_err("dtb");
        assert!(err.to_string().contains("devicetree attribute unsupported"));
        let err = parse_entry(&parse_conf("efi /x.efi"), disk.root(), &BlsContext::default(), false)
            .expect_err("efi");
        assert!(err.to_string().contains("EFI not yet supported"));
    }

    #[test]
    fn loader_default_and_saved_entry_order() {
        let disk = Disk::new();
        for id in ["fedora-5.10", "fedora-5.14", "rescue", "fedora-5.12"] {
            disk.entry(id, &format!("title {id}\nlinux vmlinuz\n"));
        }
        disk.write("loader/vmlinuz", "k");
        disk.write("loader/loader.conf", "timeout 3\ndefault fedora-*\n");

        let ctx = BlsContext {
            saved_entry: Some("fedora-5.12".to_string()),
            ..Default::default()
        };
        let images = scan_entries(disk.root(), &ctx).expect("scan");
        let names: Vec<String> = images.iter().map(BootImage::label).collect();
        assert_eq!(names, vec!["fedora-5.14", "fedora-5.12", "fedora-5.10", "rescue"]);
        assert_eq!(images[1].rank(), 2);
        assert_eq!(images[0].rank(), 1);

        let ctx = BlsContext {
            rank_override: Some(7),
            ..ctx
        };
        assert!(scan_entries(disk.root(), &ctx)
            .expect("scan")
            .iter()
            .all(|image| image.rank() == 7));
    }

    #[test]
    fn falls_back_to_boot_loader_entries() {
        let disk = Disk::new();
        disk.write("boot/loader/entries/x.conf", "linux /vmlinuz-5.14\n");
        assert_eq!(scan_entries(disk.root(), &BlsContext::default()).expect("scan").len(), 1);

        let empty = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            scan_entries(empty.path(), &BlsContext::default()),
            Err(ConfigError::NoConfig(_))
        ));
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("fedora-*", "fedora-5.14"));
        assert!(!glob_match("fedora-*", "rescue"));
        assert!(glob_match("a?c", "abc"));
        assert!(glob_match("v[0-9].conf", "v7.conf"));
        assert!(!glob_match("v[!0-9]", "v7"));
        assert!(glob_match("[x", "[x"));
        assert!(glob_match("a*b*c", "aXXbYYbc"));
        assert!(!glob_match("a*b*c", "aXXbYYb"));
        assert!(glob_match("fedora-**", "fedora-"));
    }

    #[test]
    fn many_stars_match_in_linear_time() {
        let name = "a".repeat(40);
        let failing = format!("{}b", "*a".repeat(10));
        assert!(!glob_match(&failing, &name));
        let passing = format!("{}*", "*a".repeat(10));
        assert!(glob_match(&passing, &name));
    }
}
