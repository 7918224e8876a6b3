// SPDX-License-Identifier: GPL-3.0-only

//! GRUB configuration interpreter
//!
//! Only the commands that decide what gets booted are evaluated:
//! `menuentry`, `linux*`, `initrd*`, `multiboot*`, `module*`, `set`,
//! `search*`, `configfile` and `blscfg`. Everything else is ignored, including
//! conditionals, so both branches of an `if` contribute their assignments.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use boot_types::{BootImage, ByteSource, LinuxImage, Module, MultibootImage};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ConfigError, Result};
use crate::locator::{Schemes, dir_file_url, resolve_under};
use crate::search::{DeviceResolver, SearchKind};
use crate::shlex;

const PROBE_FILES: &[&str] = &[
    "boot/grub/grub.cfg",
    "grub/grub.cfg",
    "grub2/grub.cfg",
    "boot/grub2/grub.cfg",
];

const ENV_FILES: &[&str] = &[
    "grub2/grubenv",
    "grub/grubenv",
    "boot/grub2/grubenv",
    "boot/grub/grubenv",
];

const MAX_INCLUDE_DEPTH: usize = 8;

/// Result of interpreting a GRUB config.
#[derive(Debug, Clone, Default)]
pub struct GrubConfig {
    /// Images in boot order, the default entry first.
    pub images: Vec<BootImage>,
    /// Final variable values, including those seeded from grubenv.
    pub variables: HashMap<String, String>,
    /// The config asked for Boot Loader Spec entries.
    pub blscfg: bool,
}

impl GrubConfig {
    pub fn saved_entry(&self) -> Option<&str> {
        self.variables.get("saved_entry").map(String::as_str)
    }
}

/// Quotes arguments the way GRUB hands them to the kernel.
pub fn cmdline_quote<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| {
            let quoted = arg
                .as_ref()
                .replace('\\', r"\\")
                .replace('\'', r"\'")
                .replace('"', "\\\"");
            if quoted.contains(' ') {
                format!("\"{quoted}\"")
            } else {
                quoted
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `key=value` lines of a grubenv block.
pub fn parse_grubenv(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

struct Parser<'a> {
    schemes: &'a Schemes,
    search: &'a mut dyn DeviceResolver,
    wd: Url,
    variables: HashMap<String, String>,
    /// Filesystems found by `search`, keyed by the value stored in the variable.
    roots: HashMap<String, Url>,

    images: Vec<BootImage>,
    linux: HashMap<String, usize>,
    multiboot: HashMap<String, usize>,
    label_order: Vec<String>,
    default_entry: Option<String>,
    num_entry: usize,
    cur_entry: String,
    cur_label: String,
    depth: usize,
    blscfg: bool,
}

impl<'a> Parser<'a> {
    fn new(schemes: &'a Schemes, search: &'a mut dyn DeviceResolver, wd: Url) -> Self {
        Self {
            schemes,
            search,
            wd,
            variables: HashMap::new(),
            roots: HashMap::new(),
            images: Vec::new(),
            linux: HashMap::new(),
            multiboot: HashMap::new(),
            label_order: Vec::new(),
            default_entry: None,
            num_entry: 0,
            cur_entry: String::new(),
            cur_label: String::new(),
            depth: 0,
            blscfg: false,
        }
    }

    fn root_url(&self) -> &Url {
        self.variables
            .get("root")
            .and_then(|root| self.roots.get(root))
            .unwrap_or(&self.wd)
    }

    /// URL of a GRUB path, honouring a leading `(device)` prefix.
    fn locate(&self, path: &str) -> Url {
        if let Some(rest) = path.strip_prefix('(')
            && let Some((device, path)) = rest.split_once(')')
        {
            let root = self.roots.get(device).unwrap_or_else(|| self.root_url());
            let path = if path.is_empty() { "/" } else { path };
            return resolve_under(path, root);
        }
        resolve_under(path, self.root_url())
    }

    fn lazy(&self, path: &str) -> Result<ByteSource> {
        self.schemes.lazy_fetch(&self.locate(path))
    }

    /// Expands `$name` and `${name}` outside single quotes. Unset variables
    /// expand to nothing.
    fn expand(&self, line: &str) -> String {
        let mut out = String::with_capacity(line.len());
        let mut chars = line.chars().peekable();
        let mut single = false;
        let mut double = false;
        while let Some(ch) = chars.next() {
            match ch {
                '\'' if !double => {
                    single = !single;
                    out.push(ch);
                }
                '"' if !single => {
                    double = !double;
                    out.push(ch);
                }
                '\\' if !single => {
                    out.push(ch);
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                '$' if !single => {
                    let mut name = String::new();
                    if chars.peek() == Some(&'{') {
                        chars.next();
                        for c in chars.by_ref() {
                            if c == '}' {
                                break;
                            }
                            name.push(c);
                        }
                    } else {
                        while let Some(&c) = chars.peek() {
                            if !(c.is_ascii_alphanumeric() || c == '_') {
                                break;
                            }
                            name.push(c);
                            chars.next();
                        }
                    }
                    if name.is_empty() {
                        out.push('$');
                    } else if let Some(value) = self.variables.get(&name) {
                        out.push_str(value);
                    }
                }
                c => out.push(c),
            }
        }
        out
    }

    fn append_file(&mut self, name: &str) -> Result<()> {
        let url = self.locate(name);
        debug!(%url, "fetching grub config");
        let config = self.schemes.fetch_string(&url)?;
        self.append(&config, url.as_str());
        Ok(())
    }

    fn append(&mut self, config: &str, file: &str) {
        for (index, line) in config.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let words = shlex::split(&self.expand(line));
            if words.is_empty() {
                continue;
            }
            if let Err(e) = self.directive(&words) {
                warn!(file, line = index + 1, error = %e, "skipping grub directive");
            }
        }
    }

    fn directive(&mut self, words: &[String]) -> Result<()> {
        let directive = words[0].to_lowercase();
        if directive == "blscfg" {
            self.blscfg = true;
            return Ok(());
        }
        if words.len() <= 1 {
            return Ok(());
        }
        let arg = words[1].as_str();

        match directive.as_str() {
            "set" => {
                if let Some((key, value)) = arg.split_once('=') {
                    if key == "default" {
                        self.default_entry = Some(value.to_string());
                    }
                    self.variables.insert(key.to_string(), value.to_string());
                }
            }
            "configfile" => {
                if self.depth >= MAX_INCLUDE_DEPTH {
                    return Err(ConfigError::NoConfig(format!(
                        "configfile {arg}: nested too deeply"
                    )));
                }
                self.depth += 1;
                let result = self.append_file(arg);
                self.depth -= 1;
                result?;
            }
            "menuentry" => {
                self.cur_entry = self.num_entry.to_string();
                self.num_entry += 1;
                self.cur_label = arg.to_string();
                self.label_order.push(self.cur_entry.clone());
                self.label_order.push(self.cur_label.clone());
            }
            "linux" | "linux16" | "linuxefi" => {
                let mut image = LinuxImage::new(self.cur_label.clone(), self.lazy(arg)?);
                image.cmdline = cmdline_quote(&words[2..]);
                let index = self.push(image.into());
                // A reload replaces the entry's kernel and forgets its initrd.
                self.linux.insert(self.cur_entry.clone(), index);
                self.linux.insert(self.cur_label.clone(), index);
            }
            "initrd" | "initrd16" | "initrdefi" => {
                let index = *self.linux.get(&self.cur_entry).ok_or_else(|| {
                    ConfigError::NoConfig("initrd without a preceding linux".to_string())
                })?;
                let initrds = words[1..]
                    .iter()
                    .map(|path| self.lazy(path))
                    .collect::<Result<Vec<_>>>()?;
                if let BootImage::Linux(image) = &mut self.images[index] {
                    image.initrd = Some(ByteSource::concat(initrds));
                }
            }
            "multiboot" | "multiboot2" => {
                let mut image = MultibootImage::new(self.cur_label.clone(), self.lazy(arg)?);
                image.cmdline = cmdline_quote(&words[2..]);
                let index = self.push(image.into());
                self.multiboot.insert(self.cur_entry.clone(), index);
                self.multiboot.insert(self.cur_label.clone(), index);
            }
            "module" | "module2" => {
                let index = *self.multiboot.get(&self.cur_entry).ok_or_else(|| {
                    ConfigError::NoConfig("module without a preceding multiboot".to_string())
                })?;
                let module = Module {
                    name: arg.to_string(),
                    source: self.lazy(arg)?,
                    cmdline: cmdline_quote(&words[1..]),
                };
                if let BootImage::Multiboot(image) = &mut self.images[index] {
                    image.modules.push(module);
                }
            }
            "search" | "search.fs_uuid" | "search.fs_label" | "search.file" => {
                self.search_directive(&directive, &words[1..]);
            }
            other => debug!(directive = other, "ignoring grub directive"),
        }
        Ok(())
    }

    fn search_directive(&mut self, directive: &str, args: &[String]) {
        let mut kind = match directive {
            "search.fs_uuid" => SearchKind::FsUuid,
            "search.fs_label" => SearchKind::FsLabel,
            _ => SearchKind::File,
        };
        let mut var = "root".to_string();
        let mut positional = Vec::new();
        for arg in args {
            match arg.as_str() {
                "--fs-uuid" | "-u" => kind = SearchKind::FsUuid,
                "--label" | "-l" => kind = SearchKind::FsLabel,
                "--file" | "-f" => kind = SearchKind::File,
                "--set" | "-s" => var = "root".to_string(),
                flag if flag.starts_with("--set=") => var = flag["--set=".len()..].to_string(),
                flag if flag.starts_with('-') => {}
                value => positional.push(value.to_string()),
            }
        }
        let Some(key) = positional.first().cloned() else {
            return;
        };
        // The aliases take the variable name as a second operand.
        if directive != "search"
            && let Some(name) = positional.get(1)
        {
            var = name.clone();
        }

        match self.search.find(kind, &key) {
            Some(url) => {
                debug!(?kind, key, %url, var, "search matched");
                self.roots.insert(key.clone(), url);
                self.variables.insert(var, key);
            }
            None => debug!(?kind, key, "search found nothing"),
        }
    }

    fn push(&mut self, image: BootImage) -> usize {
        self.images.push(image);
        self.images.len() - 1
    }

    fn finish(mut self) -> GrubConfig {
        let mut order = std::mem::take(&mut self.label_order);
        if let Some(default) = &self.default_entry {
            order.insert(0, default.clone());
        }

        let mut seen_linux = Vec::new();
        let mut seen_multiboot = Vec::new();
        let mut picked = Vec::new();
        for label in &order {
            if let Some(&index) = self.linux.get(label)
                && !seen_linux.contains(&index)
            {
                seen_linux.push(index);
                picked.push(index);
            }
            if let Some(&index) = self.multiboot.get(label)
                && !seen_multiboot.contains(&index)
            {
                seen_multiboot.push(index);
                picked.push(index);
            }
        }

        let images = picked
            .into_iter()
            .map(|index| self.images[index].clone())
            .collect();
        GrubConfig {
            images,
            variables: self.variables,
            blscfg: self.blscfg,
        }
    }
}

/// Interprets `config_file`, resolved against `wd`, and everything it
/// includes.
pub fn parse_config_file(
    schemes: &Schemes,
    search: &mut dyn DeviceResolver,
    config_file: &str,
    wd: &Url,
    variables: HashMap<String, String>,
) -> Result<GrubConfig> {
    let mut parser = Parser::new(schemes, search, wd.clone());
    parser.variables = variables;
    parser.append_file(config_file)?;
    Ok(parser.finish())
}

/// Interprets GRUB config text that has already been read.
pub fn parse_config(
    schemes: &Schemes,
    search: &mut dyn DeviceResolver,
    config: &str,
    wd: &Url,
) -> GrubConfig {
    let mut parser = Parser::new(schemes, search, wd.clone());
    parser.append(config, "<inline>");
    parser.finish()
}

fn efi_configs(root: &Path) -> Vec<String> {
    let mut found = Vec::new();
    for efi in ["EFI", "efi"] {
        let Ok(entries) = fs::read_dir(root.join(efi)) else {
            continue;
        };
        let mut vendors: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        vendors.sort();
        found.extend(vendors.into_iter().map(|vendor| format!("{efi}/{vendor}/grub.cfg")));
    }
    found
}

fn read_grubenv(schemes: &Schemes, wd: &Url) -> HashMap<String, String> {
    for name in ENV_FILES {
        let url = resolve_under(name, wd);
        if let Ok(contents) = schemes.fetch_string(&url) {
            debug!(%url, "loaded grubenv");
            return parse_grubenv(&contents);
        }
    }
    HashMap::new()
}

/// Looks for a GRUB config on the filesystem mounted at `root`.
pub fn parse_local_config(
    schemes: &Schemes,
    search: &mut dyn DeviceResolver,
    root: &Path,
) -> Result<GrubConfig> {
    let wd = dir_file_url(root)?;
    let variables = read_grubenv(schemes, &wd);

    let mut candidates: Vec<String> = PROBE_FILES.iter().map(|s| s.to_string()).collect();
    candidates.extend(efi_configs(root));

    for name in &candidates {
        match parse_config_file(schemes, search, name, &wd, variables.clone()) {
            Err(e) if e.is_url_error() => continue,
            Err(e) => return Err(e),
            Ok(config) => {
                info!(
                    root = %root.display(),
                    file = name.as_str(),
                    images = config.images.len(),
                    "parsed grub config"
                );
                return Ok(config);
            }
        }
    }
    Err(ConfigError::NoConfig(format!(
        "no valid grub config found in {}",
        root.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::MemoryScheme;
    use crate::search::NoSearch;

    fn schemes(files: &[(&str, &str)]) -> Schemes {
        let mut memory = MemoryScheme::new();
        for (path, contents) in files {
            memory = memory.with_file(path, *contents);
        }
        let mut schemes = Schemes::new();
        schemes.register("mem", memory);
        schemes
    }

    fn wd() -> Url {
        Url::parse("mem://disk/").expect("url")
    }

    fn parse(config: &str) -> GrubConfig {
        parse_config(&schemes(&[]), &mut NoSearch, config, &wd())
    }

    fn linux(image: &BootImage) -> &LinuxImage {
        match image {
            BootImage::Linux(image) => image,
            other => panic!("expected linux image, got {other}"),
        }
    }

    #[test]
    fn single_entry() {
        let config = parse(
            "menuentry \"X\" {\n  linux /vmlinuz console=ttyS0\n  initrd /initrd.img\n}\n",
        );
        assert_eq!(config.images.len(), 1);
        let image = linux(&config.images[0]);
        assert_eq!(image.name, "X");
        assert_eq!(image.kernel.describe(), "mem://disk/vmlinuz");
        assert_eq!(image.cmdline, "console=ttyS0");
        assert_eq!(
            image.initrd.as_ref().map(ByteSource::describe).as_deref(),
            Some("mem://disk/initrd.img")
        );
    }

    #[test]
    fn default_is_promoted_and_deduplicated() {
        let config = parse(
            "set default=B\n\
             menuentry A {\n linux /a\n}\n\
             menuentry B {\n linux /b\n}\n\
             menuentry C {\n linux /c\n}\n",
        );
        let names: Vec<String> = config.images.iter().map(BootImage::label).collect();
        assert_eq!(names, vec!["B", "A", "C"]);
    }

    #[test]
    fn numeric_default_selects_by_index() {
        let config = parse("set default=1\nmenuentry A {\nlinux /a\n}\nmenuentry B {\nlinux /b\n}\n");
        assert_eq!(config.images[0].label(), "B");
        assert_eq!(config.images.len(), 2);
    }

    #[test]
    fn reloading_linux_replaces_the_entry_image() {
        let config = parse("menuentry A {\nlinux /old\ninitrd /initrd\nlinux /new\n}\n");
        assert_eq!(config.images.len(), 1);
        let image = linux(&config.images[0]);
        assert_eq!(image.kernel.describe(), "mem://disk/new");
        assert!(image.initrd.is_none());
    }

    #[test]
    fn initrd_without_linux_is_skipped() {
        let config = parse("menuentry A {\ninitrd /initrd\n}\nmenuentry B {\nlinux /b\n}\n");
        assert_eq!(config.images.len(), 1);
        assert_eq!(config.images[0].label(), "B");
    }

    #[test]
    fn multiboot_entries_collect_modules() {
        let config = parse(
            "menuentry Xen {\nmultiboot /xen.gz dom0_mem=1G\nmodule /vmlinuz root=/dev/sda1\nmodule /initrd\n}\n",
        );
        let BootImage::Multiboot(image) = &config.images[0] else {
            panic!("expected multiboot");
        };
        assert_eq!(image.cmdline, "dom0_mem=1G");
        assert_eq!(image.modules.len(), 2);
        assert_eq!(image.modules[0].name, "/vmlinuz");
        assert_eq!(image.modules[0].cmdline, "/vmlinuz root=/dev/sda1");
    }

    #[test]
    fn expands_variables_and_strips_device_prefix() {
        let config = parse(
            "set opts=\"quiet splash\"\n\
             set root='hd0,gpt2'\n\
             menuentry '$opts' {\nlinux ($root)/boot/vmlinuz ro $opts ${missing}\n}\n",
        );
        let image = linux(&config.images[0]);
        assert_eq!(image.name, "$opts");
        assert_eq!(image.kernel.describe(), "mem://disk/boot/vmlinuz");
        assert_eq!(image.cmdline, "ro quiet splash");
    }

    #[test]
    fn quotes_arguments_with_spaces() {
        assert_eq!(
            cmdline_quote(&["a b", r#"c"d"#, "e'f", r"g\h"]),
            r#""a b" c\"d e\'f g\\h"#
        );
    }

    struct OneDisk;

    impl DeviceResolver for OneDisk {
        fn find(&mut self, kind: SearchKind, key: &str) -> Option<Url> {
            (kind == SearchKind::FsUuid && key == "1234-ABCD")
                .then(|| Url::parse("mem://other/").expect("url"))
        }
    }

    #[test]
    fn search_rebinds_root() {
        let config = parse_config(
            &schemes(&[]),
            &mut OneDisk,
            "search --no-floppy --fs-uuid --set=root 1234-ABCD\nmenuentry A {\nlinux /vmlinuz\n}\n",
            &wd(),
        );
        assert_eq!(linux(&config.images[0]).kernel.describe(), "mem://other/vmlinuz");
        assert_eq!(config.variables.get("root").map(String::as_str), Some("1234-ABCD"));
    }

    #[test]
    fn failed_search_keeps_root() {
        let config = parse_config(
            &schemes(&[]),
            &mut OneDisk,
            "search.fs_uuid ffff-0000 root\nmenuentry A {\nlinux /vmlinuz\n}\n",
            &wd(),
        );
        assert_eq!(linux(&config.images[0]).kernel.describe(), "mem://disk/vmlinuz");
    }

    #[test]
    fn configfile_includes_and_probe_order() {
        let files = [
            ("/grub2/grub.cfg", "configfile /grub2/entries.cfg\n"),
            ("/grub2/entries.cfg", "menuentry Inner {\nlinux /k\n}\n"),
        ];
        let schemes = schemes(&files);
        let config =
            parse_config_file(&schemes, &mut NoSearch, "grub2/grub.cfg", &wd(), HashMap::new())
                .expect("parse");
        assert_eq!(config.images[0].label(), "Inner");

        let err = parse_config_file(&schemes, &mut NoSearch, "grub/grub.cfg", &wd(), HashMap::new())
            .expect_err("missing");
        assert!(err.is_url_error());
    }

    #[test]
    fn blscfg_and_grubenv_variables() {
        let env = parse_grubenv("# GRUB Environment Block\nsaved_entry=abc-5.14\nkernelopts=root=/dev/sda2 ro\n####");
        assert_eq!(env.get("kernelopts").map(String::as_str), Some("root=/dev/sda2 ro"));

        let schemes = schemes(&[("/grub2/grub.cfg", "insmod blscfg\nblscfg\n")]);
        let config = parse_config_file(&schemes, &mut NoSearch, "grub2/grub.cfg", &wd(), env)
            .expect("parse");
        assert!(config.blscfg);
        assert!(config.images.is_empty());
        assert_eq!(config.saved_entry(), Some("abc-5.14"));
    }

    #[test]
    fn local_config_probes_mount_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("EFI/fedora")).expect("mkdir");
        fs::write(
            dir.path().join("EFI/fedora/grub.cfg"),
            "menuentry Fedora {\nlinux /vmlinuz\n}\n",
        )
        .expect("write");

        let config = parse_local_config(&Schemes::local(), &mut NoSearch, dir.path()).expect("parse");
        let image = linux(&config.images[0]);
        assert_eq!(image.kernel.local_path(), Some(dir.path().join("vmlinuz").as_path()));

        let empty = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            parse_local_config(&Schemes::local(), &mut NoSearch, empty.path()),
            Err(ConfigError::NoConfig(_))
        ));
    }
}
