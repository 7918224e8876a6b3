// SPDX-License-Identifier: GPL-3.0-only

//! Minimal iPXE script support
//!
//! Only `kernel`, `initrd` and `boot` are understood. That is enough for the
//! scripts netboot servers hand out to chain a Linux kernel.

use boot_types::{ByteSource, LinuxImage};
use tracing::{debug, info};
use url::Url;

use crate::error::{ConfigError, Result};
use crate::locator::{Schemes, dir_url, resolve_relative};

const SIGNATURE: &str = "#!ipxe";

/// Whether `contents` starts like an iPXE script.
pub fn is_ipxe_script(contents: &str) -> bool {
    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .is_some_and(|line| line.eq_ignore_ascii_case(SIGNATURE))
}

struct Parser<'a> {
    schemes: &'a Schemes,
    wd: Url,
    kernel: Option<ByteSource>,
    cmdline: String,
    initrds: Vec<ByteSource>,
}

impl Parser<'_> {
    fn lazy(&self, name: &str) -> Result<ByteSource> {
        let url = resolve_relative(name, &self.wd)?;
        self.schemes.lazy_fetch(&url)
    }

    /// Returns false once `boot` is reached.
    fn line(&mut self, line: &str) -> Result<bool> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(true);
        };
        // Options such as `--name` carry nothing the kernel needs.
        let mut args = words.skip_while(|word| word.starts_with("--"));

        match verb {
            "kernel" => {
                if let Some(path) = args.next() {
                    self.kernel = Some(self.lazy(path)?);
                    self.cmdline = args.collect::<Vec<_>>().join(" ");
                }
            }
            "initrd" => {
                if let Some(list) = args.next() {
                    for path in list.split(',').filter(|path| !path.is_empty()) {
                        let initrd = self.lazy(path)?;
                        self.initrds.push(initrd);
                    }
                }
            }
            "boot" => return Ok(false),
            other => debug!(verb = other, "ignoring ipxe command"),
        }
        Ok(true)
    }
}

/// Parses an iPXE script already fetched from `url`. Paths in the script
/// are relative to the script's directory. Returns `None` when the script
/// names no kernel.
pub fn parse_script(schemes: &Schemes, contents: &str, url: &Url) -> Result<Option<LinuxImage>> {
    if !is_ipxe_script(contents) {
        return Err(ConfigError::NotIpxeScript);
    }

    let mut parser = Parser {
        schemes,
        wd: dir_url(url),
        kernel: None,
        cmdline: String::new(),
        initrds: Vec::new(),
    };
    for line in contents
        .lines()
        .map(str::trim)
        .skip_while(|line| line.is_empty())
        .skip(1)
    {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !parser.line(line)? {
            break;
        }
    }

    let Some(kernel) = parser.kernel else {
        debug!(%url, "ipxe script names no kernel");
        return Ok(None);
    };
    let mut image = LinuxImage::new(String::new(), kernel);
    image.cmdline = parser.cmdline;
    if !parser.initrds.is_empty() {
        image.initrd = Some(ByteSource::concat(parser.initrds));
    }
    info!(%url, image = %image.label(), "parsed ipxe script");
    Ok(Some(image))
}

/// Fetches and parses the iPXE script at `url`.
pub fn parse_config(schemes: &Schemes, url: &Url) -> Result<Option<LinuxImage>> {
    let contents = schemes.fetch_string(url)?;
    parse_script(schemes, &contents, url)
}
