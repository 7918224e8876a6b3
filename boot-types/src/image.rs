// SPDX-License-Identifier: GPL-3.0-only

//! Canonical boot images
//!
//! Every bootloader format normalizes into one of two shapes. The kernel
//! source is mandatory, so an image that exists is an image that can be tried.

use std::fmt;

use serde::Serialize;

use crate::ByteSource;

/// A Linux kernel with optional initrd and device tree.
#[derive(Debug, Clone)]
pub struct LinuxImage {
    pub name: String,
    pub kernel: ByteSource,
    pub initrd: Option<ByteSource>,
    pub dtb: Option<ByteSource>,
    pub cmdline: String,
    /// Higher ranks sort first; 0 for generic finds.
    pub rank: i32,
}

impl LinuxImage {
    pub fn new(name: impl Into<String>, kernel: ByteSource) -> Self {
        Self {
            name: name.into(),
            kernel,
            initrd: None,
            dtb: None,
            cmdline: String::new(),
            rank: 0,
        }
    }

    /// The name, or a short description of the sources when unnamed.
    pub fn label(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        let mut info = vec![format!("kernel={}", self.kernel)];
        if let Some(initrd) = &self.initrd {
            info.push(format!("initrd={initrd}"));
        }
        if let Some(dtb) = &self.dtb {
            info.push(format!("dtb={dtb}"));
        }
        format!("Linux({})", info.join(" "))
    }
}

impl fmt::Display for LinuxImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "LinuxImage(")?;
        writeln!(f, "  Name: {}", self.name)?;
        writeln!(f, "  Kernel: {}", self.kernel)?;
        match &self.initrd {
            Some(initrd) => writeln!(f, "  Initrd: {initrd}")?,
            None => writeln!(f, "  Initrd: <none>")?,
        }
        if let Some(dtb) = &self.dtb {
            writeln!(f, "  DTB: {dtb}")?;
        }
        writeln!(f, "  Cmdline: {}", self.cmdline)?;
        write!(f, ")")
    }
}

/// A multiboot module and the command line it is handed.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub source: ByteSource,
    pub cmdline: String,
}

/// A multiboot kernel (e.g. a hypervisor) with its modules.
#[derive(Debug, Clone)]
pub struct MultibootImage {
    pub name: String,
    pub kernel: ByteSource,
    pub cmdline: String,
    pub modules: Vec<Module>,
    pub rank: i32,
}

impl MultibootImage {
    pub fn new(name: impl Into<String>, kernel: ByteSource) -> Self {
        Self {
            name: name.into(),
            kernel,
            cmdline: String::new(),
            modules: Vec::new(),
            rank: 0,
        }
    }

    pub fn label(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        format!("Multiboot(kernel={})", self.kernel)
    }
}

impl fmt::Display for MultibootImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MultibootImage(")?;
        writeln!(f, "  Name: {}", self.name)?;
        writeln!(f, "  Kernel: {}", self.kernel)?;
        writeln!(f, "  Cmdline: {}", self.cmdline)?;
        for module in &self.modules {
            writeln!(f, "  Module: {} ({})", module.source, module.cmdline)?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone)]
pub enum BootImage {
    Linux(LinuxImage),
    Multiboot(MultibootImage),
}

impl BootImage {
    pub fn label(&self) -> String {
        match self {
            Self::Linux(image) => image.label(),
            Self::Multiboot(image) => image.label(),
        }
    }

    pub fn rank(&self) -> i32 {
        match self {
            Self::Linux(image) => image.rank,
            Self::Multiboot(image) => image.rank,
        }
    }

    pub fn set_rank(&mut self, rank: i32) {
        match self {
            Self::Linux(image) => image.rank = rank,
            Self::Multiboot(image) => image.rank = rank,
        }
    }

    pub fn cmdline(&self) -> &str {
        match self {
            Self::Linux(image) => &image.cmdline,
            Self::Multiboot(image) => &image.cmdline,
        }
    }

    /// Rewrites the kernel command line in place.
    pub fn edit(&mut self, f: impl FnOnce(&str) -> String) {
        let cmdline = match self {
            Self::Linux(image) => &mut image.cmdline,
            Self::Multiboot(image) => &mut image.cmdline,
        };
        *cmdline = f(cmdline);
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Linux(_) => "linux",
            Self::Multiboot(_) => "multiboot",
        }
    }

    pub fn summary(&self) -> ImageSummary {
        match self {
            Self::Linux(image) => ImageSummary {
                kind: self.kind(),
                label: image.label(),
                rank: image.rank,
                kernel: image.kernel.describe(),
                initrd: image.initrd.as_ref().map(ByteSource::describe),
                cmdline: image.cmdline.clone(),
                modules: Vec::new(),
            },
            Self::Multiboot(image) => ImageSummary {
                kind: self.kind(),
                label: image.label(),
                rank: image.rank,
                kernel: image.kernel.describe(),
                initrd: None,
                cmdline: image.cmdline.clone(),
                modules: image
                    .modules
                    .iter()
                    .map(|module| format!("{} {}", module.source, module.cmdline))
                    .collect(),
            },
        }
    }
}

impl fmt::Display for BootImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux(image) => fmt::Display::fmt(image, f),
            Self::Multiboot(image) => fmt::Display::fmt(image, f),
        }
    }
}

impl From<LinuxImage> for BootImage {
    fn from(image: LinuxImage) -> Self {
        Self::Linux(image)
    }
}

impl From<MultibootImage> for BootImage {
    fn from(image: MultibootImage) -> Self {
        Self::Multiboot(image)
    }
}

/// Serializable view of an image, used for listings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImageSummary {
    pub kind: &'static str,
    pub label: String,
    pub rank: i32,
    pub kernel: String,
    pub initrd: Option<String>,
    pub cmdline: String,
    pub modules: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unnamed_linux_label_describes_sources() {
        let mut image = LinuxImage::new("", ByteSource::from_bytes("/vmlinuz", b"k".to_vec()));
        image.initrd = Some(ByteSource::from_bytes("/initrd.img", b"i".to_vec()));
        assert_eq!(image.label(), "Linux(kernel=/vmlinuz initrd=/initrd.img)");
    }

    #[test]
    fn edit_rewrites_cmdline() {
        let mut image: BootImage =
            LinuxImage::new("x", ByteSource::from_bytes("k", b"k".to_vec())).into();
        image.edit(|old| format!("{old} quiet").trim().to_string());
        assert_eq!(image.cmdline(), "quiet");
    }

    #[test]
    fn summary_lists_modules() {
        let mut image = MultibootImage::new("xen", ByteSource::from_bytes("xen.gz", b"x".to_vec()));
        image.modules.push(Module {
            name: "dom0".to_string(),
            source: ByteSource::from_bytes("vmlinuz", b"k".to_vec()),
            cmdline: "vmlinuz console=hvc0".to_string(),
        });
        let summary = BootImage::from(image).summary();
        assert_eq!(summary.kind, "multiboot");
        assert_eq!(summary.modules, vec!["vmlinuz vmlinuz console=hvc0".to_string()]);
    }
}
