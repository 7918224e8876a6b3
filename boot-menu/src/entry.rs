// SPDX-License-Identifier: GPL-3.0-only

//! Menu entries
//!
//! Loading prepares an entry without side effects on the running system, so a
//! failed load can fall through to the next candidate. Executing is final.

use std::process::Command;
use std::sync::Arc;

use boot_sys::{Kexec, load_image};
use boot_types::BootImage;
use nix::sys::reboot::{RebootMode, reboot};
use tracing::{info, warn};

use crate::error::{MenuError, Result};

const DEFAULT_SHELL: &str = "/bin/sh";

pub trait Entry {
    fn label(&self) -> String;

    /// A longer description shown before booting, if the entry has one.
    fn description(&self) -> Option<String> {
        None
    }

    /// Rewrites the kernel command line. Entries without one ignore it.
    fn edit(&mut self, _rewrite: &mut dyn FnMut(&str) -> String) {}

    fn load(&mut self) -> Result<()>;

    fn exec(&mut self) -> Result<()>;

    /// Whether a timeout may pick this entry.
    fn is_default(&self) -> bool;
}

/// The description when the entry offers one, otherwise its label.
pub fn extended_label<E: Entry + ?Sized>(entry: &E) -> String {
    entry.description().unwrap_or_else(|| entry.label())
}

/// A discovered image handed over through kexec.
pub struct ImageEntry {
    pub image: BootImage,
    kexec: Arc<dyn Kexec>,
}

impl ImageEntry {
    pub fn new(image: BootImage, kexec: Arc<dyn Kexec>) -> Self {
        Self { image, kexec }
    }
}

impl std::fmt::Debug for ImageEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageEntry")
            .field("image", &self.image.label())
            .finish_non_exhaustive()
    }
}

/// Everything the menu can offer.
#[derive(Debug)]
pub enum MenuEntry {
    Image(ImageEntry),
    Reboot,
    StartShell,
}

impl MenuEntry {
    pub fn image(image: BootImage, kexec: Arc<dyn Kexec>) -> Self {
        Self::Image(ImageEntry::new(image, kexec))
    }

    /// One entry per image followed by the synthetic actions.
    pub fn for_images(images: Vec<BootImage>, kexec: Arc<dyn Kexec>) -> Vec<Self> {
        let mut entries: Vec<Self> = images
            .into_iter()
            .map(|image| Self::image(image, Arc::clone(&kexec)))
            .collect();
        entries.push(Self::StartShell);
        entries.push(Self::Reboot);
        entries
    }
}

impl Entry for MenuEntry {
    fn label(&self) -> String {
        match self {
            Self::Image(entry) => entry.image.label(),
            Self::Reboot => "Reboot".to_string(),
            Self::StartShell => "Enter a shell".to_string(),
        }
    }

    fn description(&self) -> Option<String> {
        match self {
            Self::Image(entry) => Some(entry.image.to_string()),
            Self::Reboot | Self::StartShell => None,
        }
    }

    fn edit(&mut self, rewrite: &mut dyn FnMut(&str) -> String) {
        if let Self::Image(entry) = self {
            entry.image.edit(rewrite);
        }
    }

    fn load(&mut self) -> Result<()> {
        match self {
            Self::Image(entry) => {
                load_image(entry.kexec.as_ref(), &entry.image).map_err(|e| MenuError::Load {
                    label: entry.image.label(),
                    reason: e.to_string(),
                })
            }
            Self::Reboot | Self::StartShell => Ok(()),
        }
    }

    fn exec(&mut self) -> Result<()> {
        let label = self.label();
        match self {
            Self::Image(entry) => entry.kexec.execute().map_err(|e| MenuError::Exec {
                label,
                reason: e.to_string(),
            }),
            Self::Reboot => {
                info!("rebooting");
                match reboot(RebootMode::RB_AUTOBOOT) {
                    Ok(never) => match never {},
                    Err(e) => Err(MenuError::Exec {
                        label,
                        reason: e.to_string(),
                    }),
                }
            }
            Self::StartShell => {
                let shell = std::env::var("SHELL")
                    .ok()
                    .filter(|shell| !shell.is_empty())
                    .unwrap_or_else(|| DEFAULT_SHELL.to_string());
                info!(shell = %shell, "starting shell");
                let status = Command::new(&shell).status().map_err(|e| MenuError::Exec {
                    label,
                    reason: format!("{shell}: {e}"),
                })?;
                if !status.success() {
                    warn!(shell = %shell, %status, "shell exited");
                }
                Ok(())
            }
        }
    }

    fn is_default(&self) -> bool {
        matches!(self, Self::Image(_))
    }
}
