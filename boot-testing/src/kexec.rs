// SPDX-License-Identifier: GPL-3.0-only

use std::sync::{Mutex, MutexGuard, PoisonError};

use boot_sys::{Kexec, KexecCall, SysError};
use boot_types::{ByteSource, Module};

/// Records handover calls without reading any bytes. Loads of kernels whose
/// description contains a refused pattern fail.
#[derive(Debug, Default)]
pub struct FakeKexec {
    calls: Mutex<Vec<KexecCall>>,
    refused: Vec<String>,
}

impl FakeKexec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing(mut self, pattern: &str) -> Self {
        self.refused.push(pattern.to_string());
        self
    }

    fn guard(&self) -> MutexGuard<'_, Vec<KexecCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<KexecCall> {
        self.guard().clone()
    }

    pub fn executed(&self) -> bool {
        self.guard().contains(&KexecCall::Execute)
    }

    fn check(&self, kernel: &ByteSource) -> boot_sys::Result<()> {
        let described = kernel.describe();
        if self.refused.iter().any(|pattern| described.contains(pattern)) {
            return Err(SysError::Kexec(format!("refusing to load {described}")));
        }
        Ok(())
    }
}

impl Kexec for FakeKexec {
    fn load_linux(
        &self,
        kernel: &ByteSource,
        initrd: Option<&ByteSource>,
        cmdline: &str,
        dtb: Option<&ByteSource>,
    ) -> boot_sys::Result<()> {
        self.check(kernel)?;
        self.guard().push(KexecCall::Linux {
            kernel: kernel.describe(),
            initrd: initrd.map(ByteSource::describe),
            cmdline: cmdline.to_string(),
            dtb: dtb.map(ByteSource::describe),
        });
        Ok(())
    }

    fn load_multiboot(&self, kernel: &ByteSource, cmdline: &str, modules: &[Module]) -> boot_sys::Result<()> {
        self.check(kernel)?;
        self.guard().push(KexecCall::Multiboot {
            kernel: kernel.describe(),
            cmdline: cmdline.to_string(),
            modules: modules.iter().map(|m| m.cmdline.clone()).collect(),
        });
        Ok(())
    }

    fn execute(&self) -> boot_sys::Result<()> {
        self.guard().push(KexecCall::Execute);
        Ok(())
    }
}
