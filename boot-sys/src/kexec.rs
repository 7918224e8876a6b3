// SPDX-License-Identifier: GPL-3.0-only

//! Kernel handover
//!
//! Loading stages the next kernel without touching the running system.
//! Executing is irrevocable and only returns on failure.

use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use boot_types::{BootImage, ByteSource, Module};
use tracing::{debug, info};

use crate::error::{Result, SysError};

/// `kexec_file_load` flag for kernels loaded without an initramfs.
const KEXEC_FILE_NO_INITRAMFS: libc::c_ulong = 0x4;

pub trait Kexec: Send + Sync {
    fn load_linux(
        &self,
        kernel: &ByteSource,
        initrd: Option<&ByteSource>,
        cmdline: &str,
        dtb: Option<&ByteSource>,
    ) -> Result<()>;

    fn load_multiboot(&self, kernel: &ByteSource, cmdline: &str, modules: &[Module]) -> Result<()>;

    /// Jumps into the loaded kernel.
    fn execute(&self) -> Result<()>;
}

/// Stages `image` with the matching load call.
pub fn load_image(kexec: &dyn Kexec, image: &BootImage) -> Result<()> {
    info!(image = %image.label(), kind = image.kind(), "loading");
    match image {
        BootImage::Linux(linux) => kexec.load_linux(
            &linux.kernel,
            linux.initrd.as_ref(),
            &linux.cmdline,
            linux.dtb.as_ref(),
        ),
        BootImage::Multiboot(mb) => kexec.load_multiboot(&mb.kernel, &mb.cmdline, &mb.modules),
    }
}

/// A source materialized somewhere the kernel or the kexec tool can open.
struct Staged {
    file: File,
    path: PathBuf,
}

fn stage(source: &ByteSource, name: &str) -> Result<Staged> {
    if let Some(path) = source.local_path() {
        let file = File::open(path)?;
        return Ok(Staged {
            file,
            path: path.to_path_buf(),
        });
    }

    let bytes = source
        .read_all()
        .map_err(|e| SysError::Kexec(format!("reading {}: {e}", source.describe())))?;
    let cname = CString::new(name)
        .map_err(|_| SysError::Kexec(format!("bad staging name {name:?}")))?;

    // No CLOEXEC: the kexec tool opens it through /proc/self/fd.
    let fd = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_ALLOW_SEALING) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let mut file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
    file.write_all(&bytes)?;
    let seals = libc::F_SEAL_SEAL | libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE;
    if unsafe { libc::fcntl(fd, libc::F_ADD_SEALS, seals) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let path = PathBuf::from(format!("/proc/self/fd/{fd}"));
    debug!(source = %source, path = %path.display(), size = bytes.len(), "staged in memfd");
    Ok(Staged { file, path })
}

fn run_kexec_tool(args: &[String]) -> Result<()> {
    let tool = which::which("kexec")
        .map_err(|_| SysError::Kexec("kexec tool not found in PATH".to_string()))?;
    debug!(tool = %tool.display(), ?args, "running kexec tool");
    let output = Command::new(&tool).args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SysError::Kexec(format!("kexec -l failed: {}", stderr.trim())));
    }
    Ok(())
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// Real handover via `kexec_file_load(2)`, the kexec tool and `reboot(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemKexec;

impl SystemKexec {
    fn file_load(kernel: &Staged, initrd: Option<&Staged>, cmdline: &str) -> Result<()> {
        let cmdline = CString::new(cmdline)
            .map_err(|_| SysError::Kexec("command line contains NUL".to_string()))?;
        let (initrd_fd, flags) = match initrd {
            Some(initrd) => (initrd.file.as_raw_fd(), 0),
            None => (-1, KEXEC_FILE_NO_INITRAMFS),
        };
        let len = cmdline.as_bytes_with_nul().len();
        let ret = unsafe {
            libc::syscall(
                libc::SYS_kexec_file_load,
                kernel.file.as_raw_fd(),
                initrd_fd,
                len,
                cmdline.as_ptr(),
                flags,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            return Err(SysError::Kexec(format!("kexec_file_load: {err}")));
        }
        Ok(())
    }
}

impl Kexec for SystemKexec {
    fn load_linux(
        &self,
        kernel: &ByteSource,
        initrd: Option<&ByteSource>,
        cmdline: &str,
        dtb: Option<&ByteSource>,
    ) -> Result<()> {
        let kernel = stage(kernel, "kernel")?;
        let initrd = initrd.map(|initrd| stage(initrd, "initrd")).transpose()?;

        let Some(dtb) = dtb else {
            return Self::file_load(&kernel, initrd.as_ref(), cmdline);
        };

        let dtb = stage(dtb, "dtb")?;
        let mut args = vec![
            "-l".to_string(),
            path_arg(&kernel.path),
            format!("--command-line={cmdline}"),
            format!("--dtb={}", path_arg(&dtb.path)),
        ];
        if let Some(initrd) = &initrd {
            args.push(format!("--initrd={}", path_arg(&initrd.path)));
        }
        run_kexec_tool(&args)
    }

    fn load_multiboot(&self, kernel: &ByteSource, cmdline: &str, modules: &[Module]) -> Result<()> {
        let kernel = stage(kernel, "kernel")?;
        let mut staged = Vec::with_capacity(modules.len());
        for (index, module) in modules.iter().enumerate() {
            staged.push(stage(&module.source, &format!("module{index}"))?);
        }

        let mut args = vec![
            "-l".to_string(),
            path_arg(&kernel.path),
            "--type".to_string(),
            "multiboot-x86".to_string(),
            format!("--command-line={cmdline}"),
        ];
        for (module, file) in modules.iter().zip(&staged) {
            // The module's own command line leads with its name; swap in the staged path.
            let args_only = module
                .cmdline
                .split_once(char::is_whitespace)
                .map(|(_, rest)| rest.trim())
                .unwrap_or("");
            let spec = if args_only.is_empty() {
                path_arg(&file.path)
            } else {
                format!("{} {args_only}", path_arg(&file.path))
            };
            args.push("--module".to_string());
            args.push(spec);
        }
        run_kexec_tool(&args)
    }

    fn execute(&self) -> Result<()> {
        info!("executing loaded kernel");
        match nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_KEXEC) {
            Ok(never) => match never {},
            Err(errno) => Err(SysError::Kexec(format!("reboot(RB_KEXEC): {}", errno.desc()))),
        }
    }
}

/// A recorded handover call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KexecCall {
    Linux {
        kernel: String,
        initrd: Option<String>,
        cmdline: String,
        dtb: Option<String>,
    },
    Multiboot {
        kernel: String,
        cmdline: String,
        modules: Vec<String>,
    },
    Execute,
}

/// Reads every source like a real load would, records the call and stops
/// there. Used for `--dry-run`.
#[derive(Debug, Default)]
pub struct DryRunKexec {
    calls: Mutex<Vec<KexecCall>>,
}

impl DryRunKexec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<KexecCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn record(&self, call: KexecCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

fn read_len(source: &ByteSource) -> Result<usize> {
    source
        .read_all()
        .map(|bytes| bytes.len())
        .map_err(|e| SysError::Kexec(format!("reading {}: {e}", source.describe())))
}

impl Kexec for DryRunKexec {
    fn load_linux(
        &self,
        kernel: &ByteSource,
        initrd: Option<&ByteSource>,
        cmdline: &str,
        dtb: Option<&ByteSource>,
    ) -> Result<()> {
        let kernel_len = read_len(kernel)?;
        let initrd_len = initrd.map(read_len).transpose()?;
        if let Some(dtb) = dtb {
            read_len(dtb)?;
        }
        info!(
            kernel = %kernel,
            kernel_len,
            initrd_len,
            cmdline,
            "dry run: would load linux kernel"
        );
        self.record(KexecCall::Linux {
            kernel: kernel.describe(),
            initrd: initrd.map(ByteSource::describe),
            cmdline: cmdline.to_string(),
            dtb: dtb.map(ByteSource::describe),
        });
        Ok(())
    }

    fn load_multiboot(&self, kernel: &ByteSource, cmdline: &str, modules: &[Module]) -> Result<()> {
        read_len(kernel)?;
        for module in modules {
            read_len(&module.source)?;
        }
        info!(kernel = %kernel, cmdline, modules = modules.len(), "dry run: would load multiboot kernel");
        self.record(KexecCall::Multiboot {
            kernel: kernel.describe(),
            cmdline: cmdline.to_string(),
            modules: modules.iter().map(|m| m.cmdline.clone()).collect(),
        });
        Ok(())
    }

    fn execute(&self) -> Result<()> {
        info!("dry run: not executing");
        self.record(KexecCall::Execute);
        Ok(())
    }
}
