// SPDX-License-Identifier: GPL-3.0-only

//! boot-resolver: find a bootable system and kexec into it

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use boot_config::Schemes;
use boot_menu::{CrosstermTerminal, MenuEntry};
use boot_resolver::handover::{self, Selection};
use boot_resolver::netboot::{self, StaticLeaseSource};
use boot_resolver::resolve::{self, DeviceFilters, Resolver};
use boot_resolver::{Settings, logging, settings};
use boot_sys::{BlockCatalog, DryRunKexec, Kexec, LinuxMounter, MountPool, SystemKexec, is_root};
use boot_types::{BootImage, ImageSummary};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use url::Url;

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Finds bootable systems on local disks or the network and boots one
#[derive(Debug, Parser)]
#[command(name = "boot-resolver", version)]
#[command(about = "Discover, rank and kexec into bootable systems", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Load the chosen kernel but do not execute it
    #[arg(long, global = true)]
    dry_run: bool,

    /// Log debug output from every component
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (default: /etc/boot-resolver.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// PCI devices to ignore, e.g. 8086:1234,10de:1c82
    #[arg(long, global = true)]
    block_list: Option<String>,

    /// Only consider devices behind these PCI functions
    #[arg(long, global = true)]
    allow_list: Option<String>,

    /// Kernel parameters to append
    #[arg(long, global = true)]
    append: Option<String>,

    /// Comma separated kernel parameters to remove
    #[arg(long, global = true, value_delimiter = ',')]
    remove: Option<Vec<String>>,

    /// Comma separated kernel parameters to copy from the running kernel
    #[arg(long, global = true, value_delimiter = ',')]
    reuse: Option<Vec<String>>,

    /// Boot this entry (0-based index or label) without showing the menu
    #[arg(long, global = true)]
    boot: Option<String>,

    /// Boot the first default entry without showing the menu
    #[arg(long, global = true)]
    no_menu: bool,

    /// Allow editing kernel command lines from the menu
    #[arg(long, global = true)]
    allow_edit: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Boot from local disks (default)
    Local,
    /// Boot from the network
    Netboot {
        /// Boot file URI, for networks configured outside this tool
        #[arg(long)]
        boot_uri: Url,
        /// Interfaces to try (default: all but loopback)
        #[arg(long = "interface")]
        interfaces: Vec<String>,
    },
    /// Boot an explicit kernel from the partition with a given GUID
    Path {
        #[arg(long)]
        guid: String,
        /// Kernel path on that partition
        #[arg(long)]
        kernel: String,
        #[arg(long)]
        initrd: Option<String>,
        #[arg(long, default_value = "")]
        cmdline: String,
    },
    /// Print the ranked candidates and exit
    List {
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Flags win over the settings file.
    fn apply(&self, settings: &mut Settings) {
        if let Some(block) = &self.block_list {
            settings.devices.block_list = Some(block.clone());
        }
        if let Some(allow) = &self.allow_list {
            settings.devices.allow_list = Some(allow.clone());
        }
        if let Some(append) = &self.append {
            settings.cmdline.append = append.clone();
        }
        if let Some(remove) = &self.remove {
            settings.cmdline.remove = remove.clone();
        }
        if let Some(reuse) = &self.reuse {
            settings.cmdline.reuse = reuse.clone();
        }
        if self.allow_edit {
            settings.menu.allow_edit = true;
        }
        if let Some(Command::Netboot { interfaces, .. }) = &self.command
            && !interfaces.is_empty()
        {
            settings.netboot.interfaces = interfaces.clone();
        }
    }

    fn selection(&self, settings: &Settings) -> Selection {
        if let Some(choice) = &self.boot {
            Selection::Preselect(choice.clone())
        } else if self.no_menu {
            Selection::Default
        } else {
            Selection::Menu(settings.menu.options())
        }
    }
}

fn device_filters(settings: &Settings) -> Result<DeviceFilters> {
    Ok(DeviceFilters {
        block_pci: settings.devices.block_pci()?,
        allow_pci: settings.devices.allow_pci()?,
    })
}

fn netboot_images(uri: &Url, settings: &Settings) -> Result<Vec<BootImage>> {
    let sys_net = Path::new(SYS_CLASS_NET);
    let interfaces = netboot::interfaces(sys_net, &settings.netboot.interfaces)?;
    let source = Arc::new(StaticLeaseSource::new(uri.clone()));

    let lease = {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        runtime.block_on(netboot::first_lease(
            &interfaces,
            source,
            settings.netboot.timeout(),
            settings.netboot.retries,
        ))?
    };
    lease.configure()?;

    let mac = netboot::hardware_addr(sys_net, lease.link());
    Ok(netboot::images_from_lease(
        lease.as_ref(),
        &Schemes::with_defaults(),
        mac.as_deref(),
    )?)
}

fn print_list(images: &[BootImage], json: bool) -> Result<()> {
    let summaries: Vec<ImageSummary> = images.iter().map(BootImage::summary).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    for (index, summary) in summaries.iter().enumerate() {
        println!("{index:2}. {} [{} rank {}]", summary.label, summary.kind, summary.rank);
        println!("      kernel:  {}", summary.kernel);
        if let Some(initrd) = &summary.initrd {
            println!("      initrd:  {initrd}");
        }
        for module in &summary.modules {
            println!("      module:  {module}");
        }
        println!("      cmdline: {}", summary.cmdline);
    }
    Ok(())
}

fn pipeline(
    cli: &Cli,
    settings: &Settings,
    pool: &mut MountPool,
    log_guard: Option<WorkerGuard>,
) -> Result<()> {
    let catalog = BlockCatalog::system();
    let command = cli.command.clone().unwrap_or(Command::Local);

    let mut images = match &command {
        Command::Local | Command::List { .. } => {
            let devices = resolve::find_devices(&catalog, &device_filters(settings)?)?;
            Resolver::new(&catalog, pool).resolve(&devices)
        }
        Command::Netboot { boot_uri, .. } => netboot_images(boot_uri, settings)?,
        Command::Path {
            guid,
            kernel,
            initrd,
            cmdline,
        } => {
            let devices = resolve::find_devices(&catalog, &device_filters(settings)?)?;
            vec![resolve::explicit_image(
                &catalog,
                pool,
                &devices,
                guid,
                kernel,
                initrd.as_deref(),
                cmdline,
            )?]
        }
    };
    if images.is_empty() {
        return Err(boot_resolver::ResolveError::NoCandidates.into());
    }

    resolve::apply_cmdline_filter(&mut images, &settings.cmdline.filter());
    for (index, image) in images.iter().enumerate() {
        info!(index, rank = image.rank(), kind = image.kind(), image = %image.label(), "candidate");
    }
    if let Command::List { json } = command {
        return print_list(&images, json);
    }

    let kexec: Arc<dyn Kexec> = if cli.dry_run {
        Arc::new(DryRunKexec::new())
    } else {
        if !is_root() {
            warn!("not running as root, kexec will most likely fail");
        }
        Arc::new(SystemKexec)
    };
    let mut entries = MenuEntry::for_images(images, kexec);
    let mut term = CrosstermTerminal::stdout();
    let Some(index) = handover::select(&mut entries, &cli.selection(settings), Some(&mut term))
    else {
        bail!("no boot entry could be loaded");
    };

    handover::boot(&mut entries[index], pool, log_guard, cli.dry_run)?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = settings::load(cli.config.as_deref()).context("failed to load settings")?;
    cli.apply(&mut settings);
    let log_guard = logging::init(&settings.log, cli.verbose);

    info!("Starting boot-resolver v{}", env!("CARGO_PKG_VERSION"));
    let mut pool = MountPool::new(Arc::new(LinuxMounter), settings.devices.mount_root.clone());
    let result = pipeline(&cli, &settings, &mut pool, log_guard);
    // A successful pipeline has already released the pool inside handover::boot.
    if result.is_err() {
        handover::release(&mut pool);
    }
    result
}
