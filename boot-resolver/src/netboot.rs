// SPDX-License-Identifier: GPL-3.0-only

//! Network boot
//!
//! Address configuration itself is someone else's job; this module only
//! consumes its result, a [`Lease`]. One attempt per interface runs
//! concurrently and the first lease to arrive wins.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use boot_config::{ConfigError, Schemes, ipxe, syslinux};
use boot_types::BootImage;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ResolveError, Result};

/// A completed address configuration exchange.
pub trait Lease: Send + Sync {
    /// The boot file the server pointed at.
    fn boot_uri(&self) -> Result<Url>;

    /// Applies the lease to its interface.
    fn configure(&self) -> Result<()>;

    /// Name of the interface the lease was obtained on.
    fn link(&self) -> &str;

    fn dns(&self) -> Vec<IpAddr>;

    fn ipv4(&self) -> Option<Ipv4Addr> {
        None
    }
}

/// Produces leases, e.g. by running DHCP on an interface.
#[async_trait]
pub trait LeaseSource: Send + Sync {
    async fn acquire(&self, interface: &str) -> Result<Box<dyn Lease>>;
}

/// A lease with a fixed boot URI that configures nothing. Lets the pipeline
/// run where the network is already set up.
#[derive(Debug, Clone)]
pub struct StaticLease {
    link: String,
    uri: Url,
}

impl Lease for StaticLease {
    fn boot_uri(&self) -> Result<Url> {
        Ok(self.uri.clone())
    }

    fn configure(&self) -> Result<()> {
        Ok(())
    }

    fn link(&self) -> &str {
        &self.link
    }

    fn dns(&self) -> Vec<IpAddr> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
pub struct StaticLeaseSource {
    uri: Url,
}

impl StaticLeaseSource {
    pub fn new(uri: Url) -> Self {
        Self { uri }
    }
}

#[async_trait]
impl LeaseSource for StaticLeaseSource {
    async fn acquire(&self, interface: &str) -> Result<Box<dyn Lease>> {
        Ok(Box::new(StaticLease {
            link: interface.to_string(),
            uri: self.uri.clone(),
        }))
    }
}

/// Network interfaces under `sys_class_net` except loopback, sorted. A
/// non-empty `only` restricts the result to those names.
pub fn interfaces(sys_class_net: &Path, only: &[String]) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(sys_class_net)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .filter(|name| only.is_empty() || only.contains(name))
        .collect();
    names.sort();
    Ok(names)
}

/// Hardware address of `link` as sysfs reports it.
pub fn hardware_addr(sys_class_net: &Path, link: &str) -> Option<String> {
    fs::read_to_string(sys_class_net.join(link).join("address"))
        .ok()
        .map(|address| address.trim().to_string())
        .filter(|address| !address.is_empty())
}

async fn attempt(
    source: Arc<dyn LeaseSource>,
    interface: &str,
    per_attempt: Duration,
    retries: u32,
) -> Result<Box<dyn Lease>> {
    let mut last = ResolveError::NoLease(format!("{interface}: no attempt made"));
    for round in 0..=retries {
        match timeout(per_attempt, source.acquire(interface)).await {
            Ok(Ok(lease)) => return Ok(lease),
            Ok(Err(e)) => {
                debug!(interface, round, error = %e, "lease attempt failed");
                last = e;
            }
            Err(_) => {
                debug!(interface, round, "lease attempt timed out");
                last = ResolveError::NoLease(format!("{interface}: timed out after {per_attempt:?}"));
            }
        }
    }
    Err(last)
}

/// Races one lease attempt per interface and returns the first success.
/// Later results are drained and dropped until the overall deadline passes.
pub async fn first_lease(
    interfaces: &[String],
    source: Arc<dyn LeaseSource>,
    per_attempt: Duration,
    retries: u32,
) -> Result<Box<dyn Lease>> {
    if interfaces.is_empty() {
        return Err(ResolveError::NoLease("no network interfaces".to_string()));
    }

    let deadline = Instant::now() + per_attempt * (retries + 1);
    let (tx, mut rx) = mpsc::channel(interfaces.len());
    for interface in interfaces {
        let tx = tx.clone();
        let source = Arc::clone(&source);
        let interface = interface.clone();
        tokio::spawn(async move {
            let result = attempt(source, &interface, per_attempt, retries).await;
            // The receiver is gone once a winner was picked and the deadline passed.
            let _ = tx.send((interface, result)).await;
        });
    }
    drop(tx);

    let mut failures = Vec::new();
    loop {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some((interface, Ok(lease)))) => {
                info!(interface = %interface, "got lease");
                tokio::spawn(async move {
                    while let Ok(Some((interface, result))) = timeout_at(deadline, rx.recv()).await {
                        debug!(interface = %interface, ok = result.is_ok(), "ignoring later lease result");
                    }
                });
                return Ok(lease);
            }
            Ok(Some((interface, Err(e)))) => {
                warn!(interface = %interface, error = %e, "no lease");
                failures.push(format!("{interface}: {e}"));
            }
            Ok(None) => return Err(ResolveError::NoLease(failures.join("; "))),
            Err(_) => {
                failures.push("deadline exceeded".to_string());
                return Err(ResolveError::NoLease(failures.join("; ")));
            }
        }
    }
}

fn is_ipxe_name(uri: &Url) -> bool {
    uri.path().ends_with(".ipxe")
}

/// Boot images behind the lease's boot URI: an iPXE script if it is one,
/// otherwise a PXELINUX config next to the boot file.
pub fn images_from_lease(
    lease: &dyn Lease,
    schemes: &Schemes,
    mac: Option<&str>,
) -> Result<Vec<BootImage>> {
    let uri = lease.boot_uri()?;
    info!(%uri, link = lease.link(), "boot file");

    let contents = schemes.fetch_string(&uri);
    let script = match &contents {
        Ok(contents) => ipxe::is_ipxe_script(contents),
        Err(_) => false,
    };
    if script || is_ipxe_name(&uri) {
        let contents = contents?;
        return match ipxe::parse_script(schemes, &contents, &uri)? {
            Some(mut image) => {
                image.name = format!("iPXE script from {uri}");
                Ok(vec![image.into()])
            }
            None => Err(ResolveError::NoCandidates),
        };
    }

    let mut root = uri.clone();
    root.set_path("/");
    let wd = Path::new(uri.path())
        .parent()
        .map(|dir| dir.to_string_lossy().trim_start_matches('/').to_string())
        .unwrap_or_default();
    match syslinux::parse_pxelinux(schemes, &root, &wd, mac, lease.ipv4()) {
        Ok(images) => Ok(images),
        Err(ConfigError::NoConfig(reason)) => {
            debug!(reason = %reason, "no pxelinux config");
            Err(ResolveError::NoCandidates)
        }
        Err(e) => Err(e.into()),
    }
}
