// SPDX-License-Identifier: GPL-3.0-only

//! URL-addressed config files and kernels
//!
//! Everything a parser touches is named by a URL: `file://` for mounted
//! disks, `http(s)://` for netboot. Handlers are looked up by scheme in a
//! [`Schemes`] registry that is passed down explicitly.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use boot_types::{ByteSource, Fetch};
use tracing::debug;
use url::Url;

use crate::error::{ConfigError, Result};

/// Fetches the bytes behind URLs of one scheme.
pub trait Scheme: Send + Sync {
    fn fetch(&self, url: &Url) -> io::Result<Vec<u8>>;

    /// Local file backing `url`, if any. Lets kexec open files directly.
    fn local_path(&self, _url: &Url) -> Option<PathBuf> {
        None
    }
}

/// `file://` URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileScheme;

impl Scheme for FileScheme {
    fn fetch(&self, url: &Url) -> io::Result<Vec<u8>> {
        let path = url.to_file_path().map_err(|()| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("not a local path: {url}"))
        })?;
        fs::read(path)
    }

    fn local_path(&self, url: &Url) -> Option<PathBuf> {
        url.to_file_path().ok()
    }
}

/// `http://` and `https://` through a blocking reqwest client, built on
/// first use.
pub struct HttpScheme {
    timeout: Duration,
    client: OnceLock<std::result::Result<reqwest::blocking::Client, String>>,
}

impl HttpScheme {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> io::Result<&reqwest::blocking::Client> {
        let client = self.client.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| e.to_string())
        });
        client.as_ref().map_err(|e| io::Error::other(e.clone()))
    }
}

impl Default for HttpScheme {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl Scheme for HttpScheme {
    fn fetch(&self, url: &Url) -> io::Result<Vec<u8>> {
        let response = self
            .client()?
            .get(url.as_str())
            .send()
            .map_err(io::Error::other)?;
        let status = response.status();
        if !status.is_success() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("HTTP status {status}"),
            ));
        }
        let body = response.bytes().map_err(io::Error::other)?;
        debug!(%url, size = body.len(), "fetched");
        Ok(body.to_vec())
    }
}

/// In-memory files keyed by URL path, for tests and fixed payloads.
#[derive(Debug, Default, Clone)]
pub struct MemoryScheme {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryScheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(clean_path("/", path), contents.into());
        self
    }
}

impl Scheme for MemoryScheme {
    fn fetch(&self, url: &Url) -> io::Result<Vec<u8>> {
        self.files
            .get(&clean_path("/", url.path()))
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }
}

/// Scheme registry.
#[derive(Clone, Default)]
pub struct Schemes {
    handlers: HashMap<String, Arc<dyn Scheme>>,
}

impl Schemes {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `file` only.
    pub fn local() -> Self {
        let mut schemes = Self::new();
        schemes.register("file", FileScheme);
        schemes
    }

    /// `file`, `http` and `https`.
    pub fn with_defaults() -> Self {
        let mut schemes = Self::local();
        let http: Arc<dyn Scheme> = Arc::new(HttpScheme::default());
        schemes.register_shared("http", Arc::clone(&http));
        schemes.register_shared("https", http);
        schemes
    }

    pub fn register(&mut self, scheme: &str, handler: impl Scheme + 'static) {
        self.register_shared(scheme, Arc::new(handler));
    }

    pub fn register_shared(&mut self, scheme: &str, handler: Arc<dyn Scheme>) {
        self.handlers.insert(scheme.to_ascii_lowercase(), handler);
    }

    fn handler(&self, url: &Url) -> Result<Arc<dyn Scheme>> {
        self.handlers
            .get(url.scheme())
            .cloned()
            .ok_or_else(|| ConfigError::NoSuchScheme {
                url: url.to_string(),
            })
    }

    /// Fetches `url` now.
    pub fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        self.handler(url)?
            .fetch(url)
            .map_err(|e| ConfigError::NoSuchFile {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn fetch_string(&self, url: &Url) -> Result<String> {
        let bytes = self.fetch(url)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// A source that fetches `url` on first read. The scheme is checked now,
    /// the file itself only when read.
    pub fn lazy_fetch(&self, url: &Url) -> Result<ByteSource> {
        let scheme = self.handler(url)?;
        let local = scheme.local_path(url);
        Ok(ByteSource::lazy(LazyUrl {
            url: url.clone(),
            scheme,
            local,
        }))
    }
}

impl fmt::Debug for Schemes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("Schemes").field("handlers", &names).finish()
    }
}

struct LazyUrl {
    url: Url,
    scheme: Arc<dyn Scheme>,
    local: Option<PathBuf>,
}

impl Fetch for LazyUrl {
    fn fetch(&self) -> io::Result<Vec<u8>> {
        self.scheme.fetch(&self.url)
    }

    fn describe(&self) -> String {
        match &self.local {
            Some(path) => path.display().to_string(),
            None => self.url.to_string(),
        }
    }

    fn local_path(&self) -> Option<&Path> {
        self.local.as_deref()
    }

    fn size_hint(&self) -> Option<u64> {
        self.local
            .as_ref()
            .and_then(|path| fs::metadata(path).ok())
            .map(|meta| meta.len())
    }
}

/// Lexically joins `name` onto `base`, resolving `.` and `..`. The result is
/// always absolute and never climbs above `/`.
pub fn clean_path(base: &str, name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(name.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parse_absolute(name: &str) -> Option<Url> {
    // "c:" style one-letter schemes are paths, not URLs.
    match Url::parse(name) {
        Ok(url) if url.scheme().len() > 1 => Some(url),
        _ => None,
    }
}

/// Resolves `name` under `root`: full URLs are returned as-is, anything
/// else (absolute or relative) becomes a path below `root`'s path.
pub fn resolve_under(name: &str, root: &Url) -> Url {
    if let Some(url) = parse_absolute(name) {
        return url;
    }
    let mut url = root.clone();
    url.set_path(&clean_path(root.path(), name));
    url
}

/// Resolves `name` the way a browser would against `dir`: full URLs as-is,
/// absolute paths replace the path, relative paths append to it.
pub fn resolve_relative(name: &str, dir: &Url) -> Result<Url> {
    if let Some(url) = parse_absolute(name) {
        return Ok(url);
    }
    Ok(dir.join(name)?)
}

/// `url` with its last path segment removed, ending in `/`.
pub fn dir_url(url: &Url) -> Url {
    let mut dir = url.clone();
    let path = url.path();
    let cut = path.rfind('/').map_or(0, |idx| idx + 1);
    dir.set_path(&path[..cut]);
    dir.set_query(None);
    dir.set_fragment(None);
    dir
}

/// `file://` URL of a local directory such as a mount point.
pub fn dir_file_url(path: &Path) -> Result<Url> {
    Url::from_directory_path(path).map_err(|()| ConfigError::NoSuchFile {
        url: path.display().to_string(),
        reason: "not an absolute path".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("url")
    }

    #[test]
    fn resolves_paths_under_root() {
        let root = url("file:///mnt/sda1/");
        assert_eq!(
            resolve_under("/boot/vmlinuz", &root).as_str(),
            "file:///mnt/sda1/boot/vmlinuz"
        );
        assert_eq!(
            resolve_under("vmlinuz", &root).as_str(),
            "file:///mnt/sda1/vmlinuz"
        );
        assert_eq!(
            resolve_under("../../../etc/x", &root).as_str(),
            "file:///etc/x"
        );
        assert_eq!(
            resolve_under("http://10.0.0.1/k", &root).as_str(),
            "http://10.0.0.1/k"
        );
    }

    #[test]
    fn resolves_relative_to_directory() {
        let dir = dir_url(&url("http://boot.example/pxe/script.ipxe?x=1"));
        assert_eq!(dir.as_str(), "http://boot.example/pxe/");
        assert_eq!(
            resolve_relative("kernel", &dir).expect("join").as_str(),
            "http://boot.example/pxe/kernel"
        );
        assert_eq!(
            resolve_relative("/abs/kernel", &dir).expect("join").as_str(),
            "http://boot.example/abs/kernel"
        );
    }

    #[test]
    fn unknown_scheme_is_reported_with_url() {
        let schemes = Schemes::local();
        let err = schemes
            .lazy_fetch(&url("tftp://10.0.0.1/pxelinux.0"))
            .expect_err("tftp is not registered");
        assert!(err.is_url_error());
        assert!(matches!(err, ConfigError::NoSuchScheme { ref url } if url.starts_with("tftp://")));
    }

    #[test]
    fn file_scheme_reads_and_reports_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("grub.cfg"), "set default=0\n").expect("write");
        let root = dir_file_url(dir.path()).expect("url");
        let schemes = Schemes::local();

        let text = schemes
            .fetch_string(&resolve_under("grub.cfg", &root))
            .expect("fetch");
        assert_eq!(text, "set default=0\n");

        let err = schemes
            .fetch(&resolve_under("missing.cfg", &root))
            .expect_err("missing");
        assert!(matches!(err, ConfigError::NoSuchFile { .. }));
    }

    #[test]
    fn lazy_file_source_defers_and_knows_its_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir_file_url(dir.path()).expect("url");
        let source = Schemes::local()
            .lazy_fetch(&resolve_under("vmlinuz", &root))
            .expect("lazy");
        assert_eq!(source.local_path(), Some(dir.path().join("vmlinuz").as_path()));
        assert!(source.read_all().is_err());
    }

    #[test]
    fn memory_scheme_serves_registered_files() {
        let mut schemes = Schemes::new();
        schemes.register("http", MemoryScheme::new().with_file("/a/b.cfg", "x"));
        assert_eq!(
            schemes.fetch(&url("http://host/a/./b.cfg")).expect("fetch"),
            b"x"
        );
    }
}
