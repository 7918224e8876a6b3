// SPDX-License-Identifier: GPL-3.0-only

//! Lazy byte sources for kernels, initrds, device trees and modules
//!
//! A parser can build a speculative image for free: nothing is opened or
//! downloaded until the first `read_all`, and the bytes are cached from then on.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Concatenated initrds are padded to this boundary.
pub const INITRD_ALIGN: usize = 512;

/// Deferred producer of bytes.
pub trait Fetch: Send + Sync {
    fn fetch(&self) -> io::Result<Vec<u8>>;

    /// Human readable origin, e.g. a path or a URL.
    fn describe(&self) -> String;

    fn local_path(&self) -> Option<&Path> {
        None
    }

    fn size_hint(&self) -> Option<u64> {
        None
    }
}

struct FileFetch {
    path: PathBuf,
}

impl Fetch for FileFetch {
    fn fetch(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn local_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn size_hint(&self) -> Option<u64> {
        fs::metadata(&self.path).ok().map(|meta| meta.len())
    }
}

#[derive(Clone)]
struct CachedError {
    kind: io::ErrorKind,
    message: String,
}

enum Inner {
    Bytes {
        name: String,
        data: Arc<[u8]>,
    },
    Lazy {
        fetcher: Box<dyn Fetch>,
        cache: OnceLock<Result<Arc<[u8]>, CachedError>>,
    },
    Concat(Vec<ByteSource>),
}

/// Shared handle to lazily fetched bytes.
#[derive(Clone)]
pub struct ByteSource(Arc<Inner>);

impl ByteSource {
    /// A local file, opened on first read.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::lazy(FileFetch { path: path.into() })
    }

    pub fn lazy(fetcher: impl Fetch + 'static) -> Self {
        Self(Arc::new(Inner::Lazy {
            fetcher: Box::new(fetcher),
            cache: OnceLock::new(),
        }))
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self(Arc::new(Inner::Bytes {
            name: name.into(),
            data: Arc::from(data.into()),
        }))
    }

    /// Concatenates sources in order, padding each but the last to
    /// [`INITRD_ALIGN`].
    pub fn concat(mut parts: Vec<ByteSource>) -> Self {
        if parts.len() == 1 {
            return parts.remove(0);
        }
        Self(Arc::new(Inner::Concat(parts)))
    }

    pub fn read_all(&self) -> io::Result<Arc<[u8]>> {
        match &*self.0 {
            Inner::Bytes { data, .. } => Ok(Arc::clone(data)),
            Inner::Lazy { fetcher, cache } => {
                let cached = cache.get_or_init(|| {
                    fetcher.fetch().map(Arc::from).map_err(|err| CachedError {
                        kind: err.kind(),
                        message: format!("{}: {err}", fetcher.describe()),
                    })
                });
                match cached {
                    Ok(data) => Ok(Arc::clone(data)),
                    Err(err) => Err(io::Error::new(err.kind, err.message.clone())),
                }
            }
            Inner::Concat(parts) => {
                let mut out = Vec::new();
                for (index, part) in parts.iter().enumerate() {
                    out.extend_from_slice(&part.read_all()?);
                    if index + 1 < parts.len() {
                        let padded = out.len().div_ceil(INITRD_ALIGN) * INITRD_ALIGN;
                        out.resize(padded, 0);
                    }
                }
                Ok(Arc::from(out))
            }
        }
    }

    pub fn describe(&self) -> String {
        match &*self.0 {
            Inner::Bytes { name, .. } => name.clone(),
            Inner::Lazy { fetcher, .. } => fetcher.describe(),
            Inner::Concat(parts) => parts
                .iter()
                .map(ByteSource::describe)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Path of the backing file when the source is a plain local file.
    pub fn local_path(&self) -> Option<&Path> {
        match &*self.0 {
            Inner::Lazy { fetcher, .. } => fetcher.local_path(),
            _ => None,
        }
    }

    /// Size in bytes, if known without fetching.
    pub fn size(&self) -> Option<u64> {
        match &*self.0 {
            Inner::Bytes { data, .. } => Some(data.len() as u64),
            Inner::Lazy { fetcher, cache } => match cache.get() {
                Some(Ok(data)) => Some(data.len() as u64),
                _ => fetcher.size_hint(),
            },
            Inner::Concat(parts) => {
                let mut total = 0u64;
                for (index, part) in parts.iter().enumerate() {
                    total += part.size()?;
                    if index + 1 < parts.len() {
                        total = total.div_ceil(INITRD_ALIGN as u64) * INITRD_ALIGN as u64;
                    }
                }
                Some(total)
            }
        }
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteSource({})", self.describe())
    }
}

impl fmt::Display for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}
