//! Bundle locations.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{BundleError, BundleResult};

/// Where a bundle's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BundleUri {
    /// A file on disk.
    File {
        /// The path as resolved at registration.
        path: PathBuf,
    },

    /// A named entry in the cache's in-memory store.
    Memory {
        /// The entry name.
        name: String,
    },

    /// An `http://` or `https://` location, fetched through the remote reader.
    Remote {
        /// The full URL.
        url: String,
    },
}

impl BundleUri {
    /// Parse a URI. Strings without a scheme are treated as file paths;
    /// relative file paths are joined onto `base` when one is given.
    pub fn parse(uri: &str, base: Option<&Path>) -> BundleResult<Self> {
        let uri = uri.trim();
        if let Some(path) = uri.strip_prefix("file://") {
            return Ok(Self::file(path, base));
        }
        if let Some(name) = uri.strip_prefix("memory://") {
            return Ok(BundleUri::Memory {
                name: name.to_string(),
            });
        }
        let lower = uri.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(BundleUri::Remote {
                url: uri.to_string(),
            });
        }
        if uri.contains("://") {
            return Err(BundleError::UnsupportedScheme {
                uri: uri.to_string(),
            });
        }
        Ok(Self::file(uri, base))
    }

    /// A file URI for `path`, joined onto `base` if `path` is relative.
    pub fn file(path: impl AsRef<Path>, base: Option<&Path>) -> Self {
        let path = path.as_ref();
        let path = match base {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        };
        BundleUri::File { path }
    }

    pub fn memory(name: impl Into<String>) -> Self {
        BundleUri::Memory { name: name.into() }
    }

    /// The key used to detect repeated registrations of the same bundle.
    ///
    /// File paths are made absolute and canonicalised where possible, and
    /// lower-cased on case-insensitive file systems.
    pub fn canonical_key(&self) -> String {
        match self {
            BundleUri::File { path } => format!("file://{}", normalize_path(path)),
            BundleUri::Memory { name } => format!("memory://{}", name),
            BundleUri::Remote { url } => url.clone(),
        }
    }

    /// Final path segment, used to find the bundle in a manifest.
    pub fn name(&self) -> &str {
        let full = match self {
            BundleUri::File { path } => {
                return path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            }
            BundleUri::Memory { name } => name.as_str(),
            BundleUri::Remote { url } => url.split(['?', '#']).next().unwrap_or(url.as_str()),
        };
        full.rsplit('/').find(|s| !s.is_empty()).unwrap_or(full)
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, BundleUri::Remote { .. })
    }
}

impl fmt::Display for BundleUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleUri::File { path } => write!(f, "file://{}", path.display()),
            BundleUri::Memory { name } => write!(f, "memory://{}", name),
            BundleUri::Remote { url } => f.write_str(url),
        }
    }
}

fn normalize_path(path: &Path) -> String {
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    // Falls back to the joined path for files that do not exist yet.
    let normalized = std::fs::canonicalize(&abs_path).unwrap_or(abs_path);
    let path_str = normalized.to_string_lossy().to_string();

    #[cfg(any(target_os = "windows", target_os = "macos"))]
    let path_str = path_str.to_lowercase();

    path_str
}
