//! Content-hash metadata supplied by the build pipeline.
//!
//! The text form has one bundle per line:
//!
//! ```text
//! # name        blake3 hex                                                        size
//! ui.bundle     4f0c...e1                                                         20480
//! ```
//!
//! The size column is optional. Blank lines and lines starting with `#` are
//! ignored.

use std::fmt;

use strata_core::alloc::HashMap;

use crate::error::{BundleError, BundleResult};

/// BLAKE3 digest of a bundle's encoded bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex.trim()).ok().map(|h| Self(*h.as_bytes()))
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestEntry {
    pub content_hash: ContentHash,
    /// Encoded size in bytes, when known.
    pub size: Option<u64>,
}

/// Bundle name to expected content.
#[derive(Debug, Clone, Default)]
pub struct BundleManifest {
    entries: HashMap<String, ManifestEntry>,
}

impl BundleManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> BundleResult<Self> {
        let mut manifest = Self::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let invalid = |reason: &str| BundleError::Other {
                message: format!("manifest line {}: {}", line_no + 1, reason),
            };
            let mut fields = line.split_whitespace();
            let name = fields.next().ok_or_else(|| invalid("missing name"))?;
            let hash = fields
                .next()
                .and_then(ContentHash::from_hex)
                .ok_or_else(|| invalid("missing or malformed content hash"))?;
            let size = match fields.next() {
                Some(size) => Some(size.parse().map_err(|_| invalid("malformed size"))?),
                None => None,
            };
            if fields.next().is_some() {
                return Err(invalid("unexpected trailing fields"));
            }

            manifest.insert(
                name,
                ManifestEntry {
                    content_hash: hash,
                    size,
                },
            );
        }
        Ok(manifest)
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: ManifestEntry) {
        self.entries.insert(name.into(), entry);
    }

    pub fn with_bundle(mut self, name: impl Into<String>, bytes: &[u8]) -> Self {
        self.insert(
            name,
            ManifestEntry {
                content_hash: ContentHash::of(bytes),
                size: Some(bytes.len() as u64),
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.get(name)
    }

    /// Merge `other` into `self`; entries in `other` win.
    pub fn merge(&mut self, other: BundleManifest) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Check `bytes` against `entry`.
pub fn verify(bundle: &str, entry: &ManifestEntry, bytes: &[u8]) -> BundleResult<()> {
    if let Some(size) = entry.size {
        if size != bytes.len() as u64 {
            return Err(BundleError::Corrupt {
                bundle: bundle.to_string(),
                reason: format!("expected {} bytes, got {}", size, bytes.len()),
            });
        }
    }
    let actual = ContentHash::of(bytes);
    if actual != entry.content_hash {
        return Err(BundleError::ContentHashMismatch {
            bundle: bundle.to_string(),
            expected: entry.content_hash.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}
