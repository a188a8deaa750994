//! Asset keys and their resolved locations.

use std::fmt;

/// Longest key, in bytes, that a bundle may index.
pub const MAX_KEY_LEN: usize = 255;

/// Normalise an asset key for case-insensitive matching.
///
/// Lower-cases, converts `\` to `/` and strips any leading `./` or `/`.
pub fn normalize_key(key: &str) -> String {
    let mut normalized = key.trim().replace('\\', "/").to_lowercase();
    loop {
        if let Some(rest) = normalized.strip_prefix("./") {
            normalized = rest.to_string();
        } else if let Some(rest) = normalized.strip_prefix('/') {
            normalized = rest.to_string();
        } else {
            break;
        }
    }
    normalized
}

/// A fixed-width key derived from a normalised asset name.
///
/// Two keys that differ only in case or separator style hash equally.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyHash(u64);

impl KeyHash {
    pub fn new(key: &str) -> Self {
        Self::of_normalized(&normalize_key(key))
    }

    /// Hash a key that has already been through [`normalize_key`].
    ///
    /// The first eight bytes of its BLAKE3 digest. Distinct keys may still
    /// collide, so lookups compare the stored key after a hit.
    pub fn of_normalized(normalized: &str) -> Self {
        let digest = blake3::hash(normalized.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_le_bytes(head))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({:016x})", self.0)
    }
}

impl From<&str> for KeyHash {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Where a key lives: the bundle's slot index and the asset's index inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mapped {
    pub bundle_index: u32,
    pub asset_index: u32,
}

impl Mapped {
    pub const fn new(bundle_index: u32, asset_index: u32) -> Self {
        Self {
            bundle_index,
            asset_index,
        }
    }
}

/// Extension of a key (text after the last `.` of the final path segment).
pub fn key_extension(key: &str) -> Option<&str> {
    let file = key.rsplit(['/', '\\']).next()?;
    file.rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
}
