//! The bundle container format.
//!
//! A bundle is a single byte buffer holding an entry table followed by the
//! entry payloads. All integers are little-endian.
//!
//! ```text
//! magic   "STRB"
//! version u16
//! flags   u16        (reserved, zero)
//! count   u32
//! count × { name_len u16, name [u8; name_len], offset u64, len u64 }
//! data    [u8]       (offsets are relative to the start of this section)
//! ```

use std::ops::Range;
use std::sync::Arc;

use strata_core::alloc::HashMap;

use crate::error::{BundleError, BundleResult};
use crate::key::{KeyHash, normalize_key};

pub const MAGIC: [u8; 4] = *b"STRB";
pub const FORMAT_VERSION: u16 = 1;

/// One named entry inside an archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    name: Box<str>,
    range: Range<usize>,
}

impl ArchiveEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// A decoded bundle: an entry table over one shared byte buffer.
#[derive(Debug, Clone)]
pub struct BundleArchive {
    bytes: Arc<[u8]>,
    entries: Vec<ArchiveEntry>,
    by_key: HashMap<KeyHash, u32>,
}

impl BundleArchive {
    /// Parse `bytes`. `origin` is only used in error messages.
    pub fn decode(origin: &str, bytes: Arc<[u8]>) -> BundleResult<Self> {
        let corrupt = |reason: String| BundleError::Corrupt {
            bundle: origin.to_string(),
            reason,
        };

        let mut reader = Reader::new(&bytes);
        let magic = reader.take(4).ok_or_else(|| corrupt("missing header".into()))?;
        if magic != MAGIC {
            return Err(corrupt("bad magic".into()));
        }
        let version = reader.u16().ok_or_else(|| corrupt("missing version".into()))?;
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported version {}", version)));
        }
        let _flags = reader.u16().ok_or_else(|| corrupt("missing flags".into()))?;
        let count = reader.u32().ok_or_else(|| corrupt("missing entry count".into()))? as usize;

        let mut raw = Vec::with_capacity(count.min(4096));
        for i in 0..count {
            let truncated = || corrupt(format!("entry table truncated at entry {}", i));
            let name_len = reader.u16().ok_or_else(truncated)? as usize;
            let name = reader.take(name_len).ok_or_else(truncated)?;
            let name = std::str::from_utf8(name)
                .map_err(|_| corrupt(format!("entry {} has a non UTF-8 name", i)))?;
            let offset = reader.u64().ok_or_else(truncated)?;
            let len = reader.u64().ok_or_else(truncated)?;
            raw.push((name, offset, len));
        }

        let data_start = reader.position();
        let data_len = (bytes.len() - data_start) as u64;
        let mut entries = Vec::with_capacity(raw.len());
        let mut by_key = HashMap::with_capacity(raw.len());
        for (name, offset, len) in raw {
            let end = offset
                .checked_add(len)
                .filter(|end| *end <= data_len)
                .ok_or_else(|| corrupt(format!("entry '{}' extends past the data section", name)))?;

            let hash = KeyHash::of_normalized(&normalize_key(name));
            if by_key.insert(hash, entries.len() as u32).is_some() {
                return Err(corrupt(format!("duplicate entry '{}'", name)));
            }

            entries.push(ArchiveEntry {
                name: name.into(),
                range: data_start + offset as usize..data_start + end as usize,
            });
        }

        Ok(Self {
            bytes,
            entries,
            by_key,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Entry names in table order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name())
    }

    pub fn find(&self, key: KeyHash) -> Option<u32> {
        self.by_key.get(&key).copied()
    }

    /// Bytes of entry `index`.
    pub fn entry_bytes(&self, index: u32) -> Option<AssetBytes> {
        let entry = self.entries.get(index as usize)?;
        Some(AssetBytes {
            bytes: self.bytes.clone(),
            range: entry.range.clone(),
        })
    }

    /// Size of the whole encoded archive.
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// The whole encoded archive.
    pub fn raw_bytes(&self) -> Arc<[u8]> {
        self.bytes.clone()
    }
}

/// A zero-copy view of one entry's bytes.
#[derive(Clone)]
pub struct AssetBytes {
    bytes: Arc<[u8]>,
    range: Range<usize>,
}

impl AssetBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.range.clone()]
    }
}

impl std::ops::Deref for AssetBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for AssetBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetBytes")
            .field("len", &self.range.len())
            .finish()
    }
}

/// Builds the encoded form of a bundle.
///
/// # Example
///
/// ```
/// use strata_bundles::archive::BundleArchiveBuilder;
///
/// let bytes = BundleArchiveBuilder::new()
///     .with_entry("foo.txt", b"foo".to_vec())
///     .with_entry("bar.txt", b"bar".to_vec())
///     .build();
/// assert_eq!(&bytes[..4], b"STRB");
/// ```
#[derive(Debug, Default, Clone)]
pub struct BundleArchiveBuilder {
    entries: Vec<(String, Vec<u8>)>,
}

impl BundleArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.entries.push((name.into(), bytes.into()));
        self
    }

    pub fn with_entry(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.add(name, bytes);
        self
    }

    /// # Panics
    ///
    /// Panics if a name is longer than `u16::MAX` bytes.
    pub fn build(&self) -> Vec<u8> {
        let table_len: usize = self.entries.iter().map(|(name, _)| 2 + name.len() + 16).sum();
        let data_len: usize = self.entries.iter().map(|(_, bytes)| bytes.len()).sum();
        let mut out = Vec::with_capacity(12 + table_len + data_len);

        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());

        let mut offset = 0u64;
        for (name, bytes) in &self.entries {
            let name_len = u16::try_from(name.len()).expect("entry name longer than u16::MAX");
            out.extend_from_slice(&name_len.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            offset += bytes.len() as u64;
        }
        for (_, bytes) in &self.entries {
            out.extend_from_slice(bytes);
        }
        out
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Some(u64::from_le_bytes(buf))
    }
}
