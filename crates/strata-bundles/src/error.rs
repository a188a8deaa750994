//! Error types for the bundle cache.

use std::any::TypeId;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// One asset that still had outstanding leases when its bundle was unloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
    /// The asset's key as stored in the bundle.
    pub key: String,
    /// Number of leases not yet reserved.
    pub outstanding: u32,
    /// `file:line:column` of every call that acquired a still-open lease.
    ///
    /// Only populated in debug builds.
    pub call_sites: Vec<String>,
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({} outstanding)", self.key, self.outstanding)?;
        if !self.call_sites.is_empty() {
            write!(f, " acquired at [{}]", self.call_sites.join(", "))?;
        }
        Ok(())
    }
}

/// Errors that can occur during bundle and asset operations.
#[derive(Debug)]
pub enum BundleError {
    /// The handle's generation no longer matches its slot.
    StaleHandle {
        /// What the handle was used for.
        context: &'static str,
    },

    /// The key is not part of the bundle's index.
    UnknownKey {
        /// The bundle that was searched.
        bundle: String,
        /// The key as given by the caller.
        key: String,
    },

    /// The bundle's payload has not been fetched.
    NotLoaded {
        /// The bundle's URI.
        bundle: String,
    },

    /// `load` was called on a bundle that is already loaded.
    AlreadyLoaded {
        /// The bundle's URI.
        bundle: String,
    },

    /// `unregister` was called on a bundle that is still loaded or loading.
    StillLoaded {
        /// The bundle's URI.
        bundle: String,
    },

    /// An asset handle was reserved against a bundle it does not belong to.
    OwnershipMismatch {
        /// The bundle the caller reserved against.
        expected: String,
        /// The bundle the handle was issued by.
        actual: String,
    },

    /// The handle's lease was already reserved.
    LeaseNotOutstanding {
        /// The asset key.
        key: String,
    },

    /// `unload` found assets with outstanding leases.
    LeakedReference {
        /// The bundle's URI.
        bundle: String,
        /// Every asset that still had leases.
        leaks: Vec<LeakReport>,
    },

    /// The requested file or memory entry does not exist.
    NotFound {
        /// The path or identifier.
        path: String,
    },

    /// Failed to read bundle bytes.
    Io {
        /// The path that failed.
        path: PathBuf,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// The bundle bytes are not a valid archive.
    Corrupt {
        /// Where the bytes came from.
        bundle: String,
        /// What was wrong with them.
        reason: String,
    },

    /// The fetched bytes do not match the manifest's content hash.
    ContentHashMismatch {
        /// The bundle's name in the manifest.
        bundle: String,
        /// Hash recorded in the manifest.
        expected: String,
        /// Hash of the bytes received.
        actual: String,
    },

    /// No reader is configured for the URI's scheme.
    UnsupportedScheme {
        /// The URI.
        uri: String,
    },

    /// No loader registered for the requested asset type and extension.
    NoLoader {
        /// Human-readable type name.
        type_name: &'static str,
        /// The key's extension, if it had one.
        extension: Option<String>,
    },

    /// The loader failed to decode the asset.
    LoaderError {
        /// The asset key.
        key: String,
        /// Description of the error.
        message: String,
    },

    /// The loaded object is not of the requested type.
    TypeMismatch {
        /// Expected type name.
        expected: &'static str,
        /// Actual type ID.
        actual: TypeId,
    },

    /// The asset is still being fetched.
    NotReady {
        /// The asset key.
        key: String,
    },

    /// Generic error with a message.
    Other {
        /// Error message.
        message: String,
    },
}

impl fmt::Display for BundleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleError::StaleHandle { context } => {
                write!(f, "Stale handle used for {}", context)
            }
            BundleError::UnknownKey { bundle, key } => {
                write!(f, "Asset '{}' is not part of bundle '{}'", key, bundle)
            }
            BundleError::NotLoaded { bundle } => {
                write!(f, "Bundle '{}' is not loaded", bundle)
            }
            BundleError::AlreadyLoaded { bundle } => {
                write!(f, "Bundle '{}' is already loaded", bundle)
            }
            BundleError::StillLoaded { bundle } => {
                write!(f, "Bundle '{}' must be unloaded before it is unregistered", bundle)
            }
            BundleError::OwnershipMismatch { expected, actual } => {
                write!(
                    f,
                    "Asset handle from '{}' is not part of '{}', cannot be reserved",
                    actual, expected
                )
            }
            BundleError::LeaseNotOutstanding { key } => {
                write!(f, "Lease on '{}' was already reserved", key)
            }
            BundleError::LeakedReference { bundle, leaks } => {
                write!(f, "Bundle '{}' still has leased assets: ", bundle)?;
                for (i, leak) in leaks.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", leak)?;
                }
                Ok(())
            }
            BundleError::NotFound { path } => {
                write!(f, "Bundle not found: {}", path)
            }
            BundleError::Io { path, source } => {
                write!(f, "IO error reading '{}': {}", path.display(), source)
            }
            BundleError::Corrupt { bundle, reason } => {
                write!(f, "Corrupt bundle '{}': {}", bundle, reason)
            }
            BundleError::ContentHashMismatch {
                bundle,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Content hash mismatch for '{}': expected {}, got {}",
                    bundle, expected, actual
                )
            }
            BundleError::UnsupportedScheme { uri } => {
                write!(f, "No reader configured for '{}'", uri)
            }
            BundleError::NoLoader {
                type_name,
                extension,
            } => match extension {
                Some(ext) => write!(f, "No loader for {} with extension .{}", type_name, ext),
                None => write!(f, "No loader for {} (key has no extension)", type_name),
            },
            BundleError::LoaderError { key, message } => {
                write!(f, "Failed to load '{}': {}", key, message)
            }
            BundleError::TypeMismatch { expected, .. } => {
                write!(f, "Type mismatch: expected {}", expected)
            }
            BundleError::NotReady { key } => {
                write!(f, "Asset not ready: {}", key)
            }
            BundleError::Other { message } => {
                write!(f, "Bundle error: {}", message)
            }
        }
    }
}

impl std::error::Error for BundleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BundleError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl Clone for BundleError {
    /// IO errors are cloned by kind and message.
    fn clone(&self) -> Self {
        match self {
            BundleError::StaleHandle { context } => BundleError::StaleHandle { context: *context },
            BundleError::UnknownKey { bundle, key } => BundleError::UnknownKey {
                bundle: bundle.clone(),
                key: key.clone(),
            },
            BundleError::NotLoaded { bundle } => BundleError::NotLoaded {
                bundle: bundle.clone(),
            },
            BundleError::AlreadyLoaded { bundle } => BundleError::AlreadyLoaded {
                bundle: bundle.clone(),
            },
            BundleError::StillLoaded { bundle } => BundleError::StillLoaded {
                bundle: bundle.clone(),
            },
            BundleError::OwnershipMismatch { expected, actual } => BundleError::OwnershipMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            BundleError::LeaseNotOutstanding { key } => {
                BundleError::LeaseNotOutstanding { key: key.clone() }
            }
            BundleError::LeakedReference { bundle, leaks } => BundleError::LeakedReference {
                bundle: bundle.clone(),
                leaks: leaks.clone(),
            },
            BundleError::NotFound { path } => BundleError::NotFound { path: path.clone() },
            BundleError::Io { path, source } => BundleError::Io {
                path: path.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            BundleError::Corrupt { bundle, reason } => BundleError::Corrupt {
                bundle: bundle.clone(),
                reason: reason.clone(),
            },
            BundleError::ContentHashMismatch {
                bundle,
                expected,
                actual,
            } => BundleError::ContentHashMismatch {
                bundle: bundle.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            BundleError::UnsupportedScheme { uri } => {
                BundleError::UnsupportedScheme { uri: uri.clone() }
            }
            BundleError::NoLoader {
                type_name,
                extension,
            } => BundleError::NoLoader {
                type_name: *type_name,
                extension: extension.clone(),
            },
            BundleError::LoaderError { key, message } => BundleError::LoaderError {
                key: key.clone(),
                message: message.clone(),
            },
            BundleError::TypeMismatch { expected, actual } => BundleError::TypeMismatch {
                expected: *expected,
                actual: *actual,
            },
            BundleError::NotReady { key } => BundleError::NotReady { key: key.clone() },
            BundleError::Other { message } => BundleError::Other {
                message: message.clone(),
            },
        }
    }
}

impl From<std::io::Error> for BundleError {
    fn from(err: std::io::Error) -> Self {
        BundleError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

/// Result type alias for bundle operations.
pub type BundleResult<T> = Result<T, BundleError>;

/// Result delivered through a [`Promise`](crate::promise::Promise), where the
/// error may be observed by several subscribers.
pub type SharedResult<T> = Result<T, Arc<BundleError>>;
