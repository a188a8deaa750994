//! Asset loader traits and infrastructure.

use std::any::TypeId;
use std::sync::Arc;

use strata_core::alloc::HashMap;

use crate::archive::AssetBytes;
use crate::error::{BundleError, BundleResult};
use crate::payload::AssetObject;

/// Context provided to asset loaders during loading.
pub struct LoadContext<'a> {
    /// URI of the bundle the asset lives in.
    pub bundle: &'a str,
    /// The asset's key as stored in the bundle.
    pub key: &'a str,
    /// The raw bytes of the asset.
    pub bytes: &'a [u8],
    /// Key extension (without the dot), if available.
    pub extension: Option<&'a str>,
}

impl<'a> LoadContext<'a> {
    pub fn new(bundle: &'a str, key: &'a str, bytes: &'a [u8], extension: Option<&'a str>) -> Self {
        Self {
            bundle,
            key,
            bytes,
            extension,
        }
    }

    /// A [`BundleError::LoaderError`] for this asset.
    pub fn error(&self, message: impl Into<String>) -> BundleError {
        BundleError::LoaderError {
            key: self.key.to_string(),
            message: message.into(),
        }
    }
}

/// Default priority for loaders.
pub const DEFAULT_LOADER_PRIORITY: i32 = 0;

/// Decodes the bytes of a bundle entry into a typed asset.
///
/// # Example
///
/// ```ignore
/// struct ShaderLoader;
///
/// impl AssetLoader for ShaderLoader {
///     type Asset = ShaderSource;
///
///     fn extensions(&self) -> &[&str] {
///         &["wgsl"]
///     }
///
///     fn load(&self, ctx: LoadContext<'_>) -> BundleResult<Self::Asset> {
///         // Parse ctx.bytes...
///     }
/// }
/// ```
pub trait AssetLoader: Send + Sync + 'static {
    /// The asset type this loader produces.
    type Asset: crate::Asset;

    /// The key extensions this loader handles (without dots).
    fn extensions(&self) -> &[&str];

    fn load(&self, ctx: LoadContext<'_>) -> BundleResult<Self::Asset>;

    /// Higher priority loaders win when several handle the same type and
    /// extension.
    fn priority(&self) -> i32 {
        DEFAULT_LOADER_PRIORITY
    }
}

/// Type-erased asset loader for dynamic dispatch.
pub trait ErasedAssetLoader: Send + Sync {
    fn asset_type_id(&self) -> TypeId;

    fn asset_type_name(&self) -> &'static str;

    fn extensions(&self) -> &[&str];

    fn priority(&self) -> i32;

    fn load_erased(&self, ctx: LoadContext<'_>) -> BundleResult<AssetObject>;
}

impl<L: AssetLoader> ErasedAssetLoader for L {
    fn asset_type_id(&self) -> TypeId {
        TypeId::of::<L::Asset>()
    }

    fn asset_type_name(&self) -> &'static str {
        <L::Asset as crate::Asset>::type_name()
    }

    fn extensions(&self) -> &[&str] {
        AssetLoader::extensions(self)
    }

    fn priority(&self) -> i32 {
        AssetLoader::priority(self)
    }

    fn load_erased(&self, ctx: LoadContext<'_>) -> BundleResult<AssetObject> {
        let asset = self.load(ctx)?;
        Ok(Arc::new(asset))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LoaderKey {
    type_id: TypeId,
    extension: String,
}

#[derive(Clone)]
struct LoaderEntry {
    loader: Arc<dyn ErasedAssetLoader>,
    priority: i32,
}

/// Registry of asset loaders, indexed by asset type and extension.
///
/// Decoding an asset of type `T` from a key ending in `.ext` uses the
/// highest-priority loader that produces `T` and handles `ext`. Raw
/// [`AssetBytes`] never go through a loader.
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    by_type_and_ext: HashMap<LoaderKey, Vec<LoaderEntry>>,
    by_type: HashMap<TypeId, Vec<Arc<dyn ErasedAssetLoader>>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with [`TextLoader`] and [`BytesLoader`] installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(TextLoader);
        registry.register(BytesLoader);
        registry
    }

    /// Register a loader for its declared extensions.
    pub fn register<L: AssetLoader>(&mut self, loader: L) {
        let loader: Arc<dyn ErasedAssetLoader> = Arc::new(loader);
        let type_id = loader.asset_type_id();
        let priority = loader.priority();

        for ext in loader.extensions() {
            let key = LoaderKey {
                type_id,
                extension: ext.to_lowercase(),
            };
            let entries = self.by_type_and_ext.entry(key).or_default();
            entries.push(LoaderEntry {
                loader: loader.clone(),
                priority,
            });
            entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        tracing::debug!(
            "Registered loader for {} ({:?})",
            loader.asset_type_name(),
            loader.extensions()
        );
        self.by_type.entry(type_id).or_default().push(loader);
    }

    pub fn get(&self, type_id: TypeId, extension: &str) -> Option<&Arc<dyn ErasedAssetLoader>> {
        let key = LoaderKey {
            type_id,
            extension: extension.to_lowercase(),
        };
        self.by_type_and_ext
            .get(&key)
            .and_then(|entries| entries.first())
            .map(|entry| &entry.loader)
    }

    pub fn has_loader_for<T: 'static>(&self, extension: &str) -> bool {
        self.get(TypeId::of::<T>(), extension).is_some()
    }

    pub fn has_loader_for_type<T: 'static>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    /// Decode `ctx` into an object of `type_id`.
    pub fn decode(
        &self,
        type_id: TypeId,
        type_name: &'static str,
        ctx: LoadContext<'_>,
    ) -> BundleResult<AssetObject> {
        let loader = ctx
            .extension
            .and_then(|ext| self.get(type_id, ext))
            .ok_or_else(|| BundleError::NoLoader {
                type_name,
                extension: ctx.extension.map(str::to_string),
            })?;
        loader.load_erased(ctx)
    }

    /// Decode `ctx` into a `T`.
    pub fn load_typed<T: crate::Asset>(&self, ctx: LoadContext<'_>) -> BundleResult<Arc<T>> {
        self.decode(TypeId::of::<T>(), T::type_name(), ctx)?
            .downcast::<T>()
            .map_err(|_| BundleError::TypeMismatch {
                expected: T::type_name(),
                actual: TypeId::of::<T>(),
            })
    }

    /// List all registered extensions for a type.
    pub fn extensions_for_type<T: 'static>(&self) -> Vec<&str> {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(|loaders| {
                loaders
                    .iter()
                    .flat_map(|l| l.extensions().iter().copied())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Decode `bytes` as `type_id`. Raw bytes are passed through untouched.
pub(crate) fn decode_entry(
    registry: &LoaderRegistry,
    bundle: &str,
    key: &str,
    bytes: AssetBytes,
    type_id: TypeId,
    type_name: &'static str,
) -> BundleResult<AssetObject> {
    if type_id == TypeId::of::<AssetBytes>() {
        return Ok(Arc::new(bytes));
    }
    let ctx = LoadContext::new(bundle, key, &bytes, crate::key::key_extension(key));
    registry.decode(type_id, type_name, ctx)
}

/// Loads UTF-8 text.
pub struct TextLoader;

impl AssetLoader for TextLoader {
    type Asset = String;

    fn extensions(&self) -> &[&str] {
        &["txt", "text", "md", "json", "ron", "toml"]
    }

    fn load(&self, ctx: LoadContext<'_>) -> BundleResult<Self::Asset> {
        String::from_utf8(ctx.bytes.to_vec()).map_err(|e| ctx.error(format!("Invalid UTF-8: {}", e)))
    }
}

/// Copies the bytes into an owned buffer.
pub struct BytesLoader;

impl AssetLoader for BytesLoader {
    type Asset = Vec<u8>;

    fn extensions(&self) -> &[&str] {
        &["bin", "bytes", "dat"]
    }

    fn load(&self, ctx: LoadContext<'_>) -> BundleResult<Self::Asset> {
        Ok(ctx.bytes.to_vec())
    }
}
