//! Consumer-side download cache
//!
//! Downloaded assets are flushed here under their id once the last chunk
//! arrives. The cache is append-only; stale entries are never invalidated
//! because asset ids are never reused.

use std::path::{Path, PathBuf};

use sonora_core::AssetId;
use sonora_platform::FileSystem;

use crate::{AssetLocator, AssetResult};

/// Local persistent cache of downloaded assets
#[derive(Debug, Clone)]
pub struct AssetCache {
    fs: FileSystem,
}

impl AssetCache {
    /// Open (or create) a cache rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> AssetResult<Self> {
        let fs = FileSystem::open(root)?;
        Ok(Self { fs })
    }

    /// Root directory of the cache
    pub fn root(&self) -> &Path {
        self.fs.root()
    }

    /// Whether an asset is cached
    pub fn contains(&self, id: &AssetId) -> bool {
        self.fs.exists(id.to_string())
    }

    /// Path of a cached asset
    pub fn resolve(&self, id: &AssetId) -> Option<PathBuf> {
        let name = id.to_string();
        self.fs.exists(&name).then(|| self.fs.path(name))
    }

    /// Flush a complete download into the cache
    pub fn insert(&self, id: &AssetId, data: &[u8]) -> AssetResult<PathBuf> {
        let name = id.to_string();
        self.fs.write_atomic(&name, data)?;
        log::debug!("Cached asset {} ({} bytes)", id, data.len());
        Ok(self.fs.path(name))
    }
}

impl AssetLocator for AssetCache {
    fn locate(&self, id: &AssetId) -> Option<PathBuf> {
        self.resolve(id)
    }
}
