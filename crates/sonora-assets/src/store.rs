//! Authoritative asset store
//!
//! Blobs live next to a `manifest.json` listing every record. A blob is
//! written first, then the manifest is rewritten; only a successful manifest
//! write makes the asset visible, and a failed one removes the blob again.

use std::io::Read;
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use parking_lot::RwLock;
use sonora_core::AssetId;
use sonora_platform::FileSystem;

use crate::{validate, AssetError, AssetLocator, AssetRecord, AssetResult};

const MANIFEST: &str = "manifest.json";

/// Content storage plus manifest
pub struct AssetStore {
    fs: FileSystem,
    records: RwLock<AHashMap<AssetId, AssetRecord>>,
}

impl AssetStore {
    /// Open (or create) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> AssetResult<Self> {
        let fs = FileSystem::open(root)?;

        let mut records = AHashMap::new();
        if fs.exists(MANIFEST) {
            let manifest: Vec<AssetRecord> = serde_json::from_str(&fs.read_string(MANIFEST)?)?;
            for record in manifest {
                if !fs.exists(record.blob_name()) {
                    log::warn!("Manifest lists {} but its blob is missing", record.id);
                    continue;
                }
                records.insert(record.id, record);
            }
        }

        log::info!(
            "Opened asset store at {} with {} assets",
            fs.root().display(),
            records.len()
        );

        Ok(Self {
            fs,
            records: RwLock::new(records),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        self.fs.root()
    }

    /// Check a file name against the container allow-list
    pub fn validate(filename: &str) -> bool {
        validate(filename)
    }

    /// Store a stream under a fresh id.
    ///
    /// Nothing is registered unless the manifest write succeeds.
    pub fn store(&self, reader: &mut dyn Read, original_filename: &str) -> AssetResult<AssetRecord> {
        let display_name = Path::new(original_filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !validate(&display_name) {
            return Err(AssetError::InvalidFormat(original_filename.to_string()));
        }

        let record = AssetRecord {
            id: AssetId::new_random(),
            original_name: display_name,
        };
        let blob = record.blob_name();
        let size = self.fs.write_stream_atomic(&blob, reader)?;

        let mut records = self.records.write();
        records.insert(record.id, record.clone());
        if let Err(err) = self.write_manifest(&records) {
            records.remove(&record.id);
            drop(records);
            if let Err(cleanup) = self.fs.remove(&blob) {
                log::warn!("Could not remove orphaned blob {}: {}", blob, cleanup);
            }
            return Err(err);
        }

        log::info!(
            "Stored asset {} ('{}', {} bytes)",
            record.id,
            record.original_name,
            size
        );
        Ok(record)
    }

    /// Path of an asset's blob
    pub fn resolve(&self, id: &AssetId) -> Option<PathBuf> {
        self.records
            .read()
            .get(id)
            .map(|record| self.fs.path(record.blob_name()))
    }

    /// Record of an asset
    pub fn get(&self, id: &AssetId) -> Option<AssetRecord> {
        self.records.read().get(id).cloned()
    }

    /// Every stored record, in no particular order
    pub fn list(&self) -> Vec<AssetRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Number of stored assets
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn write_manifest(&self, records: &AHashMap<AssetId, AssetRecord>) -> AssetResult<()> {
        let mut manifest: Vec<&AssetRecord> = records.values().collect();
        manifest.sort_by(|a, b| a.id.cmp(&b.id));
        let json = serde_json::to_vec_pretty(&manifest)?;
        self.fs.write_atomic(MANIFEST, &json)?;
        Ok(())
    }
}

impl AssetLocator for AssetStore {
    fn locate(&self, id: &AssetId) -> Option<PathBuf> {
        self.resolve(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_store_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::open(dir.path()).unwrap();

        let record = store
            .store(&mut Cursor::new(b"audio bytes".to_vec()), "Track.OGG")
            .unwrap();

        assert_eq!(record.original_name, "Track.OGG");
        let path = store.resolve(&record.id).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"audio bytes");
        assert_eq!(store.list(), vec![record]);
    }

    #[test]
    fn test_invalid_format_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::open(dir.path()).unwrap();

        let result = store.store(&mut Cursor::new(vec![0u8; 8]), "notes.txt");
        assert!(matches!(result, Err(AssetError::InvalidFormat(_))));
        assert!(store.is_empty());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_display_name_drops_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::open(dir.path()).unwrap();

        let record = store
            .store(&mut Cursor::new(vec![1u8; 4]), "../../escape.wav")
            .unwrap();
        assert_eq!(record.original_name, "escape.wav");
        assert!(store.resolve(&record.id).unwrap().starts_with(dir.path()));
    }

    #[test]
    fn test_manifest_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let store = AssetStore::open(dir.path()).unwrap();
            store.store(&mut Cursor::new(vec![1u8; 4]), "a.wav").unwrap();
            store.store(&mut Cursor::new(vec![2u8; 4]), "b.mp3").unwrap()
        };

        let reopened = AssetStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(&first.id).unwrap().original_name, "b.mp3");
    }

    #[test]
    fn test_reopen_skips_records_without_blob() {
        let dir = tempfile::tempdir().unwrap();
        let record = {
            let store = AssetStore::open(dir.path()).unwrap();
            store.store(&mut Cursor::new(vec![1u8; 4]), "a.wav").unwrap()
        };
        std::fs::remove_file(dir.path().join(record.blob_name())).unwrap();

        let reopened = AssetStore::open(dir.path()).unwrap();
        assert!(reopened.resolve(&record.id).is_none());
    }

    #[test]
    fn test_unknown_id_resolves_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::open(dir.path()).unwrap();
        assert!(store.resolve(&AssetId::new_random()).is_none());
        assert!(store.locate(&AssetId::new_random()).is_none());
    }
}
