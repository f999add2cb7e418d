//! # Sonora Assets
//!
//! Storage of uploaded audio assets.
//!
//! ## Features
//! - Random opaque asset ids mapped to original display names
//! - Manifest persisted wholesale on every store; the manifest write commits
//! - Extension allow-list validation before anything touches disk
//! - Consumer-side download cache with the same lookup surface

pub mod cache;
pub mod store;

pub use cache::AssetCache;
pub use store::AssetStore;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sonora_core::AssetId;
use sonora_platform::PlatformError;
use thiserror::Error;

/// Asset errors
#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Unsupported audio format: {0}")]
    InvalidFormat(String),

    #[error("Asset not found: {0}")]
    NotFound(AssetId),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Result type for asset operations
pub type AssetResult<T> = Result<T, AssetError>;

/// Audio containers accepted for upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioFormat {
    Ogg,
    Mp3,
    Wav,
    Flac,
}

impl AudioFormat {
    /// Every accepted format
    pub const ALL: [AudioFormat; 4] = [Self::Ogg, Self::Mp3, Self::Wav, Self::Flac];

    /// Canonical file extension
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Ogg => "ogg",
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Flac => "flac",
        }
    }

    /// Whether the container usually carries lossy audio
    pub fn is_lossy(&self) -> bool {
        matches!(self, Self::Ogg | Self::Mp3)
    }

    /// Detect the format from a file name, case-insensitively
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = Path::new(filename).extension()?.to_str()?;
        Self::ALL
            .into_iter()
            .find(|format| format.extension().eq_ignore_ascii_case(ext))
    }
}

/// One stored asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub id: AssetId,
    #[serde(rename = "displayName")]
    pub original_name: String,
}

impl AssetRecord {
    /// Container format implied by the original name
    pub fn format(&self) -> Option<AudioFormat> {
        AudioFormat::from_filename(&self.original_name)
    }

    /// Name of the blob file holding this asset's bytes
    pub fn blob_name(&self) -> String {
        match self.format() {
            Some(format) => format!("{}.{}", self.id, format.extension()),
            None => self.id.to_string(),
        }
    }
}

/// Check a file name against the container allow-list
pub fn validate(filename: &str) -> bool {
    AudioFormat::from_filename(filename).is_some()
}

/// Anything that can map an asset id to a playable local file
pub trait AssetLocator: Send + Sync {
    /// Local path of the asset, if present
    fn locate(&self, id: &AssetId) -> Option<PathBuf>;
}
