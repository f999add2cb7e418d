//! Wire messages
//!
//! Everything exchanged between the authoritative side and consumers. The
//! routing layer that maps a message to a connection lives outside Sonora;
//! these types only describe payloads.

use serde::{Deserialize, Serialize};
use sonora_core::{AssetId, BlockPos, ChannelKey, TransactionId};

/// Consumer → authoritative side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Ask to upload `size` bytes named `filename`
    RequestUpload {
        tx_id: TransactionId,
        filename: String,
        size: u64,
    },
    /// One ordered block of an approved upload
    UploadChunk { tx_id: TransactionId, bytes: Vec<u8> },
    /// Ask for the catalog of stored assets
    RequestAssetList,
    /// Ask for an asset's bytes
    RequestAsset { id: AssetId },
    /// Change the looping flag of the channel a binding plays
    SetLooping { position: BlockPos, looping: bool },
    /// Point a proxy binding at another channel
    SetChannelId {
        position: BlockPos,
        channel_key: ChannelKey,
    },
}

impl ClientMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestUpload { .. } => "RequestUpload",
            Self::UploadChunk { .. } => "UploadChunk",
            Self::RequestAssetList => "RequestAssetList",
            Self::RequestAsset { .. } => "RequestAsset",
            Self::SetLooping { .. } => "SetLooping",
            Self::SetChannelId { .. } => "SetChannelId",
        }
    }
}

/// Catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSummary {
    pub id: AssetId,
    pub display_name: String,
}

/// Playback instruction for one consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Directive {
    /// Start the asset at `offset_seconds` on the source at `position`
    Play {
        position: BlockPos,
        asset_id: AssetId,
        display_name: String,
        offset_seconds: f64,
        looping: bool,
    },
    /// Stop whatever plays at `position`
    Stop { position: BlockPos },
    /// Update the loop flag of a running source
    SetLooping { position: BlockPos, looping: bool },
}

impl Directive {
    /// Position of the source this directive targets
    pub fn position(&self) -> BlockPos {
        match self {
            Self::Play { position, .. }
            | Self::Stop { position }
            | Self::SetLooping { position, .. } => *position,
        }
    }
}

/// Authoritative side → consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Admission decision for an upload
    ResponseUpload {
        tx_id: TransactionId,
        approved: bool,
        max_chunk: u32,
        reason: Option<String>,
    },
    /// Terminal result of an upload
    Acknowledge {
        tx_id: TransactionId,
        success: bool,
        display_name: Option<String>,
        reason: Option<String>,
    },
    /// Catalog of stored assets
    AssetList { assets: Vec<AssetSummary> },
    /// One ordered block of an asset
    AssetChunk {
        id: AssetId,
        bytes: Vec<u8>,
        is_last: bool,
    },
    /// The requested asset does not exist
    AssetUnavailable { id: AssetId },
    /// Playback instruction
    Directive(Directive),
}

impl ServerMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResponseUpload { .. } => "ResponseUpload",
            Self::Acknowledge { .. } => "Acknowledge",
            Self::AssetList { .. } => "AssetList",
            Self::AssetChunk { .. } => "AssetChunk",
            Self::AssetUnavailable { .. } => "AssetUnavailable",
            Self::Directive(_) => "Directive",
        }
    }
}

impl From<Directive> for ServerMessage {
    fn from(directive: Directive) -> Self {
        Self::Directive(directive)
    }
}
