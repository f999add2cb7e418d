//! # Sonora Transfer
//!
//! Chunked asset movement between consumers and the authoritative store.
//!
//! ## Features
//! - Upload admission control before any byte moves
//! - Ordered upload chunks bounded by a negotiated size
//! - Download streaming with an explicit last-chunk marker
//! - Consumer-side reassembly into the local cache
//! - Bincode frame codec for every wire message

pub mod codec;
pub mod download;
pub mod messages;
pub mod upload;

pub use codec::{decode, encode, MAX_FRAME_BYTES};
pub use download::{AssetChunks, DownloadClient, DownloadServer};
pub use messages::{AssetSummary, ClientMessage, Directive, ServerMessage};
pub use upload::{UploadClient, UploadPolicy, UploadServer};

use sonora_assets::AssetError;
use sonora_core::TransactionId;
use sonora_platform::PlatformError;
use thiserror::Error;

/// Transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Upload of {size} bytes exceeds the {limit} byte limit")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("Upload declares zero bytes")]
    EmptyUpload,

    #[error("Transaction already in flight: {0}")]
    DuplicateTransaction(TransactionId),

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(String),

    #[error("Chunk of {size} bytes exceeds the negotiated {limit} bytes")]
    ChunkTooLarge { size: usize, limit: u32 },

    #[error("Upload denied: {0}")]
    Denied(String),

    #[error("Upload rejected: {0}")]
    Rejected(String),

    #[error("Source ended after {actual} of {expected} bytes")]
    Truncated { expected: u64, actual: u64 },

    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Frame of {0} bytes is too large")]
    FrameTooLarge(usize),
}

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Destination for outgoing messages.
///
/// The transport is external; handlers only push into whatever queue the
/// caller routes from.
pub trait Outbox<M> {
    fn push(&mut self, message: M);
}

impl<M> Outbox<M> for Vec<M> {
    fn push(&mut self, message: M) {
        Vec::push(self, message);
    }
}
