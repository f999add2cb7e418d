//! # Sonora Audio
//!
//! Consumer side of Sonora: turns playback directives into streamed audio.
//!
//! ## Features
//! - Incremental decode through symphonia with exact join offsets
//! - One streaming thread per active position over rotating backend buffers
//! - Looping restarts that reuse buffer handles
//! - Distance-based gain pass
//! - Non-blocking teardown with bounded forced release
//! - Deferred starts while an asset downloads
//! - Software mixing onto the default output device (`device` feature)

pub mod backend;
pub mod client;
pub mod decode;
pub mod engine;
pub mod gain;
pub mod mixer;
pub mod resource;

#[cfg(feature = "device")]
pub mod device;

pub use backend::{AudioBackend, BufferId, Consumption, NullBackend, NullStats, SourceId, SourceState};
pub use client::{ClientSession, SessionEvent};
pub use decode::{
    seek_byte_offset, BufferFormat, MemoryOpener, PcmFormat, PcmStream, StreamOpener, SymphoniaOpener,
};
pub use engine::{EngineSettings, PlayOutcome, StreamingEngine};
pub use gain::attenuation;
pub use mixer::SoftwareMixer;
pub use resource::{ResourceHandles, StreamPhase, StreamSettings, StreamingResource};

#[cfg(feature = "device")]
pub use device::CpalBackend;

use sonora_assets::AssetError;
use sonora_platform::PlatformError;
use sonora_transfer::TransferError;
use thiserror::Error;

/// Playback errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Seek to byte {requested} failed: stream ends after {available} bytes")]
    SeekFailure { requested: u64, available: u64 },

    #[error("Unsupported audio: {0}")]
    DecodeUnsupported(String),

    #[error("Resource mismatch: {0}")]
    ResourceMismatch(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Decode error: {0}")]
    Decode(#[from] symphonia::core::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),
}

/// Result type for playback operations
pub type AudioResult<T> = Result<T, AudioError>;
