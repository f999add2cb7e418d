//! # Sonora Server
//!
//! Authoritative side of Sonora.
//!
//! ## Features
//! - Channel state shared by key, written through to JSON on every change
//! - Tick-driven scheduling of speakers and proxies with edge-triggered activation
//! - Join offsets computed from the channel start tick
//! - Message dispatch for uploads, downloads, catalog and playback controls

pub mod endpoint;
pub mod scheduler;
pub mod state;
pub mod world;

pub use endpoint::ServerEndpoint;
pub use scheduler::{BindingKind, PlaybackScheduler};
pub use state::{JsonFilePersistence, MemoryPersistence, PlaybackState, StatePersistence, StateStore};
pub use world::{Activation, Observer, SimulatedWorld, World};

use sonora_core::BlockPos;
use sonora_platform::PlatformError;
use thiserror::Error;

/// Channel state errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Inconsistent state for channel '{key}': playing={playing}, start_tick={start_tick}")]
    Inconsistent {
        key: String,
        playing: bool,
        start_tick: i64,
    },

    #[error("Invalid state file path: {0}")]
    InvalidPath(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for state operations
pub type StateResult<T> = Result<T, StateError>;

/// Scheduler errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("No binding at {0}")]
    UnknownBinding(BlockPos),

    #[error("Position {0} is already bound")]
    AlreadyBound(BlockPos),

    #[error("Standalone speaker at {0} cannot change channel")]
    StandaloneBinding(BlockPos),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;
