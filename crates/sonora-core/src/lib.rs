//! # Sonora Core
//!
//! Foundational types shared by every Sonora crate.
//!
//! - **Ids**: opaque asset, transaction and observer identifiers plus channel keys
//! - **Math**: block positions used as spatial keys for speakers and proxies
//! - **Time**: fixed-rate simulation ticks and tick/seconds conversion
//! - **Config**: server and client tunables loaded from JSON

pub mod config;
pub mod ids;
pub mod math;
pub mod time;

pub use config::{ClientConfig, ServerConfig, SonoraConfig};
pub use ids::{AssetId, ChannelKey, ObserverId, TransactionId};
pub use math::{BlockPos, Vec3};
pub use time::{NOT_PLAYING, TickClock, TickRate};

use thiserror::Error;

/// Core errors
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
