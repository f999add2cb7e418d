//! Configuration
//!
//! Server and client tunables. Every field has a default so partial JSON files
//! load cleanly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::time::TickRate;
use crate::{CoreError, CoreResult};

/// Authoritative side configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Simulation ticks per second
    pub ticks_per_second: u32,
    /// Hearing range around a speaker, in blocks
    pub listen_range: f32,
    /// Largest upload admitted, in bytes
    pub max_upload_bytes: u64,
    /// Largest chunk an uploader may send
    pub max_chunk_bytes: u32,
    /// Chunk size used when streaming assets to consumers
    pub download_chunk_bytes: u32,
    /// Uploads with no chunk for this long are discarded
    pub upload_idle_timeout_ms: u64,
    /// Directory holding asset blobs and the manifest
    pub asset_dir: PathBuf,
    /// File holding persisted channel state
    pub state_file: PathBuf,
}

impl ServerConfig {
    /// Tick rate derived from `ticks_per_second`
    pub fn tick_rate(&self) -> TickRate {
        TickRate::new(self.ticks_per_second)
    }

    /// Idle time after which an unfinished upload is dropped
    pub fn upload_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_idle_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: 20,
            listen_range: 64.0,
            max_upload_bytes: 32 * 1024 * 1024,
            max_chunk_bytes: 32 * 1024,
            download_chunk_bytes: 32 * 1024,
            upload_idle_timeout_ms: 30_000,
            asset_dir: PathBuf::from("assets"),
            state_file: PathBuf::from("channels.json"),
        }
    }
}

/// Consumer side configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Distance at which gain reaches zero
    pub listen_range: f32,
    /// Rotating buffers per stream
    pub buffer_count: usize,
    /// Bytes of PCM per buffer
    pub buffer_bytes: usize,
    /// Buffer refill polling interval
    pub poll_interval_ms: u64,
    /// Gain recomputation interval
    pub gain_interval_ms: u64,
    /// How long teardown waits for a playback thread before forcing release
    pub stop_timeout_ms: u64,
    /// Worker threads releasing stopped streams
    pub reaper_threads: usize,
    /// Local download cache
    pub cache_dir: PathBuf,
}

impl ClientConfig {
    /// Buffer refill polling interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Gain recomputation interval
    pub fn gain_interval(&self) -> Duration {
        Duration::from_millis(self.gain_interval_ms)
    }

    /// Teardown join timeout
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_range: 64.0,
            buffer_count: 3,
            buffer_bytes: 16 * 1024,
            poll_interval_ms: 10,
            gain_interval_ms: 50,
            stop_timeout_ms: 250,
            reaper_threads: 2,
            cache_dir: PathBuf::from("cache"),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SonoraConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl SonoraConfig {
    /// Load and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        log::debug!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Load a file if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> CoreResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> CoreResult<()> {
        let server = &self.server;
        let client = &self.client;

        if server.ticks_per_second == 0 {
            return Err(CoreError::Config("ticks_per_second must be positive".into()));
        }
        if !(server.listen_range > 0.0) || !(client.listen_range > 0.0) {
            return Err(CoreError::Config("listen_range must be positive".into()));
        }
        if server.max_chunk_bytes == 0 || server.download_chunk_bytes == 0 {
            return Err(CoreError::Config("chunk sizes must be positive".into()));
        }
        if server.upload_idle_timeout_ms == 0 {
            return Err(CoreError::Config("upload_idle_timeout_ms must be positive".into()));
        }
        if client.buffer_count < 2 {
            return Err(CoreError::Config("at least two stream buffers are required".into()));
        }
        // One stereo 16-bit frame is four bytes
        if client.buffer_bytes < 4 {
            return Err(CoreError::Config("buffer_bytes is too small".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SonoraConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.tick_rate().ticks_per_second(), 20);
        assert_eq!(config.client.buffer_count, 3);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sonora.json");
        std::fs::write(&path, r#"{ "server": { "listen_range": 16.0 } }"#).unwrap();

        let config = SonoraConfig::load(&path).unwrap();
        assert_eq!(config.server.listen_range, 16.0);
        assert_eq!(config.server.ticks_per_second, 20);
        assert_eq!(config.client, ClientConfig::default());
    }

    #[test]
    fn test_invalid_buffer_count() {
        let mut config = SonoraConfig::default();
        config.client.buffer_count = 1;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = SonoraConfig::load_or_default(dir.path().join("absent.json")).unwrap();
        assert_eq!(config, SonoraConfig::default());
    }
}
