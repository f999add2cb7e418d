//! # Sonora Platform
//!
//! Operating-system facing helpers shared by the server and client crates:
//! - **FileSystem**: directory-rooted I/O with atomic replacement and chunked reads
//! - **Threading**: named threads with bounded joins and a draining worker pool
//! - **Timers**: interval gating and traced scoped timers with overrun warnings

pub mod filesystem;
pub mod threading;
pub mod timer;

pub use filesystem::{FileSystem, StreamingReader};
pub use threading::{Thread, ThreadPool};
pub use timer::{IntervalTimer, ScopedTimer};

use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("File I/O error: {0}")]
    FileIO(#[from] std::io::Error),

    #[error("Threading error: {0}")]
    Thread(String),
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;
