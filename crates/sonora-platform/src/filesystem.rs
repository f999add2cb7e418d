//! File System Abstraction
//!
//! Directory-rooted file access with atomic replacement and chunked reads.
//!
//! Every persistent document Sonora writes (asset blobs, the manifest, channel
//! state, cached downloads) goes through [`FileSystem::write_atomic`] or
//! [`FileSystem::write_stream_atomic`]: data lands in a temporary sibling file
//! and is renamed into place, so readers never observe a half-written file.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::PlatformResult;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// File system rooted at one directory
#[derive(Debug, Clone)]
pub struct FileSystem {
    root: PathBuf,
}

impl FileSystem {
    /// Create a file system rooted at `root`; the directory is not created
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a file system rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> PlatformResult<Self> {
        let fs = Self::rooted(root);
        fs.ensure_root()?;
        Ok(fs)
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory and all parents
    pub fn ensure_root(&self) -> PlatformResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Resolve a name relative to the root
    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.root.join(name)
    }

    /// Check if a file exists under the root
    pub fn exists(&self, name: impl AsRef<Path>) -> bool {
        self.path(name).is_file()
    }

    /// Read a file's contents
    pub fn read(&self, name: impl AsRef<Path>) -> PlatformResult<Vec<u8>> {
        Ok(std::fs::read(self.path(name))?)
    }

    /// Read a file as a string
    pub fn read_string(&self, name: impl AsRef<Path>) -> PlatformResult<String> {
        Ok(std::fs::read_to_string(self.path(name))?)
    }

    /// Replace a file's contents atomically
    pub fn write_atomic(&self, name: impl AsRef<Path>, data: &[u8]) -> PlatformResult<()> {
        self.write_stream_atomic(name, &mut io::Cursor::new(data))?;
        Ok(())
    }

    /// Copy a stream into a file atomically, returning the bytes written
    pub fn write_stream_atomic(
        &self,
        name: impl AsRef<Path>,
        reader: &mut dyn Read,
    ) -> PlatformResult<u64> {
        let target = self.path(name);
        let temp = temp_sibling(&target);

        let result = (|| -> io::Result<u64> {
            let mut file = std::fs::File::create(&temp)?;
            let written = io::copy(reader, &mut file)?;
            file.flush()?;
            file.sync_all()?;
            std::fs::rename(&temp, &target)?;
            Ok(written)
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&temp);
        }
        Ok(result?)
    }

    /// Remove a file; a missing file is not an error
    pub fn remove(&self, name: impl AsRef<Path>) -> PlatformResult<()> {
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// List file names directly under the root
    pub fn list(&self) -> PlatformResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }
}

fn temp_sibling(target: &Path) -> PathBuf {
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}-{}.tmp", name, std::process::id(), counter))
}

/// Streaming file reader for large files
pub struct StreamingReader {
    file: std::fs::File,
    chunk_size: usize,
    remaining: u64,
}

impl StreamingReader {
    /// Create a new streaming reader
    pub fn new(path: impl AsRef<Path>, chunk_size: usize) -> PlatformResult<Self> {
        let file = std::fs::File::open(path)?;
        let remaining = file.metadata()?.len();
        Ok(Self {
            file,
            chunk_size: chunk_size.max(1),
            remaining,
        })
    }

    /// Bytes not yet returned, as sized when the file was opened
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Read the next chunk; every chunk but the last is exactly `chunk_size`
    pub fn read_chunk(&mut self) -> PlatformResult<Option<Vec<u8>>> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buffer.len() {
            match self.file.read(&mut buffer[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        buffer.truncate(filled);
        self.remaining = self.remaining.saturating_sub(filled as u64);
        Ok(Some(buffer))
    }
}
