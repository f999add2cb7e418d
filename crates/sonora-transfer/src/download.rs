//! Chunked download
//!
//! The store answers `RequestAsset` with an ordered run of chunks ending in
//! one marked `is_last`. Consumers buffer per asset id and flush to the cache
//! once the last chunk arrives.

use std::path::PathBuf;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use sonora_assets::{AssetCache, AssetError, AssetStore};
use sonora_core::AssetId;
use sonora_platform::StreamingReader;

use crate::messages::{ClientMessage, ServerMessage};
use crate::{TransferError, TransferResult};

/// Store side of the download protocol
pub struct DownloadServer {
    store: Arc<AssetStore>,
    chunk_size: usize,
}

impl DownloadServer {
    /// Create a download server streaming `chunk_size` byte chunks
    pub fn new(store: Arc<AssetStore>, chunk_size: u32) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1) as usize,
        }
    }

    /// Chunk size used for streaming
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Start streaming an asset
    pub fn stream(&self, id: AssetId) -> TransferResult<AssetChunks> {
        let path = self.store.resolve(&id).ok_or(AssetError::NotFound(id))?;
        let reader = StreamingReader::new(path, self.chunk_size)?;
        log::debug!("Streaming asset {} ({} bytes)", id, reader.remaining());
        Ok(AssetChunks {
            id,
            reader,
            done: false,
        })
    }

    /// Handle `RequestAsset`, pushing every reply in order
    pub fn handle_request(&self, id: AssetId, replies: &mut impl crate::Outbox<ServerMessage>) {
        let chunks = match self.stream(id) {
            Ok(chunks) => chunks,
            Err(err) => {
                log::info!("Asset {} unavailable: {}", id, err);
                replies.push(ServerMessage::AssetUnavailable { id });
                return;
            }
        };

        for chunk in chunks {
            match chunk {
                Ok(message) => replies.push(message),
                Err(err) => {
                    // Consumers discard a partial download once they see this
                    log::error!("Streaming asset {} failed: {}", id, err);
                    replies.push(ServerMessage::AssetUnavailable { id });
                    return;
                }
            }
        }
    }
}

/// Ordered chunks of one asset
pub struct AssetChunks {
    id: AssetId,
    reader: StreamingReader,
    done: bool,
}

impl Iterator for AssetChunks {
    type Item = TransferResult<ServerMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let bytes = match self.reader.read_chunk() {
            Ok(Some(bytes)) => bytes,
            // An empty asset still produces a single last chunk
            Ok(None) => Vec::new(),
            Err(err) => {
                self.done = true;
                return Some(Err(err.into()));
            }
        };

        let is_last = self.reader.remaining() == 0;
        self.done = is_last;
        Some(Ok(ServerMessage::AssetChunk {
            id: self.id,
            bytes,
            is_last,
        }))
    }
}

struct InFlight {
    buffer: Vec<u8>,
    chunks: usize,
}

/// Consumer side of the download protocol
pub struct DownloadClient {
    cache: AssetCache,
    in_flight: Mutex<AHashMap<AssetId, InFlight>>,
}

impl DownloadClient {
    /// Create a client flushing into `cache`
    pub fn new(cache: AssetCache) -> Self {
        Self {
            cache,
            in_flight: Mutex::new(AHashMap::new()),
        }
    }

    /// Local cache
    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    /// Begin fetching an asset.
    ///
    /// Returns `None` when the asset is already cached or being downloaded.
    pub fn request(&self, id: AssetId) -> Option<ClientMessage> {
        if self.cache.contains(&id) {
            return None;
        }
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(&id) {
            return None;
        }
        in_flight.insert(
            id,
            InFlight {
                buffer: Vec::new(),
                chunks: 0,
            },
        );
        Some(ClientMessage::RequestAsset { id })
    }

    /// Whether a download is in flight for `id`
    pub fn is_downloading(&self, id: &AssetId) -> bool {
        self.in_flight.lock().contains_key(id)
    }

    /// Accept one chunk; returns the cached path after the last one
    pub fn accept_chunk(
        &self,
        id: AssetId,
        bytes: Vec<u8>,
        is_last: bool,
    ) -> TransferResult<Option<PathBuf>> {
        let finished = {
            let mut in_flight = self.in_flight.lock();
            let Some(download) = in_flight.get_mut(&id) else {
                return Err(TransferError::UnknownTransaction(id.to_string()));
            };
            download.buffer.extend_from_slice(&bytes);
            download.chunks += 1;
            if !is_last {
                return Ok(None);
            }
            in_flight.remove(&id)
        };

        let Some(download) = finished else {
            return Ok(None);
        };
        log::debug!(
            "Download of {} complete ({} chunks, {} bytes)",
            id,
            download.chunks,
            download.buffer.len()
        );
        let path = self.cache.insert(&id, &download.buffer)?;
        Ok(Some(path))
    }

    /// Drop a partial download
    pub fn abandon(&self, id: &AssetId) -> bool {
        self.in_flight.lock().remove(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stored(bytes: Vec<u8>) -> (tempfile::TempDir, Arc<AssetStore>, AssetId) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AssetStore::open(dir.path().join("store")).unwrap());
        let record = store.store(&mut Cursor::new(bytes), "song.ogg").unwrap();
        (dir, store, record.id)
    }

    #[test]
    fn test_last_flag_only_on_final_chunk() {
        let (_dir, store, id) = stored(vec![3u8; 100]);
        let server = DownloadServer::new(store, 32);

        let chunks: Vec<ServerMessage> = server.stream(id).unwrap().map(Result::unwrap).collect();
        let shape: Vec<(usize, bool)> = chunks
            .iter()
            .map(|c| match c {
                ServerMessage::AssetChunk { bytes, is_last, .. } => (bytes.len(), *is_last),
                other => panic!("unexpected {}", other.kind()),
            })
            .collect();
        assert_eq!(shape, vec![(32, false), (32, false), (32, false), (4, true)]);
    }

    #[test]
    fn test_exact_multiple_ends_with_full_last_chunk() {
        let (_dir, store, id) = stored(vec![1u8; 64]);
        let server = DownloadServer::new(store, 32);

        let lasts: Vec<bool> = server
            .stream(id)
            .unwrap()
            .map(|c| matches!(c.unwrap(), ServerMessage::AssetChunk { is_last: true, .. }))
            .collect();
        assert_eq!(lasts, vec![false, true]);
    }

    #[test]
    fn test_empty_asset_yields_single_last_chunk() {
        let (_dir, store, id) = stored(Vec::new());
        let server = DownloadServer::new(store, 32);

        let chunks: Vec<ServerMessage> = server.stream(id).unwrap().map(Result::unwrap).collect();
        assert_eq!(
            chunks,
            vec![ServerMessage::AssetChunk {
                id,
                bytes: Vec::new(),
                is_last: true
            }]
        );
    }

    #[test]
    fn test_unknown_asset_is_unavailable() {
        let (_dir, store, _) = stored(vec![1u8; 4]);
        let server = DownloadServer::new(store, 32);
        let missing = AssetId::new_random();

        let mut replies: Vec<ServerMessage> = Vec::new();
        server.handle_request(missing, &mut replies);
        assert_eq!(replies, vec![ServerMessage::AssetUnavailable { id: missing }]);
    }

    #[test]
    fn test_client_reassembles_into_cache() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let (dir, store, id) = stored(data.clone());
        let server = DownloadServer::new(store, 128);
        let client = DownloadClient::new(AssetCache::open(dir.path().join("cache")).unwrap());

        assert!(matches!(client.request(id), Some(ClientMessage::RequestAsset { .. })));
        assert!(client.request(id).is_none());

        let mut replies: Vec<ServerMessage> = Vec::new();
        server.handle_request(id, &mut replies);
        let mut cached = None;
        for reply in replies {
            if let ServerMessage::AssetChunk { id, bytes, is_last } = reply {
                cached = client.accept_chunk(id, bytes, is_last).unwrap();
            }
        }

        let path = cached.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), data);
        assert!(!client.is_downloading(&id));
        assert!(client.request(id).is_none());
    }

    #[test]
    fn test_unrequested_chunk_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let client = DownloadClient::new(AssetCache::open(dir.path()).unwrap());
        assert!(matches!(
            client.accept_chunk(AssetId::new_random(), vec![1], true),
            Err(TransferError::UnknownTransaction(_))
        ));
    }
}
