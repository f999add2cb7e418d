//! Chunked upload
//!
//! The consumer announces `{tx_id, filename, size}`; admission control happens
//! before any byte moves. Approved uploads stream ordered chunks of at most the
//! negotiated size. Once the declared size is reached the store finalizes,
//! acknowledges, and forgets the transaction whatever the outcome. A
//! transaction that receives nothing for the idle timeout is discarded.

use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;
use sonora_assets::{AssetRecord, AssetStore};
use sonora_core::{ServerConfig, TransactionId};

use crate::messages::{ClientMessage, ServerMessage};
use crate::{TransferError, TransferResult};

/// Admission limits for uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPolicy {
    /// Largest declared size admitted
    pub max_upload_bytes: u64,
    /// Largest chunk a consumer may send
    pub max_chunk_bytes: u32,
    /// Inactivity after which an unfinished upload is dropped
    pub idle_timeout: Duration,
}

impl From<&ServerConfig> for UploadPolicy {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_upload_bytes: config.max_upload_bytes,
            max_chunk_bytes: config.max_chunk_bytes,
            idle_timeout: config.upload_idle_timeout(),
        }
    }
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

struct UploadTransaction {
    filename: String,
    total_size: u64,
    received: u64,
    chunks: Vec<Vec<u8>>,
    last_activity: Instant,
}

/// Reads a list of chunks back as one stream without concatenating them
struct ChunkReader {
    chunks: std::vec::IntoIter<Vec<u8>>,
    current: Vec<u8>,
    cursor: usize,
}

impl ChunkReader {
    fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into_iter(),
            current: Vec::new(),
            cursor: 0,
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.cursor >= self.current.len() {
            match self.chunks.next() {
                Some(next) => {
                    self.current = next;
                    self.cursor = 0;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.cursor);
        buf[..n].copy_from_slice(&self.current[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }
}

/// Store side of the upload protocol
pub struct UploadServer {
    store: Arc<AssetStore>,
    policy: UploadPolicy,
    transactions: Mutex<AHashMap<TransactionId, UploadTransaction>>,
}

impl UploadServer {
    /// Create an upload server writing into `store`
    pub fn new(store: Arc<AssetStore>, policy: UploadPolicy) -> Self {
        Self {
            store,
            policy,
            transactions: Mutex::new(AHashMap::new()),
        }
    }

    /// Admission limits
    pub fn policy(&self) -> UploadPolicy {
        self.policy
    }

    /// Number of uploads in flight
    pub fn in_flight(&self) -> usize {
        self.transactions.lock().len()
    }

    /// Admit or deny an upload; returns the negotiated chunk size
    pub fn request(&self, tx_id: TransactionId, filename: &str, size: u64) -> TransferResult<u32> {
        self.request_at(tx_id, filename, size, Instant::now())
    }

    fn request_at(
        &self,
        tx_id: TransactionId,
        filename: &str,
        size: u64,
        now: Instant,
    ) -> TransferResult<u32> {
        self.expire_idle_at(now);
        if size == 0 {
            return Err(TransferError::EmptyUpload);
        }
        if size > self.policy.max_upload_bytes {
            return Err(TransferError::SizeExceeded {
                size,
                limit: self.policy.max_upload_bytes,
            });
        }

        let mut transactions = self.transactions.lock();
        if transactions.contains_key(&tx_id) {
            return Err(TransferError::DuplicateTransaction(tx_id));
        }
        transactions.insert(
            tx_id,
            UploadTransaction {
                filename: filename.to_string(),
                total_size: size,
                received: 0,
                chunks: Vec::new(),
                last_activity: now,
            },
        );

        log::debug!("Approved upload {} of '{}' ({} bytes)", tx_id, filename, size);
        Ok(self.policy.max_chunk_bytes)
    }

    /// Accept one chunk.
    ///
    /// Returns `Ok(None)` while more bytes are expected and `Ok(Some(record))`
    /// once the upload finalized. Any error other than `UnknownTransaction`
    /// means the transaction has been discarded.
    pub fn accept_chunk(
        &self,
        tx_id: TransactionId,
        bytes: Vec<u8>,
    ) -> TransferResult<Option<AssetRecord>> {
        self.accept_chunk_at(tx_id, bytes, Instant::now())
    }

    fn accept_chunk_at(
        &self,
        tx_id: TransactionId,
        bytes: Vec<u8>,
        now: Instant,
    ) -> TransferResult<Option<AssetRecord>> {
        self.expire_idle_at(now);
        let finished = {
            let mut transactions = self.transactions.lock();
            let Some(transaction) = transactions.get_mut(&tx_id) else {
                return Err(TransferError::UnknownTransaction(tx_id.to_string()));
            };

            if bytes.len() > self.policy.max_chunk_bytes as usize {
                transactions.remove(&tx_id);
                return Err(TransferError::ChunkTooLarge {
                    size: bytes.len(),
                    limit: self.policy.max_chunk_bytes,
                });
            }

            transaction.received += bytes.len() as u64;
            transaction.chunks.push(bytes);
            transaction.last_activity = now;
            if transaction.received < transaction.total_size {
                return Ok(None);
            }
            transactions.remove(&tx_id)
        };

        let Some(transaction) = finished else {
            return Ok(None);
        };

        log::debug!(
            "Finalizing upload {} ({} chunks, {} bytes)",
            tx_id,
            transaction.chunks.len(),
            transaction.received
        );
        let mut reader = ChunkReader::new(transaction.chunks);
        let record = self.store.store(&mut reader, &transaction.filename)?;
        Ok(Some(record))
    }

    /// Discard uploads idle for longer than the policy allows; returns how
    /// many were dropped
    pub fn expire_idle(&self) -> usize {
        self.expire_idle_at(Instant::now())
    }

    fn expire_idle_at(&self, now: Instant) -> usize {
        let timeout = self.policy.idle_timeout;
        let mut transactions = self.transactions.lock();
        let before = transactions.len();
        transactions.retain(|tx_id, transaction| {
            let idle = now.saturating_duration_since(transaction.last_activity);
            let keep = idle <= timeout;
            if !keep {
                log::warn!(
                    "Discarding upload {} of '{}' after {:?} without data ({} of {} bytes)",
                    tx_id,
                    transaction.filename,
                    idle,
                    transaction.received,
                    transaction.total_size
                );
            }
            keep
        });
        before - transactions.len()
    }

    /// Handle `RequestUpload` and build the reply
    pub fn handle_request(&self, tx_id: TransactionId, filename: &str, size: u64) -> ServerMessage {
        match self.request(tx_id, filename, size) {
            Ok(max_chunk) => ServerMessage::ResponseUpload {
                tx_id,
                approved: true,
                max_chunk,
                reason: None,
            },
            Err(err) => {
                log::info!("Denied upload {} of '{}': {}", tx_id, filename, err);
                ServerMessage::ResponseUpload {
                    tx_id,
                    approved: false,
                    max_chunk: 0,
                    reason: Some(err.to_string()),
                }
            }
        }
    }

    /// Handle `UploadChunk`; returns the acknowledgement once terminal.
    ///
    /// Chunks for unknown transactions are logged and dropped without reply.
    pub fn handle_chunk(&self, tx_id: TransactionId, bytes: Vec<u8>) -> Option<ServerMessage> {
        match self.accept_chunk(tx_id, bytes) {
            Ok(None) => None,
            Ok(Some(record)) => Some(ServerMessage::Acknowledge {
                tx_id,
                success: true,
                display_name: Some(record.original_name),
                reason: None,
            }),
            Err(TransferError::UnknownTransaction(_)) => {
                log::warn!("Dropping chunk for unknown upload {}", tx_id);
                None
            }
            Err(err) => {
                log::warn!("Upload {} failed: {}", tx_id, err);
                Some(ServerMessage::Acknowledge {
                    tx_id,
                    success: false,
                    display_name: None,
                    reason: Some(err.to_string()),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadPhase {
    AwaitingApproval,
    Sending { max_chunk: u32 },
    AwaitingAck,
    Finished,
}

/// Consumer side of one upload
pub struct UploadClient {
    tx_id: TransactionId,
    filename: String,
    total_size: u64,
    sent: u64,
    source: Box<dyn Read + Send>,
    phase: UploadPhase,
}

impl UploadClient {
    /// Start an upload from any reader; returns the request to send
    pub fn from_reader(
        source: Box<dyn Read + Send>,
        filename: impl Into<String>,
        total_size: u64,
    ) -> (Self, ClientMessage) {
        let client = Self {
            tx_id: TransactionId::new_random(),
            filename: filename.into(),
            total_size,
            sent: 0,
            source,
            phase: UploadPhase::AwaitingApproval,
        };
        let request = ClientMessage::RequestUpload {
            tx_id: client.tx_id,
            filename: client.filename.clone(),
            size: total_size,
        };
        (client, request)
    }

    /// Start an upload of a file on disk
    pub fn from_path(path: impl AsRef<Path>) -> TransferResult<(Self, ClientMessage)> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::from_reader(Box::new(file), filename, size))
    }

    /// Transaction id of this upload
    pub fn tx_id(&self) -> TransactionId {
        self.tx_id
    }

    /// Name announced to the store
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Bytes sent so far
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Whether the upload reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.phase == UploadPhase::Finished
    }

    /// Apply the store's admission decision
    pub fn on_response(
        &mut self,
        approved: bool,
        max_chunk: u32,
        reason: Option<String>,
    ) -> TransferResult<()> {
        if !approved {
            self.phase = UploadPhase::Finished;
            return Err(TransferError::Denied(
                reason.unwrap_or_else(|| String::from("no reason given")),
            ));
        }
        if max_chunk == 0 {
            self.phase = UploadPhase::Finished;
            return Err(TransferError::Denied(String::from("zero chunk size")));
        }
        self.phase = UploadPhase::Sending { max_chunk };
        Ok(())
    }

    /// Produce the next chunk, or `None` when everything has been sent
    pub fn next_chunk(&mut self) -> TransferResult<Option<ClientMessage>> {
        let UploadPhase::Sending { max_chunk } = self.phase else {
            return Ok(None);
        };

        let remaining = self.total_size - self.sent;
        if remaining == 0 {
            self.phase = UploadPhase::AwaitingAck;
            return Ok(None);
        }

        let len = remaining.min(max_chunk as u64) as usize;
        let mut bytes = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.source.read(&mut bytes[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        if filled < len {
            self.phase = UploadPhase::Finished;
            return Err(TransferError::Truncated {
                expected: self.total_size,
                actual: self.sent + filled as u64,
            });
        }

        self.sent += len as u64;
        if self.sent == self.total_size {
            self.phase = UploadPhase::AwaitingAck;
        }
        Ok(Some(ClientMessage::UploadChunk {
            tx_id: self.tx_id,
            bytes,
        }))
    }

    /// Apply the terminal acknowledgement; returns the stored display name
    pub fn on_acknowledge(
        &mut self,
        success: bool,
        display_name: Option<String>,
        reason: Option<String>,
    ) -> TransferResult<String> {
        self.phase = UploadPhase::Finished;
        if success {
            Ok(display_name.unwrap_or_else(|| self.filename.clone()))
        } else {
            Err(TransferError::Rejected(
                reason.unwrap_or_else(|| String::from("no reason given")),
            ))
        }
    }
}
