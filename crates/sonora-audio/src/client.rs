//! Consumer session
//!
//! Dispatches every [`ServerMessage`] a consumer receives: directives drive
//! the [`StreamingEngine`], asset chunks land in the local cache, and upload
//! replies advance whatever uploads this consumer started.

use std::path::Path;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use sonora_core::{AssetId, BlockPos, TransactionId};
use sonora_transfer::{
    AssetSummary, ClientMessage, Directive, DownloadClient, Outbox, ServerMessage, UploadClient,
};

use crate::engine::{PlayOutcome, StreamingEngine};
use crate::AudioResult;

/// What a handled message did
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A stream started at `position`
    Started(BlockPos),
    /// A play waits for `asset_id` to download
    Awaiting { position: BlockPos, asset_id: AssetId },
    /// The stream at `position` was stopped
    Stopped(BlockPos),
    /// Loop flag updated for `position`
    LoopingChanged { position: BlockPos, looping: bool },
    /// Part of an asset arrived
    Downloading(AssetId),
    /// An asset finished downloading; `started` deferred plays began
    Downloaded { asset_id: AssetId, started: usize },
    /// The store does not have an asset
    Unavailable(AssetId),
    /// Catalog received
    Catalog(Vec<AssetSummary>),
    /// Upload approved; `chunks` were sent
    UploadSent { tx_id: TransactionId, chunks: usize },
    /// Upload stored under `display_name`
    UploadFinished { tx_id: TransactionId, display_name: String },
    /// Upload denied or rejected
    UploadFailed { tx_id: TransactionId, reason: String },
    /// Nothing to do
    Ignored,
}

/// Consumer-side state for one connection
pub struct ClientSession {
    engine: Arc<StreamingEngine>,
    downloads: DownloadClient,
    uploads: Mutex<AHashMap<TransactionId, UploadClient>>,
}

impl ClientSession {
    /// `downloads` must flush into the cache the engine resolves assets from
    pub fn new(engine: Arc<StreamingEngine>, downloads: DownloadClient) -> Self {
        Self {
            engine,
            downloads,
            uploads: Mutex::new(AHashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<StreamingEngine> {
        &self.engine
    }

    pub fn downloads(&self) -> &DownloadClient {
        &self.downloads
    }

    /// Uploads awaiting a reply
    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().len()
    }

    /// Ask the store for its catalog
    pub fn request_catalog(&self, out: &mut impl Outbox<ClientMessage>) {
        out.push(ClientMessage::RequestAssetList);
    }

    /// Start uploading a file; returns its transaction id
    pub fn begin_upload(
        &self,
        path: impl AsRef<Path>,
        out: &mut impl Outbox<ClientMessage>,
    ) -> AudioResult<TransactionId> {
        let (upload, request) = UploadClient::from_path(path)?;
        let tx_id = upload.tx_id();
        log::info!("Requesting upload of '{}'", upload.filename());
        self.uploads.lock().insert(tx_id, upload);
        out.push(request);
        Ok(tx_id)
    }

    /// Handle one message from the store
    pub fn handle(
        &self,
        message: ServerMessage,
        out: &mut impl Outbox<ClientMessage>,
    ) -> AudioResult<SessionEvent> {
        log::trace!("Handling {}", message.kind());
        match message {
            ServerMessage::Directive(directive) => self.apply(directive, out),
            ServerMessage::AssetChunk { id, bytes, is_last } => {
                match self.downloads.accept_chunk(id, bytes, is_last)? {
                    Some(path) => {
                        log::info!("Asset {} cached at {}", id, path.display());
                        let started = self.engine.asset_ready(id);
                        Ok(SessionEvent::Downloaded { asset_id: id, started })
                    }
                    None => Ok(SessionEvent::Downloading(id)),
                }
            }
            ServerMessage::AssetUnavailable { id } => {
                self.downloads.abandon(&id);
                self.engine.asset_unavailable(id);
                Ok(SessionEvent::Unavailable(id))
            }
            ServerMessage::AssetList { assets } => Ok(SessionEvent::Catalog(assets)),
            ServerMessage::ResponseUpload {
                tx_id,
                approved,
                max_chunk,
                reason,
            } => self.on_upload_response(tx_id, approved, max_chunk, reason, out),
            ServerMessage::Acknowledge {
                tx_id,
                success,
                display_name,
                reason,
            } => {
                let Some(mut upload) = self.uploads.lock().remove(&tx_id) else {
                    log::debug!("Acknowledge for unknown upload {}", tx_id);
                    return Ok(SessionEvent::Ignored);
                };
                Ok(match upload.on_acknowledge(success, display_name, reason) {
                    Ok(display_name) => {
                        log::info!("Uploaded '{}'", display_name);
                        SessionEvent::UploadFinished { tx_id, display_name }
                    }
                    Err(err) => {
                        log::warn!("Upload of '{}' failed: {}", upload.filename(), err);
                        SessionEvent::UploadFailed {
                            tx_id,
                            reason: err.to_string(),
                        }
                    }
                })
            }
        }
    }

    fn apply(
        &self,
        directive: Directive,
        out: &mut impl Outbox<ClientMessage>,
    ) -> AudioResult<SessionEvent> {
        match directive {
            Directive::Play {
                position,
                asset_id,
                display_name,
                offset_seconds,
                looping,
            } => {
                log::debug!("Play '{}' at {} from {:.3}s", display_name, position, offset_seconds);
                match self.engine.play(position, asset_id, offset_seconds, looping)? {
                    PlayOutcome::Started => Ok(SessionEvent::Started(position)),
                    PlayOutcome::AwaitingAsset => {
                        if let Some(request) = self.downloads.request(asset_id) {
                            out.push(request);
                        }
                        Ok(SessionEvent::Awaiting { position, asset_id })
                    }
                }
            }
            Directive::Stop { position } => {
                self.engine.stop(position);
                Ok(SessionEvent::Stopped(position))
            }
            Directive::SetLooping { position, looping } => {
                self.engine.set_looping(position, looping);
                Ok(SessionEvent::LoopingChanged { position, looping })
            }
        }
    }

    fn on_upload_response(
        &self,
        tx_id: TransactionId,
        approved: bool,
        max_chunk: u32,
        reason: Option<String>,
        out: &mut impl Outbox<ClientMessage>,
    ) -> AudioResult<SessionEvent> {
        let mut uploads = self.uploads.lock();
        let Some(upload) = uploads.get_mut(&tx_id) else {
            log::debug!("Upload response for unknown transaction {}", tx_id);
            return Ok(SessionEvent::Ignored);
        };

        if let Err(err) = upload.on_response(approved, max_chunk, reason) {
            log::warn!("Upload of '{}' denied: {}", upload.filename(), err);
            uploads.remove(&tx_id);
            return Ok(SessionEvent::UploadFailed {
                tx_id,
                reason: err.to_string(),
            });
        }

        let mut chunks = 0;
        loop {
            match upload.next_chunk() {
                Ok(Some(chunk)) => {
                    out.push(chunk);
                    chunks += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    uploads.remove(&tx_id);
                    return Err(err.into());
                }
            }
        }
        log::debug!("Sent {} chunks for upload {}", chunks, tx_id);
        Ok(SessionEvent::UploadSent { tx_id, chunks })
    }
}
