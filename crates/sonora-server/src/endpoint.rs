//! Message dispatch
//!
//! Routes every [`ClientMessage`] to the component that owns it. Replies go
//! back to the sender; playback directives go to whichever observers the
//! scheduler addresses.

use std::path::Path;
use std::sync::Arc;

use sonora_assets::{AssetResult, AssetStore};
use sonora_core::{ObserverId, ServerConfig};
use sonora_transfer::{
    AssetSummary, ClientMessage, Directive, DownloadServer, Outbox, ServerMessage, UploadPolicy,
    UploadServer,
};

use crate::scheduler::PlaybackScheduler;

/// Authoritative message handler
pub struct ServerEndpoint {
    store: Arc<AssetStore>,
    uploads: UploadServer,
    downloads: DownloadServer,
}

impl ServerEndpoint {
    /// Create an endpoint over an opened store
    pub fn new(store: Arc<AssetStore>, config: &ServerConfig) -> Self {
        Self {
            uploads: UploadServer::new(Arc::clone(&store), UploadPolicy::from(config)),
            downloads: DownloadServer::new(Arc::clone(&store), config.download_chunk_bytes),
            store,
        }
    }

    /// Open the asset store under `root` and create an endpoint over it
    pub fn open(root: impl AsRef<Path>, config: &ServerConfig) -> AssetResult<Self> {
        let store = Arc::new(AssetStore::open(root.as_ref().join(&config.asset_dir))?);
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &Arc<AssetStore> {
        &self.store
    }

    pub fn uploads(&self) -> &UploadServer {
        &self.uploads
    }

    /// Catalog of stored assets, sorted by display name
    pub fn catalog(&self) -> Vec<AssetSummary> {
        let mut assets: Vec<AssetSummary> = self
            .store
            .list()
            .into_iter()
            .map(|record| AssetSummary {
                id: record.id,
                display_name: record.original_name,
            })
            .collect();
        assets.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
        assets
    }

    /// Handle one message from `sender`
    pub fn handle(
        &self,
        sender: ObserverId,
        message: ClientMessage,
        scheduler: &mut PlaybackScheduler,
        replies: &mut impl Outbox<ServerMessage>,
        directives: &mut impl Outbox<(ObserverId, Directive)>,
    ) {
        log::debug!("{} from {}", message.kind(), sender);
        match message {
            ClientMessage::RequestUpload { tx_id, filename, size } => {
                replies.push(self.uploads.handle_request(tx_id, &filename, size));
            }
            ClientMessage::UploadChunk { tx_id, bytes } => {
                if let Some(ack) = self.uploads.handle_chunk(tx_id, bytes) {
                    replies.push(ack);
                }
            }
            ClientMessage::RequestAssetList => {
                replies.push(ServerMessage::AssetList {
                    assets: self.catalog(),
                });
            }
            ClientMessage::RequestAsset { id } => {
                self.downloads.handle_request(id, replies);
            }
            ClientMessage::SetLooping { position, looping } => {
                if let Err(err) = scheduler.set_looping(position, looping, directives) {
                    log::warn!("SetLooping from {} ignored: {}", sender, err);
                }
            }
            ClientMessage::SetChannelId {
                position,
                channel_key,
            } => {
                if let Err(err) = scheduler.set_channel(position, channel_key, directives) {
                    log::warn!("SetChannelId from {} ignored: {}", sender, err);
                }
            }
        }
    }
}
