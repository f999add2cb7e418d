//! Upload then download through the endpoint, every message crossing the
//! frame codec as it would on the wire.

use std::io::Cursor;
use std::sync::Arc;

use sonora_assets::AssetCache;
use sonora_core::{ObserverId, ServerConfig, TickRate};
use sonora_server::{PlaybackScheduler, ServerEndpoint, StateStore};
use sonora_transfer::{
    decode, encode, ClientMessage, Directive, DownloadClient, ServerMessage, UploadClient,
};

fn wire<M: serde::Serialize + serde::de::DeserializeOwned>(message: &M) -> M {
    decode(&encode(message).unwrap()).unwrap()
}

struct Harness {
    endpoint: ServerEndpoint,
    scheduler: PlaybackScheduler,
    sender: ObserverId,
}

impl Harness {
    fn send(&mut self, message: ClientMessage) -> Vec<ServerMessage> {
        let mut replies: Vec<ServerMessage> = Vec::new();
        let mut directives: Vec<(ObserverId, Directive)> = Vec::new();
        self.endpoint.handle(
            self.sender,
            wire(&message),
            &mut self.scheduler,
            &mut replies,
            &mut directives,
        );
        replies.iter().map(wire).collect()
    }
}

#[test]
fn test_ten_mebibytes_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::default();
    let mut harness = Harness {
        endpoint: ServerEndpoint::open(dir.path(), &config).unwrap(),
        scheduler: PlaybackScheduler::with_settings(
            Arc::new(StateStore::in_memory()),
            TickRate::DEFAULT,
            config.listen_range,
        ),
        sender: ObserverId::new_random(),
    };

    let size = 10 * 1024 * 1024;
    let original: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();

    // Upload
    let (mut upload, request) =
        UploadClient::from_reader(Box::new(Cursor::new(original.clone())), "Big Theme.flac", size as u64);
    let replies = harness.send(request);
    let [ServerMessage::ResponseUpload { approved, max_chunk, reason, .. }] = replies.as_slice() else {
        panic!("expected a single ResponseUpload");
    };
    assert!(*approved);
    assert_eq!(*max_chunk, config.max_chunk_bytes);
    upload.on_response(*approved, *max_chunk, reason.clone()).unwrap();

    let mut chunks = 0;
    let mut ack = None;
    while let Some(chunk) = upload.next_chunk().unwrap() {
        chunks += 1;
        let mut replies = harness.send(chunk);
        if let Some(reply) = replies.pop() {
            assert!(ack.is_none(), "acknowledged before the last chunk");
            ack = Some(reply);
        }
    }
    assert_eq!(chunks, size / config.max_chunk_bytes as usize);
    let Some(ServerMessage::Acknowledge { success, display_name, reason, .. }) = ack else {
        panic!("expected an Acknowledge");
    };
    let name = upload.on_acknowledge(success, display_name, reason).unwrap();
    assert_eq!(name, "Big Theme.flac");

    // Catalog
    let replies = harness.send(ClientMessage::RequestAssetList);
    let [ServerMessage::AssetList { assets }] = replies.as_slice() else {
        panic!("expected an AssetList");
    };
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].display_name, "Big Theme.flac");
    let id = assets[0].id;

    // Download
    let downloads = DownloadClient::new(AssetCache::open(dir.path().join("cache")).unwrap());
    let request = downloads.request(id).unwrap();
    let mut cached = None;
    for reply in harness.send(request) {
        let ServerMessage::AssetChunk { id, bytes, is_last } = reply else {
            panic!("expected only AssetChunk replies");
        };
        assert!(cached.is_none());
        cached = downloads.accept_chunk(id, bytes, is_last).unwrap();
    }

    let path = cached.unwrap();
    let downloaded = std::fs::read(path).unwrap();
    assert_eq!(downloaded.len(), original.len());
    assert!(downloaded == original);
}

#[test]
fn test_oversized_upload_is_denied_before_any_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        max_upload_bytes: 1024,
        ..ServerConfig::default()
    };
    let mut harness = Harness {
        endpoint: ServerEndpoint::open(dir.path(), &config).unwrap(),
        scheduler: PlaybackScheduler::new(Arc::new(StateStore::in_memory()), &config),
        sender: ObserverId::new_random(),
    };

    let (mut upload, request) =
        UploadClient::from_reader(Box::new(Cursor::new(vec![0u8; 2048])), "long.mp3", 2048);
    let replies = harness.send(request);
    let [ServerMessage::ResponseUpload { approved, max_chunk, reason, .. }] = replies.as_slice() else {
        panic!("expected a single ResponseUpload");
    };
    assert!(!*approved);
    assert!(upload.on_response(*approved, *max_chunk, reason.clone()).is_err());
    assert!(upload.next_chunk().unwrap().is_none());
    assert!(harness.endpoint.store().is_empty());
}

#[test]
fn test_unknown_asset_request() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::default();
    let mut harness = Harness {
        endpoint: ServerEndpoint::open(dir.path(), &config).unwrap(),
        scheduler: PlaybackScheduler::new(Arc::new(StateStore::in_memory()), &config),
        sender: ObserverId::new_random(),
    };

    let id = sonora_core::AssetId::new_random();
    let replies = harness.send(ClientMessage::RequestAsset { id });
    assert_eq!(replies, vec![ServerMessage::AssetUnavailable { id }]);
}
