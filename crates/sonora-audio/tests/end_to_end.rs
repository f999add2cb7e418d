//! A consumer uploads a WAV, a powered speaker starts it, and the consumer
//! downloads and streams it through the real decoder.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sonora_assets::AssetCache;
use sonora_audio::{
    ClientSession, Consumption, EngineSettings, NullBackend, SessionEvent, StreamingEngine,
    SymphoniaOpener,
};
use sonora_core::{BlockPos, ObserverId, ServerConfig};
use sonora_server::{PlaybackScheduler, ServerEndpoint, SimulatedWorld, StateStore};
use sonora_transfer::{ClientMessage, Directive, DownloadClient, ServerMessage};

struct Link {
    endpoint: ServerEndpoint,
    scheduler: PlaybackScheduler,
    observer: ObserverId,
}

impl Link {
    fn send(&mut self, messages: Vec<ClientMessage>) -> Vec<ServerMessage> {
        let mut replies: Vec<ServerMessage> = Vec::new();
        let mut directives: Vec<(ObserverId, Directive)> = Vec::new();
        for message in messages {
            self.endpoint.handle(
                self.observer,
                message,
                &mut self.scheduler,
                &mut replies,
                &mut directives,
            );
        }
        replies
    }
}

fn write_wav(path: &Path, frames: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let mut pcm = Vec::new();
    for i in 0..frames * 2 {
        let sample = ((i * 7) % 20000) as i16 - 10000;
        writer.write_sample(sample).unwrap();
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    writer.finalize().unwrap();
    pcm
}

#[test]
fn test_upload_schedule_download_and_stream() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::default();
    let observer = ObserverId::new_random();
    let mut link = Link {
        endpoint: ServerEndpoint::open(dir.path().join("server"), &config).unwrap(),
        scheduler: PlaybackScheduler::new(Arc::new(StateStore::in_memory()), &config),
        observer,
    };

    let cache = AssetCache::open(dir.path().join("cache")).unwrap();
    let backend = Arc::new(NullBackend::new(Consumption::Immediate).with_capture());
    let engine = StreamingEngine::new(
        backend.clone(),
        Arc::new(SymphoniaOpener),
        Arc::new(cache.clone()),
        EngineSettings::default(),
    )
    .unwrap();
    let session = ClientSession::new(Arc::new(engine), DownloadClient::new(cache));

    // Upload
    let wav = dir.path().join("tone.wav");
    let pcm = write_wav(&wav, 16000);
    let mut out: Vec<ClientMessage> = Vec::new();
    session.begin_upload(&wav, &mut out).unwrap();
    for reply in link.send(std::mem::take(&mut out)) {
        assert!(matches!(
            session.handle(reply, &mut out).unwrap(),
            SessionEvent::UploadSent { .. }
        ));
    }
    let events: Vec<SessionEvent> = link
        .send(std::mem::take(&mut out))
        .into_iter()
        .map(|reply| session.handle(reply, &mut out).unwrap())
        .collect();
    assert!(matches!(events.as_slice(), [SessionEvent::UploadFinished { .. }]));
    let asset = link.endpoint.catalog().remove(0);
    assert_eq!(asset.display_name, "tone.wav");

    // Power a speaker with the observer standing on it
    let speaker = BlockPos::new(10, 64, -3);
    let mut world = SimulatedWorld::new();
    let mut directives: Vec<(ObserverId, Directive)> = Vec::new();
    link.scheduler.bind_speaker(speaker).unwrap();
    link.scheduler
        .assign_asset(speaker, asset.id, &asset.display_name, &mut directives)
        .unwrap();
    world.place(speaker);
    world.move_observer(observer, speaker.center());
    link.scheduler.tick(0, &world, &mut directives);
    world.set_powered(speaker, true);
    for now in 1..=3 {
        link.scheduler.tick(now, &world, &mut directives);
    }

    let play = directives
        .into_iter()
        .find(|(id, directive)| *id == observer && matches!(directive, Directive::Play { .. }))
        .map(|(_, directive)| directive)
        .unwrap();

    // The consumer has no copy yet and asks for one
    let event = session.handle(ServerMessage::Directive(play), &mut out).unwrap();
    assert_eq!(
        event,
        SessionEvent::Awaiting {
            position: speaker,
            asset_id: asset.id
        }
    );
    assert_eq!(out, vec![ClientMessage::RequestAsset { id: asset.id }]);

    let mut last = None;
    for reply in link.send(std::mem::take(&mut out)) {
        last = Some(session.handle(reply, &mut out).unwrap());
    }
    assert_eq!(
        last,
        Some(SessionEvent::Downloaded {
            asset_id: asset.id,
            started: 1
        })
    );

    // Non-looping playback runs to the end and frees everything
    let deadline = Instant::now() + Duration::from_secs(10);
    while backend.stats().live_sources() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let stats = backend.stats();
    assert_eq!(stats.live_sources(), 0);
    assert_eq!(stats.live_buffers(), 0);
    assert_eq!(stats.invalid_deletes, 0);

    // Waiting for the download shifted the start; the rest is bit-exact
    let streamed = backend.captured().concat();
    assert!(!streamed.is_empty());
    assert_eq!(streamed.len() % 4, 0);
    assert!(pcm.ends_with(&streamed));
}
