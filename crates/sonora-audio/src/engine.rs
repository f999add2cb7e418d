//! Streaming Playback Engine
//!
//! Registry of active streams keyed by position. Each stream runs its
//! [`StreamingResource`] on a dedicated thread; teardown is handed to a reaper
//! pool so callers never wait on a join.
//!
//! Plays for assets that are not cached yet are parked until the download
//! lands, then started with their offset advanced by the time spent waiting.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use sonora_assets::AssetLocator;
use sonora_core::{AssetId, BlockPos, ClientConfig, Vec3};
use sonora_platform::{IntervalTimer, ScopedTimer, Thread, ThreadPool};

use crate::backend::{AudioBackend, SourceId};
use crate::decode::StreamOpener;
use crate::gain::attenuation;
use crate::resource::{ResourceHandles, StreamPhase, StreamSettings, StreamingResource};
use crate::AudioResult;

/// Engine tunables
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    pub stream: StreamSettings,
    pub listen_range: f32,
    pub gain_interval: Duration,
    pub stop_timeout: Duration,
    pub reaper_threads: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for EngineSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            stream: StreamSettings::from(config),
            listen_range: config.listen_range,
            gain_interval: config.gain_interval(),
            stop_timeout: config.stop_timeout(),
            reaper_threads: config.reaper_threads,
        }
    }
}

/// Result of [`StreamingEngine::play`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// A stream is running for the position
    Started,
    /// The asset is not cached; the play waits for it
    AwaitingAsset,
}

struct ActiveStream {
    asset_id: AssetId,
    stop: Arc<AtomicBool>,
    looping: Arc<AtomicBool>,
    handles: Arc<ResourceHandles>,
    thread: Thread,
}

#[derive(Debug, Clone)]
struct DeferredPlay {
    asset_id: AssetId,
    offset_seconds: f64,
    looping: bool,
    requested_at: Instant,
}

/// Streaming engine
pub struct StreamingEngine {
    backend: Arc<dyn AudioBackend>,
    opener: Arc<dyn StreamOpener>,
    locator: Arc<dyn AssetLocator>,
    settings: EngineSettings,
    active: RwLock<AHashMap<BlockPos, ActiveStream>>,
    deferred: Mutex<AHashMap<BlockPos, DeferredPlay>>,
    listener: Mutex<Option<Vec3>>,
    gain_timer: Mutex<IntervalTimer>,
    reaper: ThreadPool,
}

impl StreamingEngine {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        opener: Arc<dyn StreamOpener>,
        locator: Arc<dyn AssetLocator>,
        settings: EngineSettings,
    ) -> AudioResult<Self> {
        let reaper = ThreadPool::new("sonora-reaper", settings.reaper_threads)?;
        log::info!(
            "Streaming engine ready ({} buffers x {} bytes, range {})",
            settings.stream.buffer_count,
            settings.stream.buffer_bytes,
            settings.listen_range
        );
        Ok(Self {
            backend,
            opener,
            locator,
            settings,
            active: RwLock::new(AHashMap::new()),
            deferred: Mutex::new(AHashMap::new()),
            listener: Mutex::new(None),
            gain_timer: Mutex::new(IntervalTimer::new(settings.gain_interval)),
            reaper,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Start `asset_id` at `position`, replacing whatever played there.
    ///
    /// When the asset is not available locally the play is deferred until
    /// [`asset_ready`](Self::asset_ready).
    pub fn play(
        &self,
        position: BlockPos,
        asset_id: AssetId,
        offset_seconds: f64,
        looping: bool,
    ) -> AudioResult<PlayOutcome> {
        self.stop(position);

        let Some(path) = self.locator.locate(&asset_id) else {
            log::debug!("Asset {} not cached; deferring play at {}", asset_id, position);
            self.deferred.lock().insert(
                position,
                DeferredPlay {
                    asset_id,
                    offset_seconds,
                    looping,
                    requested_at: Instant::now(),
                },
            );
            return Ok(PlayOutcome::AwaitingAsset);
        };

        self.start(position, asset_id, path, offset_seconds, looping)?;
        Ok(PlayOutcome::Started)
    }

    /// Start every play waiting on `asset_id`; returns how many started
    pub fn asset_ready(&self, asset_id: AssetId) -> usize {
        let mut ready = Vec::new();
        self.deferred.lock().retain(|position, play| {
            if play.asset_id == asset_id {
                ready.push((*position, play.clone()));
                false
            } else {
                true
            }
        });
        if ready.is_empty() {
            return 0;
        }

        let Some(path) = self.locator.locate(&asset_id) else {
            log::warn!("Asset {} reported ready but is not cached", asset_id);
            return 0;
        };

        let mut started = 0;
        for (position, play) in ready {
            let offset = play.offset_seconds + play.requested_at.elapsed().as_secs_f64();
            match self.start(position, asset_id, path.clone(), offset, play.looping) {
                Ok(()) => started += 1,
                Err(err) => log::warn!("Deferred play at {} failed: {}", position, err),
            }
        }
        started
    }

    /// Drop every play waiting on `asset_id`
    pub fn asset_unavailable(&self, asset_id: AssetId) -> usize {
        let mut deferred = self.deferred.lock();
        let before = deferred.len();
        deferred.retain(|_, play| play.asset_id != asset_id);
        let dropped = before - deferred.len();
        if dropped > 0 {
            log::info!("Asset {} unavailable; dropped {} pending plays", asset_id, dropped);
        }
        dropped
    }

    fn start(
        &self,
        position: BlockPos,
        asset_id: AssetId,
        path: PathBuf,
        offset_seconds: f64,
        looping: bool,
    ) -> AudioResult<()> {
        let stream_settings = self.settings.stream;
        let handles = ResourceHandles::allocate(self.backend.clone(), stream_settings.buffer_count)?;
        if let Some(listener) = *self.listener.lock() {
            self.apply_gain(position, handles.source(), listener);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let looping = Arc::new(AtomicBool::new(looping));
        let mut resource = StreamingResource::new(
            position,
            path,
            self.opener.clone(),
            handles.clone(),
            offset_seconds,
            looping.clone(),
            &stream_settings,
        );

        let thread_stop = stop.clone();
        let thread = Thread::spawn(format!("sonora-stream {}", position), move || {
            run_stream(&mut resource, &thread_stop, stream_settings.poll_interval);
        });
        let thread = match thread {
            Ok(thread) => thread,
            Err(err) => {
                handles.release();
                return Err(err.into());
            }
        };

        log::debug!(
            "Streaming asset {} at {} from {:.3}s (looping: {})",
            asset_id,
            position,
            offset_seconds,
            looping.load(Ordering::Relaxed)
        );

        let replaced = self.active.write().insert(
            position,
            ActiveStream {
                asset_id,
                stop,
                looping,
                handles,
                thread,
            },
        );
        if let Some(previous) = replaced {
            self.retire(position, previous);
        }
        Ok(())
    }

    /// Stop the stream at `position`. Idempotent and non-blocking.
    ///
    /// Returns `true` if a stream or a pending play was cancelled.
    pub fn stop(&self, position: BlockPos) -> bool {
        let cancelled_pending = self.deferred.lock().remove(&position).is_some();
        let Some(stream) = self.active.write().remove(&position) else {
            return cancelled_pending;
        };
        self.retire(position, stream);
        true
    }

    /// Stop every stream and pending play; returns how many streams stopped
    pub fn stop_all(&self) -> usize {
        self.deferred.lock().clear();
        let streams: Vec<(BlockPos, ActiveStream)> = self.active.write().drain().collect();
        let count = streams.len();
        for (position, stream) in streams {
            self.retire(position, stream);
        }
        if count > 0 {
            log::info!("Stopped {} streams", count);
        }
        count
    }

    /// Flag the thread and hand the join to the reaper
    fn retire(&self, position: BlockPos, stream: ActiveStream) {
        let ActiveStream {
            asset_id,
            stop,
            handles,
            thread,
            ..
        } = stream;
        stop.store(true, Ordering::Release);
        log::debug!("Stopping asset {} at {}", asset_id, position);

        let timeout = self.settings.stop_timeout;
        let reaped = handles.clone();
        let submitted = self.reaper.submit(move || {
            if !thread.join_timeout(timeout) {
                log::warn!("Stream at {} did not stop within {:?}; forcing release", position, timeout);
            }
            reaped.release();
        });
        if let Err(err) = submitted {
            log::warn!("Releasing stream at {} inline: {}", position, err);
            handles.release();
        }
    }

    /// Change the loop flag of a running or pending play
    pub fn set_looping(&self, position: BlockPos, looping: bool) -> bool {
        if let Some(stream) = self.active.read().get(&position) {
            stream.looping.store(looping, Ordering::Release);
            return true;
        }
        match self.deferred.lock().get_mut(&position) {
            Some(play) => {
                play.looping = looping;
                true
            }
            None => false,
        }
    }

    /// Recompute every stream's gain for a listener at `listener`
    pub fn update_gains(&self, listener: Vec3) {
        let _timer = ScopedTimer::traced("gain_pass").with_budget(self.settings.gain_interval);
        *self.listener.lock() = Some(listener);
        let active = self.active.read();
        for (position, stream) in active.iter() {
            self.apply_gain(*position, stream.handles.source(), listener);
        }
    }

    fn apply_gain(&self, position: BlockPos, source: SourceId, listener: Vec3) {
        let gain = attenuation(position.distance_to(listener), self.settings.listen_range);
        if let Err(err) = self.backend.set_gain(source, gain) {
            log::debug!("Setting gain at {}: {}", position, err);
        }
    }

    /// Periodic housekeeping; runs the gain pass at most once per gain interval.
    ///
    /// Returns `true` if the pass ran.
    pub fn poll(&self, listener: Vec3) -> bool {
        if !self.gain_timer.lock().poll() {
            return false;
        }
        self.reap_finished();
        self.update_gains(listener);
        true
    }

    /// Forget streams whose thread ended on its own
    pub fn reap_finished(&self) -> usize {
        let finished: Vec<(BlockPos, ActiveStream)> = {
            let mut active = self.active.write();
            let positions: Vec<BlockPos> = active
                .iter()
                .filter(|(_, stream)| stream.thread.is_finished())
                .map(|(position, _)| *position)
                .collect();
            positions
                .into_iter()
                .filter_map(|position| active.remove(&position).map(|stream| (position, stream)))
                .collect()
        };

        for (position, stream) in &finished {
            log::debug!("Stream of asset {} at {} ended", stream.asset_id, position);
            stream.handles.release();
        }
        finished.len()
    }

    pub fn is_active(&self, position: BlockPos) -> bool {
        self.active.read().contains_key(&position)
    }

    /// Whether a play at `position` waits on a download
    pub fn is_awaiting(&self, position: BlockPos) -> bool {
        self.deferred.lock().contains_key(&position)
    }

    /// Backend source of the stream at `position`
    pub fn source(&self, position: BlockPos) -> Option<SourceId> {
        self.active.read().get(&position).map(|s| s.handles.source())
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Block until every retired stream has been released
    pub fn wait_idle(&self) {
        self.reaper.wait_all();
    }
}

impl Drop for StreamingEngine {
    fn drop(&mut self) {
        self.stop_all();
        self.reaper.wait_all();
    }
}

/// Body of a stream thread
fn run_stream(resource: &mut StreamingResource, stop: &AtomicBool, poll_interval: Duration) {
    let position = resource.position();
    loop {
        if stop.load(Ordering::Acquire) {
            resource.finish();
            return;
        }

        match resource.step() {
            Ok(StreamPhase::Stopped) => {
                log::debug!("Stream at {} finished after {} loops", position, resource.cycles());
                return;
            }
            Ok(StreamPhase::Streaming | StreamPhase::Draining) => std::thread::sleep(poll_interval),
            Ok(StreamPhase::Priming | StreamPhase::Restarting) => {}
            Err(err) => {
                log::warn!("Stream at {} stopped: {}", position, err);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Consumption, NullBackend};
    use crate::decode::{BufferFormat, MemoryOpener, PcmFormat};
    use sonora_assets::AssetCache;

    const MONO: PcmFormat = PcmFormat {
        sample_rate: 8000,
        layout: BufferFormat::Mono16,
    };

    /// One second of mono audio whose samples are their own frame index
    fn indexed_pcm() -> Vec<u8> {
        (0..8000u16).flat_map(|i| i.to_le_bytes()).collect()
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            stream: StreamSettings {
                buffer_count: 3,
                buffer_bytes: 1600,
                poll_interval: Duration::from_millis(5),
            },
            listen_range: 16.0,
            gain_interval: Duration::from_millis(50),
            stop_timeout: Duration::from_millis(250),
            reaper_threads: 1,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: AssetCache,
        backend: Arc<NullBackend>,
        opener: Arc<MemoryOpener>,
        engine: StreamingEngine,
    }

    fn fixture(consumption: Consumption, pcm: Vec<u8>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::open(dir.path()).unwrap();
        let backend = Arc::new(NullBackend::new(consumption).with_capture());
        let opener = Arc::new(MemoryOpener::new(MONO, pcm));
        let engine = StreamingEngine::new(
            backend.clone(),
            opener.clone(),
            Arc::new(cache.clone()),
            settings(),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            cache,
            backend,
            opener,
            engine,
        }
    }

    fn cached(fixture: &Fixture) -> AssetId {
        let id = AssetId::new_random();
        fixture.cache.insert(&id, b"pcm").unwrap();
        id
    }

    fn eventually(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    const SPEAKER: BlockPos = BlockPos::new(0, 64, 0);

    #[test]
    fn test_stop_twice_releases_once() {
        let f = fixture(Consumption::RealTime, indexed_pcm());
        let id = cached(&f);

        assert_eq!(f.engine.play(SPEAKER, id, 0.0, true).unwrap(), PlayOutcome::Started);
        assert!(f.engine.is_active(SPEAKER));
        assert!(eventually(|| f.backend.stats().uploads > 0));

        assert!(f.engine.stop(SPEAKER));
        assert!(!f.engine.stop(SPEAKER));
        f.engine.wait_idle();

        let stats = f.backend.stats();
        assert_eq!(stats.live_sources(), 0);
        assert_eq!(stats.live_buffers(), 0);
        assert_eq!(stats.invalid_deletes, 0);
        assert_eq!(f.engine.active_count(), 0);
    }

    #[test]
    fn test_replay_replaces_stream() {
        let f = fixture(Consumption::RealTime, indexed_pcm());
        let id = cached(&f);

        f.engine.play(SPEAKER, id, 0.0, false).unwrap();
        f.engine.play(SPEAKER, id, 0.5, false).unwrap();
        assert_eq!(f.engine.active_count(), 1);

        f.engine.stop_all();
        f.engine.wait_idle();
        assert_eq!(f.backend.stats().live_sources(), 0);
        assert_eq!(f.backend.stats().invalid_deletes, 0);
    }

    #[test]
    fn test_deferred_play_advances_offset() {
        let f = fixture(Consumption::RealTime, indexed_pcm());
        let id = AssetId::new_random();

        assert_eq!(
            f.engine.play(SPEAKER, id, 0.0, false).unwrap(),
            PlayOutcome::AwaitingAsset
        );
        assert!(f.engine.is_awaiting(SPEAKER));
        assert_eq!(f.opener.open_count(), 0);

        std::thread::sleep(Duration::from_millis(60));
        f.cache.insert(&id, b"pcm").unwrap();
        assert_eq!(f.engine.asset_ready(id), 1);
        assert!(f.engine.is_active(SPEAKER));
        assert!(!f.engine.is_awaiting(SPEAKER));

        assert!(eventually(|| !f.backend.captured().is_empty()));
        let captured = f.backend.captured();
        let first = &captured[0];
        let frame = u16::from_le_bytes([first[0], first[1]]);
        // At least 60 ms of waiting at 8 kHz
        assert!(frame >= 480, "started at frame {}", frame);

        f.engine.stop_all();
    }

    #[test]
    fn test_unavailable_asset_drops_pending_play() {
        let f = fixture(Consumption::RealTime, indexed_pcm());
        let id = AssetId::new_random();

        f.engine.play(SPEAKER, id, 0.0, false).unwrap();
        f.engine.play(SPEAKER.offset(1, 0, 0), id, 0.0, false).unwrap();
        assert_eq!(f.engine.deferred_count(), 2);

        assert_eq!(f.engine.asset_unavailable(id), 2);
        assert_eq!(f.engine.deferred_count(), 0);
        assert_eq!(f.engine.asset_ready(id), 0);
    }

    #[test]
    fn test_stop_cancels_pending_play() {
        let f = fixture(Consumption::RealTime, indexed_pcm());
        f.engine.play(SPEAKER, AssetId::new_random(), 0.0, false).unwrap();

        assert!(f.engine.stop(SPEAKER));
        assert!(!f.engine.is_awaiting(SPEAKER));
        assert!(!f.engine.stop(SPEAKER));
    }

    #[test]
    fn test_finished_stream_is_reaped() {
        let f = fixture(Consumption::Immediate, vec![0u8; 400]);
        let id = cached(&f);

        f.engine.play(SPEAKER, id, 0.0, false).unwrap();
        assert!(eventually(|| f.backend.stats().live_sources() == 0));
        assert!(eventually(|| {
            f.engine.reap_finished();
            f.engine.active_count() == 0
        }));
        assert!(!f.engine.stop(SPEAKER));
        assert_eq!(f.backend.stats().invalid_deletes, 0);
    }

    #[test]
    fn test_seek_failure_stops_stream() {
        let f = fixture(Consumption::RealTime, vec![0u8; 400]);
        let id = cached(&f);

        // Offset far beyond the stream; the thread stops without looping
        f.engine.play(SPEAKER, id, 30.0, true).unwrap();
        assert!(eventually(|| f.backend.stats().live_sources() == 0));
        assert_eq!(f.backend.stats().plays, 0);
        assert_eq!(f.opener.open_count(), 1);
    }

    #[test]
    fn test_gain_follows_listener() {
        let f = fixture(Consumption::RealTime, indexed_pcm());
        let id = cached(&f);
        f.engine.play(SPEAKER, id, 0.0, true).unwrap();
        let source = f.engine.source(SPEAKER).unwrap();

        f.engine.update_gains(SPEAKER.center());
        assert_eq!(f.backend.gain(source), Some(1.0));

        f.engine.update_gains(SPEAKER.center() + Vec3::new(8.0, 0.0, 0.0));
        assert!((f.backend.gain(source).unwrap() - 0.25).abs() < 1e-6);

        f.engine.update_gains(SPEAKER.center() + Vec3::new(100.0, 0.0, 0.0));
        assert_eq!(f.backend.gain(source), Some(0.0));

        f.engine.stop_all();
    }

    #[test]
    fn test_poll_is_rate_limited() {
        let f = fixture(Consumption::RealTime, indexed_pcm());
        assert!(f.engine.poll(Vec3::ZERO));
        assert!(!f.engine.poll(Vec3::ZERO));
    }

    #[test]
    fn test_set_looping_reaches_pending_play() {
        let f = fixture(Consumption::RealTime, indexed_pcm());
        assert!(!f.engine.set_looping(SPEAKER, true));
        f.engine.play(SPEAKER, AssetId::new_random(), 0.0, false).unwrap();
        assert!(f.engine.set_looping(SPEAKER, true));
    }
}
