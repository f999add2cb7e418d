//! Streaming resource
//!
//! One active position's decode cursor and rotating buffers, advanced one
//! step at a time by its playback thread:
//!
//! ```text
//! Priming -> Streaming -> Draining -> Restarting -> Priming
//!                                  \-> Stopped
//! ```
//!
//! Backend handles live in [`ResourceHandles`], shared with the engine so a
//! forced teardown can free them while the thread is still winding down.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sonora_core::{BlockPos, ClientConfig};

use crate::backend::{AudioBackend, BufferId, SourceId, SourceState};
use crate::decode::{seek_byte_offset, PcmFormat, PcmStream, StreamOpener};
use crate::{AudioError, AudioResult};

/// Buffer layout and polling of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub buffer_count: usize,
    pub buffer_bytes: usize,
    pub poll_interval: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for StreamSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            buffer_count: config.buffer_count.max(2),
            buffer_bytes: config.buffer_bytes,
            poll_interval: config.poll_interval(),
        }
    }
}

/// Backend source and buffers owned by one stream.
///
/// Freed exactly once, by whichever of [`release`](Self::release) or drop
/// comes first.
pub struct ResourceHandles {
    backend: Arc<dyn AudioBackend>,
    source: SourceId,
    buffers: Vec<BufferId>,
    released: AtomicBool,
}

impl ResourceHandles {
    /// Create a source with `buffer_count` buffers
    pub fn allocate(backend: Arc<dyn AudioBackend>, buffer_count: usize) -> AudioResult<Arc<Self>> {
        let source = backend.create_source()?;
        let buffers = match backend.create_buffers(buffer_count) {
            Ok(buffers) => buffers,
            Err(err) => {
                if let Err(cleanup) = backend.delete_source(source) {
                    log::warn!("Failed to delete source {} after allocation error: {}", source, cleanup);
                }
                return Err(err);
            }
        };
        Ok(Arc::new(Self {
            backend,
            source,
            buffers,
            released: AtomicBool::new(false),
        }))
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn buffers(&self) -> &[BufferId] {
        &self.buffers
    }

    /// Whether `buffer` belongs to this stream
    pub fn owns(&self, buffer: BufferId) -> bool {
        self.buffers.contains(&buffer)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Stop the source and free every handle; returns `false` if already released
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Err(err) = self.backend.stop(self.source) {
            log::debug!("Stopping source {} on release: {}", self.source, err);
        }
        if let Err(err) = self.backend.unqueue_all(self.source) {
            log::debug!("Unqueueing source {} on release: {}", self.source, err);
        }
        if let Err(err) = self.backend.delete_source(self.source) {
            log::warn!("Failed to delete source {}: {}", self.source, err);
        }
        if let Err(err) = self.backend.delete_buffers(&self.buffers) {
            log::warn!("Failed to delete buffers of source {}: {}", self.source, err);
        }
        true
    }
}

impl Drop for ResourceHandles {
    fn drop(&mut self) {
        self.release();
    }
}

/// Phase of a streaming resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Fill every free buffer and start the source
    Priming,
    /// Recycle processed buffers
    Streaming,
    /// End of stream read; waiting for queued audio
    Draining,
    /// Rewind a looping stream to the start
    Restarting,
    /// Finished; handles released
    Stopped,
}

/// Decode cursor plus rotating buffers for one position
pub struct StreamingResource {
    position: BlockPos,
    path: PathBuf,
    opener: Arc<dyn StreamOpener>,
    handles: Arc<ResourceHandles>,
    looping: Arc<AtomicBool>,
    stream: Option<Box<dyn PcmStream>>,
    format: Option<PcmFormat>,
    pending_offset: Option<f64>,
    free: Vec<BufferId>,
    scratch: Vec<u8>,
    buffer_bytes: usize,
    end_of_stream: bool,
    cycle_bytes: u64,
    cycles: u32,
    phase: StreamPhase,
}

impl StreamingResource {
    pub fn new(
        position: BlockPos,
        path: PathBuf,
        opener: Arc<dyn StreamOpener>,
        handles: Arc<ResourceHandles>,
        offset_seconds: f64,
        looping: Arc<AtomicBool>,
        settings: &StreamSettings,
    ) -> Self {
        let free = handles.buffers().to_vec();
        Self {
            position,
            path,
            opener,
            handles,
            looping,
            stream: None,
            format: None,
            pending_offset: (offset_seconds > 0.0).then_some(offset_seconds),
            free,
            scratch: Vec::new(),
            buffer_bytes: settings.buffer_bytes,
            end_of_stream: false,
            cycle_bytes: 0,
            cycles: 0,
            phase: StreamPhase::Priming,
        }
    }

    pub fn position(&self) -> BlockPos {
        self.position
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn handles(&self) -> &Arc<ResourceHandles> {
        &self.handles
    }

    /// Completed loop restarts
    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    /// Format of the decoded stream, once opened
    pub fn format(&self) -> Option<PcmFormat> {
        self.format
    }

    /// Advance one step; returns the phase to run next.
    ///
    /// Any error stops the resource and releases its handles.
    pub fn step(&mut self) -> AudioResult<StreamPhase> {
        let next = match self.phase {
            StreamPhase::Priming => self.prime(),
            StreamPhase::Streaming => self.stream_step(),
            StreamPhase::Draining => self.drain(),
            StreamPhase::Restarting => self.restart(),
            StreamPhase::Stopped => return Ok(StreamPhase::Stopped),
        };

        match next {
            Ok(StreamPhase::Stopped) => {
                self.finish();
                Ok(StreamPhase::Stopped)
            }
            Ok(phase) => {
                self.phase = phase;
                Ok(phase)
            }
            Err(err) => {
                self.finish();
                Err(err)
            }
        }
    }

    /// Stop early and release handles
    pub fn finish(&mut self) {
        self.phase = StreamPhase::Stopped;
        self.stream = None;
        self.handles.release();
    }

    fn prime(&mut self) -> AudioResult<StreamPhase> {
        if self.stream.is_none() {
            self.open()?;
        }

        self.fill()?;
        let backend = &self.handles.backend;
        if backend.queued_count(self.handles.source)? == 0 {
            return Ok(self.end_of_cycle());
        }
        backend.play(self.handles.source)?;

        Ok(if self.end_of_stream {
            StreamPhase::Draining
        } else {
            StreamPhase::Streaming
        })
    }

    fn stream_step(&mut self) -> AudioResult<StreamPhase> {
        self.reclaim()?;
        self.fill()?;
        self.resume_after_underrun()?;

        Ok(if self.end_of_stream {
            StreamPhase::Draining
        } else {
            StreamPhase::Streaming
        })
    }

    fn drain(&mut self) -> AudioResult<StreamPhase> {
        self.reclaim()?;
        if self.handles.backend.queued_count(self.handles.source)? > 0 {
            self.resume_after_underrun()?;
            return Ok(StreamPhase::Draining);
        }
        Ok(self.end_of_cycle())
    }

    fn restart(&mut self) -> AudioResult<StreamPhase> {
        let backend = &self.handles.backend;
        backend.stop(self.handles.source)?;
        for buffer in backend.unqueue_all(self.handles.source)? {
            self.take_back(buffer)?;
        }

        self.stream = None;
        self.end_of_stream = false;
        self.cycle_bytes = 0;
        self.cycles += 1;
        log::trace!("Looping stream at {} (cycle {})", self.position, self.cycles);
        Ok(StreamPhase::Priming)
    }

    fn end_of_cycle(&self) -> StreamPhase {
        // An empty stream would restart forever
        if self.looping.load(Ordering::Acquire) && self.cycle_bytes > 0 {
            StreamPhase::Restarting
        } else {
            StreamPhase::Stopped
        }
    }

    fn open(&mut self) -> AudioResult<()> {
        let mut stream = self.opener.open(&self.path)?;
        let format = stream.format();
        if let Some(previous) = self.format {
            if previous != format {
                return Err(AudioError::ResourceMismatch(format!(
                    "stream at {} reopened as {:?}, was {:?}",
                    self.position, format, previous
                )));
            }
        }

        // The join offset applies to the first cycle only
        if let Some(offset) = self.pending_offset.take() {
            let bytes = seek_byte_offset(offset, format);
            stream.skip(bytes)?;
            log::debug!("Stream at {} joined {:.3}s in ({} bytes)", self.position, offset, bytes);
        }

        self.format = Some(format);
        self.scratch = vec![0u8; format.align(self.buffer_bytes)];
        self.stream = Some(stream);
        Ok(())
    }

    /// Decode into every free buffer and queue it
    fn fill(&mut self) -> AudioResult<()> {
        let (Some(stream), Some(format)) = (self.stream.as_mut(), self.format) else {
            return Ok(());
        };
        let backend = &self.handles.backend;

        while !self.end_of_stream {
            let Some(buffer) = self.free.pop() else {
                break;
            };

            let read = stream.read(&mut self.scratch)?;
            if read < self.scratch.len() {
                self.end_of_stream = true;
            }
            let whole = read - read % format.frame_size();
            if whole == 0 {
                self.free.push(buffer);
                break;
            }

            backend.upload(buffer, format, &self.scratch[..whole])?;
            backend.queue(self.handles.source, buffer)?;
            self.cycle_bytes += whole as u64;
        }
        Ok(())
    }

    fn reclaim(&mut self) -> AudioResult<()> {
        for buffer in self.handles.backend.unqueue_processed(self.handles.source)? {
            self.take_back(buffer)?;
        }
        Ok(())
    }

    fn take_back(&mut self, buffer: BufferId) -> AudioResult<()> {
        if !self.handles.owns(buffer) || self.free.contains(&buffer) {
            return Err(AudioError::ResourceMismatch(format!(
                "buffer {} returned to stream at {} twice or by a foreign source",
                buffer, self.position
            )));
        }
        self.free.push(buffer);
        Ok(())
    }

    /// Restart a source that ran dry while buffers are still queued
    fn resume_after_underrun(&self) -> AudioResult<()> {
        let backend = &self.handles.backend;
        let source = self.handles.source;
        if backend.queued_count(source)? > 0 && backend.source_state(source)? != SourceState::Playing {
            log::trace!("Resuming stream at {} after underrun", self.position);
            backend.play(source)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Consumption, NullBackend};
    use crate::decode::{BufferFormat, MemoryOpener};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    const MONO: PcmFormat = PcmFormat {
        sample_rate: 8000,
        layout: BufferFormat::Mono16,
    };

    fn settings() -> StreamSettings {
        StreamSettings {
            buffer_count: 2,
            buffer_bytes: 16,
            poll_interval: Duration::from_millis(1),
        }
    }

    fn resource(
        backend: &Arc<NullBackend>,
        opener: Arc<dyn StreamOpener>,
        offset: f64,
        looping: bool,
    ) -> StreamingResource {
        let settings = settings();
        let handles = ResourceHandles::allocate(backend.clone(), settings.buffer_count).unwrap();
        StreamingResource::new(
            BlockPos::ORIGIN,
            PathBuf::from("clip"),
            opener,
            handles,
            offset,
            Arc::new(AtomicBool::new(looping)),
            &settings,
        )
    }

    fn pcm() -> Vec<u8> {
        (0..40u8).collect()
    }

    #[test]
    fn test_loop_restarts_from_zero_reusing_handles() {
        let backend = Arc::new(NullBackend::new(Consumption::Immediate).with_capture());
        let opener = Arc::new(MemoryOpener::new(MONO, pcm()));
        // 0.001 s at 8 kHz mono is 8 frames, 16 bytes
        let mut resource = resource(&backend, opener.clone(), 0.001, true);

        let phases: Vec<StreamPhase> = (0..4).map(|_| resource.step().unwrap()).collect();
        assert_eq!(
            phases,
            vec![
                StreamPhase::Draining,
                StreamPhase::Restarting,
                StreamPhase::Priming,
                StreamPhase::Streaming,
            ]
        );

        let data = pcm();
        assert_eq!(
            backend.captured(),
            vec![
                data[16..32].to_vec(),
                data[32..40].to_vec(),
                data[0..16].to_vec(),
                data[16..32].to_vec(),
            ]
        );
        assert_eq!(resource.cycles(), 1);
        assert_eq!(opener.open_count(), 2);

        let stats = backend.stats();
        assert_eq!(stats.sources_created, 1);
        assert_eq!(stats.buffers_created, 2);
        assert_eq!(stats.live_buffers(), 2);
    }

    #[test]
    fn test_non_looping_stream_stops_and_releases() {
        let backend = Arc::new(NullBackend::new(Consumption::Immediate).with_capture());
        let opener = Arc::new(MemoryOpener::new(MONO, pcm()));
        let mut resource = resource(&backend, opener, 0.0, false);

        assert_eq!(resource.step().unwrap(), StreamPhase::Streaming);
        assert_eq!(resource.step().unwrap(), StreamPhase::Draining);
        assert_eq!(resource.step().unwrap(), StreamPhase::Stopped);
        assert_eq!(resource.step().unwrap(), StreamPhase::Stopped);

        assert_eq!(backend.captured().concat(), pcm());
        assert!(resource.handles().is_released());
        let stats = backend.stats();
        assert_eq!(stats.live_sources(), 0);
        assert_eq!(stats.live_buffers(), 0);
        assert_eq!(stats.invalid_deletes, 0);
    }

    #[test]
    fn test_offset_past_end_is_seek_failure() {
        let backend = Arc::new(NullBackend::new(Consumption::Immediate));
        let opener = Arc::new(MemoryOpener::new(MONO, pcm()));
        let mut resource = resource(&backend, opener, 1.0, true);

        assert!(matches!(
            resource.step(),
            Err(AudioError::SeekFailure { requested: 16000, available: 40 })
        ));
        assert_eq!(resource.phase(), StreamPhase::Stopped);
        assert_eq!(backend.stats().live_sources(), 0);
        assert_eq!(backend.stats().plays, 0);
    }

    #[test]
    fn test_underrun_with_queued_audio_resumes() {
        let backend = Arc::new(NullBackend::new(Consumption::RealTime));
        // Four seconds of mono audio in one-second buffers
        let opener = Arc::new(MemoryOpener::new(MONO, vec![0u8; 64_000]));
        let settings = StreamSettings {
            buffer_count: 2,
            buffer_bytes: 16_000,
            poll_interval: Duration::from_millis(1),
        };
        let handles = ResourceHandles::allocate(backend.clone(), settings.buffer_count).unwrap();
        let source = handles.source();
        let mut resource = StreamingResource::new(
            BlockPos::ORIGIN,
            PathBuf::from("clip"),
            opener,
            handles,
            0.0,
            Arc::new(AtomicBool::new(false)),
            &settings,
        );

        assert_eq!(resource.step().unwrap(), StreamPhase::Streaming);
        assert_eq!(backend.stats().plays, 1);

        backend.starve(source);
        assert_eq!(resource.step().unwrap(), StreamPhase::Streaming);
        assert_eq!(backend.stats().plays, 2);
        assert_eq!(backend.source_state(source).unwrap(), SourceState::Playing);
        assert_eq!(backend.queued_count(source).unwrap(), 2);
        assert!(!resource.handles().is_released());
    }

    #[test]
    fn test_empty_looping_stream_stops() {
        let backend = Arc::new(NullBackend::new(Consumption::Immediate));
        let opener = Arc::new(MemoryOpener::new(MONO, Vec::new()));
        let mut resource = resource(&backend, opener, 0.0, true);

        assert_eq!(resource.step().unwrap(), StreamPhase::Stopped);
    }

    #[test]
    fn test_release_happens_once() {
        let backend = Arc::new(NullBackend::new(Consumption::Immediate));
        let handles = ResourceHandles::allocate(backend.clone(), 3).unwrap();

        assert!(handles.release());
        assert!(!handles.release());
        drop(handles);

        let stats = backend.stats();
        assert_eq!(stats.sources_deleted, 1);
        assert_eq!(stats.buffers_deleted, 3);
        assert_eq!(stats.invalid_deletes, 0);
    }

    /// Opens mono first, stereo afterwards
    struct ShiftingOpener {
        opens: AtomicUsize,
    }

    impl StreamOpener for ShiftingOpener {
        fn open(&self, path: &Path) -> AudioResult<Box<dyn PcmStream>> {
            let layout = if self.opens.fetch_add(1, Ordering::SeqCst) == 0 {
                BufferFormat::Mono16
            } else {
                BufferFormat::Stereo16
            };
            MemoryOpener::new(PcmFormat::new(8000, layout), vec![0u8; 8]).open(path)
        }
    }

    #[test]
    fn test_format_change_on_loop_is_mismatch() {
        let backend = Arc::new(NullBackend::new(Consumption::Immediate));
        let opener = Arc::new(ShiftingOpener {
            opens: AtomicUsize::new(0),
        });
        let mut resource = resource(&backend, opener, 0.0, true);

        assert_eq!(resource.step().unwrap(), StreamPhase::Draining);
        assert_eq!(resource.step().unwrap(), StreamPhase::Restarting);
        assert_eq!(resource.step().unwrap(), StreamPhase::Priming);
        assert!(matches!(resource.step(), Err(AudioError::ResourceMismatch(_))));
        assert_eq!(backend.stats().live_sources(), 0);
    }
}
