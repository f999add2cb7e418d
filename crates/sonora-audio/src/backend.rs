//! Audio output backend
//!
//! Streaming talks to the output device through a small queue-of-buffers
//! interface: a source plays whatever buffers are queued on it, and hands them
//! back as processed once played. [`NullBackend`] implements it without a
//! device, consuming buffers either instantly or in real time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::decode::PcmFormat;
use crate::{AudioError, AudioResult};

pub type SourceId = u32;
pub type BufferId = u32;

/// Playback state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Initial,
    Playing,
    Stopped,
}

/// Output device abstraction
pub trait AudioBackend: Send + Sync {
    fn create_source(&self) -> AudioResult<SourceId>;
    fn create_buffers(&self, count: usize) -> AudioResult<Vec<BufferId>>;

    /// Replace the contents of an unqueued buffer
    fn upload(&self, buffer: BufferId, format: PcmFormat, data: &[u8]) -> AudioResult<()>;

    fn queue(&self, source: SourceId, buffer: BufferId) -> AudioResult<()>;

    /// Take back buffers the source finished playing
    fn unqueue_processed(&self, source: SourceId) -> AudioResult<Vec<BufferId>>;

    /// Take back every queued buffer; the source must be stopped
    fn unqueue_all(&self, source: SourceId) -> AudioResult<Vec<BufferId>>;

    fn queued_count(&self, source: SourceId) -> AudioResult<usize>;
    fn play(&self, source: SourceId) -> AudioResult<()>;
    fn stop(&self, source: SourceId) -> AudioResult<()>;
    fn source_state(&self, source: SourceId) -> AudioResult<SourceState>;
    fn set_gain(&self, source: SourceId, gain: f32) -> AudioResult<()>;
    fn delete_source(&self, source: SourceId) -> AudioResult<()>;
    fn delete_buffers(&self, buffers: &[BufferId]) -> AudioResult<()>;
}

/// How the null backend plays queued audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// Everything queued is played as soon as it is observed
    Immediate,
    /// Buffers last as long as the audio they hold
    RealTime,
}

/// Counters kept by [`NullBackend`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NullStats {
    pub sources_created: usize,
    pub sources_deleted: usize,
    pub buffers_created: usize,
    pub buffers_deleted: usize,
    pub uploads: usize,
    pub bytes_uploaded: u64,
    pub plays: usize,
    /// Deletes of ids that were not live
    pub invalid_deletes: usize,
}

impl NullStats {
    pub fn live_sources(&self) -> usize {
        self.sources_created - self.sources_deleted
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers_created - self.buffers_deleted
    }
}

#[derive(Default)]
struct NullBuffer {
    duration: Duration,
}

struct NullSource {
    queued: VecDeque<BufferId>,
    processed: VecDeque<BufferId>,
    state: SourceState,
    gain: f32,
    last_advance: Instant,
    /// Time already spent playing the front buffer
    front_elapsed: Duration,
}

#[derive(Default)]
struct NullState {
    next_id: u32,
    sources: AHashMap<SourceId, NullSource>,
    buffers: AHashMap<BufferId, NullBuffer>,
    stats: NullStats,
    captured: Vec<Vec<u8>>,
}

/// Device-less backend
pub struct NullBackend {
    consumption: Consumption,
    capture: bool,
    state: Mutex<NullState>,
}

impl NullBackend {
    pub fn new(consumption: Consumption) -> Self {
        Self {
            consumption,
            capture: false,
            state: Mutex::new(NullState::default()),
        }
    }

    /// Keep a copy of every upload, in upload order
    pub fn with_capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn stats(&self) -> NullStats {
        self.state.lock().stats.clone()
    }

    /// Every captured upload, in order
    pub fn captured(&self) -> Vec<Vec<u8>> {
        self.state.lock().captured.clone()
    }

    /// Gain last set on `source`
    pub fn gain(&self, source: SourceId) -> Option<f32> {
        self.state.lock().sources.get(&source).map(|s| s.gain)
    }

    /// Number of sources currently playing
    pub fn playing_sources(&self) -> usize {
        let mut state = self.state.lock();
        let consumption = self.consumption;
        let NullState { sources, buffers, .. } = &mut *state;
        let mut playing = 0;
        for source in sources.values_mut() {
            advance(source, buffers, consumption);
            if source.state == SourceState::Playing {
                playing += 1;
            }
        }
        playing
    }

    /// Stop `source` as a device underrun would, leaving its queue in place
    #[cfg(test)]
    pub(crate) fn starve(&self, source: SourceId) {
        if let Some(source) = self.state.lock().sources.get_mut(&source) {
            source.state = SourceState::Stopped;
        }
    }

    fn with_source<T>(
        &self,
        id: SourceId,
        f: impl FnOnce(&mut NullSource, &AHashMap<BufferId, NullBuffer>) -> AudioResult<T>,
    ) -> AudioResult<T> {
        let mut state = self.state.lock();
        let NullState { sources, buffers, .. } = &mut *state;
        let source = sources
            .get_mut(&id)
            .ok_or_else(|| AudioError::Backend(format!("unknown source {}", id)))?;
        advance(source, buffers, self.consumption);
        f(source, buffers)
    }
}

/// Move played buffers from the queue to the processed list
fn advance(source: &mut NullSource, buffers: &AHashMap<BufferId, NullBuffer>, consumption: Consumption) {
    let now = Instant::now();
    if source.state != SourceState::Playing {
        source.last_advance = now;
        return;
    }

    match consumption {
        Consumption::Immediate => source.processed.extend(source.queued.drain(..)),
        Consumption::RealTime => {
            let mut budget = now.saturating_duration_since(source.last_advance) + source.front_elapsed;
            source.front_elapsed = Duration::ZERO;
            while let Some(front) = source.queued.front() {
                let length = buffers.get(front).map_or(Duration::ZERO, |b| b.duration);
                if budget < length {
                    source.front_elapsed = budget;
                    break;
                }
                budget -= length;
                if let Some(done) = source.queued.pop_front() {
                    source.processed.push_back(done);
                }
            }
        }
    }
    source.last_advance = now;

    if source.queued.is_empty() {
        source.state = SourceState::Stopped;
    }
}

impl AudioBackend for NullBackend {
    fn create_source(&self) -> AudioResult<SourceId> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.sources.insert(
            id,
            NullSource {
                queued: VecDeque::new(),
                processed: VecDeque::new(),
                state: SourceState::Initial,
                gain: 1.0,
                last_advance: Instant::now(),
                front_elapsed: Duration::ZERO,
            },
        );
        state.stats.sources_created += 1;
        Ok(id)
    }

    fn create_buffers(&self, count: usize) -> AudioResult<Vec<BufferId>> {
        let mut state = self.state.lock();
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            state.next_id += 1;
            let id = state.next_id;
            state.buffers.insert(id, NullBuffer::default());
            ids.push(id);
        }
        state.stats.buffers_created += count;
        Ok(ids)
    }

    fn upload(&self, buffer: BufferId, format: PcmFormat, data: &[u8]) -> AudioResult<()> {
        if data.len() % format.frame_size() != 0 {
            return Err(AudioError::ResourceMismatch(format!(
                "{} bytes is not a whole number of {}-byte frames",
                data.len(),
                format.frame_size()
            )));
        }
        let mut state = self.state.lock();
        let slot = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| AudioError::Backend(format!("unknown buffer {}", buffer)))?;
        slot.duration = format.duration_of(data.len());
        state.stats.uploads += 1;
        state.stats.bytes_uploaded += data.len() as u64;
        if self.capture {
            state.captured.push(data.to_vec());
        }
        Ok(())
    }

    fn queue(&self, source: SourceId, buffer: BufferId) -> AudioResult<()> {
        self.with_source(source, |source, buffers| {
            if !buffers.contains_key(&buffer) {
                return Err(AudioError::Backend(format!("unknown buffer {}", buffer)));
            }
            source.queued.push_back(buffer);
            Ok(())
        })
    }

    fn unqueue_processed(&self, source: SourceId) -> AudioResult<Vec<BufferId>> {
        self.with_source(source, |source, _| Ok(source.processed.drain(..).collect()))
    }

    fn unqueue_all(&self, source: SourceId) -> AudioResult<Vec<BufferId>> {
        self.with_source(source, |source, _| {
            let mut all: Vec<BufferId> = source.processed.drain(..).collect();
            all.extend(source.queued.drain(..));
            source.front_elapsed = Duration::ZERO;
            Ok(all)
        })
    }

    fn queued_count(&self, source: SourceId) -> AudioResult<usize> {
        self.with_source(source, |source, _| Ok(source.queued.len() + source.processed.len()))
    }

    fn play(&self, source: SourceId) -> AudioResult<()> {
        self.with_source(source, |source, _| {
            source.state = SourceState::Playing;
            source.last_advance = Instant::now();
            Ok(())
        })?;
        self.state.lock().stats.plays += 1;
        Ok(())
    }

    fn stop(&self, source: SourceId) -> AudioResult<()> {
        self.with_source(source, |source, _| {
            source.state = SourceState::Stopped;
            source.processed.extend(source.queued.drain(..));
            source.front_elapsed = Duration::ZERO;
            Ok(())
        })
    }

    fn source_state(&self, source: SourceId) -> AudioResult<SourceState> {
        self.with_source(source, |source, _| Ok(source.state))
    }

    fn set_gain(&self, source: SourceId, gain: f32) -> AudioResult<()> {
        self.with_source(source, |source, _| {
            source.gain = gain.clamp(0.0, 1.0);
            Ok(())
        })
    }

    fn delete_source(&self, source: SourceId) -> AudioResult<()> {
        let mut state = self.state.lock();
        if state.sources.remove(&source).is_none() {
            state.stats.invalid_deletes += 1;
            return Err(AudioError::Backend(format!("unknown source {}", source)));
        }
        state.stats.sources_deleted += 1;
        Ok(())
    }

    fn delete_buffers(&self, buffers: &[BufferId]) -> AudioResult<()> {
        let mut state = self.state.lock();
        let mut missing = 0;
        for buffer in buffers {
            if state.buffers.remove(buffer).is_some() {
                state.stats.buffers_deleted += 1;
            } else {
                missing += 1;
            }
        }
        if missing > 0 {
            state.stats.invalid_deletes += missing;
            return Err(AudioError::Backend(format!("{} unknown buffers", missing)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::BufferFormat;

    const MONO: PcmFormat = PcmFormat {
        sample_rate: 8000,
        layout: BufferFormat::Mono16,
    };

    #[test]
    fn test_immediate_consumption() {
        let backend = NullBackend::new(Consumption::Immediate);
        let source = backend.create_source().unwrap();
        let buffers = backend.create_buffers(2).unwrap();

        for buffer in &buffers {
            backend.upload(*buffer, MONO, &[0u8; 16]).unwrap();
            backend.queue(source, *buffer).unwrap();
        }
        assert_eq!(backend.source_state(source).unwrap(), SourceState::Initial);

        backend.play(source).unwrap();
        assert_eq!(backend.unqueue_processed(source).unwrap(), buffers);
        assert_eq!(backend.source_state(source).unwrap(), SourceState::Stopped);
        assert_eq!(backend.queued_count(source).unwrap(), 0);
    }

    #[test]
    fn test_realtime_consumption_waits() {
        let backend = NullBackend::new(Consumption::RealTime);
        let source = backend.create_source().unwrap();
        let buffers = backend.create_buffers(1).unwrap();
        // One second of mono audio
        backend.upload(buffers[0], MONO, &vec![0u8; 16000]).unwrap();
        backend.queue(source, buffers[0]).unwrap();
        backend.play(source).unwrap();

        assert!(backend.unqueue_processed(source).unwrap().is_empty());
        assert_eq!(backend.source_state(source).unwrap(), SourceState::Playing);
    }

    #[test]
    fn test_playing_sources_counts_live_playback() {
        let backend = NullBackend::new(Consumption::RealTime);
        let long = backend.create_source().unwrap();
        let short = backend.create_source().unwrap();
        let idle = backend.create_source().unwrap();
        let buffers = backend.create_buffers(2).unwrap();
        backend.upload(buffers[0], MONO, &vec![0u8; 16000]).unwrap();
        backend.queue(long, buffers[0]).unwrap();
        backend.queue(short, buffers[1]).unwrap();
        backend.play(long).unwrap();
        backend.play(short).unwrap();

        // The empty buffer on `short` is used up at once; `idle` never started
        assert_eq!(backend.playing_sources(), 1);
        assert_eq!(backend.source_state(idle).unwrap(), SourceState::Initial);
    }

    #[test]
    fn test_partial_frame_upload_is_rejected() {
        let backend = NullBackend::new(Consumption::Immediate);
        let buffers = backend.create_buffers(1).unwrap();
        assert!(matches!(
            backend.upload(buffers[0], MONO, &[0u8; 3]),
            Err(AudioError::ResourceMismatch(_))
        ));
    }

    #[test]
    fn test_double_delete_is_counted() {
        let backend = NullBackend::new(Consumption::Immediate);
        let source = backend.create_source().unwrap();
        let buffers = backend.create_buffers(3).unwrap();

        backend.delete_source(source).unwrap();
        backend.delete_buffers(&buffers).unwrap();
        assert!(backend.delete_source(source).is_err());

        let stats = backend.stats();
        assert_eq!(stats.live_sources(), 0);
        assert_eq!(stats.live_buffers(), 0);
        assert_eq!(stats.invalid_deletes, 1);
    }

    #[test]
    fn test_capture_and_gain() {
        let backend = NullBackend::new(Consumption::Immediate).with_capture();
        let source = backend.create_source().unwrap();
        let buffers = backend.create_buffers(1).unwrap();
        backend.upload(buffers[0], MONO, &[1, 2, 3, 4]).unwrap();
        backend.set_gain(source, 1.5).unwrap();

        assert_eq!(backend.captured(), vec![vec![1, 2, 3, 4]]);
        assert_eq!(backend.gain(source), Some(1.0));
    }
}
