//! Software mixer
//!
//! Implements the buffer-queue interface on top of one interleaved `f32`
//! output block, the shape a device callback asks for. Each playing source is
//! resampled to the output rate, scaled by its gain and summed.

use std::collections::VecDeque;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::backend::{AudioBackend, BufferId, SourceId, SourceState};
use crate::decode::PcmFormat;
use crate::{AudioError, AudioResult};

#[derive(Default)]
struct MixBuffer {
    samples: Vec<f32>,
    channels: usize,
    sample_rate: u32,
}

impl MixBuffer {
    fn frames(&self) -> usize {
        match self.channels {
            0 => 0,
            n => self.samples.len() / n,
        }
    }

    /// Left and right sample of `frame`; mono is duplicated
    fn frame(&self, frame: usize) -> (f32, f32) {
        let at = frame * self.channels;
        match self.channels {
            1 => (self.samples[at], self.samples[at]),
            _ => (self.samples[at], self.samples[at + 1]),
        }
    }
}

struct MixSource {
    queued: VecDeque<BufferId>,
    processed: VecDeque<BufferId>,
    state: SourceState,
    gain: f32,
    /// Read position in the front buffer, in source frames
    cursor: f64,
}

#[derive(Default)]
struct MixState {
    next_id: u32,
    sources: AHashMap<SourceId, MixSource>,
    buffers: AHashMap<BufferId, MixBuffer>,
}

/// Mixes queued PCM buffers into a single output stream
pub struct SoftwareMixer {
    output_rate: u32,
    output_channels: usize,
    state: Mutex<MixState>,
}

impl SoftwareMixer {
    pub fn new(output_rate: u32, output_channels: u16) -> Self {
        Self {
            output_rate: output_rate.max(1),
            output_channels: usize::from(output_channels.max(1)),
            state: Mutex::new(MixState::default()),
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Overwrite `out`, interleaved in the output layout, with the next block
    /// of mixed audio. Played buffers move to their source's processed list.
    pub fn render(&self, out: &mut [f32]) {
        let mut state = self.state.lock();
        let MixState { sources, buffers, .. } = &mut *state;

        for frame in out.chunks_mut(self.output_channels) {
            let (mut left, mut right) = (0.0f32, 0.0f32);
            for source in sources.values_mut() {
                if source.state != SourceState::Playing {
                    continue;
                }
                if let Some((l, r)) = next_frame(source, buffers, self.output_rate) {
                    left += l * source.gain;
                    right += r * source.gain;
                }
            }
            write_frame(frame, left, right);
        }
    }

    fn with_source<T>(&self, id: SourceId, f: impl FnOnce(&mut MixSource) -> AudioResult<T>) -> AudioResult<T> {
        let mut state = self.state.lock();
        let source = state
            .sources
            .get_mut(&id)
            .ok_or_else(|| AudioError::Backend(format!("unknown source {}", id)))?;
        f(source)
    }
}

/// Pull one output frame from `source`, stepping past finished buffers
fn next_frame(
    source: &mut MixSource,
    buffers: &AHashMap<BufferId, MixBuffer>,
    output_rate: u32,
) -> Option<(f32, f32)> {
    loop {
        let Some(front) = source.queued.front() else {
            source.state = SourceState::Stopped;
            return None;
        };

        let frames = match buffers.get(front) {
            Some(buffer) if (source.cursor as usize) < buffer.frames() => {
                let sample = buffer.frame(source.cursor as usize);
                source.cursor += buffer.sample_rate as f64 / output_rate as f64;
                return Some(sample);
            }
            Some(buffer) => buffer.frames(),
            None => 0,
        };

        source.cursor = (source.cursor - frames as f64).max(0.0);
        if let Some(done) = source.queued.pop_front() {
            source.processed.push_back(done);
        }
    }
}

fn write_frame(frame: &mut [f32], left: f32, right: f32) {
    if let [mono] = frame {
        *mono = ((left + right) * 0.5).clamp(-1.0, 1.0);
        return;
    }
    for (channel, sample) in frame.iter_mut().enumerate() {
        *sample = match channel {
            0 => left.clamp(-1.0, 1.0),
            1 => right.clamp(-1.0, 1.0),
            _ => 0.0,
        };
    }
}

impl AudioBackend for SoftwareMixer {
    fn create_source(&self) -> AudioResult<SourceId> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.sources.insert(
            id,
            MixSource {
                queued: VecDeque::new(),
                processed: VecDeque::new(),
                state: SourceState::Initial,
                gain: 1.0,
                cursor: 0.0,
            },
        );
        Ok(id)
    }

    fn create_buffers(&self, count: usize) -> AudioResult<Vec<BufferId>> {
        let mut state = self.state.lock();
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            state.next_id += 1;
            let id = state.next_id;
            state.buffers.insert(id, MixBuffer::default());
            ids.push(id);
        }
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
        let samples = data
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
            .collect();

        let mut state = self.state.lock();
        let slot = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| AudioError::Backend(format!("unknown buffer {}", buffer)))?;
        *slot = MixBuffer {
            samples,
            channels: format.layout.channels(),
            sample_rate: format.sample_rate,
        };
        Ok(())
    }

    fn queue(&self, source: SourceId, buffer: BufferId) -> AudioResult<()> {
        let mut state = self.state.lock();
        if !state.buffers.contains_key(&buffer) {
            return Err(AudioError::Backend(format!("unknown buffer {}", buffer)));
        }
        let source = state
            .sources
            .get_mut(&source)
            .ok_or_else(|| AudioError::Backend(format!("unknown source {}", source)))?;
        source.queued.push_back(buffer);
        Ok(())
    }

    fn unqueue_processed(&self, source: SourceId) -> AudioResult<Vec<BufferId>> {
        self.with_source(source, |source| Ok(source.processed.drain(..).collect()))
    }

    fn unqueue_all(&self, source: SourceId) -> AudioResult<Vec<BufferId>> {
        self.with_source(source, |source| {
            let mut all: Vec<BufferId> = source.processed.drain(..).collect();
            all.extend(source.queued.drain(..));
            source.cursor = 0.0;
            Ok(all)
        })
    }

    fn queued_count(&self, source: SourceId) -> AudioResult<usize> {
        self.with_source(source, |source| Ok(source.queued.len() + source.processed.len()))
    }

    fn play(&self, source: SourceId) -> AudioResult<()> {
        self.with_source(source, |source| {
            source.state = SourceState::Playing;
            Ok(())
        })
    }

    fn stop(&self, source: SourceId) -> AudioResult<()> {
        self.with_source(source, |source| {
            source.state = SourceState::Stopped;
            source.processed.extend(source.queued.drain(..));
            source.cursor = 0.0;
            Ok(())
        })
    }

    fn source_state(&self, source: SourceId) -> AudioResult<SourceState> {
        self.with_source(source, |source| Ok(source.state))
    }

    fn set_gain(&self, source: SourceId, gain: f32) -> AudioResult<()> {
        self.with_source(source, |source| {
            source.gain = gain.clamp(0.0, 1.0);
            Ok(())
        })
    }

    fn delete_source(&self, source: SourceId) -> AudioResult<()> {
        match self.state.lock().sources.remove(&source) {
            Some(_) => Ok(()),
            None => Err(AudioError::Backend(format!("unknown source {}", source))),
        }
    }

    fn delete_buffers(&self, buffers: &[BufferId]) -> AudioResult<()> {
        let mut state = self.state.lock();
        let missing = buffers
            .iter()
            .filter(|buffer| state.buffers.remove(*buffer).is_none())
            .count();
        if missing > 0 {
            return Err(AudioError::Backend(format!("{} unknown buffers", missing)));
        }
        Ok(())
    }
}
