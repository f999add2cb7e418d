//! Output through the host's default device via cpal
//!
//! The device stream pulls blocks from a [`SoftwareMixer`]. The stream lives
//! on its own thread until the backend is dropped, since cpal streams cannot
//! move between threads on every host.

use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample, StreamConfig};
use crossbeam::channel::{bounded, Receiver, Sender};
use sonora_platform::Thread;

use crate::backend::{AudioBackend, BufferId, SourceId, SourceState};
use crate::decode::PcmFormat;
use crate::mixer::SoftwareMixer;
use crate::{AudioError, AudioResult};

/// How long drop waits for the output thread to close the stream
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// [`AudioBackend`] playing on the default output device
pub struct CpalBackend {
    mixer: Arc<SoftwareMixer>,
    shutdown: Option<Sender<()>>,
    thread: Option<Thread>,
}

impl CpalBackend {
    /// Open the default output device and start mixing into it
    pub fn open() -> AudioResult<Self> {
        let (ready_tx, ready_rx) = bounded::<AudioResult<Arc<SoftwareMixer>>>(1);
        let (shutdown, shutdown_rx) = bounded::<()>(0);
        let thread = Thread::spawn("sonora-output", move || run_output(ready_tx, shutdown_rx))?;

        let mixer = ready_rx
            .recv()
            .map_err(|_| AudioError::Backend(String::from("output thread exited during startup")))??;
        log::info!(
            "Audio output open at {} Hz, {} channels",
            mixer.output_rate(),
            mixer.output_channels()
        );

        Ok(Self {
            mixer,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn mixer(&self) -> &Arc<SoftwareMixer> {
        &self.mixer
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        // Disconnecting the channel tells the output thread to close the stream
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            thread.join_timeout(CLOSE_TIMEOUT);
        }
    }
}

fn run_output(ready: Sender<AudioResult<Arc<SoftwareMixer>>>, shutdown: Receiver<()>) {
    let stream = match open_stream() {
        Ok((stream, mixer)) => {
            if ready.send(Ok(mixer)).is_err() {
                return;
            }
            stream
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    let _ = shutdown.recv();
    drop(stream);
    log::debug!("Audio output closed");
}

fn open_stream() -> AudioResult<(cpal::Stream, Arc<SoftwareMixer>)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::Backend(String::from("no output device available")))?;
    let supported = device.default_output_config().map_err(backend_error)?;
    let config = supported.config();
    let mixer = Arc::new(SoftwareMixer::new(config.sample_rate.0, config.channels));

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, mixer.clone())?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, mixer.clone())?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, mixer.clone())?,
        format => {
            return Err(AudioError::DecodeUnsupported(format!(
                "output sample format {:?}",
                format
            )));
        }
    };
    stream.play().map_err(backend_error)?;
    Ok((stream, mixer))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Arc<SoftwareMixer>,
) -> AudioResult<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut block: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                block.resize(data.len(), 0.0);
                mixer.render(&mut block);
                for (out, sample) in data.iter_mut().zip(&block) {
                    *out = T::from_sample(*sample);
                }
            },
            |err| log::warn!("Audio output error: {}", err),
            None,
        )
        .map_err(backend_error)
}

fn backend_error(err: impl std::fmt::Display) -> AudioError {
    AudioError::Backend(err.to_string())
}

impl AudioBackend for CpalBackend {
    fn create_source(&self) -> AudioResult<SourceId> {
        self.mixer.create_source()
    }

    fn create_buffers(&self, count: usize) -> AudioResult<Vec<BufferId>> {
        self.mixer.create_buffers(count)
    }

    fn upload(&self, buffer: BufferId, format: PcmFormat, data: &[u8]) -> AudioResult<()> {
        self.mixer.upload(buffer, format, data)
    }

    fn queue(&self, source: SourceId, buffer: BufferId) -> AudioResult<()> {
        self.mixer.queue(source, buffer)
    }

    fn unqueue_processed(&self, source: SourceId) -> AudioResult<Vec<BufferId>> {
        self.mixer.unqueue_processed(source)
    }

    fn unqueue_all(&self, source: SourceId) -> AudioResult<Vec<BufferId>> {
        self.mixer.unqueue_all(source)
    }

    fn queued_count(&self, source: SourceId) -> AudioResult<usize> {
        self.mixer.queued_count(source)
    }

    fn play(&self, source: SourceId) -> AudioResult<()> {
        self.mixer.play(source)
    }

    fn stop(&self, source: SourceId) -> AudioResult<()> {
        self.mixer.stop(source)
    }

    fn source_state(&self, source: SourceId) -> AudioResult<SourceState> {
        self.mixer.source_state(source)
    }

    fn set_gain(&self, source: SourceId, gain: f32) -> AudioResult<()> {
        self.mixer.set_gain(source, gain)
    }

    fn delete_source(&self, source: SourceId) -> AudioResult<()> {
        self.mixer.delete_source(source)
    }

    fn delete_buffers(&self, buffers: &[BufferId]) -> AudioResult<()> {
        self.mixer.delete_buffers(buffers)
    }
}
