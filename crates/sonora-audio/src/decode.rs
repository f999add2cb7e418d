//! Incremental decode to 16-bit PCM
//!
//! Playback never decodes a whole asset up front. A [`PcmStream`] hands out
//! interleaved little-endian `i16` bytes on demand and can skip forward by an
//! exact byte count to honor a join offset.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sonora_assets::AudioFormat;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::{AudioError, AudioResult};

const BYTES_PER_SAMPLE: usize = 2;

/// Channel layout of uploaded buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferFormat {
    Mono16,
    Stereo16,
}

impl BufferFormat {
    /// Layout for a channel count; only mono and stereo are playable
    pub fn from_channels(channels: usize) -> AudioResult<Self> {
        match channels {
            1 => Ok(Self::Mono16),
            2 => Ok(Self::Stereo16),
            n => Err(AudioError::DecodeUnsupported(format!("{} channels", n))),
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            Self::Mono16 => 1,
            Self::Stereo16 => 2,
        }
    }
}

/// Shape of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub layout: BufferFormat,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, layout: BufferFormat) -> Self {
        Self { sample_rate, layout }
    }

    /// Bytes per frame (one sample for every channel)
    pub fn frame_size(&self) -> usize {
        self.layout.channels() * BYTES_PER_SAMPLE
    }

    /// Bytes per second of audio
    pub fn byte_rate(&self) -> u64 {
        self.sample_rate as u64 * self.frame_size() as u64
    }

    /// Playback time of `bytes` of PCM
    pub fn duration_of(&self, bytes: usize) -> std::time::Duration {
        let rate = self.byte_rate().max(1);
        std::time::Duration::from_secs_f64(bytes as f64 / rate as f64)
    }

    /// Largest frame-aligned size not above `bytes`, at least one frame
    pub fn align(&self, bytes: usize) -> usize {
        let frame = self.frame_size();
        (bytes / frame).max(1) * frame
    }
}

/// Byte position of `offset_seconds` in a stream of `format`
pub fn seek_byte_offset(offset_seconds: f64, format: PcmFormat) -> u64 {
    if offset_seconds <= 0.0 || !offset_seconds.is_finite() {
        return 0;
    }
    let frames = (offset_seconds * format.sample_rate as f64).floor() as u64;
    frames * format.frame_size() as u64
}

/// Source of interleaved 16-bit PCM
pub trait PcmStream: Send {
    fn format(&self) -> PcmFormat;

    /// Fill `buf` with PCM; returns bytes written, `0` at end of stream
    fn read(&mut self, buf: &mut [u8]) -> AudioResult<usize>;

    /// Discard exactly `bytes` of PCM.
    ///
    /// Reaching end of stream first is a [`AudioError::SeekFailure`].
    fn skip(&mut self, bytes: u64) -> AudioResult<()> {
        let mut scratch = vec![0u8; 16 * 1024];
        let mut skipped = 0u64;
        while skipped < bytes {
            let want = (bytes - skipped).min(scratch.len() as u64) as usize;
            let n = self.read(&mut scratch[..want])?;
            if n == 0 {
                return Err(AudioError::SeekFailure {
                    requested: bytes,
                    available: skipped,
                });
            }
            skipped += n as u64;
        }
        Ok(())
    }
}

/// Opens decode streams for cached asset files
pub trait StreamOpener: Send + Sync {
    fn open(&self, path: &Path) -> AudioResult<Box<dyn PcmStream>>;
}

/// Decoder backed by symphonia
pub struct SymphoniaOpener;

impl StreamOpener for SymphoniaOpener {
    fn open(&self, path: &Path) -> AudioResult<Box<dyn PcmStream>> {
        Ok(Box::new(SymphoniaStream::open(path)?))
    }
}

/// Incremental symphonia decode of one file
pub struct SymphoniaStream {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    format: PcmFormat,
    pending: Vec<u8>,
    cursor: usize,
    finished: bool,
}

impl SymphoniaStream {
    pub fn open(path: &Path) -> AudioResult<Self> {
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // Cache entries carry no extension; the probe then goes by content
        let mut hint = Hint::new();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if let Some(format) = AudioFormat::from_filename(name) {
            hint.with_extension(format.extension());
        }

        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AudioError::DecodeUnsupported(String::from("no audio track")))?;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| AudioError::DecodeUnsupported(String::from("unknown sample rate")))?;
        let channels = track
            .codec_params
            .channels
            .ok_or_else(|| AudioError::DecodeUnsupported(String::from("unknown channel layout")))?
            .count();
        let layout = BufferFormat::from_channels(channels)?;

        let decoder = symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;
        let track_id = track.id;

        log::debug!(
            "Opened {} ({} Hz, {} channels)",
            path.display(),
            sample_rate,
            channels
        );

        Ok(Self {
            reader,
            decoder,
            track_id,
            format: PcmFormat::new(sample_rate, layout),
            pending: Vec::new(),
            cursor: 0,
            finished: false,
        })
    }

    /// Decode the next packet into `pending`; returns `false` at end of stream
    fn decode_next(&mut self) -> AudioResult<bool> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(err)) => {
                    log::warn!("Skipping undecodable packet: {}", err);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if decoded.spec().channels.count() != self.format.layout.channels() {
                return Err(AudioError::ResourceMismatch(String::from(
                    "channel count changed mid-stream",
                )));
            }

            let mut samples = SampleBuffer::<i16>::new(decoded.capacity() as u64, *decoded.spec());
            samples.copy_interleaved_ref(decoded);

            self.pending.clear();
            self.cursor = 0;
            self.pending.reserve(samples.samples().len() * BYTES_PER_SAMPLE);
            for sample in samples.samples() {
                self.pending.extend_from_slice(&sample.to_le_bytes());
            }
            if !self.pending.is_empty() {
                return Ok(true);
            }
        }
    }
}

impl PcmStream for SymphoniaStream {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn read(&mut self, buf: &mut [u8]) -> AudioResult<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.cursor >= self.pending.len() {
                if self.finished || !self.decode_next()? {
                    self.finished = true;
                    break;
                }
            }
            let n = (buf.len() - written).min(self.pending.len() - self.cursor);
            buf[written..written + n].copy_from_slice(&self.pending[self.cursor..self.cursor + n]);
            self.cursor += n;
            written += n;
        }
        Ok(written)
    }
}

/// In-memory PCM for tests and tooling; every open replays the same bytes
pub struct MemoryOpener {
    format: PcmFormat,
    data: Arc<Vec<u8>>,
    opens: AtomicUsize,
}

impl MemoryOpener {
    pub fn new(format: PcmFormat, data: Vec<u8>) -> Self {
        Self {
            format,
            data: Arc::new(data),
            opens: AtomicUsize::new(0),
        }
    }

    /// Number of streams opened so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl StreamOpener for MemoryOpener {
    fn open(&self, _path: &Path) -> AudioResult<Box<dyn PcmStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryStream {
            format: self.format,
            data: Arc::clone(&self.data),
            cursor: 0,
        }))
    }
}

/// Stream over shared in-memory PCM
pub struct MemoryStream {
    format: PcmFormat,
    data: Arc<Vec<u8>>,
    cursor: usize,
}

impl PcmStream for MemoryStream {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn read(&mut self, buf: &mut [u8]) -> AudioResult<usize> {
        let n = buf.len().min(self.data.len() - self.cursor);
        buf[..n].copy_from_slice(&self.data[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }

    fn skip(&mut self, bytes: u64) -> AudioResult<()> {
        let available = (self.data.len() - self.cursor) as u64;
        if bytes > available {
            self.cursor = self.data.len();
            return Err(AudioError::SeekFailure {
                requested: bytes,
                available,
            });
        }
        self.cursor += bytes as usize;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Write a 16-bit WAV whose samples count up from zero
    fn write_wav(path: &Path, channels: u16, sample_rate: u32, frames: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let mut pcm = Vec::new();
        for i in 0..frames * channels as u32 {
            let sample = (i % 30000) as i16;
            writer.write_sample(sample).unwrap();
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        writer.finalize().unwrap();
        pcm
    }

    fn read_all(stream: &mut dyn PcmStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 1000];
        loop {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn test_seek_byte_offset() {
        let stereo = PcmFormat::new(44100, BufferFormat::Stereo16);
        assert_eq!(seek_byte_offset(0.0, stereo), 0);
        assert_eq!(seek_byte_offset(-3.0, stereo), 0);
        assert_eq!(seek_byte_offset(1.0, stereo), 176_400);

        let mono = PcmFormat::new(8000, BufferFormat::Mono16);
        // 0.00019 s is 1.52 frames; floor to one frame
        assert_eq!(seek_byte_offset(0.00019, mono), 2);
    }

    #[test]
    fn test_frame_alignment() {
        let stereo = PcmFormat::new(48000, BufferFormat::Stereo16);
        assert_eq!(stereo.frame_size(), 4);
        assert_eq!(stereo.align(16 * 1024 + 3), 16 * 1024);
        assert_eq!(stereo.align(1), 4);
    }

    #[test]
    fn test_more_than_two_channels_is_unsupported() {
        assert!(matches!(
            BufferFormat::from_channels(6),
            Err(AudioError::DecodeUnsupported(_))
        ));
    }

    #[test]
    fn test_symphonia_decodes_wav_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let pcm = write_wav(&path, 2, 8000, 4000);

        let mut stream = SymphoniaOpener.open(&path).unwrap();
        assert_eq!(stream.format(), PcmFormat::new(8000, BufferFormat::Stereo16));
        assert_eq!(read_all(stream.as_mut()), pcm);
    }

    #[test]
    fn test_extensionless_cache_file_is_probed() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("tone.wav");
        let pcm = write_wav(&wav, 1, 8000, 800);
        let cached = dir.path().join("0123456789abcdef");
        std::fs::rename(&wav, &cached).unwrap();

        let mut stream = SymphoniaOpener.open(&cached).unwrap();
        assert_eq!(stream.format().layout, BufferFormat::Mono16);
        assert_eq!(read_all(stream.as_mut()), pcm);
    }

    #[test]
    fn test_skip_lands_on_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let pcm = write_wav(&path, 2, 8000, 8000);

        let mut stream = SymphoniaOpener.open(&path).unwrap();
        let offset = seek_byte_offset(0.25, stream.format());
        stream.skip(offset).unwrap();
        let rest = read_all(stream.as_mut());
        assert_eq!(rest, pcm[offset as usize..]);
        assert_eq!(offset, 2000 * 4);
    }

    #[test]
    fn test_skip_past_end_is_seek_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        write_wav(&path, 1, 8000, 800);

        let mut stream = SymphoniaOpener.open(&path).unwrap();
        let offset = seek_byte_offset(5.0, stream.format());
        assert!(matches!(
            stream.skip(offset),
            Err(AudioError::SeekFailure { available: 1600, .. })
        ));
    }

    #[test]
    fn test_memory_stream_counts_opens() {
        let opener = MemoryOpener::new(PcmFormat::new(8000, BufferFormat::Mono16), vec![7u8; 10]);
        let mut first = opener.open(Path::new("a")).unwrap();
        assert_eq!(read_all(first.as_mut()), vec![7u8; 10]);
        let mut second = opener.open(Path::new("a")).unwrap();
        assert!(second.skip(11).is_err());
        assert_eq!(opener.open_count(), 2);
    }
}
