//! Sources of stream audio.
//!
//! Readers run on the stream I/O thread only. They produce interleaved `f32` frames
//! in their native channel layout; conversion to the stereo chunk format happens in
//! the loader.

use crate::audio_data::CitySonicAudioData;
use crate::error::{CitySonicError, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions},
    errors::Error,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use symphonia::default::{get_codecs, get_probe};

/// Header information of a stream's backing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub total_frames: u64,
}

/// Blocking frame source used by the stream loader.
pub trait StreamReader: Send {
    fn format(&self) -> StreamFormat;

    /// Frame index the next `read` starts at.
    fn position(&self) -> u64;

    /// Fill `out` with interleaved frames. Returns frames read; 0 means end of data.
    fn read(&mut self, out: &mut [f32]) -> Result<usize>;

    fn seek(&mut self, frame: u64) -> Result<()>;
}

/// Check the 12-byte RIFF/WAVE preamble.
pub fn validate_wav_magic(header: &[u8]) -> Result<()> {
    if header.len() < 12 || &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        return Err(CitySonicError::AudioFormat(
            "missing RIFF/WAVE header".to_string(),
        ));
    }
    Ok(())
}

/// Streams a WAV file from disk through symphonia.
pub struct WavStreamReader {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    format: StreamFormat,
    pending: Vec<f32>,
    pending_pos: usize,
    /// Frames to drop after a seek landed before the requested frame.
    skip_frames: u64,
    position: u64,
    scratch: Option<SampleBuffer<f32>>,
}

impl WavStreamReader {
    /// Open `path`, validate its RIFF/WAVE magic and parse the header.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be opened, `AudioFormat` if the magic is wrong or the
    /// header lacks the sample rate, channel count or length, `AudioLoading` if
    /// symphonia rejects the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let mut magic = [0u8; 12];
        file.read_exact(&mut magic)?;
        validate_wav_magic(&magic)?;
        file.seek(SeekFrom::Start(0))?;

        let mut hint = Hint::new();
        hint.with_extension("wav");
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| {
                CitySonicError::AudioLoading(format!("Failed to probe {}: {:?}", path.display(), e))
            })?;
        let format_reader = probed.format;

        let track = format_reader
            .default_track()
            .ok_or_else(|| CitySonicError::AudioLoading("No default audio track found".into()))?;
        let params = &track.codec_params;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| CitySonicError::AudioFormat("Sample rate not found".into()))?;
        let channels = params
            .channels
            .ok_or_else(|| CitySonicError::AudioFormat("Channel count not found".into()))?
            .count() as u16;
        let total_frames = params
            .n_frames
            .ok_or_else(|| CitySonicError::AudioFormat("Stream length not found".into()))?;
        let bits_per_sample = params.bits_per_sample.unwrap_or(16) as u16;
        let track_id = track.id;

        let decoder = get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| {
                CitySonicError::AudioLoading(format!("Failed to create decoder: {:?}", e))
            })?;

        log::debug!(
            "Opened stream {} ({} Hz, {} ch, {} bit, {} frames)",
            path.display(),
            sample_rate,
            channels,
            bits_per_sample,
            total_frames
        );
        Ok(Self {
            format_reader,
            decoder,
            track_id,
            format: StreamFormat {
                sample_rate,
                channels,
                bits_per_sample,
                total_frames,
            },
            pending: Vec::new(),
            pending_pos: 0,
            skip_frames: 0,
            position: 0,
            scratch: None,
        })
    }

    /// Decode the next packet into `pending`. Returns false at end of data.
    fn decode_next(&mut self) -> Result<bool> {
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok(packet) => packet,
                Err(Error::IoError(_)) => return Ok(false),
                Err(e) => {
                    return Err(CitySonicError::AudioLoading(format!(
                        "Error reading packet: {:?}",
                        e
                    )));
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(Error::DecodeError(e)) => {
                    log::warn!("Skipping corrupt stream packet: {}", e);
                    continue;
                }
                Err(e) => {
                    return Err(CitySonicError::AudioLoading(format!(
                        "Error decoding packet: {:?}",
                        e
                    )));
                }
            };
            let spec = *decoded.spec();
            let capacity = decoded.capacity();
            let buf = self
                .scratch
                .get_or_insert_with(|| SampleBuffer::<f32>::new(capacity as u64, spec));
            if buf.capacity() < capacity * spec.channels.count() {
                *buf = SampleBuffer::<f32>::new(capacity as u64, spec);
            }
            buf.copy_interleaved_ref(decoded);
            self.pending.clear();
            self.pending.extend_from_slice(buf.samples());

            let channels = spec.channels.count().max(1);
            let skip = (self.skip_frames as usize).min(self.pending.len() / channels);
            self.skip_frames -= skip as u64;
            self.pending_pos = skip * channels;
            return Ok(true);
        }
    }
}

impl StreamReader for WavStreamReader {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        let channels = self.format.channels.max(1) as usize;
        let wanted = out.len() / channels * channels;
        let mut written = 0;
        while written < wanted {
            if self.pending_pos >= self.pending.len() && !self.decode_next()? {
                break;
            }
            let take = (self.pending.len() - self.pending_pos).min(wanted - written);
            out[written..written + take]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
            self.pending_pos += take;
            written += take;
        }
        let frames = written / channels;
        self.position += frames as u64;
        Ok(frames)
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        let seeked = self
            .format_reader
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: frame,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| CitySonicError::AudioLoading(format!("Seek failed: {:?}", e)))?;
        self.decoder.reset();
        self.pending.clear();
        self.pending_pos = 0;
        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
        self.position = frame;
        Ok(())
    }
}

/// Streams an in-memory clip. Useful for procedurally generated ambience and tests.
#[derive(Debug, Clone)]
pub struct MemoryStreamReader {
    clip: CitySonicAudioData,
    position: u64,
}

impl MemoryStreamReader {
    pub fn new(clip: CitySonicAudioData) -> Self {
        Self { clip, position: 0 }
    }
}

impl StreamReader for MemoryStreamReader {
    fn format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.clip.sample_rate(),
            channels: self.clip.channels(),
            bits_per_sample: 32,
            total_frames: self.clip.total_frames() as u64,
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        let channels = self.clip.channels().max(1) as usize;
        let total = self.clip.total_frames() as u64;
        let start = self.position.min(total) as usize;
        let frames = (out.len() / channels).min(total as usize - start);
        out[..frames * channels]
            .copy_from_slice(&self.clip.samples()[start * channels..(start + frames) * channels]);
        self.position += frames as u64;
        Ok(frames)
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        self.position = frame.min(self.clip.total_frames() as u64);
        Ok(())
    }
}
