use crate::{
    audio_data::CitySonicAudioData,
    error::{CitySonicError, Result},
};
use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use symphonia::{
    core::{
        audio::SampleBuffer,
        codecs::DecoderOptions,
        errors::Error,
        formats::FormatOptions,
        io::{MediaSource, MediaSourceStream},
        meta::MetadataOptions,
        probe::Hint,
    },
    default::{get_codecs, get_probe},
};

/// How multi-channel input is reduced while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Downmix {
    /// Keep every channel.
    #[default]
    Keep,
    /// Average all channels into one.
    Average,
    /// Keep a single channel.
    Channel(usize),
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Target sample rate for resampling (None = keep original)
    pub target_sample_rate: Option<u32>,
    pub downmix: Downmix,
    /// Maximum duration to decode (None = whole file)
    pub max_duration: Option<Duration>,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_sample_rate(mut self, rate: u32) -> Self {
        self.target_sample_rate = Some(rate);
        self
    }

    pub fn downmix(mut self, downmix: Downmix) -> Self {
        self.downmix = downmix;
        self
    }

    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }
}

/// Decode a whole file into memory.
pub fn load_audio_file(path: impl AsRef<Path>, options: &LoadOptions) -> Result<CitySonicAudioData> {
    let path = path.as_ref();
    let file = File::open(path)?;

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    log::debug!("Decoding {}", path.display());
    decode(Box::new(file), hint, options)
}

/// Decode an encoded file image already held in memory.
///
/// `extension` is an optional format hint such as `"wav"`.
pub fn load_audio_bytes(
    bytes: Vec<u8>,
    extension: Option<&str>,
    options: &LoadOptions,
) -> Result<CitySonicAudioData> {
    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }
    decode(Box::new(Cursor::new(bytes)), hint, options)
}

fn decode(
    source: Box<dyn MediaSource>,
    hint: Hint,
    options: &LoadOptions,
) -> Result<CitySonicAudioData> {
    let mss = MediaSourceStream::new(source, Default::default());

    let probed = get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| {
            CitySonicError::AudioLoading(format!("Failed to probe audio format: {:?}", e))
        })?;

    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| CitySonicError::AudioLoading("No default audio track found".to_string()))?;
    let track_id = track.id;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| CitySonicError::AudioLoading("Sample rate not found".to_string()))?;

    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| CitySonicError::AudioLoading("Channel count not found".to_string()))?
        .count();

    if let Downmix::Channel(ch) = options.downmix {
        if ch >= channels {
            return Err(CitySonicError::AudioFormat(format!(
                "Channel {} out of range (max: {})",
                ch,
                channels - 1
            )));
        }
    }

    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| CitySonicError::AudioLoading(format!("Failed to create decoder: {:?}", e)))?;

    let max_frames = options
        .max_duration
        .map(|d| (d.as_secs_f64() * sample_rate as f64) as usize)
        .unwrap_or(usize::MAX);

    let out_channels = match options.downmix {
        Downmix::Keep => channels,
        Downmix::Average | Downmix::Channel(_) => 1,
    };
    let mut samples: Vec<f32> = Vec::new();
    let mut frames_decoded = 0;
    let mut scratch: Option<SampleBuffer<f32>> = None;

    while frames_decoded < max_frames {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(Error::IoError(_)) => break, // end of stream
            Err(e) => {
                return Err(CitySonicError::AudioLoading(format!(
                    "Error reading packet: {:?}",
                    e
                )));
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(Error::IoError(_)) => break,
            Err(Error::DecodeError(e)) => {
                log::warn!("Skipping corrupt packet: {}", e);
                continue;
            }
            Err(e) => {
                return Err(CitySonicError::AudioLoading(format!(
                    "Error decoding packet: {:?}",
                    e
                )));
            }
        };

        let buf = scratch.get_or_insert_with(|| {
            SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec())
        });
        if buf.capacity() < decoded.capacity() * channels {
            *buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        }
        buf.copy_interleaved_ref(decoded);

        let frames = buf.samples().chunks_exact(channels);
        let take = frames.len().min(max_frames - frames_decoded);
        match options.downmix {
            Downmix::Keep => samples.extend_from_slice(&buf.samples()[..take * channels]),
            Downmix::Average => samples.extend(
                frames
                    .take(take)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            ),
            Downmix::Channel(ch) => samples.extend(frames.take(take).map(|frame| frame[ch])),
        }
        frames_decoded += take;
    }

    let mut clip = CitySonicAudioData::new(samples, sample_rate, out_channels as u16);
    if let Some(target_rate) = options.target_sample_rate {
        clip = clip.resample(target_rate)?;
    }

    log::debug!(
        "Decoded {} frames at {} Hz ({} channels)",
        clip.total_frames(),
        clip.sample_rate(),
        clip.channels()
    );
    Ok(clip)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal 16-bit PCM WAV image.
    pub(crate) fn wav_bytes(channels: u16, sample_rate: u32, samples: &[i16]) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let block_align = channels * 2;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_load_wav_bytes_stereo() {
        let bytes = wav_bytes(2, 22050, &[16384, -16384, 0, 8192]);
        let clip = load_audio_bytes(bytes, Some("wav"), &LoadOptions::default()).unwrap();
        assert_eq!(clip.channels(), 2);
        assert_eq!(clip.sample_rate(), 22050);
        assert_eq!(clip.total_frames(), 2);
        assert!((clip.samples()[0] - 0.5).abs() < 1e-3);
        assert!((clip.samples()[1] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_load_wav_average_downmix() {
        let bytes = wav_bytes(2, 48000, &[16384, 0, 8192, 8192]);
        let options = LoadOptions::new().downmix(Downmix::Average);
        let clip = load_audio_bytes(bytes, Some("wav"), &options).unwrap();
        assert_eq!(clip.channels(), 1);
        assert!((clip.samples()[0] - 0.25).abs() < 1e-3);
        assert!((clip.samples()[1] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_load_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        std::fs::write(&path, wav_bytes(1, 48000, &[0; 480])).unwrap();
        let clip = load_audio_file(&path, &LoadOptions::default()).unwrap();
        assert_eq!(clip.total_frames(), 480);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_audio_file("/definitely/not/here.wav", &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, CitySonicError::Io(_)));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = load_audio_bytes(vec![0u8; 64], None, &LoadOptions::default()).unwrap_err();
        assert!(err.is_io_failure());
    }

    #[test]
    fn test_channel_out_of_range() {
        let bytes = wav_bytes(1, 48000, &[0; 8]);
        let options = LoadOptions::new().downmix(Downmix::Channel(3));
        assert!(load_audio_bytes(bytes, Some("wav"), &options).is_err());
    }
}
