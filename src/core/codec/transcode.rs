//! Turn TTS backend payloads (WAV or MP3) into device-ready Opus frames.

use std::io::Cursor;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{AudioFormat, CodecError, OpusEncoder};

/// Container of an audio payload returned by a synthesis backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioContainer {
    #[default]
    Wav,
    Mp3,
}

/// Interleaved float PCM with its native rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmAudio {
    /// Downmix to mono and linearly resample to `target_rate`.
    pub fn to_mono(&self, target_rate: u32) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        let mono: Vec<f32> = self
            .samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();
        resample_linear(&mono, self.sample_rate, target_rate)
    }
}

pub fn decode_container(data: &[u8], container: AudioContainer) -> Result<PcmAudio, CodecError> {
    match container {
        AudioContainer::Wav => decode_wav(data),
        AudioContainer::Mp3 => decode_with_probe(data, "mp3"),
    }
}

fn decode_wav(data: &[u8]) -> Result<PcmAudio, CodecError> {
    let mut reader = hound::WavReader::new(Cursor::new(data))
        .map_err(|e| CodecError::Decode(format!("invalid WAV: {e}")))?;
    let spec = reader.spec();

    let samples = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map(|v| v as f32 / max)
                        .map_err(|e| CodecError::Decode(format!("WAV read error: {e}")))
                })
                .collect::<Result<Vec<f32>, _>>()?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map_err(|e| CodecError::Decode(format!("WAV read error: {e}"))))
            .collect::<Result<Vec<f32>, _>>()?,
    };

    Ok(PcmAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

fn decode_with_probe(data: &[u8], extension: &str) -> Result<PcmAudio, CodecError> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let mss = MediaSourceStream::new(Box::new(Cursor::new(data.to_vec())), Default::default());
    let mut hint = Hint::new();
    hint.with_extension(extension);

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| CodecError::Decode(format!("failed to probe audio: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| CodecError::Decode("no default audio track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| CodecError::Decode(format!("failed to create decoder: {e}")))?;

    let mut samples = Vec::new();
    let mut sample_rate = codec_params.sample_rate.unwrap_or(0);
    let mut channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(1);

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CodecError::Decode(format!("audio read error: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphError::DecodeError(_)) => continue,
            Err(e) => return Err(CodecError::Decode(format!("audio decode error: {e}"))),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count() as u16;

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    if sample_rate == 0 {
        return Err(CodecError::Decode("unknown sample rate".into()));
    }

    Ok(PcmAudio {
        samples,
        sample_rate,
        channels,
    })
}

pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() || from_rate == 0 {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).round() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = input[idx.min(input.len() - 1)];
            let b = input[(idx + 1).min(input.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

/// Encode PCM at `format`'s rate into Opus frames of `format.frame_duration`.
/// The trailing partial frame is zero padded.
pub fn encode_opus_frames(pcm: &[f32], format: AudioFormat) -> Result<Vec<Bytes>, CodecError> {
    let mut encoder = OpusEncoder::new(format)?;
    pcm.chunks(format.frame_samples())
        .map(|chunk| encoder.encode(chunk).map(Bytes::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in samples {
                writer.write_sample(*s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_wav() {
        let data = wav_bytes(&[0, 16384, -16384, 0], 16000, 1);
        let pcm = decode_container(&data, AudioContainer::Wav).unwrap();
        assert_eq!(pcm.sample_rate, 16000);
        assert_eq!(pcm.channels, 1);
        assert_eq!(pcm.samples.len(), 4);
        assert!((pcm.samples[1] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_to_mono_downmixes_stereo() {
        let pcm = PcmAudio {
            samples: vec![1.0, 0.0, 0.5, 0.5],
            sample_rate: 16000,
            channels: 2,
        };
        assert_eq!(pcm.to_mono(16000), vec![0.5, 0.5]);
    }

    #[test]
    fn test_resample_changes_length() {
        let input = vec![0.0; 16000];
        assert_eq!(resample_linear(&input, 16000, 24000).len(), 24000);
        assert_eq!(resample_linear(&input, 16000, 8000).len(), 8000);
        assert_eq!(resample_linear(&input, 16000, 16000).len(), 16000);
    }

    #[test]
    fn test_encode_opus_frames_counts_partial_frame() {
        let format = AudioFormat::opus(16000, 1, 60);
        let pcm = vec![0.0; format.frame_samples() * 2 + 10];
        let frames = encode_opus_frames(&pcm, format).unwrap();
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn test_invalid_wav_is_error() {
        assert!(matches!(
            decode_container(b"not a wav", AudioContainer::Wav),
            Err(CodecError::Decode(_))
        ));
    }
}
