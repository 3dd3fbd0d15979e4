//! Audio codec and framing utilities.
//!
//! - `opus`: frame-level Opus encode/decode for the device audio path
//! - `transcode`: WAV/MP3 payloads from TTS backends into Opus frames
//! - `packet`: AES-CTR framing for the UDP audio channel

pub mod opus;
pub mod packet;
pub mod transcode;

use serde::{Deserialize, Serialize};

pub use self::opus::{OpusDecoder, OpusEncoder};
pub use packet::{NONCE_LEN, UdpCipher};
pub use transcode::{AudioContainer, PcmAudio, decode_container, encode_opus_frames};

/// Codec level failures. Framing errors are always recoverable: the offending
/// frame or datagram is discarded and the stream continues.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("Opus error: {0}")]
    Opus(String),
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),
    #[error("Packet length mismatch: header says {declared}, payload is {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Packet nonce does not belong to this session")]
    NonceMismatch,
}

/// Audio parameters exchanged in `hello`.
///
/// Field names follow the device wire format (`frame_duration` is in ms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    #[serde(default = "default_codec")]
    pub format: AudioCodec,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_frame_duration")]
    pub frame_duration: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Opus,
    Pcm,
}

fn default_codec() -> AudioCodec {
    AudioCodec::Opus
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_channels() -> u16 {
    1
}

fn default_frame_duration() -> u32 {
    60
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::opus(16000, 1, 60)
    }
}

impl AudioFormat {
    pub const fn opus(sample_rate: u32, channels: u16, frame_duration: u32) -> Self {
        Self {
            format: AudioCodec::Opus,
            sample_rate,
            channels,
            frame_duration,
        }
    }

    /// Samples (all channels interleaved) carried by one frame.
    pub fn frame_samples(&self) -> usize {
        frame_samples(self.sample_rate, self.channels, self.frame_duration)
    }
}

/// `sample_rate * channels * frame_ms / 1000`
pub fn frame_samples(sample_rate: u32, channels: u16, frame_ms: u32) -> usize {
    (sample_rate as usize * channels as usize * frame_ms as usize) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_samples() {
        assert_eq!(frame_samples(16000, 1, 60), 960);
        assert_eq!(frame_samples(24000, 1, 20), 480);
        assert_eq!(frame_samples(48000, 2, 20), 1920);
        assert_eq!(AudioFormat::default().frame_samples(), 960);
    }

    #[test]
    fn test_audio_format_wire_defaults() {
        let parsed: AudioFormat = serde_json::from_str(r#"{"sample_rate":24000}"#).unwrap();
        assert_eq!(parsed, AudioFormat::opus(24000, 1, 60));

        let json = serde_json::to_value(AudioFormat::opus(16000, 1, 60)).unwrap();
        assert_eq!(json["format"], "opus");
        assert_eq!(json["frame_duration"], 60);
    }
}
