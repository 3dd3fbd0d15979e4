use ::opus::{Application, Channels};

use super::{AudioFormat, CodecError};

/// Upper bound for a single Opus packet produced by the encoder.
const MAX_PACKET_BYTES: usize = 4000;

/// Longest frame Opus can carry (120 ms); sizes the decode scratch buffer.
const MAX_FRAME_MS: u32 = 120;

fn channels(count: u16) -> Result<Channels, CodecError> {
    match count {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        other => Err(CodecError::UnsupportedFormat(format!(
            "{other} channels (Opus supports 1 or 2)"
        ))),
    }
}

/// Stateful Opus decoder producing interleaved f32 PCM.
pub struct OpusDecoder {
    inner: ::opus::Decoder,
    format: AudioFormat,
    scratch: Vec<f32>,
}

impl OpusDecoder {
    pub fn new(format: AudioFormat) -> Result<Self, CodecError> {
        let inner = ::opus::Decoder::new(format.sample_rate, channels(format.channels)?)
            .map_err(|e| CodecError::Opus(e.to_string()))?;
        let scratch_len = super::frame_samples(format.sample_rate, format.channels, MAX_FRAME_MS);

        Ok(Self {
            inner,
            format,
            scratch: vec![0.0; scratch_len],
        })
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Decode one packet. The returned length is `samples_per_channel * channels`
    /// regardless of the packet's byte size.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>, CodecError> {
        let per_channel = self
            .inner
            .decode_float(packet, &mut self.scratch, false)
            .map_err(|e| CodecError::Opus(e.to_string()))?;
        let total = per_channel * self.format.channels as usize;
        Ok(self.scratch[..total].to_vec())
    }
}

/// Opus encoder tuned for speech output.
pub struct OpusEncoder {
    inner: ::opus::Encoder,
    format: AudioFormat,
}

impl OpusEncoder {
    pub fn new(format: AudioFormat) -> Result<Self, CodecError> {
        let inner = ::opus::Encoder::new(
            format.sample_rate,
            channels(format.channels)?,
            Application::Voip,
        )
        .map_err(|e| CodecError::Opus(e.to_string()))?;
        Ok(Self { inner, format })
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Encode exactly one frame. Short input is zero padded to the frame size.
    pub fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>, CodecError> {
        let frame = self.format.frame_samples();
        if pcm.len() > frame {
            return Err(CodecError::UnsupportedFormat(format!(
                "frame holds {frame} samples, got {}",
                pcm.len()
            )));
        }

        if pcm.len() == frame {
            return self
                .inner
                .encode_vec_float(pcm, MAX_PACKET_BYTES)
                .map_err(|e| CodecError::Opus(e.to_string()));
        }

        let mut padded = pcm.to_vec();
        padded.resize(frame, 0.0);
        self.inner
            .encode_vec_float(&padded, MAX_PACKET_BYTES)
            .map_err(|e| CodecError::Opus(e.to_string()))
    }
}
