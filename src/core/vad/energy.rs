use serde::Deserialize;

use super::{VadError, VoiceDetector};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnergyVadConfig {
    /// RMS level (full scale = 1.0) above which a window counts as voiced.
    pub threshold: f32,
    /// Consecutive voiced windows required before reporting speech.
    pub min_speech_frames: u32,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.015,
            min_speech_frames: 2,
        }
    }
}

/// RMS energy gate with a short onset debounce.
#[derive(Debug)]
pub struct EnergyVad {
    config: EnergyVadConfig,
    voiced_run: u32,
}

impl EnergyVad {
    pub fn new(config: EnergyVadConfig) -> Result<Self, VadError> {
        if !(0.0..1.0).contains(&config.threshold) {
            return Err(VadError::Configuration(format!(
                "threshold must be in [0, 1), got {}",
                config.threshold
            )));
        }
        Ok(Self {
            config,
            voiced_run: 0,
        })
    }

    pub fn rms(pcm: &[f32]) -> f32 {
        if pcm.is_empty() {
            return 0.0;
        }
        (pcm.iter().map(|s| s * s).sum::<f32>() / pcm.len() as f32).sqrt()
    }
}

impl VoiceDetector for EnergyVad {
    fn is_speech(&mut self, pcm: &[f32], sample_rate: u32) -> Result<bool, VadError> {
        if sample_rate == 0 {
            return Err(VadError::UnsupportedSampleRate(sample_rate));
        }
        if Self::rms(pcm) >= self.config.threshold {
            self.voiced_run = self.voiced_run.saturating_add(1);
        } else {
            self.voiced_run = 0;
        }
        Ok(self.voiced_run >= self.config.min_speech_frames.max(1))
    }

    fn reset(&mut self) {
        self.voiced_run = 0;
    }
}
