//! Per-session voice status driving server-side turn taking.
//!
//! ```text
//! [Idle] ── voiced window ──► [Voice] (SpeechOnset)
//!                               │
//!                               └── silence >= threshold ──► [Stopped] (SpeechOffset)
//! ```
//!
//! Silence is accumulated from window durations rather than wall clock so the
//! tracker behaves identically under load and in tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEvent {
    /// First voiced window of the turn.
    SpeechOnset,
    /// Silence exceeded the threshold after voice was observed.
    SpeechOffset,
}

pub struct VoiceStatus {
    silence_threshold_ms: AtomicU64,
    have_voice: AtomicBool,
    voice_stop: AtomicBool,
    silence_ms: AtomicU64,
    last_voice_ts: parking_lot::RwLock<Option<Instant>>,
}

impl VoiceStatus {
    pub fn new(silence_threshold_ms: u64) -> Self {
        Self {
            silence_threshold_ms: AtomicU64::new(silence_threshold_ms),
            have_voice: AtomicBool::new(false),
            voice_stop: AtomicBool::new(false),
            silence_ms: AtomicU64::new(0),
            last_voice_ts: parking_lot::RwLock::new(None),
        }
    }

    /// Feed one classified window of `window_ms` duration.
    pub fn process(&self, is_speech: bool, window_ms: u64) -> Option<VoiceEvent> {
        if self.voice_stop.load(Ordering::Acquire) {
            return None;
        }

        if is_speech {
            self.silence_ms.store(0, Ordering::Release);
            *self.last_voice_ts.write() = Some(Instant::now());
            if !self.have_voice.swap(true, Ordering::AcqRel) {
                debug!("Speech onset");
                return Some(VoiceEvent::SpeechOnset);
            }
            return None;
        }

        if !self.have_voice.load(Ordering::Acquire) {
            return None;
        }

        let silence = self.silence_ms.fetch_add(window_ms, Ordering::AcqRel) + window_ms;
        if silence >= self.silence_threshold_ms.load(Ordering::Acquire)
            && !self.voice_stop.swap(true, Ordering::AcqRel)
        {
            debug!(silence_ms = silence, "Speech offset");
            return Some(VoiceEvent::SpeechOffset);
        }
        None
    }

    pub fn have_voice(&self) -> bool {
        self.have_voice.load(Ordering::Acquire)
    }

    /// Manual mode marks the turn as voiced up front.
    pub fn set_have_voice(&self, value: bool) {
        self.have_voice.store(value, Ordering::Release);
    }

    pub fn voice_stop(&self) -> bool {
        self.voice_stop.load(Ordering::Acquire)
    }

    pub fn set_voice_stop(&self, value: bool) {
        self.voice_stop.store(value, Ordering::Release);
    }

    pub fn last_voice_ts(&self) -> Option<Instant> {
        *self.last_voice_ts.read()
    }

    pub fn silence_threshold_ms(&self) -> u64 {
        self.silence_threshold_ms.load(Ordering::Acquire)
    }

    pub fn set_silence_threshold_ms(&self, value: u64) {
        self.silence_threshold_ms.store(value, Ordering::Release);
    }

    pub fn reset(&self) {
        self.have_voice.store(false, Ordering::Release);
        self.voice_stop.store(false, Ordering::Release);
        self.silence_ms.store(0, Ordering::Release);
        *self.last_voice_ts.write() = None;
    }
}
