//! Per-session state shared by the session's tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::asr::AsrProvider;
use crate::core::codec::AudioFormat;
use crate::core::device_config::DeviceConfig;
use crate::core::llm::LlmProvider;
use crate::core::pool::Pooled;
use crate::core::tts::TtsProvider;
use crate::core::vad::{VadFactory, VadPool, VoiceStatus};

use super::messages::ListenMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Listening,
    ListenStopped,
    LlmRunning,
    TtsRunning,
}

impl SessionStatus {
    /// A reply is being produced or played.
    pub fn is_speaking(self) -> bool {
        matches!(self, SessionStatus::LlmRunning | SessionStatus::TtsRunning)
    }
}

/// Mono PCM accumulated from decoded Opus frames, handed out in fixed windows.
#[derive(Default)]
pub struct PcmRing {
    samples: Mutex<Vec<f32>>,
    frame_size: AtomicUsize,
}

impl PcmRing {
    pub fn set_frame_size(&self, frame_size: usize) {
        self.frame_size.store(frame_size, Ordering::Release);
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size.load(Ordering::Acquire)
    }

    pub fn push(&self, pcm: &[f32]) {
        self.samples.lock().extend_from_slice(pcm);
    }

    /// Next full window, if one is buffered.
    pub fn pop_frame(&self) -> Option<Vec<f32>> {
        let size = self.frame_size();
        if size == 0 {
            return None;
        }
        let mut samples = self.samples.lock();
        if samples.len() < size {
            return None;
        }
        Some(samples.drain(..size).collect())
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}

/// Provider handles built at `hello`.
#[derive(Clone)]
pub struct Providers {
    pub asr: Arc<dyn AsrProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
}

pub struct ClientState {
    pub device_id: String,
    pub device_config: DeviceConfig,
    session_id: RwLock<String>,
    status: RwLock<SessionStatus>,
    listen_mode: RwLock<ListenMode>,
    input_format: RwLock<AudioFormat>,
    output_format: RwLock<AudioFormat>,
    pub voice: VoiceStatus,
    pub pcm: PcmRing,
    providers: RwLock<Option<Providers>>,
    vad: tokio::sync::Mutex<Option<Pooled<VadFactory>>>,
    asr_audio: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    root: CancellationToken,
    turn: Mutex<Option<CancellationToken>>,
    tts_started: AtomicBool,
    greeting_in_flight: AtomicBool,
}

impl ClientState {
    pub fn new(
        device_id: impl Into<String>,
        device_config: DeviceConfig,
        silence_threshold_ms: u64,
        root: CancellationToken,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_config,
            session_id: RwLock::new(String::new()),
            status: RwLock::new(SessionStatus::Idle),
            listen_mode: RwLock::new(ListenMode::Auto),
            input_format: RwLock::new(AudioFormat::default()),
            output_format: RwLock::new(AudioFormat::default()),
            voice: VoiceStatus::new(silence_threshold_ms),
            pcm: PcmRing::default(),
            providers: RwLock::new(None),
            vad: tokio::sync::Mutex::new(None),
            asr_audio: Mutex::new(None),
            root,
            turn: Mutex::new(None),
            tts_started: AtomicBool::new(false),
            greeting_in_flight: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> String {
        self.session_id.read().clone()
    }

    pub fn set_session_id(&self, session_id: impl Into<String>) {
        *self.session_id.write() = session_id.into();
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: SessionStatus) {
        let previous = std::mem::replace(&mut *self.status.write(), status);
        if previous != status {
            debug!(device_id = %self.device_id, from = ?previous, to = ?status, "Session status");
        }
    }

    pub fn listen_mode(&self) -> ListenMode {
        *self.listen_mode.read()
    }

    pub fn set_listen_mode(&self, mode: ListenMode) {
        *self.listen_mode.write() = mode;
    }

    pub fn input_format(&self) -> AudioFormat {
        *self.input_format.read()
    }

    /// Also resizes the PCM window to one input frame.
    pub fn set_input_format(&self, format: AudioFormat) {
        *self.input_format.write() = format;
        self.pcm.set_frame_size(format.frame_samples());
    }

    pub fn output_format(&self) -> AudioFormat {
        *self.output_format.read()
    }

    pub fn set_output_format(&self, format: AudioFormat) {
        *self.output_format.write() = format;
    }

    pub fn providers(&self) -> Option<Providers> {
        self.providers.read().clone()
    }

    pub fn set_providers(&self, providers: Providers) {
        *self.providers.write() = Some(providers);
    }

    pub fn vad(&self) -> &tokio::sync::Mutex<Option<Pooled<VadFactory>>> {
        &self.vad
    }

    /// Borrow a detector for this session. Exhaustion leaves the session
    /// without VAD gating.
    pub async fn acquire_vad(&self, pool: &Arc<VadPool>) -> bool {
        let acquired = pool.acquire(pool.acquire_timeout()).await;
        match acquired {
            Ok(detector) => {
                *self.vad.lock().await = Some(detector);
                true
            }
            Err(e) => {
                warn!(device_id = %self.device_id, "VAD unavailable, falling back to manual turn taking: {}", e);
                false
            }
        }
    }

    pub async fn release_vad(&self) {
        self.vad.lock().await.take();
    }

    /// Install the sender feeding the current recognizer.
    pub fn set_asr_audio(&self, sender: Option<mpsc::Sender<Vec<f32>>>) {
        *self.asr_audio.lock() = sender;
    }

    /// Forward one PCM window to the recognizer; dropped when none is open or it is backed up.
    pub fn feed_asr(&self, pcm: Vec<f32>) -> bool {
        let sender = self.asr_audio.lock().clone();
        match sender {
            Some(sender) => sender.try_send(pcm).is_ok(),
            None => false,
        }
    }

    /// Closing the recognizer input makes it flush its final result.
    pub fn stop_asr(&self) {
        self.asr_audio.lock().take();
    }

    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    /// Current turn scope, created on demand as a child of the session root.
    pub fn turn(&self) -> CancellationToken {
        let mut turn = self.turn.lock();
        match turn.as_ref() {
            Some(token) if !token.is_cancelled() => token.clone(),
            _ => {
                let token = self.root.child_token();
                *turn = Some(token.clone());
                token
            }
        }
    }

    /// Cancel the current turn. The next call to [`turn`](Self::turn) opens a new one.
    pub fn cancel_turn(&self) -> bool {
        match self.turn.lock().take() {
            Some(token) => {
                let was_live = !token.is_cancelled();
                token.cancel();
                was_live
            }
            None => false,
        }
    }

    pub fn has_live_turn(&self) -> bool {
        self.turn.lock().as_ref().is_some_and(|t| !t.is_cancelled())
    }

    pub fn tts_started(&self) -> bool {
        self.tts_started.load(Ordering::Acquire)
    }

    pub fn set_tts_started(&self, value: bool) {
        self.tts_started.store(value, Ordering::Release);
    }

    /// Claim the single greeting slot. Returns false when one is already playing.
    pub fn begin_greeting(&self) -> bool {
        !self.greeting_in_flight.swap(true, Ordering::AcqRel)
    }

    pub fn end_greeting(&self) {
        self.greeting_in_flight.store(false, Ordering::Release);
    }

    /// Reset per-turn audio state before a new listen phase.
    pub async fn reset_for_listen(&self) {
        self.stop_asr();
        if let Some(detector) = self.vad.lock().await.as_mut() {
            detector.reset();
        }
        self.voice.reset();
        self.pcm.clear();
        self.set_tts_started(false);
    }

    /// End of user speech: stop feeding the recognizer so it finalizes.
    pub fn on_voice_silence(&self) {
        self.voice.set_voice_stop(true);
        self.stop_asr();
        self.set_status(SessionStatus::ListenStopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ClientState {
        ClientState::new("dev", DeviceConfig::default(), 200, CancellationToken::new())
    }

    #[test]
    fn test_pcm_ring_windows() {
        let ring = PcmRing::default();
        ring.set_frame_size(4);
        ring.push(&[0.1; 6]);
        assert_eq!(ring.pop_frame().map(|f| f.len()), Some(4));
        assert!(ring.pop_frame().is_none());
        ring.push(&[0.2; 2]);
        assert_eq!(ring.pop_frame().map(|f| f.len()), Some(4));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_input_format_sets_frame_size() {
        let state = state();
        state.set_input_format(AudioFormat::opus(16000, 1, 60));
        assert_eq!(state.pcm.frame_size(), 960);
    }

    #[test]
    fn test_single_live_turn() {
        let state = state();
        let first = state.turn();
        assert_eq!(state.turn().is_cancelled(), first.is_cancelled());

        assert!(state.cancel_turn());
        assert!(first.is_cancelled());
        assert!(!state.has_live_turn());
        assert!(!state.cancel_turn());

        let second = state.turn();
        assert!(!second.is_cancelled());
        assert!(state.has_live_turn());
    }

    #[test]
    fn test_root_cancels_turn() {
        let state = state();
        let turn = state.turn();
        state.root().cancel();
        assert!(turn.is_cancelled());
    }

    #[test]
    fn test_greeting_slot() {
        let state = state();
        assert!(state.begin_greeting());
        assert!(!state.begin_greeting());
        state.end_greeting();
        assert!(state.begin_greeting());
    }

    #[tokio::test]
    async fn test_feed_asr_and_silence() {
        let state = state();
        assert!(!state.feed_asr(vec![0.0; 4]));

        let (tx, mut rx) = mpsc::channel(2);
        state.set_asr_audio(Some(tx));
        assert!(state.feed_asr(vec![0.0; 4]));
        assert_eq!(rx.recv().await.map(|f| f.len()), Some(4));

        state.on_voice_silence();
        assert_eq!(state.status(), SessionStatus::ListenStopped);
        assert!(state.voice.voice_stop());
        assert_eq!(rx.recv().await, None);
    }
}
