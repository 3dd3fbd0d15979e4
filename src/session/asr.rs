//! Audio intake: decoding, VAD gating and the per-turn recognizer loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::asr::AsrStream;
use crate::core::codec::AudioCodec;
use crate::core::tts::pcm_i16_le_to_f32;
use crate::core::vad::VoiceEvent;
use crate::transport::TransportError;

use super::chat::ChatSession;
use super::client_state::{ClientState, SessionStatus};
use super::messages::ListenMode;
use super::registry::ManagedSession;
use super::{SessionError, spawn_guarded};

pub const AUDIO_RECV_TIMEOUT: Duration = Duration::from_millis(300);
pub const ASR_AUDIO_QUEUE: usize = 100;

/// Opens recognizers and collects their transcripts.
pub struct AsrManager {
    state: Arc<ClientState>,
}

impl AsrManager {
    pub fn new(state: Arc<ClientState>) -> Self {
        Self { state }
    }

    /// Open a fresh recognizer scoped to `turn` and route session PCM into it.
    /// Any previous recognizer input is closed first.
    pub async fn restart(&self, turn: &CancellationToken) -> Result<AsrStream, SessionError> {
        let providers = self.state.providers().ok_or(SessionError::NotReady)?;
        self.state.stop_asr();
        let (audio_tx, audio_rx) = mpsc::channel(ASR_AUDIO_QUEUE);
        let stream = providers.asr.streaming_recognize(turn.child_token(), audio_rx).await?;
        self.state.set_asr_audio(Some(audio_tx));
        debug!(device_id = %self.state.device_id, provider = providers.asr.provider_name(), "Recognizer opened");
        Ok(stream)
    }

    /// Wait for the final transcript of one recognition. A stream that closes
    /// without a final result yields its last partial.
    pub async fn retire_result(&self, turn: &CancellationToken, stream: &mut AsrStream) -> Result<String, SessionError> {
        let started = Instant::now();
        let mut partial = String::new();
        loop {
            let next = tokio::select! {
                _ = turn.cancelled() => return Err(SessionError::Cancelled),
                next = stream.recv() => next,
            };
            match next {
                None => return Ok(partial),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(result)) if result.is_final => {
                    let text = if result.text.is_empty() { partial } else { result.text };
                    debug!(
                        device_id = %self.state.device_id,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "Recognition finished"
                    );
                    return Ok(text);
                }
                Some(Ok(result)) => {
                    if !result.text.is_empty() {
                        partial = result.text;
                    }
                }
            }
        }
    }
}

impl ChatSession {
    /// Enter the listening phase: reset per-turn audio state, open a
    /// recognizer and start collecting its transcript.
    pub(super) async fn on_listen_start(&self) -> Result<(), SessionError> {
        let root = self.state.root().clone();
        if root.is_cancelled() {
            return Ok(());
        }
        self.state.reset_for_listen().await;
        self.state.set_status(SessionStatus::Listening);
        let turn = self.state.turn();
        if self.state.listen_mode() == ListenMode::Manual {
            self.state.voice.set_have_voice(true);
        }

        let stream = match self.asr.restart(&turn).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(device_id = %self.state.device_id, "Failed to start recognition: {}", e);
                self.writer.close().await;
                return Err(e);
            }
        };
        if let Some(session) = self.me.upgrade() {
            spawn_guarded("asr", self.state.device_id.clone(), root, session.asr_turn(turn, stream));
        }
        Ok(())
    }

    /// Drive recognition for one turn. Empty results restart the recognizer
    /// while the device is still listening, until the idle ceiling closes the
    /// session.
    async fn asr_turn(self: Arc<Self>, turn: CancellationToken, mut stream: AsrStream) {
        let device_id = self.state.device_id.clone();
        let max_idle = Duration::from_secs(self.services.settings.chat.max_idle_secs);
        let started = Instant::now();

        loop {
            let text = match self.asr.retire_result(&turn, &mut stream).await {
                Ok(text) => text,
                Err(SessionError::Cancelled) => return,
                Err(e) => {
                    error!(device_id = %device_id, "Recognition failed: {}", e);
                    return;
                }
            };

            if !text.is_empty() {
                info!(device_id = %device_id, text = %text, "Recognized");
                self.state.on_voice_silence();
                if let Err(e) = self.writer.send_stt(&text).await {
                    error!(device_id = %device_id, "Failed to send stt: {}", e);
                    return;
                }
                if let Err(e) = self.push_chat_text(&text).await {
                    debug!(device_id = %device_id, "Utterance not queued: {}", e);
                }
                return;
            }

            if turn.is_cancelled()
                || !matches!(
                    self.state.status(),
                    SessionStatus::Listening | SessionStatus::ListenStopped
                )
            {
                return;
            }
            if started.elapsed() > max_idle {
                warn!(device_id = %device_id, idle_secs = max_idle.as_secs(), "No speech recognized, closing session");
                self.close().await;
                return;
            }

            debug!(device_id = %device_id, "Empty recognition, restarting");
            self.state.voice.reset();
            if self.state.listen_mode() == ListenMode::Manual {
                self.state.voice.set_have_voice(true);
            }
            self.state.set_status(SessionStatus::Listening);
            stream = match self.asr.restart(&turn).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(device_id = %device_id, "Failed to restart recognition: {}", e);
                    return;
                }
            };
        }
    }

    pub(super) async fn audio_loop(self: Arc<Self>) {
        let root = self.state.root().clone();
        loop {
            let received = tokio::select! {
                _ = root.cancelled() => break,
                received = self.transport().recv_audio(AUDIO_RECV_TIMEOUT) => received,
            };
            let frame = match received {
                Ok(frame) => frame,
                Err(TransportError::Timeout) => continue,
                Err(e) => {
                    debug!(device_id = %self.state.device_id, "Audio channel ended: {}", e);
                    break;
                }
            };
            if let Err(e) = self.handle_audio(&frame).await {
                warn!(device_id = %self.state.device_id, "Dropping audio frame: {}", e);
            }
        }
    }

    async fn handle_audio(&self, frame: &[u8]) -> Result<(), SessionError> {
        let input = self.state.input_format();
        let pcm = {
            let mut decoder = self.decoder.lock();
            match (decoder.as_mut(), input.format) {
                (Some(decoder), _) => decoder.decode(frame)?,
                (None, AudioCodec::Pcm) => pcm_i16_le_to_f32(frame),
                // Audio before hello.
                (None, AudioCodec::Opus) => return Ok(()),
            }
        };

        self.state.pcm.push(&pcm);
        while let Some(window) = self.state.pcm.pop_frame() {
            self.process_window(window, input.sample_rate, input.frame_duration as u64)
                .await;
        }
        Ok(())
    }

    async fn process_window(&self, window: Vec<f32>, sample_rate: u32, window_ms: u64) {
        let is_speech = {
            let mut vad = self.state.vad().lock().await;
            vad.as_mut().map(|detector| {
                detector.is_speech(&window, sample_rate).unwrap_or_else(|e| {
                    warn!(device_id = %self.state.device_id, "VAD failed on window: {}", e);
                    false
                })
            })
        };

        // Without a detector the device's listen start/stop drives the turn.
        let Some(is_speech) = is_speech else {
            if self.state.status() == SessionStatus::Listening && !self.state.voice.voice_stop() {
                self.state.feed_asr(window);
            }
            return;
        };

        if self.state.voice.voice_stop() {
            // Auto mode waits for the device's abort or next listen start to interrupt.
            if is_speech && self.state.status().is_speaking() && self.state.listen_mode() == ListenMode::Realtime {
                self.barge_in().await;
                self.state.feed_asr(window);
            }
            return;
        }

        match self.state.voice.process(is_speech, window_ms) {
            Some(VoiceEvent::SpeechOnset) => self.on_speech_onset().await,
            Some(VoiceEvent::SpeechOffset) => {
                info!(device_id = %self.state.device_id, "Speech offset");
                self.state.on_voice_silence();
                return;
            }
            None => {}
        }
        if self.state.voice.have_voice() {
            self.state.feed_asr(window);
        }
    }

    async fn on_speech_onset(&self) {
        let status = self.state.status();
        debug!(device_id = %self.state.device_id, status = ?status, "Speech onset");
        if self.state.listen_mode() == ListenMode::Manual
            || matches!(status, SessionStatus::Listening | SessionStatus::ListenStopped)
        {
            return;
        }
        if status.is_speaking() {
            self.barge_in().await;
            return;
        }
        if let Err(e) = self.on_listen_start().await {
            warn!(device_id = %self.state.device_id, "Auto listen failed: {}", e);
        }
        self.state.voice.set_have_voice(true);
    }

    async fn barge_in(&self) {
        info!(device_id = %self.state.device_id, "Barge-in, interrupting reply");
        self.stop_speaking(true).await;
        if let Err(e) = self.on_listen_start().await {
            warn!(device_id = %self.state.device_id, "Listen after barge-in failed: {}", e);
        }
        self.state.voice.set_have_voice(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::asr::AsrResult;
    use crate::core::device_config::DeviceConfig;
    use crate::core::pool::{PoolConfig, ResourcePool};
    use crate::core::vad::{EnergyVadConfig, VadFactory, VadProviderConfig};
    use crate::session::chat::tests::services;
    use crate::session::client_state::Providers;
    use crate::session::tests::{FakeAsr, FakeLlm, FakeTransport, FakeTts};
    use std::sync::atomic::Ordering;

    const WINDOW_MS: u64 = 60;

    fn loud() -> Vec<f32> {
        vec![0.3; 960]
    }

    fn quiet() -> Vec<f32> {
        vec![0.0; 960]
    }

    /// A session holding an energy detector that flags the first loud window.
    async fn gated_session(transcripts: &[&str]) -> (Arc<ChatSession>, Arc<FakeTransport>, Arc<FakeAsr>) {
        let transport = FakeTransport::new("dev");
        let asr = FakeAsr::new(transcripts);
        let providers = Providers {
            asr: asr.clone(),
            llm: FakeLlm::new(vec![]),
            tts: FakeTts::new(1),
        };
        let state = Arc::new(ClientState::new("dev", DeviceConfig::default(), 200, CancellationToken::new()));
        state.set_providers(providers.clone());

        let pool = ResourcePool::new(
            "vad",
            PoolConfig {
                max_size: 1,
                min_size: 0,
                max_idle: 1,
                acquire_timeout_ms: 100,
                idle_timeout_secs: 0,
                ..PoolConfig::default()
            },
            VadFactory::new(VadProviderConfig::Energy(EnergyVadConfig {
                threshold: 0.015,
                min_speech_frames: 1,
            })),
        )
        .await
        .unwrap();
        assert!(state.acquire_vad(&pool).await);

        let session = ChatSession::new(transport.clone(), state, services(providers));
        (session, transport, asr)
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn manager() -> AsrManager {
        AsrManager::new(Arc::new(ClientState::new(
            "dev",
            DeviceConfig::default(),
            200,
            CancellationToken::new(),
        )))
    }

    #[tokio::test]
    async fn test_retire_result_prefers_final_text() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Ok(AsrResult::new("今天", false))).await.unwrap();
        tx.send(Ok(AsrResult::new("今天天气", true))).await.unwrap();

        let text = manager().retire_result(&CancellationToken::new(), &mut rx).await.unwrap();
        assert_eq!(text, "今天天气");
    }

    #[tokio::test]
    async fn test_retire_result_falls_back_to_partial() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Ok(AsrResult::new("打开灯", false))).await.unwrap();
        drop(tx);

        let text = manager().retire_result(&CancellationToken::new(), &mut rx).await.unwrap();
        assert_eq!(text, "打开灯");
    }

    #[tokio::test]
    async fn test_retire_result_observes_turn_cancellation() {
        let (_tx, mut rx) = mpsc::channel::<Result<AsrResult, crate::core::asr::AsrError>>(4);
        let turn = CancellationToken::new();
        turn.cancel();

        let result = manager().retire_result(&turn, &mut rx).await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_restart_requires_providers() {
        let result = manager().restart(&CancellationToken::new()).await;
        assert!(matches!(result, Err(SessionError::NotReady)));
    }

    #[tokio::test]
    async fn test_auto_onset_opens_recognizer_and_feeds_it() {
        let (session, _transport, asr) = gated_session(&[]).await;
        let state = Arc::clone(session.state());

        session.process_window(quiet(), 16000, WINDOW_MS).await;
        assert_eq!(asr.calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.status(), SessionStatus::Idle);

        session.process_window(loud(), 16000, WINDOW_MS).await;
        assert_eq!(state.status(), SessionStatus::Listening);
        assert_eq!(asr.calls.load(Ordering::SeqCst), 1);
        assert!(state.voice.have_voice());

        session.process_window(loud(), 16000, WINDOW_MS).await;
        assert!(eventually(|| asr.frames.load(Ordering::SeqCst) >= 2).await);
        session.close().await;
    }

    #[tokio::test]
    async fn test_offset_stops_listening_and_finalizes() {
        let (session, transport, asr) = gated_session(&["打开客厅的灯"]).await;
        let state = Arc::clone(session.state());

        session.process_window(loud(), 16000, WINDOW_MS).await;
        assert_eq!(state.status(), SessionStatus::Listening);

        // 200 ms threshold: the fourth quiet window ends the utterance
        for _ in 0..3 {
            session.process_window(quiet(), 16000, WINDOW_MS).await;
            assert!(!state.voice.voice_stop());
        }
        session.process_window(quiet(), 16000, WINDOW_MS).await;
        assert!(state.voice.voice_stop());
        assert_eq!(state.status(), SessionStatus::ListenStopped);

        assert!(transport.wait_for(|sent| sent.iter().any(|m| m["type"] == "stt")).await);
        let stt = transport.sent_signals().into_iter().find(|m| m["type"] == "stt").unwrap();
        assert_eq!(stt["text"], "打开客厅的灯");

        // Windows after the offset no longer reach the recognizer
        let fed = asr.frames.load(Ordering::SeqCst);
        session.process_window(loud(), 16000, WINDOW_MS).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(asr.frames.load(Ordering::SeqCst), fed);
        assert_eq!(asr.calls.load(Ordering::SeqCst), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_realtime_onset_during_reply_barges_in() {
        let (session, transport, asr) = gated_session(&[]).await;
        let state = Arc::clone(session.state());
        state.set_listen_mode(ListenMode::Realtime);
        state.voice.set_have_voice(true);
        state.voice.set_voice_stop(true);
        state.set_tts_started(true);
        state.set_status(SessionStatus::TtsRunning);
        let reply_turn = state.turn();

        session.process_window(loud(), 16000, WINDOW_MS).await;

        assert!(reply_turn.is_cancelled());
        assert_eq!(transport.sent_types(), vec!["tts:stop".to_string()]);
        assert_eq!(state.status(), SessionStatus::Listening);
        assert!(state.has_live_turn());
        assert_eq!(asr.calls.load(Ordering::SeqCst), 1);
        assert!(eventually(|| asr.frames.load(Ordering::SeqCst) >= 1).await);
        session.close().await;
    }

    #[tokio::test]
    async fn test_auto_onset_during_reply_after_offset_is_ignored() {
        let (session, transport, asr) = gated_session(&[]).await;
        let state = Arc::clone(session.state());
        state.voice.set_have_voice(true);
        state.voice.set_voice_stop(true);
        state.set_tts_started(true);
        state.set_status(SessionStatus::TtsRunning);
        let reply_turn = state.turn();

        session.process_window(loud(), 16000, WINDOW_MS).await;

        assert!(!reply_turn.is_cancelled());
        assert!(transport.sent_signals().is_empty());
        assert_eq!(state.status(), SessionStatus::TtsRunning);
        assert_eq!(asr.calls.load(Ordering::SeqCst), 0);
        session.close().await;
    }

    #[tokio::test]
    async fn test_manual_mode_ignores_onset() {
        let (session, transport, asr) = gated_session(&[]).await;
        let state = Arc::clone(session.state());
        state.set_listen_mode(ListenMode::Manual);

        session.process_window(loud(), 16000, WINDOW_MS).await;
        session.process_window(loud(), 16000, WINDOW_MS).await;

        assert_eq!(state.status(), SessionStatus::Idle);
        assert_eq!(asr.calls.load(Ordering::SeqCst), 0);
        assert!(transport.sent_signals().is_empty());
        session.close().await;
    }
}
