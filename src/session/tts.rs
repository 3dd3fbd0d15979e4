//! Sentence-to-audio jobs and the frame pacer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::tts::TtsStream;
use crate::transport::Transport;

use super::SessionError;
use super::client_state::ClientState;
use super::queue::BoundedQueue;
use super::writer::ServerTransport;

pub const TTS_QUEUE_SIZE: usize = 10;
pub const SYNC_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames sent back to back before pacing starts: about 60 ms of audio,
/// never fewer than 3 or more than 20 frames.
pub fn first_frame_count(frame_ms: u32) -> usize {
    let frame_ms = frame_ms.max(1);
    (60 / frame_ms).clamp(3, 20) as usize
}

/// Send a burst prefix to prime the device jitter buffer, then one frame per
/// `frame_ms` tick. Returns the number of frames sent. Cancellation drops the
/// stream, which ends the provider side.
pub async fn pace_frames(
    cancel: &CancellationToken,
    transport: &dyn Transport,
    mut frames: TtsStream,
    frame_ms: u32,
) -> Result<usize, SessionError> {
    let mut sent = 0usize;

    for _ in 0..first_frame_count(frame_ms) {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(sent),
            next = frames.recv() => next,
        };
        match next {
            None => return Ok(sent),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(frame)) => {
                transport.send_audio(frame).await?;
                sent += 1;
            }
        }
    }

    let period = Duration::from_millis(frame_ms.max(1) as u64);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(sent),
            _ = ticker.tick() => {}
        }
        match frames.try_recv() {
            Ok(Ok(frame)) => {
                if cancel.is_cancelled() {
                    return Ok(sent);
                }
                transport.send_audio(frame).await?;
                sent += 1;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(tokio::sync::mpsc::error::TryRecvError::Empty) => {}
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => return Ok(sent),
        }
    }
}

struct TtsJob {
    turn: CancellationToken,
    text: String,
    done: Option<oneshot::Sender<()>>,
}

/// Serializes synthesis for one session.
pub struct TtsManager {
    state: Arc<ClientState>,
    writer: Arc<ServerTransport>,
    queue: BoundedQueue<TtsJob>,
}

impl TtsManager {
    pub fn new(state: Arc<ClientState>, writer: Arc<ServerTransport>) -> Self {
        Self {
            state,
            writer,
            queue: BoundedQueue::new(TTS_QUEUE_SIZE),
        }
    }

    /// Queue `text` for synthesis and return a receiver that fires once the
    /// job finished, failed, or was skipped.
    pub async fn enqueue(&self, turn: &CancellationToken, text: &str) -> Result<oneshot::Receiver<()>, SessionError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.queue
            .push(TtsJob {
                turn: turn.clone(),
                text: text.to_string(),
                done: Some(done_tx),
            })
            .await?;
        Ok(done_rx)
    }

    /// Wait for a queued job, bounded by the turn and [`SYNC_WAIT_TIMEOUT`].
    pub async fn wait(&self, turn: &CancellationToken, done: oneshot::Receiver<()>) -> Result<(), SessionError> {
        tokio::select! {
            _ = turn.cancelled() => Err(SessionError::Cancelled),
            result = tokio::time::timeout(SYNC_WAIT_TIMEOUT, done) => match result {
                Ok(_) => Ok(()),
                Err(_) => Err(SessionError::Timeout("tts")),
            },
        }
    }

    /// Enqueue and wait.
    pub async fn speak(&self, turn: &CancellationToken, text: &str) -> Result<(), SessionError> {
        let done = self.enqueue(turn, text).await?;
        self.wait(turn, done).await
    }

    pub fn clear(&self) -> usize {
        self.queue.clear()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Dispatcher loop; runs until the session scope ends.
    pub async fn run(self: Arc<Self>) {
        let root = self.state.root().clone();
        while let Some(mut job) = self.queue.pop(&root).await {
            if let Err(e) = self.synthesize(&job.turn, &job.text).await {
                match e {
                    SessionError::Cancelled => debug!(device_id = %self.state.device_id, "TTS job cancelled"),
                    other => error!(device_id = %self.state.device_id, text = %job.text, "TTS job failed: {}", other),
                }
            }
            if let Some(done) = job.done.take() {
                let _ = done.send(());
            }
        }
        self.queue.close();
        debug!(device_id = %self.state.device_id, "TTS dispatcher stopped");
    }

    async fn synthesize(&self, turn: &CancellationToken, text: &str) -> Result<(), SessionError> {
        if turn.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        let providers = self.state.providers().ok_or(SessionError::NotReady)?;
        let format = self.state.output_format();

        self.writer.send_sentence_start(text).await?;
        let started = Instant::now();

        let result = match providers.tts.synthesize_stream(turn.child_token(), text, format).await {
            Ok(stream) => pace_frames(turn, self.writer.transport().as_ref(), stream, format.frame_duration).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = self.writer.send_sentence_end(text).await {
            warn!(device_id = %self.state.device_id, "Failed to send sentence_end: {}", e);
        }

        let frames = result?;
        info!(
            device_id = %self.state.device_id,
            frames,
            latency_ms = started.elapsed().as_millis() as u64,
            "Sentence spoken"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::AudioFormat;
    use crate::core::device_config::DeviceConfig;
    use crate::session::tests::{FakeTransport, fake_providers};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    #[test]
    fn test_first_frame_count_clamps() {
        assert_eq!(first_frame_count(60), 3);
        assert_eq!(first_frame_count(20), 3);
        assert_eq!(first_frame_count(10), 6);
        assert_eq!(first_frame_count(2), 20);
        assert_eq!(first_frame_count(0), 20);
    }

    fn stream_of(count: usize) -> TtsStream {
        let (tx, rx) = mpsc::channel(count.max(1));
        for i in 0..count {
            tx.try_send(Ok(Bytes::from(vec![i as u8]))).unwrap();
        }
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_bursts_then_ticks() {
        let transport = FakeTransport::new("dev");
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let sent = pace_frames(&cancel, transport.as_ref(), stream_of(8), 20).await.unwrap();

        assert_eq!(sent, 8);
        assert_eq!(transport.sent_audio().len(), 8);
        // 3 burst frames, then 5 paced frames at 20 ms each.
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_pacer_stops_on_cancel() {
        let transport = FakeTransport::new("dev");
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);
        for i in 0..3u8 {
            tx.send(Ok(Bytes::from(vec![i]))).await.unwrap();
        }

        let pacer = {
            let transport = transport.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pace_frames(&cancel, transport.as_ref(), rx, 60).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        assert_eq!(pacer.await.unwrap().unwrap(), 3);
        // The receiver was dropped with the pacer.
        assert!(tx.send(Ok(Bytes::new())).await.is_err());
    }

    #[tokio::test]
    async fn test_job_frames_sentence_markers() {
        let transport = FakeTransport::new("dev");
        let state = Arc::new(ClientState::new("dev", DeviceConfig::default(), 200, CancellationToken::new()));
        state.set_output_format(AudioFormat::opus(16000, 1, 60));
        state.set_providers(fake_providers(vec![], 2));
        let writer = Arc::new(ServerTransport::new(transport.clone(), Arc::clone(&state)));
        let manager = Arc::new(TtsManager::new(Arc::clone(&state), writer));
        tokio::spawn(Arc::clone(&manager).run());

        let turn = state.turn();
        manager.speak(&turn, "你好。").await.unwrap();

        let signals = transport.sent_signals();
        assert_eq!(signals[0]["state"], "sentence_start");
        assert_eq!(signals[1]["state"], "sentence_end");
        assert_eq!(signals[1]["text"], "你好。");
        assert_eq!(transport.sent_audio().len(), 2);
        state.root().cancel();
    }

    #[tokio::test]
    async fn test_cancelled_turn_skips_job() {
        let transport = FakeTransport::new("dev");
        let state = Arc::new(ClientState::new("dev", DeviceConfig::default(), 200, CancellationToken::new()));
        state.set_providers(fake_providers(vec![], 2));
        let writer = Arc::new(ServerTransport::new(transport.clone(), Arc::clone(&state)));
        let manager = Arc::new(TtsManager::new(Arc::clone(&state), writer));
        tokio::spawn(Arc::clone(&manager).run());

        let turn = state.turn();
        let done = manager.enqueue(&turn, "skip me").await.unwrap();
        state.cancel_turn();
        let _ = done.await;

        assert!(transport.sent_signals().is_empty());
        state.root().cancel();
    }
}
