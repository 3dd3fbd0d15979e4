//! Model turns: streaming, sentence hand-off to TTS, tool execution.

use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::llm::{ChatMessage, Role, SegmenterConfig, SentenceSegmenter, ToolCall, ToolSchema};
use crate::core::mcp::{ToolContext, ToolResolver};
use crate::core::memory::DialogueMemory;

use super::SessionError;
use super::client_state::{ClientState, SessionStatus};
use super::queue::BoundedQueue;
use super::tts::TtsManager;
use super::writer::ServerTransport;

pub const LLM_QUEUE_SIZE: usize = 10;

/// Tool results are fed back at most once per turn.
pub const MAX_NEST: u32 = 2;

/// A reply spoken without asking the model (greetings).
struct CannedReply {
    turn: CancellationToken,
    text: String,
    greeting: bool,
}

pub struct LlmManager {
    state: Arc<ClientState>,
    writer: Arc<ServerTransport>,
    tts: Arc<TtsManager>,
    memory: Arc<dyn DialogueMemory>,
    tools: ToolResolver,
    segmenter: SegmenterConfig,
    queue: BoundedQueue<CannedReply>,
}

impl LlmManager {
    pub fn new(
        state: Arc<ClientState>,
        writer: Arc<ServerTransport>,
        tts: Arc<TtsManager>,
        memory: Arc<dyn DialogueMemory>,
        tools: ToolResolver,
        segmenter: SegmenterConfig,
    ) -> Self {
        Self {
            state,
            writer,
            tts,
            memory,
            tools,
            segmenter,
            queue: BoundedQueue::new(LLM_QUEUE_SIZE),
        }
    }

    /// Queue a fixed reply. `greeting` releases the session's greeting slot
    /// once the reply has been spoken or dropped.
    pub async fn enqueue_text(&self, turn: &CancellationToken, text: &str, greeting: bool) -> Result<(), SessionError> {
        let pushed = self
            .queue
            .push(CannedReply {
                turn: turn.clone(),
                text: text.to_string(),
                greeting,
            })
            .await;
        if pushed.is_err() && greeting {
            self.state.end_greeting();
        }
        pushed.map_err(Into::into)
    }

    /// Drop pending canned replies. Pending greetings give their slot back.
    pub fn clear(&self) -> usize {
        let dropped = self.queue.clear();
        if dropped > 0 {
            self.state.end_greeting();
        }
        dropped
    }

    /// Dispatcher for canned replies; runs until the session scope ends.
    pub async fn run(self: Arc<Self>) {
        let root = self.state.root().clone();
        while let Some(reply) = self.queue.pop(&root).await {
            if let Err(e) = self.speak_framed(&reply.turn, &reply.text).await {
                debug!(device_id = %self.state.device_id, "Canned reply not spoken: {}", e);
            }
            if reply.greeting {
                self.state.end_greeting();
            }
        }
        self.queue.close();
    }

    async fn speak_framed(&self, turn: &CancellationToken, text: &str) -> Result<(), SessionError> {
        if turn.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        self.writer.send_tts_start().await?;
        let result = self.tts.speak(turn, text).await;
        self.finish_framing(turn).await;
        result
    }

    async fn finish_framing(&self, turn: &CancellationToken) {
        // A barge-in may already have closed the framing.
        if self.state.tts_started() {
            if let Err(e) = self.writer.send_tts_stop().await {
                warn!(device_id = %self.state.device_id, "Failed to send tts stop: {}", e);
            }
        }
        if !turn.is_cancelled() {
            self.state.set_status(SessionStatus::Idle);
        }
    }

    /// Run one model request to completion. The outermost request (`nest <= 1`)
    /// owns the `tts:start`/`tts:stop` framing; tool follow-ups do not.
    pub fn do_request<'a>(
        &'a self,
        turn: &'a CancellationToken,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolSchema>,
        nest: u32,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        async move {
            if turn.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            self.state.set_status(SessionStatus::LlmRunning);

            let framing = nest <= 1;
            if framing {
                self.writer.send_tts_start().await?;
            }
            let result = self.stream_turn(turn, messages, tools, nest).await;
            if framing {
                self.finish_framing(turn).await;
            }
            result
        }
        .boxed()
    }

    async fn stream_turn(
        &self,
        turn: &CancellationToken,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolSchema>,
        nest: u32,
    ) -> Result<(), SessionError> {
        let providers = self.state.providers().ok_or(SessionError::NotReady)?;
        let device_id = self.state.device_id.as_str();
        let started = Instant::now();
        debug!(
            device_id = %device_id,
            nest,
            messages = messages.len(),
            tools = tools.len(),
            "LLM request"
        );

        let mut stream = providers
            .llm
            .stream_chat(turn.child_token(), messages.clone(), tools)
            .await?;

        let mut segmenter = SentenceSegmenter::new(self.segmenter);
        let mut full_text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut last_sentence: Option<oneshot::Receiver<()>> = None;
        let mut first_token_ms = None;

        loop {
            let next = tokio::select! {
                _ = turn.cancelled() => return Err(SessionError::Cancelled),
                next = stream.recv() => next,
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(e.into()),
            };
            if first_token_ms.is_none() {
                first_token_ms = Some(started.elapsed().as_millis() as u64);
            }
            tool_calls.extend(chunk.tool_calls);
            if !chunk.text.is_empty() {
                full_text.push_str(&chunk.text);
                for sentence in segmenter.push(&chunk.text) {
                    last_sentence = Some(self.tts.enqueue(turn, &sentence).await?);
                }
            }
        }
        if let Some(sentence) = segmenter.finish() {
            last_sentence = Some(self.tts.enqueue(turn, &sentence).await?);
        }

        info!(
            device_id = %device_id,
            nest,
            first_token_ms = first_token_ms.unwrap_or_default(),
            latency_ms = started.elapsed().as_millis() as u64,
            sentences = segmenter.emitted(),
            tool_calls = tool_calls.len(),
            "LLM stream finished"
        );

        if nest <= 1 {
            if let Some(user) = messages.iter().rev().find(|m| m.role == Role::User) {
                self.memory.append(device_id, user.clone()).await;
            }
        }
        if !full_text.is_empty() {
            self.memory.append(device_id, ChatMessage::assistant(full_text)).await;
        }

        if !tool_calls.is_empty() {
            self.invoke_tools(turn, messages, tool_calls, nest).await?;
        }

        if let Some(done) = last_sentence {
            self.tts.wait(turn, done).await?;
        }
        Ok(())
    }

    /// Execute the calls of one stream. When none succeeds the streamed reply
    /// text is all the device hears.
    async fn invoke_tools(
        &self,
        turn: &CancellationToken,
        mut messages: Vec<ChatMessage>,
        calls: Vec<ToolCall>,
        nest: u32,
    ) -> Result<(), SessionError> {
        let device_id = self.state.device_id.as_str();
        let ctx = ToolContext::for_device(device_id);
        let mut follow_up = Vec::new();
        let mut succeeded = false;

        for call in calls {
            let Some(tool) = self.tools.resolve(device_id, &call.name) else {
                warn!(device_id = %device_id, tool = %call.name, "Model requested an unknown tool");
                continue;
            };
            let started = Instant::now();
            let result = tokio::select! {
                _ = turn.cancelled() => return Err(SessionError::Cancelled),
                result = tool.invoke(&ctx, &call.arguments) => result,
            };
            let latency_ms = started.elapsed().as_millis() as u64;
            let output = match result {
                Ok(output) => output,
                Err(e) => {
                    error!(device_id = %device_id, tool = %call.name, latency_ms, "Tool call failed: {}", e);
                    continue;
                }
            };
            succeeded = true;
            info!(device_id = %device_id, tool = %call.name, latency_ms, "Tool call succeeded");

            if !tool.returns_to_llm() {
                debug!(device_id = %device_id, tool = %call.name, "Tool result not returned to model");
                continue;
            }
            follow_up.push(ChatMessage::assistant_tool_calls(vec![call.clone()]));
            follow_up.push(ChatMessage::tool(call.id, output));
        }

        if !succeeded {
            warn!(device_id = %device_id, nest, "No tool call succeeded, keeping the spoken reply");
            return Ok(());
        }
        if follow_up.is_empty() || nest >= MAX_NEST {
            return Ok(());
        }
        for message in &follow_up {
            self.memory.append(device_id, message.clone()).await;
        }
        messages.extend(follow_up);
        self.do_request(turn, messages, Vec::new(), nest + 1).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device_config::DeviceConfig;
    use crate::core::llm::LlmChunk;
    use crate::core::mcp::{DeviceMcpPool, GlobalMcpManager, McpConfig, McpError, Tool};
    use crate::core::memory::InMemoryDialogueMemory;
    use crate::session::client_state::Providers;
    use crate::session::tests::{FakeAsr, FakeLlm, FakeTransport, FakeTts};
    use serde_json::{Value, json};

    struct Weather;

    #[async_trait::async_trait]
    impl Tool for Weather {
        fn name(&self) -> &str {
            "query_weather"
        }
        fn description(&self) -> &str {
            "查询天气"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn invoke(&self, ctx: &ToolContext, _arguments: &str) -> Result<String, McpError> {
            assert_eq!(ctx.device_id, "dev");
            Ok("天气晴朗 20度 北风3级".to_string())
        }
    }

    struct Harness {
        transport: Arc<FakeTransport>,
        state: Arc<ClientState>,
        llm: Arc<FakeLlm>,
        memory: Arc<InMemoryDialogueMemory>,
        manager: Arc<LlmManager>,
    }

    fn harness(scripts: Vec<Vec<LlmChunk>>) -> Harness {
        let transport = FakeTransport::new("dev");
        let state = Arc::new(ClientState::new("dev", DeviceConfig::default(), 200, CancellationToken::new()));
        let llm = FakeLlm::new(scripts);
        state.set_providers(Providers {
            asr: FakeAsr::new(&[]),
            llm: llm.clone(),
            tts: FakeTts::new(1),
        });
        let writer = Arc::new(ServerTransport::new(transport.clone(), Arc::clone(&state)));
        let tts = Arc::new(TtsManager::new(Arc::clone(&state), Arc::clone(&writer)));
        tokio::spawn(Arc::clone(&tts).run());

        let global = GlobalMcpManager::new(McpConfig::default());
        global.register_local_tool(Arc::new(Weather));
        let tools = ToolResolver::new(global, DeviceMcpPool::new());
        let memory = Arc::new(InMemoryDialogueMemory::default());
        let manager = Arc::new(LlmManager::new(
            Arc::clone(&state),
            writer,
            tts,
            memory.clone(),
            tools,
            SegmenterConfig::default(),
        ));
        tokio::spawn(Arc::clone(&manager).run());
        Harness {
            transport,
            state,
            llm,
            memory,
            manager,
        }
    }

    #[tokio::test]
    async fn test_plain_reply_is_framed_and_remembered() {
        let h = harness(vec![vec![LlmChunk::text("今天晴天。"), LlmChunk::text("适合出门。")]]);
        let turn = h.state.turn();

        h.manager
            .do_request(&turn, vec![ChatMessage::user("今天天气怎么样")], Vec::new(), 1)
            .await
            .unwrap();

        assert_eq!(
            h.transport.sent_types(),
            vec![
                "tts:start",
                "tts:sentence_start",
                "tts:sentence_end",
                "tts:sentence_start",
                "tts:sentence_end",
                "tts:stop"
            ]
        );
        let history = h.memory.recent("dev", 10).await;
        assert_eq!(history[0], ChatMessage::user("今天天气怎么样"));
        assert_eq!(history[1], ChatMessage::assistant("今天晴天。适合出门。"));
        assert_eq!(h.state.status(), SessionStatus::Idle);
        h.state.root().cancel();
    }

    #[tokio::test]
    async fn test_tool_result_recurses_once_inside_one_frame() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "query_weather".into(),
            arguments: "{}".into(),
        };
        let h = harness(vec![
            vec![LlmChunk::tool_calls(vec![call])],
            vec![LlmChunk::text("大连今天天气晴朗。")],
        ]);
        let turn = h.state.turn();

        h.manager
            .do_request(&turn, vec![ChatMessage::user("大连天气")], Vec::new(), 1)
            .await
            .unwrap();

        let types = h.transport.sent_types();
        assert_eq!(types.iter().filter(|t| *t == "tts:start").count(), 1);
        assert_eq!(types.iter().filter(|t| *t == "tts:stop").count(), 1);
        assert_eq!(types.last().map(String::as_str), Some("tts:stop"));

        let requests = h.llm.requests.lock();
        assert_eq!(requests.len(), 2);
        let (follow_up, tools) = &requests[1];
        assert!(tools.is_empty());
        assert_eq!(follow_up[1].tool_calls[0].name, "query_weather");
        assert_eq!(follow_up[2].role, Role::Tool);
        assert_eq!(follow_up[2].content, "天气晴朗 20度 北风3级");
        drop(requests);
        h.state.root().cancel();
    }

    #[tokio::test]
    async fn test_unresolved_tools_keep_streamed_reply() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "launch_rocket".into(),
            arguments: "{}".into(),
        };
        let h = harness(vec![vec![LlmChunk::text("好的。"), LlmChunk::tool_calls(vec![call])]]);
        let turn = h.state.turn();

        h.manager
            .do_request(&turn, vec![ChatMessage::user("发射")], Vec::new(), 1)
            .await
            .unwrap();
        assert_eq!(h.llm.request_count(), 1);

        let spoken: Vec<_> = h
            .transport
            .sent_signals()
            .into_iter()
            .filter(|m| m["state"] == "sentence_start")
            .map(|m| m["text"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(spoken, vec!["好的。".to_string()]);
        assert_eq!(h.transport.sent_types().last().map(String::as_str), Some("tts:stop"));
        let history = h.memory.recent("dev", 10).await;
        assert!(history.iter().all(|m| m.role != Role::Tool));
        h.state.root().cancel();
    }

    #[tokio::test]
    async fn test_cancelled_turn_leaves_memory_untouched() {
        let h = harness(vec![]);
        let turn = h.state.turn();
        h.state.cancel_turn();

        let result = h
            .manager
            .do_request(&turn, vec![ChatMessage::user("hi")], Vec::new(), 1)
            .await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert!(h.memory.recent("dev", 10).await.is_empty());
        assert!(h.transport.sent_signals().is_empty());
        h.state.root().cancel();
    }

    #[tokio::test]
    async fn test_canned_reply_releases_greeting_slot() {
        let h = harness(vec![]);
        assert!(h.state.begin_greeting());
        let turn = h.state.turn();
        h.manager.enqueue_text(&turn, "你好，有啥好玩的.", true).await.unwrap();

        assert!(
            h.transport
                .wait_for(|sent| sent.last().is_some_and(|m| m["state"] == "stop"))
                .await
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(h.state.begin_greeting());
        h.state.root().cancel();
    }
}
