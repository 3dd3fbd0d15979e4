//! Per-device dialogue memory.
//!
//! The chat pipeline only talks to the `DialogueMemory` trait; the bundled
//! implementation keeps a bounded history per device in a `moka` cache.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use moka::future::{Cache as MokaCache, CacheBuilder as MokaCacheBuilder};
use parking_lot::Mutex;

use crate::core::llm::{ChatMessage, Role};

#[async_trait::async_trait]
pub trait DialogueMemory: Send + Sync {
    /// The `count` most recent messages, oldest first.
    async fn recent(&self, device_id: &str, count: usize) -> Vec<ChatMessage>;

    async fn append(&self, device_id: &str, message: ChatMessage);

    async fn clear(&self, device_id: &str);
}

type History = Arc<Mutex<VecDeque<ChatMessage>>>;

pub struct InMemoryDialogueMemory {
    histories: MokaCache<String, History>,
    max_messages: usize,
}

impl InMemoryDialogueMemory {
    pub fn new(max_messages: usize, max_devices: u64, idle_ttl: Duration) -> Self {
        Self {
            histories: MokaCacheBuilder::new(max_devices).time_to_idle(idle_ttl).build(),
            max_messages: max_messages.max(1),
        }
    }
}

impl Default for InMemoryDialogueMemory {
    fn default() -> Self {
        Self::new(100, 10_000, Duration::from_secs(3600))
    }
}

#[async_trait::async_trait]
impl DialogueMemory for InMemoryDialogueMemory {
    async fn recent(&self, device_id: &str, count: usize) -> Vec<ChatMessage> {
        let Some(history) = self.histories.get(device_id).await else {
            return Vec::new();
        };
        let history = history.lock();
        let mut start = history.len().saturating_sub(count);
        // Never hand out a tool result without the assistant call it answers.
        while start < history.len() && history[start].role == Role::Tool {
            start += 1;
        }
        history.iter().skip(start).cloned().collect()
    }

    async fn append(&self, device_id: &str, message: ChatMessage) {
        // System prompts come from device config and are never stored.
        if message.role == Role::System {
            return;
        }
        let history = self
            .histories
            .get_with(device_id.to_string(), async { Arc::new(Mutex::new(VecDeque::new())) })
            .await;
        let mut history = history.lock();
        history.push_back(message);
        while history.len() > self.max_messages {
            history.pop_front();
        }
    }

    async fn clear(&self, device_id: &str) {
        self.histories.invalidate(device_id).await;
    }
}
