//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 由调用方提供 responder：根据完整消息列表返回文本。默认 responder 直接给出一个简短回答，
//! 不发起任何动作，便于本地跑通整条流程。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{Completion, LlmClient, LlmError, Usage};
use crate::memory::{Message, Role};

type Responder = Box<dyn Fn(&[Message]) -> Result<String, LlmError> + Send + Sync>;

/// Mock 客户端：responder 决定输出，记录调用次数与每次收到的消息
pub struct MockLlmClient {
    responder: Responder,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&[Message]) -> String + Send + Sync + 'static,
    {
        Self::fallible(move |messages| Ok(responder(messages)))
    }

    /// responder 可返回错误（测试失败路径）
    pub fn fallible<F>(responder: F) -> Self
    where
        F: Fn(&[Message]) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 按顺序返回预设输出，用完后重复最后一条
    pub fn scripted(outputs: Vec<String>) -> Self {
        let cursor = AtomicUsize::new(0);
        Self::new(move |_| {
            let i = cursor.fetch_add(1, Ordering::SeqCst);
            outputs
                .get(i)
                .or_else(|| outputs.last())
                .cloned()
                .unwrap_or_default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的完整消息（含 system）
    pub fn seen(&self) -> Vec<Vec<Message>> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new(|messages| {
            let last_user = messages
                .iter()
                .rev()
                .find(|m| matches!(m.role, Role::User))
                .map(|m| m.content.as_str())
                .unwrap_or("(no input)");
            format!("Mock answer for: {last_user}")
        })
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(messages.to_vec());
        let content = (self.responder)(messages)?;
        let prompt_tokens = messages.iter().map(|m| m.content.len() as u64 / 4).sum();
        let completion_tokens = content.len() as u64 / 4;
        Ok(Completion::new(content, Usage::new(prompt_tokens, completion_tokens)))
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}
