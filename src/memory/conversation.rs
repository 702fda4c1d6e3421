//! 对话消息：角色、动作请求与动作结果
//!
//! 工作流状态中的 messages / supervisor_messages 以及子研究的私有历史都由 Message 组成；
//! 助手消息可携带 ActionRequest，工具消息通过 tool_call_id 回指对应请求。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致，Tool 为动作执行结果）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// 模型发起的一次动作调用：{name, arguments, id}
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ActionRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// 取字符串参数，缺失或类型不符时返回 None
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(|v| v.as_str())
    }
}

/// 动作执行结果，与 ActionRequest 一一对应（id 相同）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: String,
    pub name: String,
    pub content: String,
}

impl ActionResult {
    pub fn for_request(request: &ActionRequest, content: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            content: content.into(),
        }
    }

    pub fn into_message(self) -> Message {
        Message::tool(self.id, self.name, self.content)
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool 消息的动作名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool 消息回指的 ActionRequest.id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Assistant 消息携带的动作请求
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_requests: Vec<ActionRequest>,
}

impl Message {
    fn plain(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            name: None,
            tool_call_id: None,
            action_requests: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content.into())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content.into())
    }

    pub fn tool(id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            name: Some(name.into()),
            tool_call_id: Some(id.into()),
            action_requests: Vec::new(),
        }
    }

    pub fn with_action_requests(mut self, requests: Vec<ActionRequest>) -> Self {
        self.action_requests = requests;
        self
    }

    pub fn is_tool(&self, name: &str) -> bool {
        self.role == Role::Tool && self.name.as_deref() == Some(name)
    }
}

/// 将消息历史渲染为纯文本（用于澄清 Prompt 中的 {messages}）
pub fn buffer_string(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let who = match m.role {
                Role::User => "Human",
                Role::Assistant => "AI",
                Role::System => "System",
                Role::Tool => "Tool",
            };
            format!("{}: {}", who, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
