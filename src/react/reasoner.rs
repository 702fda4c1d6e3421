//! Reasoner：推理服务封装与动作调用解析
//!
//! 将可用动作（名称、描述、参数 JSON Schema）与输出 schema 写入 system prompt，调用 LLM，
//! 再用 parse_model_output 从回复中提取 `{"tool_calls": [...]}`、单个 `{"tool": .., "args": ..}` 或结构化 JSON。
//! 解析失败时由 RecoveryEngine 给出纠正提示并有限次重试。

use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{RecoveryAction, RecoveryEngine, ResearchError};
use crate::llm::{LlmClient, Usage};
use crate::memory::{ActionRequest, Message, Role};

/// 模型输出中的单个动作调用（{"tool": "search", "args": {...}, "id": "..."}）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(alias = "name")]
    pub tool: String,
    #[serde(default, alias = "arguments")]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// 暴露给模型的动作描述
#[derive(Debug, Clone, Serialize)]
pub struct ActionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ActionSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    /// 以 T 的 JSON Schema 作为参数描述
    pub fn with_args<T: JsonSchema>(mut self) -> Self {
        self.parameters = schema_of::<T>();
        self
    }
}

/// 要求模型输出的结构
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub schema: Value,
}

impl OutputSchema {
    pub fn of<T: JsonSchema>() -> Self {
        Self {
            schema: schema_of::<T>(),
        }
    }
}

fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}

/// 一次推理请求
#[derive(Debug, Clone)]
pub struct ReasoningRequest<'a> {
    pub system: String,
    pub history: &'a [Message],
    pub output_schema: Option<OutputSchema>,
    pub actions: Vec<ActionSpec>,
    /// 未提供 id 的动作请求按 `{call_prefix}_{index}` 编号
    pub call_prefix: String,
}

impl<'a> ReasoningRequest<'a> {
    pub fn new(system: impl Into<String>, history: &'a [Message]) -> Self {
        Self {
            system: system.into(),
            history,
            output_schema: None,
            actions: Vec::new(),
            call_prefix: "call".to_string(),
        }
    }

    pub fn with_schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_actions(mut self, actions: Vec<ActionSpec>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_call_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.call_prefix = prefix.into();
        self
    }
}

/// 推理结果
#[derive(Debug, Clone, Default)]
pub struct ReasoningResponse {
    pub text: String,
    pub structured: Option<Value>,
    pub action_requests: Vec<ActionRequest>,
    pub usage: Usage,
}

impl ReasoningResponse {
    /// 作为助手消息写入历史（携带动作请求）
    pub fn to_message(&self) -> Message {
        Message::assistant(self.text.clone()).with_action_requests(self.action_requests.clone())
    }
}

/// 解析后的模型输出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub text: String,
    pub structured: Option<Value>,
    pub actions: Vec<ActionRequest>,
}

/// 从文本中找出 JSON 片段（```json 代码块或首个 '{' 到最后一个 '}'），返回 (片段, 片段前的文字)
fn extract_json(trimmed: &str) -> Option<(&str, &str)> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let body = rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim());
        return Some((body, trimmed[..start].trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    Some((&trimmed[start..=end], trimmed[..start].trim()))
}

fn extract_calls(value: &Value, call_prefix: &str) -> Result<Option<Vec<ActionRequest>>, ResearchError> {
    let calls: Vec<ToolCall> = if let Some(list) = value.get("tool_calls") {
        serde_json::from_value(list.clone())
            .map_err(|e| ResearchError::InvalidOutput(format!("tool_calls: {e}")))?
    } else if value.get("tool").map(Value::is_string).unwrap_or(false) {
        vec![serde_json::from_value(value.clone())
            .map_err(|e| ResearchError::InvalidOutput(format!("tool call: {e}")))?]
    } else {
        return Ok(None);
    };

    let mut actions = Vec::with_capacity(calls.len());
    for (index, call) in calls.into_iter().enumerate() {
        if call.tool.trim().is_empty() {
            return Err(ResearchError::InvalidOutput(format!(
                "tool call #{index} has an empty tool name"
            )));
        }
        let id = call
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{call_prefix}_{index}"));
        let args = if call.args.is_null() {
            Value::Object(Default::default())
        } else {
            call.args
        };
        actions.push(ActionRequest::new(id, call.tool, args));
    }
    Ok(Some(actions))
}

/// 解析模型输出
///
/// - 有动作可用且 JSON 含 tool_calls / tool：解析为动作请求
/// - 要求结构化输出：JSON 对象作为 structured，找不到或非法时返回 InvalidOutput
/// - 其余情况视为纯文本回复
pub fn parse_model_output(
    output: &str,
    expect_structured: bool,
    allow_actions: bool,
    call_prefix: &str,
) -> Result<ParsedOutput, ResearchError> {
    let trimmed = output.trim();

    let Some((json_str, prose)) = extract_json(trimmed) else {
        if expect_structured {
            return Err(ResearchError::InvalidOutput(format!(
                "expected a JSON object, got: {}",
                preview(trimmed)
            )));
        }
        return Ok(ParsedOutput {
            text: trimmed.to_string(),
            ..Default::default()
        });
    };

    let value: Value = match serde_json::from_str(json_str) {
        Ok(v) => v,
        Err(e) => {
            let looks_like_call = allow_actions && json_str.contains("\"tool");
            if expect_structured || looks_like_call {
                return Err(ResearchError::InvalidOutput(format!("{e}: {}", preview(json_str))));
            }
            return Ok(ParsedOutput {
                text: trimmed.to_string(),
                ..Default::default()
            });
        }
    };

    if allow_actions {
        if let Some(actions) = extract_calls(&value, call_prefix)? {
            return Ok(ParsedOutput {
                text: prose.to_string(),
                structured: None,
                actions,
            });
        }
    }

    if expect_structured {
        if !value.is_object() {
            return Err(ResearchError::InvalidOutput(format!(
                "expected a JSON object, got: {}",
                preview(json_str)
            )));
        }
        return Ok(ParsedOutput {
            text: prose.to_string(),
            structured: Some(value),
            actions: Vec::new(),
        });
    }

    Ok(ParsedOutput {
        text: trimmed.to_string(),
        ..Default::default()
    })
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

/// Reasoner：持有 LLM 与恢复引擎
pub struct Reasoner {
    llm: Arc<dyn LlmClient>,
    recovery: RecoveryEngine,
    structured_retries: usize,
}

impl Reasoner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            recovery: RecoveryEngine::new(),
            structured_retries: 1,
        }
    }

    pub fn with_structured_retries(mut self, retries: usize) -> Self {
        self.structured_retries = retries;
        self
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// 通用调用：按请求中的 schema / 动作解析输出
    pub async fn invoke(&self, request: ReasoningRequest<'_>) -> Result<ReasoningResponse, ResearchError> {
        let expect_structured = request.output_schema.is_some();
        let allow_actions = !request.actions.is_empty();
        let prefix = request.call_prefix.clone();
        let hint = request
            .output_schema
            .as_ref()
            .map(|s| s.schema.to_string());
        let messages = build_messages(&request);

        let (parsed, usage) = self
            .complete_with_recovery(messages, hint.as_deref(), |raw| {
                parse_model_output(raw, expect_structured, allow_actions, &prefix)
            })
            .await?;

        Ok(ReasoningResponse {
            text: parsed.text,
            structured: parsed.structured,
            action_requests: parsed.actions,
            usage,
        })
    }

    /// 结构化调用：输出反序列化为 T，失败时纠正重试
    pub async fn invoke_structured<T>(
        &self,
        system: impl Into<String>,
        history: &[Message],
    ) -> Result<(T, Usage), ResearchError>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let schema = OutputSchema::of::<T>();
        let hint = schema.schema.to_string();
        let request = ReasoningRequest::new(system, history).with_schema(schema);
        let messages = build_messages(&request);

        self.complete_with_recovery(messages, Some(&hint), |raw| {
            let parsed = parse_model_output(raw, true, false, "call")?;
            let value = parsed.structured.unwrap_or(Value::Null);
            serde_json::from_value::<T>(value).map_err(|e| ResearchError::InvalidOutput(e.to_string()))
        })
        .await
    }

    /// 纯文本调用（压缩、报告）
    pub async fn invoke_text(
        &self,
        system: impl Into<String>,
        history: &[Message],
    ) -> Result<ReasoningResponse, ResearchError> {
        self.invoke(ReasoningRequest::new(system, history)).await
    }

    async fn complete_with_recovery<R, F>(
        &self,
        mut messages: Vec<Message>,
        schema_hint: Option<&str>,
        parse: F,
    ) -> Result<(R, Usage), ResearchError>
    where
        F: Fn(&str) -> Result<R, ResearchError>,
    {
        let mut usage = Usage::default();
        let mut corrections = 0;
        loop {
            let completion = self.llm.complete(&messages).await?;
            usage.add(completion.usage);
            let err = match parse(&completion.content) {
                Ok(out) => return Ok((out, usage)),
                Err(err) => err,
            };
            match self.recovery.handle(&err, schema_hint) {
                RecoveryAction::RetryWithPrompt(hint) if corrections < self.structured_retries => {
                    corrections += 1;
                    tracing::warn!(
                        model = self.llm.model_name(),
                        attempt = corrections,
                        error = %err,
                        "model output rejected, asking for a corrected reply"
                    );
                    messages.push(Message::assistant(completion.content));
                    messages.push(Message::user(hint));
                }
                _ => return Err(err),
            }
        }
    }
}

fn build_messages(request: &ReasoningRequest<'_>) -> Vec<Message> {
    let mut system = request.system.clone();
    if !request.actions.is_empty() {
        let specs = serde_json::to_string_pretty(&request.actions).unwrap_or_else(|_| "[]".into());
        system.push_str("\n\n## Available actions\n");
        system.push_str(&specs);
        system.push_str(
            "\n\nTo call actions, reply with only one JSON object of the form \
             {\"tool_calls\": [{\"tool\": \"<action name>\", \"args\": {...}}]}. \
             Several calls may be listed in one reply. \
             To finish without calling any action, reply with plain text.",
        );
    }
    if let Some(schema) = &request.output_schema {
        system.push_str("\n\n## Output format\nReply with only one JSON object matching this JSON Schema:\n");
        system.push_str(&schema.schema.to_string());
    }

    let mut messages = Vec::with_capacity(request.history.len() + 1);
    messages.push(Message::system(system));
    messages.extend(request.history.iter().map(render_for_model));
    messages
}

/// 助手消息若带动作请求，把请求以同一 JSON 协议追加到内容中，让模型看到自己之前的调用
fn render_for_model(message: &Message) -> Message {
    if message.role != Role::Assistant || message.action_requests.is_empty() {
        return message.clone();
    }
    let calls: Vec<ToolCall> = message
        .action_requests
        .iter()
        .map(|r| ToolCall {
            tool: r.name.clone(),
            args: r.arguments.clone(),
            id: Some(r.id.clone()),
        })
        .collect();
    let json = serde_json::json!({ "tool_calls": calls }).to_string();
    let content = if message.content.is_empty() {
        json
    } else {
        format!("{}\n{}", message.content, json)
    };
    Message::assistant(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use schemars::JsonSchema;

    #[test]
    fn test_parse_plain_text() {
        let out = parse_model_output("The answer is 42.", false, true, "call_1").unwrap();
        assert_eq!(out.text, "The answer is 42.");
        assert!(out.actions.is_empty());
    }

    #[test]
    fn test_parse_tool_calls_assigns_ids() {
        let raw = r#"Let me look.
{"tool_calls": [{"tool": "reflect", "args": {"reflection": "x"}}, {"tool": "delegate_research", "args": {"research_topic": "t"}, "id": "mine"}]}"#;
        let out = parse_model_output(raw, false, true, "call_2").unwrap();
        assert_eq!(out.text, "Let me look.");
        assert_eq!(out.actions.len(), 2);
        assert_eq!(out.actions[0].id, "call_2_0");
        assert_eq!(out.actions[0].name, "reflect");
        assert_eq!(out.actions[1].id, "mine");
        assert_eq!(out.actions[1].str_arg("research_topic"), Some("t"));
    }

    #[test]
    fn test_parse_single_tool_form() {
        let raw = "```json\n{\"tool\": \"search\", \"args\": {\"query\": \"rust\"}}\n```";
        let out = parse_model_output(raw, false, true, "step_0").unwrap();
        assert_eq!(out.actions.len(), 1);
        assert_eq!(out.actions[0].id, "step_0_0");
        assert_eq!(out.actions[0].name, "search");
    }

    #[test]
    fn test_parse_structured_requires_json() {
        let err = parse_model_output("no json here", true, false, "call").unwrap_err();
        assert!(matches!(err, ResearchError::InvalidOutput(_)));
        let ok = parse_model_output(r#"{"research_brief": "b"}"#, true, false, "call").unwrap();
        assert_eq!(ok.structured.unwrap()["research_brief"], "b");
    }

    #[test]
    fn test_braces_in_plain_answer_are_text() {
        let out = parse_model_output("Use a set {a, b} here", false, true, "call").unwrap();
        assert_eq!(out.text, "Use a set {a, b} here");
        assert!(out.actions.is_empty());
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Brief {
        research_brief: String,
    }

    #[tokio::test]
    async fn test_structured_retry_with_prompt() {
        let llm = Arc::new(MockLlmClient::scripted(vec![
            "I think the brief is about rust".into(),
            r#"{"research_brief": "Rust async runtimes"}"#.into(),
        ]));
        let reasoner = Reasoner::new(llm.clone());
        let (brief, usage): (Brief, Usage) = reasoner
            .invoke_structured("write a brief", &[Message::user("rust")])
            .await
            .unwrap();
        assert_eq!(brief.research_brief, "Rust async runtimes");
        assert_eq!(llm.calls(), 2);
        assert!(usage.total() > 0);
        let second = &llm.seen()[1];
        assert!(second.last().unwrap().content.contains("could not be parsed"));
    }

    #[tokio::test]
    async fn test_structured_gives_up_after_retries() {
        let llm = Arc::new(MockLlmClient::new(|_| "still not json".into()));
        let reasoner = Reasoner::new(llm.clone()).with_structured_retries(2);
        let result = reasoner
            .invoke_structured::<Brief>("write a brief", &[Message::user("rust")])
            .await;
        assert!(matches!(result, Err(ResearchError::InvalidOutput(_))));
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_actions_are_advertised_and_history_rendered() {
        let llm = Arc::new(MockLlmClient::new(|_| "done".into()));
        let reasoner = Reasoner::new(llm.clone());
        let history = vec![
            Message::user("topic"),
            Message::assistant("").with_action_requests(vec![ActionRequest::new(
                "s_0",
                "search",
                serde_json::json!({"query": "q"}),
            )]),
            Message::tool("s_0", "search", "result"),
        ];
        let req = ReasoningRequest::new("sys", &history)
            .with_actions(vec![ActionSpec::new("search", "web search")]);
        let resp = reasoner.invoke(req).await.unwrap();
        assert_eq!(resp.text, "done");

        let seen = &llm.seen()[0];
        assert!(seen[0].content.contains("## Available actions"));
        assert!(seen[2].content.contains("\"tool_calls\""));
        assert_eq!(seen[3].role, Role::Tool);
    }
}
