//! Search 工具：调用 Tavily 搜索 API
//!
//! POST {endpoint}，按 URL 去重后格式化为带编号的来源列表；单条内容超过 max_result_chars 时截断并追加 ...[truncated]。
//! 未配置 API Key 时返回错误（由 ToolExecutor 转为 ActionExecution）。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SearchSection;
use crate::tools::Tool;

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    query: &'a str,
    max_results: usize,
    topic: &'a str,
    include_raw_content: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

/// Search 工具
pub struct SearchTool {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    max_results: usize,
    max_result_chars: usize,
}

impl SearchTool {
    pub fn new(section: &SearchSection) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(section.timeout_secs))
            .user_agent(concat!("delve/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        let api_key = section
            .api_key
            .clone()
            .or_else(|| std::env::var("TAVILY_API_KEY").ok())
            .filter(|k| !k.is_empty());
        Self {
            client,
            endpoint: section.endpoint.clone(),
            api_key,
            max_results: section.max_results,
            max_result_chars: section.max_result_chars,
        }
    }

    async fn search(&self, query: &str, max_results: usize, topic: &str) -> Result<Vec<SearchHit>, String> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| "search is not configured (missing TAVILY_API_KEY)".to_string())?;
        let body = TavilyRequest {
            query,
            max_results,
            topic,
            include_raw_content: false,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let parsed: TavilyResponse = resp
            .json()
            .await
            .map_err(|e| format!("Decode body: {}", e))?;
        Ok(parsed.results)
    }
}

/// 按 URL 去重并格式化为文本
pub fn format_hits(hits: &[SearchHit], max_chars: usize) -> String {
    let mut seen = HashSet::new();
    let unique: Vec<&SearchHit> = hits.iter().filter(|h| seen.insert(h.url.as_str())).collect();
    if unique.is_empty() {
        return "No valid search results found. Please try different search queries.".to_string();
    }

    let mut out = format!("Search results ({}):\n\n", unique.len());
    for (i, hit) in unique.iter().enumerate() {
        let content = if hit.content.chars().count() > max_chars {
            hit.content.chars().take(max_chars).collect::<String>() + "\n...[truncated]"
        } else {
            hit.content.clone()
        };
        out.push_str(&format!(
            "--- SOURCE {}: {} ---\nURL: {}\n\nSUMMARY:\n{}\n\n",
            i + 1,
            hit.title,
            hit.url,
            content
        ));
        out.push_str(&"-".repeat(80));
        out.push('\n');
    }
    out
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Web search for comprehensive, accurate and current results. Args: {\"query\": \"...\", \"max_results\": 3, \"topic\": \"general|news|finance\"}."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "A single search query"},
                "max_results": {"type": "integer", "minimum": 1},
                "topic": {"type": "string", "enum": ["general", "news", "finance"]}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        if query.is_empty() {
            return Err("Missing query".to_string());
        }
        let max_results = args
            .get("max_results")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(self.max_results);
        let topic = args.get("topic").and_then(|v| v.as_str()).unwrap_or("general");
        tracing::info!(query = %query, max_results, "search tool query");
        let hits = self.search(query, max_results, topic).await?;
        Ok(format_hits(&hits, self.max_result_chars))
    }
}
