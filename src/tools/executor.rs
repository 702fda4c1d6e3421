//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(tool_name, args) 在超时内调用 registry.execute，
//! 超时或失败时转为 ResearchError::ActionExecution；每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::ResearchError;
use crate::react::ActionSpec;
use crate::tools::ToolRegistry;

/// 工具执行器：对每次调用施加超时，并将结果映射为 ResearchError
#[derive(Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 执行指定工具；未知工具、超时或工具返回 Err 都是 ActionExecution；输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: serde_json::Value) -> Result<String, ResearchError> {
        if self.registry.get(tool_name).is_none() {
            return Err(ResearchError::action(tool_name, "unknown action"));
        }
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, self.registry.execute(tool_name, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(ResearchError::action(tool_name, e)),
            Err(_) => Err(ResearchError::action(
                tool_name,
                format!("timed out after {}s", self.timeout.as_secs()),
            )),
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn action_specs(&self) -> Vec<ActionSpec> {
        self.registry.action_specs()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Slow;

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    struct Failing;

    #[async_trait]
    impl Tool for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Err("HTTP 500".into())
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_action_error() {
        let mut registry = ToolRegistry::new();
        registry.register(Slow);
        let executor = ToolExecutor::new(registry, 1);
        let err = executor.execute("slow", Value::Null).await.unwrap_err();
        match err {
            ResearchError::ActionExecution { name, reason } => {
                assert_eq!(name, "slow");
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failure_and_unknown_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Failing);
        let executor = ToolExecutor::new(registry, 5);
        let err = executor.execute("failing", Value::Null).await.unwrap_err();
        assert!(err.to_string().contains("HTTP 500"));
        let err = executor.execute("missing", Value::Null).await.unwrap_err();
        assert!(err.to_string().contains("unknown action"));
    }
}
