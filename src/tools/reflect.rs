//! Reflect 工具：记录一次反思，作为观察原样返回

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::Tool;

/// reflect 动作的参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReflectArgs {
    /// 对当前进展、缺口与下一步的反思
    pub reflection: String,
}

/// 反思内容对应的观察文本
pub fn reflection_recorded(reflection: &str) -> String {
    format!("Reflection recorded: {reflection}")
}

/// Reflect 工具
pub struct ReflectTool;

#[async_trait]
impl Tool for ReflectTool {
    fn name(&self) -> &str {
        "reflect"
    }

    fn description(&self) -> &str {
        "Pause to reflect on what was found, what is missing and whether to continue. Args: {\"reflection\": \"...\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(ReflectArgs)).unwrap_or(Value::Null)
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ReflectArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid reflect args: {e}"))?;
        Ok(reflection_recorded(&args.reflection))
    }
}
