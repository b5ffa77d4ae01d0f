//! Echo 工具（测试与离线运行用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

/// 回显 `text` 字段；没有时回显步骤描述 `step`
pub struct EchoTool;

impl EchoTool {
    pub const NAME: &'static str = "echo";
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Echo text (for testing). Payload: {\"text\": \"message\"}"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["text".to_string()]
    }

    async fn execute(&self, payload: Value) -> Result<Value, String> {
        let text = payload
            .get("text")
            .or_else(|| payload.get("step"))
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(Value::String(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_prefers_text_then_step() {
        assert_eq!(EchoTool.execute(json!({"text": "a", "step": "b"})).await.unwrap(), "a");
        assert_eq!(EchoTool.execute(json!({"step": "b"})).await.unwrap(), "b");
        assert_eq!(EchoTool.execute(json!({})).await.unwrap(), "(empty)");
    }
}
