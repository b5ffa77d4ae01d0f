//! 跨进程工具协议
//!
//! 请求 `{tool, payload, correlation_id}`，响应 `{correlation_id, success, output | error}`。
//! 存活探测不带 payload，只要求有界时间内的确认。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::tools::TransportError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub tool: String,
    pub payload: Value,
    pub correlation_id: Uuid,
}

impl InvokeRequest {
    /// 每次尝试使用新的 correlation_id
    pub fn new(tool: impl Into<String>, payload: Value) -> Self {
        Self {
            tool: tool.into(),
            payload,
            correlation_id: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub correlation_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InvokeResponse {
    pub fn ok(correlation_id: Uuid, output: Value) -> Self {
        Self {
            correlation_id,
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(correlation_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            correlation_id,
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    /// 校验响应与请求对应
    pub fn check(&self, request: &InvokeRequest) -> Result<(), TransportError> {
        if self.correlation_id != request.correlation_id {
            return Err(TransportError::CorrelationMismatch {
                expected: request.correlation_id,
                actual: self.correlation_id,
            });
        }
        if !self.success && self.error.as_deref().map_or(true, str::is_empty) {
            return Err(TransportError::Malformed(
                "failure response without error message".to_string(),
            ));
        }
        Ok(())
    }
}

/// 健康探测应答；空响应体或无 `status` 视为健康
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeAck {
    #[serde(default)]
    pub status: Option<String>,
}

impl ProbeAck {
    /// 宽松解析：非 JSON 响应体按无 status 处理
    pub fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    pub fn is_healthy(&self) -> bool {
        match self.status.as_deref() {
            None => true,
            Some(status) => matches!(
                status.to_ascii_lowercase().as_str(),
                "ok" | "healthy" | "up" | "ready"
            ),
        }
    }
}
