//! 工具调度器
//!
//! invoke(tool, payload) 流程：向 Registry 解析存活且具备能力的工具 → 发送请求（每次尝试都有超时）→
//! 超时 / 瞬时传输错误按指数退避重试（base 翻倍，封顶 max）→ 返回结构化 ToolResult。
//! 工具报告的逻辑失败是终态，不重试；任何错误都不会越过这一层抛出。
//! 每次尝试的结果都上报 Registry，并输出一行 JSON 审计日志。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{require_timeout, ConfigError, ErrorKind, StepError};
use crate::tools::{AttemptOutcome, InvokeRequest, ToolRegistry, ToolTransport, TransportError};

/// 指数退避：第 n 次失败后等待 min(base * 2^(n-1), max)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Result<Self, ConfigError> {
        let base = require_timeout("tools.backoff_base_ms", base)?;
        let max = require_timeout("tools.backoff_max_ms", max)?;
        if max < base {
            return Err(ConfigError::invalid(
                "tools.backoff_max_ms",
                "must not be smaller than backoff_base_ms",
            ));
        }
        Ok(Self { base, max })
    }

    /// `failed_attempts` 从 1 开始
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(5),
        }
    }
}

/// 调度默认值：单次尝试超时、总尝试次数、退避
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub timeout: Duration,
    /// 总尝试次数（含第一次）
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl DispatchPolicy {
    pub fn new(timeout: Duration, max_retries: u32, backoff: BackoffPolicy) -> Result<Self, ConfigError> {
        if max_retries == 0 {
            return Err(ConfigError::invalid("tools.max_retries", "must be at least 1"));
        }
        Ok(Self {
            timeout: require_timeout("tools.invoke_timeout_ms", timeout)?,
            max_retries,
            backoff,
        })
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// 单次调用的覆盖项
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub required_capabilities: Vec<String>,
}

/// 调用结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub attempt_count: u32,
    /// 重试预算是否耗尽
    pub exhausted: bool,
    #[serde(rename = "duration_ms", with = "crate::core::duration_ms")]
    pub duration: Duration,
}

impl ToolResult {
    fn success(tool: &str, output: Value, attempt_count: u32, duration: Duration) -> Self {
        Self {
            tool: tool.to_string(),
            success: true,
            output: Some(output),
            error: None,
            attempt_count,
            exhausted: false,
            duration,
        }
    }

    fn failure(tool: &str, error: StepError, attempt_count: u32, exhausted: bool, duration: Duration) -> Self {
        Self {
            tool: tool.to_string(),
            success: false,
            output: None,
            error: Some(error),
            attempt_count,
            exhausted,
            duration,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    transport: Arc<dyn ToolTransport>,
    policy: DispatchPolicy,
}

impl ToolDispatcher {
    /// 使用 Registry 的传输层
    pub fn new(registry: Arc<ToolRegistry>, policy: DispatchPolicy) -> Self {
        let transport = registry.transport();
        Self {
            registry,
            transport,
            policy,
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 显式给出超时与总尝试次数
    pub async fn invoke(
        &self,
        tool: &str,
        payload: Value,
        timeout: Duration,
        max_retries: u32,
    ) -> ToolResult {
        let options = InvokeOptions {
            timeout: Some(timeout),
            max_retries: Some(max_retries),
            required_capabilities: Vec::new(),
        };
        self.invoke_with(tool, payload, &options).await
    }

    pub async fn invoke_with(&self, tool: &str, payload: Value, options: &InvokeOptions) -> ToolResult {
        let start = Instant::now();
        let timeout = options.timeout.unwrap_or(self.policy.timeout);
        let max_retries = options.max_retries.unwrap_or(self.policy.max_retries);
        if timeout.is_zero() || max_retries == 0 {
            return ToolResult::failure(
                tool,
                StepError::new(
                    ErrorKind::Configuration,
                    "invoke timeout and max_retries must be non-zero",
                ),
                0,
                false,
                start.elapsed(),
            );
        }

        let descriptor = match self
            .registry
            .resolve(tool, &options.required_capabilities)
            .await
        {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!(tool = %tool, error = %e, "Tool resolve failed");
                return ToolResult::failure(
                    tool,
                    StepError::new(e.kind(), e.to_string()),
                    0,
                    false,
                    start.elapsed(),
                );
            }
        };

        let preview = payload_preview(&payload);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let request = InvokeRequest::new(tool, payload.clone());
            let attempt_start = Instant::now();
            let result = match tokio::time::timeout(
                timeout,
                self.transport.invoke(&descriptor, &request, timeout),
            )
            .await
            {
                Ok(Ok(response)) => response.check(&request).map(|()| response),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(TransportError::Timeout(timeout)),
            };
            let latency = attempt_start.elapsed();

            let (outcome, failure) = match &result {
                Ok(response) if response.success => (AttemptOutcome::Success, None),
                Ok(response) => (AttemptOutcome::LogicalFailure, response.error.clone()),
                Err(e) if e.is_timeout() => (AttemptOutcome::Timeout, Some(e.to_string())),
                Err(e) => (AttemptOutcome::TransportFailure, Some(e.to_string())),
            };
            self.registry
                .report_outcome(tool, outcome, latency, failure.as_deref())
                .await;
            audit(tool, &request, attempt, outcome, latency, &preview);

            let error = match result {
                Ok(response) if response.success => {
                    return ToolResult::success(
                        tool,
                        response.output.unwrap_or(Value::Null),
                        attempt,
                        start.elapsed(),
                    );
                }
                Ok(response) => {
                    let message = response.error.unwrap_or_default();
                    return ToolResult::failure(
                        tool,
                        StepError::logical(message),
                        attempt,
                        false,
                        start.elapsed(),
                    );
                }
                Err(e) => e,
            };

            let step_error = StepError::new(error.kind(), format!("{tool}: {error}"));
            if !error.is_transient() {
                return ToolResult::failure(tool, step_error, attempt, false, start.elapsed());
            }
            if attempt >= max_retries {
                tracing::warn!(tool = %tool, attempts = attempt, error = %error, "Tool retries exhausted");
                return ToolResult::failure(tool, step_error, attempt, true, start.elapsed());
            }

            let delay = self.policy.backoff.delay_for(attempt);
            tracing::warn!(
                tool = %tool,
                attempt,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient tool failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn audit(
    tool: &str,
    request: &InvokeRequest,
    attempt: u32,
    outcome: AttemptOutcome,
    latency: Duration,
    payload_preview: &str,
) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool,
        "correlation_id": request.correlation_id.to_string(),
        "attempt": attempt,
        "ok": outcome == AttemptOutcome::Success,
        "outcome": outcome.as_str(),
        "duration_ms": latency.as_millis() as u64,
        "payload_preview": payload_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn payload_preview(payload: &Value) -> String {
    let s = payload.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, LocalTransport, RegistryPolicy, Tool};
    use async_trait::async_trait;
    use serde_json::json;

    struct Refuse;

    #[async_trait]
    impl Tool for Refuse {
        fn name(&self) -> &str {
            "refuse"
        }

        fn description(&self) -> &str {
            "always refuses"
        }

        async fn execute(&self, _payload: Value) -> Result<Value, String> {
            Err("bad request".to_string())
        }
    }

    async fn dispatcher() -> (ToolDispatcher, Arc<LocalTransport>) {
        let local = Arc::new(LocalTransport::new());
        local.register(EchoTool);
        local.register(Refuse);
        let registry = Arc::new(ToolRegistry::new(local.clone(), RegistryPolicy::default()));
        for name in local.tool_names() {
            registry.register(local.descriptor(&name).unwrap()).await;
        }
        let policy = DispatchPolicy::new(
            Duration::from_millis(200),
            3,
            BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4)).unwrap(),
        )
        .unwrap();
        (ToolDispatcher::new(registry, policy), local)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let b = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(350)).unwrap();
        assert_eq!(b.delay_for(1), Duration::from_millis(100));
        assert_eq!(b.delay_for(2), Duration::from_millis(200));
        assert_eq!(b.delay_for(3), Duration::from_millis(350));
        assert_eq!(b.delay_for(40), Duration::from_millis(350));
        assert!(BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(5)).is_err());
    }

    #[test]
    fn test_policy_rejects_zero() {
        assert!(DispatchPolicy::new(Duration::ZERO, 3, BackoffPolicy::default()).is_err());
        assert!(DispatchPolicy::new(Duration::from_secs(1), 0, BackoffPolicy::default()).is_err());
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let (dispatcher, _) = dispatcher().await;
        let result = dispatcher
            .invoke_with("echo", json!({"text": "hi"}), &InvokeOptions::default())
            .await;
        assert!(result.success);
        assert_eq!(result.output, Some(json!("hi")));
        assert_eq!(result.attempt_count, 1);
        let d = dispatcher.registry().get("echo").await.unwrap();
        assert_eq!(d.stats.successes, 1);
    }

    #[tokio::test]
    async fn test_logical_failure_is_not_retried() {
        let (dispatcher, _) = dispatcher().await;
        let result = dispatcher.invoke_with("refuse", json!({}), &InvokeOptions::default()).await;
        assert!(!result.success);
        assert_eq!(result.attempt_count, 1);
        assert!(!result.exhausted);
        assert_eq!(result.error_kind(), Some(ErrorKind::LogicalFailure));
    }

    #[tokio::test]
    async fn test_unknown_tool_has_zero_attempts() {
        let (dispatcher, _) = dispatcher().await;
        let result = dispatcher.invoke_with("ghost", json!({}), &InvokeOptions::default()).await;
        assert_eq!(result.attempt_count, 0);
        assert_eq!(result.error_kind(), Some(ErrorKind::ResourceExhausted));
    }

    #[tokio::test]
    async fn test_missing_capability_resolves_to_failure() {
        let (dispatcher, _) = dispatcher().await;
        let options = InvokeOptions {
            required_capabilities: vec!["gpu".to_string()],
            ..Default::default()
        };
        let result = dispatcher.invoke_with("echo", json!({}), &options).await;
        assert!(!result.success);
        assert_eq!(result.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_connection_failures_exhaust_budget() {
        let (dispatcher, local) = dispatcher().await;
        local.set_reachable("echo", false);
        let result = dispatcher
            .invoke("echo", json!({}), Duration::from_millis(50), 2)
            .await;
        assert!(!result.success);
        assert!(result.exhausted);
        assert_eq!(result.attempt_count, 2);
        assert_eq!(result.error_kind(), Some(ErrorKind::TransientCollaborator));
        let d = dispatcher.registry().get("echo").await.unwrap();
        assert_eq!(d.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_zero_budget_is_configuration_failure() {
        let (dispatcher, _) = dispatcher().await;
        let result = dispatcher.invoke("echo", json!({}), Duration::ZERO, 3).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Configuration));
        assert_eq!(result.attempt_count, 0);
    }

    #[test]
    fn test_result_serializes_duration_ms() {
        let result = ToolResult::success("echo", json!(1), 1, Duration::from_millis(12));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["duration_ms"], 12);
        assert!(value.get("error").is_none());
    }
}
