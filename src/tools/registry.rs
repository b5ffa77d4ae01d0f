//! 工具注册表
//!
//! 按名称登记工具的网络位置、声明能力与存活状态：
//! - 外层读写锁只保护名称表；每个工具的描述有独立的互斥锁，不同工具的更新互不阻塞
//! - 探测循环按固定间隔并发探测所有工具，与调用流量无关
//! - `consecutive_failures` 达到阈值即视为不可用，下一次探测成功即恢复

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::{require_timeout, ConfigError, ErrorKind};
use crate::tools::{ToolDescriptor, ToolStatus, ToolTransport};

/// 探测与健康判定策略
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryPolicy {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub unhealthy_threshold: u32,
}

impl RegistryPolicy {
    pub fn new(
        probe_interval: Duration,
        probe_timeout: Duration,
        unhealthy_threshold: u32,
    ) -> Result<Self, ConfigError> {
        if unhealthy_threshold == 0 {
            return Err(ConfigError::invalid("tools.unhealthy_threshold", "must be positive"));
        }
        Ok(Self {
            probe_interval: require_timeout("tools.probe_interval_secs", probe_interval)?,
            probe_timeout: require_timeout("tools.probe_timeout_ms", probe_timeout)?,
            unhealthy_threshold,
        })
    }
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool `{0}` is not registered")]
    ToolNotFound(String),

    #[error("tool `{tool}` is unavailable: {reason}")]
    ToolUnavailable { tool: String, reason: String },
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ResourceExhausted
    }
}

/// 一次调用尝试的结果，由 Dispatcher 上报
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 工具成功响应
    Success,
    /// 工具响应了，但报告无法满足请求
    LogicalFailure,
    Timeout,
    /// 连接失败、异常状态码或格式错误
    TransportFailure,
}

impl AttemptOutcome {
    /// 工具是否给出了有效响应
    pub fn responded(self) -> bool {
        matches!(self, AttemptOutcome::Success | AttemptOutcome::LogicalFailure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Success => "ok",
            AttemptOutcome::LogicalFailure => "error",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::TransportFailure => "transport_error",
        }
    }
}

type Entry = Arc<Mutex<ToolDescriptor>>;

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Entry>>,
    transport: Arc<dyn ToolTransport>,
    policy: RegistryPolicy,
}

impl ToolRegistry {
    pub fn new(transport: Arc<dyn ToolTransport>, policy: RegistryPolicy) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            transport,
            policy,
        }
    }

    pub fn policy(&self) -> &RegistryPolicy {
        &self.policy
    }

    pub fn transport(&self) -> Arc<dyn ToolTransport> {
        Arc::clone(&self.transport)
    }

    async fn entry(&self, name: &str) -> Option<Entry> {
        self.tools.read().await.get(name).cloned()
    }

    /// 按名称幂等 upsert；endpoint 不变时保留健康状态与统计，返回是否为新工具
    pub async fn register(&self, descriptor: ToolDescriptor) -> bool {
        let existing = {
            let mut tools = self.tools.write().await;
            match tools.get(&descriptor.name) {
                Some(entry) => Arc::clone(entry),
                None => {
                    tracing::info!(
                        tool = %descriptor.name,
                        endpoint = %descriptor.endpoint,
                        capabilities = ?descriptor.capabilities,
                        "Tool registered"
                    );
                    tools.insert(descriptor.name.clone(), Arc::new(Mutex::new(descriptor)));
                    return true;
                }
            }
        };

        let mut current = existing.lock().await;
        if current.endpoint == descriptor.endpoint {
            current.capabilities = descriptor.capabilities;
        } else {
            tracing::info!(
                tool = %descriptor.name,
                from = %current.endpoint,
                to = %descriptor.endpoint,
                "Tool endpoint changed, health reset"
            );
            *current = descriptor;
        }
        false
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.tools.write().await.remove(name).is_some();
        if removed {
            tracing::info!(tool = %name, "Tool unregistered");
        }
        removed
    }

    pub async fn get(&self, name: &str) -> Option<ToolDescriptor> {
        match self.entry(name).await {
            Some(entry) => Some(entry.lock().await.clone()),
            None => None,
        }
    }

    pub async fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// 找到一个存活且具备所需能力的工具；先查能力，再查健康
    pub async fn resolve(
        &self,
        name: &str,
        required_capabilities: &[String],
    ) -> Result<ToolDescriptor, RegistryError> {
        let entry = self
            .entry(name)
            .await
            .ok_or_else(|| RegistryError::ToolNotFound(name.to_string()))?;
        let descriptor = entry.lock().await.clone();

        if let Some(missing) = descriptor.missing_capability(required_capabilities) {
            return Err(RegistryError::ToolUnavailable {
                tool: name.to_string(),
                reason: format!("missing capability `{missing}`"),
            });
        }
        if !descriptor.is_available(self.policy.unhealthy_threshold) {
            return Err(RegistryError::ToolUnavailable {
                tool: name.to_string(),
                reason: format!(
                    "{} consecutive failures (threshold {})",
                    descriptor.consecutive_failures, self.policy.unhealthy_threshold
                ),
            });
        }
        Ok(descriptor)
    }

    /// Dispatcher 上报一次尝试的结果与失败信息；工具已被注销时忽略
    pub async fn report_outcome(
        &self,
        name: &str,
        outcome: AttemptOutcome,
        latency: Duration,
        error: Option<&str>,
    ) {
        let Some(entry) = self.entry(name).await else {
            tracing::debug!(tool = %name, outcome = outcome.as_str(), "Outcome for unknown tool ignored");
            return;
        };
        let mut descriptor = entry.lock().await;
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        descriptor.stats.total_latency_ms = descriptor.stats.total_latency_ms.saturating_add(latency_ms);
        if outcome == AttemptOutcome::Success {
            descriptor.stats.successes += 1;
        } else {
            descriptor.stats.failures += 1;
            descriptor.stats.last_error = Some(
                error
                    .filter(|e| !e.is_empty())
                    .unwrap_or(outcome.as_str())
                    .to_string(),
            );
        }

        if outcome.responded() {
            descriptor.consecutive_failures = 0;
            descriptor.last_seen_healthy = Some(Utc::now());
        } else {
            descriptor.consecutive_failures = descriptor.consecutive_failures.saturating_add(1);
            if descriptor.consecutive_failures == self.policy.unhealthy_threshold {
                tracing::warn!(
                    tool = %name,
                    failures = descriptor.consecutive_failures,
                    "Tool marked unavailable"
                );
            }
        }
    }

    async fn record_probe(&self, name: &str, healthy: bool) {
        let Some(entry) = self.entry(name).await else {
            tracing::debug!(tool = %name, "Probe result for unknown tool ignored");
            return;
        };
        let mut descriptor = entry.lock().await;
        if healthy {
            if !descriptor.is_available(self.policy.unhealthy_threshold) {
                tracing::info!(tool = %name, "Tool restored by probe");
            }
            descriptor.consecutive_failures = 0;
            descriptor.last_seen_healthy = Some(Utc::now());
        } else {
            descriptor.consecutive_failures = descriptor.consecutive_failures.saturating_add(1);
        }
    }

    /// 探测单个工具，返回是否健康；未注册时为 None
    pub async fn probe(&self, name: &str) -> Option<bool> {
        let descriptor = self.get(name).await?;
        let start = Instant::now();
        let timeout = self.policy.probe_timeout;
        let healthy = match tokio::time::timeout(timeout, self.transport.probe(&descriptor, timeout)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(tool = %name, error = %e, "Probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(tool = %name, "Probe timed out");
                false
            }
        };
        self.record_probe(name, healthy).await;
        tracing::trace!(tool = %name, healthy, duration_ms = start.elapsed().as_millis() as u64, "Probe");
        Some(healthy)
    }

    /// 并发探测所有工具，返回 (名称, 是否健康)，按名称排序
    pub async fn probe_all(&self) -> Vec<(String, bool)> {
        let names = self.tool_names().await;
        let results = join_all(names.iter().map(|name| self.probe(name))).await;
        names
            .into_iter()
            .zip(results)
            .filter_map(|(name, healthy)| healthy.map(|h| (name, h)))
            .collect()
    }

    /// 固定间隔的探测循环，token 取消后退出
    pub fn spawn_probe_loop(self: &Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = self.policy.probe_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("Probe loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let results = registry.probe_all().await;
                        let unhealthy = results.iter().filter(|(_, ok)| !ok).count();
                        tracing::debug!(tools = results.len(), unhealthy, "Probe round finished");
                    }
                }
            }
        })
    }

    /// 所有工具及其可用性，按名称排序
    pub async fn snapshot(&self) -> Vec<ToolStatus> {
        let entries: Vec<Entry> = self.tools.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            let descriptor = entry.lock().await.clone();
            let available = descriptor.is_available(self.policy.unhealthy_threshold);
            statuses.push(ToolStatus {
                descriptor,
                available,
            });
        }
        statuses.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, LocalTransport};

    fn setup(threshold: u32) -> (Arc<ToolRegistry>, Arc<LocalTransport>) {
        let local = Arc::new(LocalTransport::new());
        local.register(EchoTool);
        let policy = RegistryPolicy::new(Duration::from_millis(20), Duration::from_millis(50), threshold).unwrap();
        (Arc::new(ToolRegistry::new(local.clone(), policy)), local)
    }

    #[test]
    fn test_policy_rejects_zero() {
        assert!(RegistryPolicy::new(Duration::ZERO, Duration::from_secs(1), 3).is_err());
        assert!(RegistryPolicy::new(Duration::from_secs(1), Duration::ZERO, 3).is_err());
        assert!(RegistryPolicy::new(Duration::from_secs(1), Duration::from_secs(1), 0).is_err());
    }

    #[tokio::test]
    async fn test_register_is_idempotent_upsert() {
        let (registry, local) = setup(3);
        let d = local.descriptor("echo").unwrap();
        assert!(registry.register(d.clone()).await);
        registry.report_outcome("echo", AttemptOutcome::Timeout, Duration::ZERO, None).await;
        assert!(!registry.register(d.clone()).await);
        // endpoint 不变：保留健康状态
        assert_eq!(registry.get("echo").await.unwrap().consecutive_failures, 1);

        let moved = ToolDescriptor::new("echo", "http://elsewhere", ["text"]);
        registry.register(moved).await;
        let current = registry.get("echo").await.unwrap();
        assert_eq!(current.endpoint, "http://elsewhere");
        assert_eq!(current.consecutive_failures, 0);
        assert_eq!(registry.tool_names().await, vec!["echo"]);
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let (registry, local) = setup(2);
        assert!(matches!(
            registry.resolve("missing", &[]).await,
            Err(RegistryError::ToolNotFound(_))
        ));

        registry.register(local.descriptor("echo").unwrap()).await;
        let err = registry.resolve("echo", &["gpu".to_string()]).await.unwrap_err();
        assert!(matches!(err, RegistryError::ToolUnavailable { ref reason, .. } if reason.contains("gpu")));

        registry.report_outcome("echo", AttemptOutcome::Timeout, Duration::ZERO, None).await;
        assert!(registry.resolve("echo", &["text".to_string()]).await.is_ok());
        registry.report_outcome("echo", AttemptOutcome::TransportFailure, Duration::ZERO, None).await;
        let err = registry.resolve("echo", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_logical_failure_resets_consecutive_failures() {
        let (registry, local) = setup(3);
        registry.register(local.descriptor("echo").unwrap()).await;
        registry.report_outcome("echo", AttemptOutcome::Timeout, Duration::from_millis(10), None).await;
        registry.report_outcome("echo", AttemptOutcome::LogicalFailure, Duration::from_millis(10), None).await;
        let d = registry.get("echo").await.unwrap();
        assert_eq!(d.consecutive_failures, 0);
        assert_eq!(d.stats.failures, 2);
        assert_eq!(d.stats.total_latency_ms, 20);
        assert!(d.last_seen_healthy.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_reports_last_error() {
        let (registry, local) = setup(3);
        registry.register(local.descriptor("echo").unwrap()).await;
        registry
            .report_outcome("echo", AttemptOutcome::LogicalFailure, Duration::ZERO, Some("quota exceeded"))
            .await;
        registry.report_outcome("echo", AttemptOutcome::Success, Duration::ZERO, None).await;

        let status = registry.snapshot().await;
        assert_eq!(status[0].descriptor.stats.last_error.as_deref(), Some("quota exceeded"));
        let value = serde_json::to_value(&status[0]).unwrap();
        assert_eq!(value["stats"]["last_error"], "quota exceeded");

        registry.report_outcome("echo", AttemptOutcome::Timeout, Duration::ZERO, None).await;
        let d = registry.get("echo").await.unwrap();
        assert_eq!(d.stats.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_probe_restores_and_degrades() {
        let (registry, local) = setup(1);
        registry.register(local.descriptor("echo").unwrap()).await;

        local.set_reachable("echo", false);
        assert_eq!(registry.probe_all().await, vec![("echo".to_string(), false)]);
        assert!(registry.resolve("echo", &[]).await.is_err());

        local.set_reachable("echo", true);
        assert_eq!(registry.probe("echo").await, Some(true));
        assert!(registry.resolve("echo", &[]).await.is_ok());
        assert_eq!(registry.probe("ghost").await, None);
    }

    #[tokio::test]
    async fn test_unknown_report_ignored_and_unregister() {
        let (registry, local) = setup(3);
        registry.report_outcome("ghost", AttemptOutcome::Success, Duration::ZERO, None).await;
        registry.register(local.descriptor("echo").unwrap()).await;
        assert!(registry.unregister("echo").await);
        assert!(!registry.unregister("echo").await);
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_probe_loop_runs_until_cancelled() {
        let (registry, local) = setup(1);
        registry.register(local.descriptor("echo").unwrap()).await;
        local.set_reachable("echo", false);

        let token = CancellationToken::new();
        let handle = registry.spawn_probe_loop(token.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let status = registry.snapshot().await;
        assert!(!status[0].available);

        token.cancel();
        handle.await.unwrap();
    }
}
