//! 工具描述：名称、网络位置、声明能力与存活状态
//!
//! 只由 ToolRegistry 的探测循环与 Dispatcher 的结果上报修改。

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 执行统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStats {
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    /// 最近一次失败的错误信息，成功不清除
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ToolStats {
    pub fn calls(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn avg_latency_ms(&self) -> Option<u64> {
        let calls = self.calls();
        (calls > 0).then(|| self.total_latency_ms / calls)
    }

    pub fn success_rate(&self) -> Option<f64> {
        let calls = self.calls();
        (calls > 0).then(|| self.successes as f64 / calls as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    /// `http(s)://host:port` 或 `local://name`
    pub endpoint: String,
    pub capabilities: BTreeSet<String>,
    pub last_seen_healthy: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: ToolStats,
}

impl ToolDescriptor {
    pub fn new<I, S>(name: impl Into<String>, endpoint: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            last_seen_healthy: None,
            consecutive_failures: 0,
            registered_at: Utc::now(),
            stats: ToolStats::default(),
        }
    }

    pub fn is_available(&self, unhealthy_threshold: u32) -> bool {
        self.consecutive_failures < unhealthy_threshold
    }

    /// 第一个缺失的能力
    pub fn missing_capability<'a>(&self, required: &'a [String]) -> Option<&'a str> {
        required
            .iter()
            .find(|cap| !self.capabilities.contains(cap.as_str()))
            .map(String::as_str)
    }
}

/// 注册表快照中的一项
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    #[serde(flatten)]
    pub descriptor: ToolDescriptor,
    pub available: bool,
}
