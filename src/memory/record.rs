//! 记忆记录：文本 + 向量 + 元数据

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 记录类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Success,
    Error,
    Fact,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Success => "success",
            RecordKind::Error => "error",
            RecordKind::Fact => "fact",
        }
    }
}

/// 记录元数据；`timestamp` 由 MemoryStore 在写入时按其时钟填写
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub kind: RecordKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_task_id: Option<String>,
    /// 附加属性，如 error_type / tool / step_index
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl RecordMetadata {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            timestamp: DateTime::<Utc>::default(),
            source_task_id: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_source_task(mut self, task_id: impl Into<String>) -> Self {
        self.source_task_id = Some(task_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// 单次写入的选项
#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    /// 覆盖集合声明的 ttl_days
    pub ttl: Option<std::time::Duration>,
}

/// 一条记忆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: RecordMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_expiry: Option<DateTime<Utc>>,
    /// 写入序号，同一时间戳下区分先后
    pub seq: u64,
}

impl MemoryRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_expiry.is_some_and(|expiry| expiry <= now)
    }

    /// 新旧排序键：(timestamp, seq)，越大越新
    pub fn recency_key(&self) -> (DateTime<Utc>, u64) {
        (self.metadata.timestamp, self.seq)
    }
}

/// 检索命中
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: std::sync::Arc<MemoryRecord>,
    pub score: f32,
}
