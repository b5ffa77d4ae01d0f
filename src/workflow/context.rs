//! 记忆召回：为规划与生成步骤拼接相似的历史成功 / 失败

use std::sync::Arc;

use crate::memory::{MemoryStore, RecordKind, SearchHit};

/// 召回目标：成功 / 失败各自的集合与条数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecallTargets {
    pub success_collection: String,
    pub error_collection: String,
    pub k: usize,
}

impl Default for RecallTargets {
    fn default() -> Self {
        Self {
            success_collection: "successes".to_string(),
            error_collection: "errors".to_string(),
            k: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Recall {
    pub successes: Vec<SearchHit>,
    pub errors: Vec<SearchHit>,
}

const PREVIEW_CHARS: usize = 300;

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

impl Recall {
    pub fn is_empty(&self) -> bool {
        self.successes.is_empty() && self.errors.is_empty()
    }

    /// 拼成 prompt 段落；没有召回时为空串
    pub fn to_prompt_section(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut section = String::new();
        if !self.successes.is_empty() {
            section.push_str("## Similar past successes\n");
            for hit in &self.successes {
                section.push_str(&format!("- ({:.2}) {}\n", hit.score, preview(&hit.record.text)));
            }
        }
        if !self.errors.is_empty() {
            section.push_str("## Past errors to avoid\n");
            for hit in &self.errors {
                let error_type = hit
                    .record
                    .metadata
                    .attributes
                    .get("error_type")
                    .map(String::as_str)
                    .unwrap_or("unknown");
                section.push_str(&format!(
                    "- ({:.2}) [{}] {}\n",
                    hit.score,
                    error_type,
                    preview(&hit.record.text)
                ));
            }
        }
        section
    }
}

/// 检索失败（嵌入服务不可用等）降级为无上下文
pub async fn recall(store: Option<&Arc<MemoryStore>>, targets: &RecallTargets, query: &str) -> Recall {
    let Some(store) = store else {
        return Recall::default();
    };
    let successes = search_or_warn(store, &targets.success_collection, query, targets.k, RecordKind::Success).await;
    let errors = search_or_warn(store, &targets.error_collection, query, targets.k, RecordKind::Error).await;
    Recall { successes, errors }
}

async fn search_or_warn(
    store: &MemoryStore,
    collection: &str,
    query: &str,
    k: usize,
    kind: RecordKind,
) -> Vec<SearchHit> {
    match store.search(collection, query, k, Some(kind)).await {
        Ok(hits) => hits,
        Err(e) => {
            tracing::warn!(collection = %collection, error = %e, "Memory recall failed, continuing without context");
            Vec::new()
        }
    }
}
