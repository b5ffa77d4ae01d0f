//! 测试替身（无需 API）
//!
//! - `ScriptedLlmClient`：按顺序吐出预设回复，记录收到的 prompt；脚本用完后回显最后一段 prompt。
//! - `HashingEmbedder`：词袋哈希到固定维度并归一化，同一文本永远得到同一向量；可切换为不可用。

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{EmbeddingError, EmbeddingProvider, GenerationRequest, LlmClient, LlmError};

/// 按脚本回复的生成客户端
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次回复给定文本
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new();
        for r in responses {
            client.push_ok(r);
        }
        client
    }

    pub fn push_ok(&self, text: impl Into<String>) {
        self.push(Ok(text.into()));
    }

    pub fn push_err(&self, err: LlmError) {
        self.push(Err(err));
    }

    fn push(&self, item: Result<String, LlmError>) {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(item);
    }

    /// 已收到的 prompt（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.prompt.clone());

        let next = self
            .script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        match next {
            Some(item) => item,
            None => {
                let last_line = request.prompt.lines().last().unwrap_or("(no input)");
                Ok(format!("Echo from Mock: {last_line}"))
            }
        }
    }
}

/// 确定性的词袋哈希嵌入
#[derive(Debug)]
pub struct HashingEmbedder {
    dimension: usize,
    available: AtomicBool,
    calls: AtomicUsize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// 关闭后 embed 返回传输错误，模拟嵌入服务宕机
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let bucket = (hasher.finish() % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Transport("embedder offline".to_string()));
        }
        Ok(self.vectorize(text))
    }
}
