//! 文本生成协作方的请求 / 响应契约
//!
//! 内核不关心模型身份，只发送 {prompt, 解码参数, 超时}，拿回文本或结构化失败（超时 / 传输错误 / 拒绝）。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{require_timeout, ConfigError, ErrorKind, StepError};

/// 解码参数与超时，由配置生成，Planner 与 StepExecutor 共用
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl GenerationParams {
    /// 超时为零视为配置错误
    pub fn new(temperature: f32, max_tokens: u32, timeout: Duration) -> Result<Self, ConfigError> {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::invalid(
                "llm.temperature",
                format!("{temperature} is outside 0.0..=2.0"),
            ));
        }
        if max_tokens == 0 {
            return Err(ConfigError::invalid("llm.max_tokens", "must be positive"));
        }
        Ok(Self {
            temperature,
            max_tokens,
            timeout: require_timeout("llm.timeout_secs", timeout)?,
        })
    }
}

/// 一次生成请求
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// 可选的 system 提示
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, params: &GenerationParams) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            timeout: params.timeout,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// 生成失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    /// 模型完成了调用但拒绝回答
    #[error("generation refused: {0}")]
    Refusal(String),

    /// 服务端拒绝了请求本身（参数、鉴权、上下文长度等）
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl LlmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::Timeout(_) | LlmError::Transport(_) => ErrorKind::TransientCollaborator,
            LlmError::Refusal(_) | LlmError::Rejected(_) => ErrorKind::LogicalFailure,
        }
    }
}

impl From<&LlmError> for StepError {
    fn from(err: &LlmError) -> Self {
        StepError::new(err.kind(), err.to_string())
    }
}

/// LLM 客户端 trait：所有后端（OpenAI 兼容 / Mock）实现 generate
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError>;

    /// 累计 token 使用：(prompt, completion, total)，默认不统计
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 在请求自带的超时内调用生成；后端自身没有超时也能保证有界返回
pub async fn generate_with_timeout(
    client: &dyn LlmClient,
    request: &GenerationRequest,
) -> Result<String, LlmError> {
    match tokio::time::timeout(request.timeout, client.generate(request)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(request.timeout)),
    }
}
