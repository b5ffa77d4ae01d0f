//! 错误分类与结构化错误
//!
//! 各组件有自己的错误枚举（MemoryError / RegistryError / TransportError / LlmError ...），
//! 统一通过 `kind()` 映射到 ErrorKind，由 Dispatcher / StepExecutor 决定是否重试，由 WorkflowEngine 决定终态。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误分类：决定重试与上报方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 配置错误，启动时即失败
    Configuration,
    /// 与外部服务通信的瞬时错误（网络 / 超时），按组件策略重试
    TransientCollaborator,
    /// 工具或生成调用已完成但报告无法满足请求，不重试
    LogicalFailure,
    /// 维度不一致、响应格式错误等，不重试
    DataIntegrity,
    /// 没有可用资源（无可用工具、无可淘汰记录）
    ResourceExhausted,
    /// 运行被取消
    Cancelled,
}

impl ErrorKind {
    /// 仅瞬时错误允许在组件内部重试
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientCollaborator)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::TransientCollaborator => "transient_collaborator",
            ErrorKind::LogicalFailure => "logical_failure",
            ErrorKind::DataIntegrity => "data_integrity",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 结构化错误：随 ToolResult / StepOutcome 返回，并写入错误记忆
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientCollaborator, message)
    }

    pub fn logical(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LogicalFailure, message)
    }

    pub fn data_integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataIntegrity, message)
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }
}

/// 配置错误：超时为零、维度缺失、集合重复等，启动阶段即报错
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("timeout `{0}` must be set and non-zero")]
    ZeroTimeout(String),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// 超时参数校验：缺失或为零都视为配置错误
pub fn require_timeout(
    field: &str,
    timeout: std::time::Duration,
) -> Result<std::time::Duration, ConfigError> {
    if timeout.is_zero() {
        Err(ConfigError::ZeroTimeout(field.to_string()))
    } else {
        Ok(timeout)
    }
}
