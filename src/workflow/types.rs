//! 工作流类型定义
//!
//! Task（不可变输入）、Plan / Step（引擎独占）、StepOutcome（每个终态步骤一条）与运行结果

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{ErrorKind, StepError};
use crate::memory::RecordKind;

/// 任务：自由文本描述 + 可选结构化约束；一次运行内不修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub constraints: Value,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            constraints: Value::Null,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_constraints(mut self, constraints: Value) -> Self {
        self.constraints = constraints;
        self
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// 步骤动作：工具调用或直接生成
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Tool { name: String },
    Generate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 计划内下标，从 0 开始
    pub index: usize,
    pub description: String,
    pub action: StepAction,
    /// 依赖的更早步骤下标
    #[serde(default)]
    pub depends_on: Vec<usize>,
    pub status: StepStatus,
}

impl Step {
    pub fn new(index: usize, description: impl Into<String>, tool_hint: Option<String>) -> Self {
        Self {
            index,
            description: description.into(),
            action: match tool_hint {
                Some(name) => StepAction::Tool { name },
                None => StepAction::Generate,
            },
            depends_on: Vec::new(),
            status: StepStatus::Pending,
        }
    }

    pub fn with_depends_on(mut self, depends_on: Vec<usize>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn tool_hint(&self) -> Option<&str> {
        match &self.action {
            StepAction::Tool { name } => Some(name),
            StepAction::Generate => None,
        }
    }
}

pub type Plan = Vec<Step>;

/// 单个终态步骤的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_index: usize,
    pub status: StepStatus,
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(rename = "duration_ms", with = "crate::core::duration_ms")]
    pub duration: Duration,
    pub attempt_count: u32,
}

impl StepOutcome {
    pub fn succeeded(step_index: usize, output: Value, duration: Duration, attempt_count: u32) -> Self {
        Self {
            step_index,
            status: StepStatus::Succeeded,
            success: true,
            output,
            error: None,
            duration,
            attempt_count,
        }
    }

    pub fn failed(step_index: usize, error: StepError, duration: Duration, attempt_count: u32) -> Self {
        Self {
            step_index,
            status: StepStatus::Failed,
            success: false,
            output: Value::Null,
            error: Some(error),
            duration,
            attempt_count,
        }
    }

    /// 输出的文本形式（写入记忆用）
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// 步骤失败时的处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Abort,
    SkipAndContinue,
}

/// 运行终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted,
}

/// 运行阶段：Planning → Executing → Completed | Aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Planning,
    Executing,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AbortReason {
    EmptyPlan,
    PlanningFailed,
    StepFailed { index: usize },
    /// 步骤所需的工具或资源不可用，任何失败策略下都中止
    ResourceExhausted { index: usize },
    Cancelled,
}

/// 未写入成功的记忆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryWriteFailure {
    pub step_index: usize,
    pub kind: RecordKind,
    pub error: String,
}

/// 一次运行的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub task_id: String,
    pub status: RunStatus,
    pub success: bool,
    /// 非 Completed 或 success=false 时的可读原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<AbortReason>,
    pub plan: Plan,
    pub outcomes: Vec<StepOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memory_failures: Vec<MemoryWriteFailure>,
}

impl WorkflowResult {
    pub fn failure_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }
}

/// 工作流错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("planning failed: {0}")]
    Planning(StepError),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Planning(e) => e.kind,
            WorkflowError::InvalidPlan(_) => ErrorKind::DataIntegrity,
        }
    }
}
