//! 运行过程事件：供调用方实时展示计划、步骤进度与记忆写入

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::memory::RecordKind;
use crate::workflow::types::{RunStatus, StepStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    PlanReady { run_id: Uuid, steps: usize },
    StepStarted { index: usize, description: String },
    StepFinished {
        index: usize,
        status: StepStatus,
        success: bool,
        attempt_count: u32,
    },
    MemoryWritten {
        index: usize,
        kind: RecordKind,
        record_id: Uuid,
    },
    MemoryWriteFailed {
        index: usize,
        kind: RecordKind,
        error: String,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        success: bool,
    },
}

/// 可选的事件发送端；接收端已关闭时静默丢弃
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<WorkflowEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: WorkflowEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
