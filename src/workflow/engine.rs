//! 工作流引擎
//!
//! 顶层状态机 Planning → Executing → Completed | Aborted：
//! - Planning：调用 Planner；空计划 → Aborted(EmptyPlan)，生成失败 → Aborted(PlanningFailed)
//! - Executing：按计划顺序（或按依赖波次）交给 StepExecutor；每个终态步骤写一条记忆、记一条 StepOutcome
//! - 失败策略：abort（默认）在第一个失败步骤处停止；skip_and_continue 把失败步骤标为 skipped 后继续
//! - resource_exhausted 类失败不受策略影响，直接 Aborted(ResourceExhausted)
//! - 取消：在规划前与每个步骤 / 波次之前检查，未执行的步骤标为 skipped
//!
//! 记忆写入失败只记录日志并列入结果，不会中止运行。

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{ConfigError, ErrorKind};
use crate::memory::{MemoryStore, RecordKind, RecordMetadata};
use crate::workflow::events::{EventSink, WorkflowEvent};
use crate::workflow::executor::StepExecutor;
use crate::workflow::graph::StepGraph;
use crate::workflow::planner::Planner;
use crate::workflow::types::*;

const MEMORY_TEXT_LIMIT: usize = 1000;

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub failure_policy: FailurePolicy,
    /// skip_and_continue 下允许的失败步骤数
    pub max_failures: usize,
    /// skip_and_continue 下按依赖波次并发执行
    pub parallel: bool,
    pub max_parallel: usize,
    pub success_collection: String,
    pub error_collection: String,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::invalid("workflow.max_parallel", "must be positive"));
        }
        if self.success_collection.trim().is_empty() || self.error_collection.trim().is_empty() {
            return Err(ConfigError::invalid(
                "memory.success_collection",
                "success / error collection names must be set",
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Abort,
            max_failures: 0,
            parallel: false,
            max_parallel: 4,
            success_collection: "successes".to_string(),
            error_collection: "errors".to_string(),
        }
    }
}

/// 单次运行的覆盖项
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub failure_policy: Option<FailurePolicy>,
    pub cancel: Option<CancellationToken>,
}

/// 一次运行的可变状态，只在 run_with 内部存在
struct RunState<'a> {
    run_id: Uuid,
    task: &'a Task,
    policy: FailurePolicy,
    plan: Plan,
    outcomes: Vec<StepOutcome>,
    memory_failures: Vec<MemoryWriteFailure>,
    failures: usize,
    abort: Option<(AbortReason, String)>,
}

impl<'a> RunState<'a> {
    fn new(run_id: Uuid, task: &'a Task, policy: FailurePolicy) -> Self {
        Self {
            run_id,
            task,
            policy,
            plan: Vec::new(),
            outcomes: Vec::new(),
            memory_failures: Vec::new(),
            failures: 0,
            abort: None,
        }
    }

    fn abort(&mut self, reason: AbortReason, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(run_id = %self.run_id, reason = ?reason, message = %message, "Run aborted");
        self.abort = Some((reason, message));
        for step in &mut self.plan {
            if !step.status.is_terminal() {
                step.status = StepStatus::Skipped;
            }
        }
    }
}

pub struct WorkflowEngine {
    planner: Planner,
    executor: StepExecutor,
    memory: Arc<MemoryStore>,
    config: EngineConfig,
    events: EventSink,
}

impl WorkflowEngine {
    pub fn new(
        planner: Planner,
        executor: StepExecutor,
        memory: Arc<MemoryStore>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            planner,
            executor,
            memory,
            config,
            events: EventSink::none(),
        })
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn run(&self, task: &Task) -> WorkflowResult {
        self.run_with(task, RunOptions::default()).await
    }

    pub async fn run_with(&self, task: &Task, options: RunOptions) -> WorkflowResult {
        let run_id = Uuid::new_v4();
        let policy = options.failure_policy.unwrap_or(self.config.failure_policy);
        let cancel = options.cancel.unwrap_or_default();
        let mut run = RunState::new(run_id, task, policy);

        tracing::info!(run_id = %run_id, task_id = %task.id, policy = ?policy, phase = ?RunPhase::Planning, "Run started");
        if cancel.is_cancelled() {
            run.abort(AbortReason::Cancelled, "cancelled before planning");
            return self.finish(run);
        }

        let plan = match self.planner.plan(task).await {
            Ok(plan) => plan,
            Err(e) => {
                run.abort(AbortReason::PlanningFailed, e.to_string());
                return self.finish(run);
            }
        };
        if plan.is_empty() {
            run.abort(AbortReason::EmptyPlan, "planner produced no steps");
            return self.finish(run);
        }
        let graph = match StepGraph::new(&plan) {
            Ok(graph) => graph,
            Err(e) => {
                run.abort(AbortReason::PlanningFailed, e.to_string());
                return self.finish(run);
            }
        };
        run.plan = plan;
        self.events.emit(WorkflowEvent::PlanReady {
            run_id,
            steps: run.plan.len(),
        });

        tracing::info!(run_id = %run_id, steps = run.plan.len(), phase = ?RunPhase::Executing, "Executing plan");
        if self.config.parallel && policy == FailurePolicy::SkipAndContinue {
            self.execute_waves(&mut run, graph, &cancel).await;
        } else {
            self.execute_sequential(&mut run, &cancel).await;
        }

        self.finish(run)
    }

    async fn execute_sequential(&self, run: &mut RunState<'_>, cancel: &CancellationToken) {
        for index in 0..run.plan.len() {
            if cancel.is_cancelled() {
                run.abort(AbortReason::Cancelled, format!("cancelled before step {index}"));
                return;
            }
            let step = self.start_step(run, index);
            let outcome = self.executor.execute(run.task, &step).await;
            if let Some(reason) = self.record_outcome(run, outcome).await {
                let message = format!("step {index} failed: {}", failure_message(run, index));
                run.abort(reason, message);
                return;
            }
        }
    }

    /// 就绪步骤按波次并发执行；结果按步骤下标依次记录
    async fn execute_waves(&self, run: &mut RunState<'_>, mut graph: StepGraph, cancel: &CancellationToken) {
        let mut ready = graph.initial_ready();
        while !ready.is_empty() {
            if cancel.is_cancelled() {
                run.abort(AbortReason::Cancelled, format!("cancelled before steps {ready:?}"));
                return;
            }
            let steps: Vec<Step> = ready.iter().map(|&index| self.start_step(run, index)).collect();
            let task = run.task;
            let mut outcomes: Vec<StepOutcome> = stream::iter(steps.iter().map(|step| self.executor.execute(task, step)))
                .buffer_unordered(self.config.max_parallel)
                .collect()
                .await;
            outcomes.sort_by_key(|o| o.step_index);

            let mut next = Vec::new();
            let mut abort = None;
            for outcome in outcomes {
                let index = outcome.step_index;
                if let Some(reason) = self.record_outcome(run, outcome).await {
                    abort.get_or_insert((reason, index));
                }
                next.extend(graph.mark_terminal(index));
            }
            // 同一波次的其它结果已记录，之后的波次不再启动
            if let Some((reason, index)) = abort {
                let message = format!("step {index} failed: {}", failure_message(run, index));
                run.abort(reason, message);
                return;
            }
            next.sort_unstable();
            next.dedup();
            ready = next;
        }
    }

    fn start_step(&self, run: &mut RunState<'_>, index: usize) -> Step {
        let step = &mut run.plan[index];
        step.status = StepStatus::Running;
        self.events.emit(WorkflowEvent::StepStarted {
            index,
            description: step.description.clone(),
        });
        step.clone()
    }

    /// 写记忆、更新计划、追加结果；需要中止时返回中止原因
    async fn record_outcome(&self, run: &mut RunState<'_>, mut outcome: StepOutcome) -> Option<AbortReason> {
        let index = outcome.step_index;
        self.write_memory(run, &outcome).await;

        let exhausted = outcome
            .error
            .as_ref()
            .is_some_and(|e| e.kind == ErrorKind::ResourceExhausted);
        let abort = if outcome.success {
            outcome.status = StepStatus::Succeeded;
            None
        } else {
            run.failures += 1;
            match run.policy {
                _ if exhausted => {
                    outcome.status = StepStatus::Failed;
                    Some(AbortReason::ResourceExhausted { index })
                }
                FailurePolicy::Abort => {
                    outcome.status = StepStatus::Failed;
                    Some(AbortReason::StepFailed { index })
                }
                FailurePolicy::SkipAndContinue => {
                    outcome.status = StepStatus::Skipped;
                    None
                }
            }
        };

        run.plan[index].status = outcome.status;
        tracing::info!(
            run_id = %run.run_id,
            step = index,
            status = ?outcome.status,
            attempts = outcome.attempt_count,
            duration_ms = outcome.duration.as_millis() as u64,
            "Step finished"
        );
        self.events.emit(WorkflowEvent::StepFinished {
            index,
            status: outcome.status,
            success: outcome.success,
            attempt_count: outcome.attempt_count,
        });
        run.outcomes.push(outcome);
        abort
    }

    async fn write_memory(&self, run: &mut RunState<'_>, outcome: &StepOutcome) {
        let index = outcome.step_index;
        let step = &run.plan[index];
        let (kind, collection, text) = match &outcome.error {
            None => (
                RecordKind::Success,
                &self.config.success_collection,
                format!(
                    "Task: {}\nStep {}: {}\nResult: {}",
                    run.task.description,
                    index,
                    step.description,
                    truncate(&outcome.output_text(), MEMORY_TEXT_LIMIT)
                ),
            ),
            Some(error) => (
                RecordKind::Error,
                &self.config.error_collection,
                format!(
                    "Task: {}\nStep {}: {}\nError ({}): {}",
                    run.task.description,
                    index,
                    step.description,
                    error.kind,
                    truncate(&error.message, MEMORY_TEXT_LIMIT)
                ),
            ),
        };

        let mut metadata = RecordMetadata::new(kind)
            .with_source_task(run.task.id.clone())
            .with_attribute("run_id", run.run_id.to_string())
            .with_attribute("step_index", index.to_string());
        if let Some(tool) = step.tool_hint() {
            metadata = metadata.with_attribute("tool", tool);
        }
        if let Some(error) = &outcome.error {
            metadata = metadata.with_attribute("error_type", error.kind.as_str());
        }

        match self.memory.insert(collection, &text, metadata).await {
            Ok(record_id) => {
                self.events.emit(WorkflowEvent::MemoryWritten {
                    index,
                    kind,
                    record_id,
                });
            }
            Err(e) => {
                tracing::warn!(run_id = %run.run_id, step = index, error = %e, "Memory write failed");
                self.events.emit(WorkflowEvent::MemoryWriteFailed {
                    index,
                    kind,
                    error: e.to_string(),
                });
                run.memory_failures.push(MemoryWriteFailure {
                    step_index: index,
                    kind,
                    error: e.to_string(),
                });
            }
        }
    }

    fn finish(&self, run: RunState<'_>) -> WorkflowResult {
        let phase = if run.abort.is_some() {
            RunPhase::Aborted
        } else {
            RunPhase::Completed
        };
        let (status, success, reason, abort_reason) = match run.abort {
            Some((abort_reason, message)) => (RunStatus::Aborted, false, Some(message), Some(abort_reason)),
            None => {
                let within_tolerance = match run.policy {
                    FailurePolicy::Abort => run.failures == 0,
                    FailurePolicy::SkipAndContinue => run.failures <= self.config.max_failures,
                };
                let reason = (!within_tolerance).then(|| {
                    format!(
                        "{} failed steps exceed tolerance of {}",
                        run.failures, self.config.max_failures
                    )
                });
                (RunStatus::Completed, within_tolerance, reason, None)
            }
        };

        tracing::info!(
            run_id = %run.run_id,
            task_id = %run.task.id,
            phase = ?phase,
            status = ?status,
            success,
            failures = run.failures,
            "Run finished"
        );
        self.events.emit(WorkflowEvent::RunFinished {
            run_id: run.run_id,
            status,
            success,
        });

        WorkflowResult {
            run_id: run.run_id,
            task_id: run.task.id.clone(),
            status,
            success,
            reason,
            abort_reason,
            plan: run.plan,
            outcomes: run.outcomes,
            memory_failures: run.memory_failures,
        }
    }
}

fn failure_message(run: &RunState<'_>, index: usize) -> String {
    run.outcomes
        .iter()
        .rev()
        .find(|o| o.step_index == index)
        .and_then(|o| o.error.as_ref())
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown error".to_string())
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() > limit {
        format!("{}...", text.chars().take(limit).collect::<String>())
    } else {
        text.to_string()
    }
}
