//! StepExecutor：执行单个步骤
//!
//! - 工具步骤：交给 ToolDispatcher（其内部负责超时与重试），结果映射为 succeeded / failed
//! - 生成步骤：以步骤描述 + 召回的记忆为条件调用生成协作方；任何成功返回的文本都算成功；
//!   瞬时错误在 `generation_retries` 预算内按退避重试，拒绝回答不重试

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use crate::core::StepError;
use crate::llm::{generate_with_timeout, GenerationParams, GenerationRequest, LlmClient};
use crate::memory::MemoryStore;
use crate::tools::{BackoffPolicy, InvokeOptions, ToolDispatcher};
use crate::workflow::context::{recall, RecallTargets};
use crate::workflow::types::{Step, StepAction, StepOutcome, Task};

const STEP_SYSTEM_PROMPT: &str = "You are executing one step of a larger task. \
Carry out the step and reply with its result only.";

pub struct StepExecutor {
    dispatcher: Arc<ToolDispatcher>,
    llm: Arc<dyn LlmClient>,
    params: GenerationParams,
    memory: Option<Arc<MemoryStore>>,
    recall: RecallTargets,
    generation_retries: u32,
    backoff: BackoffPolicy,
}

impl StepExecutor {
    pub fn new(dispatcher: Arc<ToolDispatcher>, llm: Arc<dyn LlmClient>, params: GenerationParams) -> Self {
        let backoff = dispatcher.policy().backoff;
        Self {
            dispatcher,
            llm,
            params,
            memory: None,
            recall: RecallTargets::default(),
            generation_retries: 1,
            backoff,
        }
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>, recall: RecallTargets) -> Self {
        self.memory = Some(memory);
        self.recall = recall;
        self
    }

    /// 生成步骤的总尝试次数，至少 1
    pub fn with_generation_retries(mut self, attempts: u32) -> Self {
        self.generation_retries = attempts.max(1);
        self
    }

    pub async fn execute(&self, task: &Task, step: &Step) -> StepOutcome {
        tracing::info!(step = step.index, action = ?step.action, "Step running");
        match &step.action {
            StepAction::Tool { name } => self.execute_tool(task, step, name).await,
            StepAction::Generate => self.execute_generate(task, step).await,
        }
    }

    async fn execute_tool(&self, task: &Task, step: &Step, tool: &str) -> StepOutcome {
        let payload = json!({
            "task": task.description,
            "step": step.description,
            "constraints": task.constraints,
        });
        let result = self
            .dispatcher
            .invoke_with(tool, payload, &InvokeOptions::default())
            .await;

        if result.success {
            StepOutcome::succeeded(
                step.index,
                result.output.unwrap_or(Value::Null),
                result.duration,
                result.attempt_count,
            )
        } else {
            let error = result
                .error
                .unwrap_or_else(|| StepError::logical(format!("{tool} failed without error")));
            StepOutcome::failed(step.index, error, result.duration, result.attempt_count)
        }
    }

    async fn execute_generate(&self, task: &Task, step: &Step) -> StepOutcome {
        let start = Instant::now();
        let context = recall(self.memory.as_ref(), &self.recall, &step.description).await;

        let mut prompt = format!("## Task\n{}\n\n## Step\n{}\n", task.description, step.description);
        if !task.constraints.is_null() {
            prompt.push_str(&format!("\n## Constraints\n{}\n", task.constraints));
        }
        if !context.is_empty() {
            prompt.push('\n');
            prompt.push_str(&context.to_prompt_section());
        }
        let request = GenerationRequest::new(prompt, &self.params).with_system(STEP_SYSTEM_PROMPT);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match generate_with_timeout(self.llm.as_ref(), &request).await {
                Ok(text) => {
                    return StepOutcome::succeeded(step.index, Value::String(text), start.elapsed(), attempt);
                }
                Err(e) => {
                    let retryable = e.kind().is_retryable() && attempt < self.generation_retries;
                    if !retryable {
                        return StepOutcome::failed(step.index, StepError::from(&e), start.elapsed(), attempt);
                    }
                    let delay = self.backoff.delay_for(attempt);
                    tracing::warn!(
                        step = step.index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Generation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
