//! Planner：任务 → 有序步骤
//!
//! 1. 从记忆库召回与任务相似的成功 / 失败记录（失败时降级为无上下文）
//! 2. 把任务、约束、可用工具与召回内容发给生成协作方
//! 3. 按编号约定解析回复；不匹配的行直接丢弃，解析不出步骤就返回空计划
//!
//! 接受的行格式：`1. text`、`1) text`、`Step 1: text`、`Step 1. text`（不区分大小写），
//! 行尾可带 `[tool: name]`（工具提示）与 `[after: 1, 3]`（依赖更早的步骤，编号按回复中的编号）。
//! 没有 `[after]` 时依赖上一步；`[after: ]` 表示无依赖。

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::core::StepError;
use crate::llm::{generate_with_timeout, GenerationParams, GenerationRequest, LlmClient};
use crate::memory::MemoryStore;
use crate::tools::ToolRegistry;
use crate::workflow::context::{recall, RecallTargets};
use crate::workflow::types::{Step, Task, WorkflowError};

const PLANNER_SYSTEM_PROMPT: &str = "You are the planning stage of a task orchestrator. \
Break the task into a short numbered list of concrete steps, one per line, formatted as \
`1. <description>`. If a step should be carried out by one of the available tools, append \
`[tool: <name>]`. If a step only depends on specific earlier steps, append `[after: <numbers>]`; \
use `[after: ]` for a step that depends on nothing. Output only the list.";

static LINE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static TOOL_RE: OnceLock<Option<Regex>> = OnceLock::new();
static AFTER_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// 解析生成的计划文本
pub fn parse_plan(text: &str) -> Vec<Step> {
    let (Some(line_re), Some(tool_re), Some(after_re)) = (
        cached(
            &LINE_RE,
            r"^\s*(?:(?i:step)\s+(\d+)\s*[:.]\s*|(\d+)\s*[.)]\s+)(.+?)\s*$",
        ),
        cached(&TOOL_RE, r"(?i)\[\s*tool\s*:\s*([^\]]*?)\s*\]"),
        cached(&AFTER_RE, r"(?i)\[\s*after\s*:\s*([^\]]*?)\s*\]"),
    ) else {
        return Vec::new();
    };

    let mut steps: Vec<Step> = Vec::new();
    // 回复中的编号 -> 计划下标
    let mut numbering: HashMap<u64, usize> = HashMap::new();

    for line in text.lines() {
        let Some(caps) = line_re.captures(line) else {
            continue;
        };
        let number = caps
            .get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<u64>().ok());
        let Some(body) = caps.get(3).map(|m| m.as_str()) else {
            continue;
        };

        let tool_hint = tool_re
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|name| !name.is_empty());
        let after = after_re
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());

        let description = after_re
            .replace_all(&tool_re.replace_all(body, ""), "")
            .trim()
            .to_string();
        if description.is_empty() {
            continue;
        }

        let index = steps.len();
        let depends_on = match after {
            Some(list) => {
                let mut deps: Vec<usize> = list
                    .split(',')
                    .filter_map(|n| n.trim().parse::<u64>().ok())
                    .filter_map(|n| numbering.get(&n).copied())
                    .filter(|&dep| dep < index)
                    .collect();
                deps.sort_unstable();
                deps.dedup();
                deps
            }
            None if index > 0 => vec![index - 1],
            None => Vec::new(),
        };

        if let Some(n) = number {
            numbering.entry(n).or_insert(index);
        }
        steps.push(Step::new(index, description, tool_hint).with_depends_on(depends_on));
    }

    steps
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    memory: Option<Arc<MemoryStore>>,
    tools: Option<Arc<ToolRegistry>>,
    params: GenerationParams,
    recall: RecallTargets,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, params: GenerationParams) -> Self {
        Self {
            llm,
            memory: None,
            tools: None,
            params,
            recall: RecallTargets::default(),
        }
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>, recall: RecallTargets) -> Self {
        self.memory = Some(memory);
        self.recall = recall;
        self
    }

    /// 在 prompt 中列出已注册工具
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    async fn build_prompt(&self, task: &Task) -> String {
        let mut prompt = format!("## Task\n{}\n", task.description);
        if !task.constraints.is_null() {
            prompt.push_str(&format!("\n## Constraints\n{}\n", task.constraints));
        }
        if let Some(tools) = &self.tools {
            let available: Vec<String> = tools
                .snapshot()
                .await
                .into_iter()
                .filter(|s| s.available)
                .map(|s| {
                    let caps: Vec<&str> = s.descriptor.capabilities.iter().map(String::as_str).collect();
                    format!("- {} ({})", s.descriptor.name, caps.join(", "))
                })
                .collect();
            if !available.is_empty() {
                prompt.push_str(&format!("\n## Available tools\n{}\n", available.join("\n")));
            }
        }
        let context = recall(self.memory.as_ref(), &self.recall, &task.description).await;
        if !context.is_empty() {
            prompt.push('\n');
            prompt.push_str(&context.to_prompt_section());
        }
        prompt
    }

    /// 生成计划；空计划不是错误
    pub async fn plan(&self, task: &Task) -> Result<Vec<Step>, WorkflowError> {
        let prompt = self.build_prompt(task).await;
        let request = GenerationRequest::new(prompt, &self.params).with_system(PLANNER_SYSTEM_PROMPT);
        let response = generate_with_timeout(self.llm.as_ref(), &request)
            .await
            .map_err(|e| WorkflowError::Planning(StepError::from(&e)))?;

        let steps = parse_plan(&response);
        if steps.is_empty() {
            tracing::warn!(task_id = %task.id, "Planner response contained no parsable steps");
        } else {
            tracing::info!(task_id = %task.id, steps = steps.len(), "Plan generated");
        }
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::llm::{HashingEmbedder, LlmError, ScriptedLlmClient};
    use crate::memory::{CollectionSpec, CosineIndex, RecordKind, RecordMetadata};
    use std::time::Duration;

    fn params() -> GenerationParams {
        GenerationParams::new(0.2, 256, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_parse_numbering_forms() {
        let text = "Here is the plan:\n\
                    1. Fetch the repo [tool: git]\n\
                    2) Run the tests\n\
                    Step 3: Summarize failures\n\
                    step 4. Write report\n\
                    - not a step\n\
                    5.5 liters is not a step either";
        let steps = parse_plan(text);
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].description, "Fetch the repo");
        assert_eq!(steps[0].tool_hint(), Some("git"));
        assert_eq!(steps[1].tool_hint(), None);
        assert_eq!(steps[2].description, "Summarize failures");
        assert_eq!(steps[3].description, "Write report");
        assert_eq!(steps[3].index, 3);
    }

    #[test]
    fn test_parse_dependencies() {
        let text = "1. A\n2. B [after: ]\n3. C [after: 1, 2]\n4. D [after: 9, 4]\n5. E";
        let steps = parse_plan(text);
        assert!(steps[0].depends_on.is_empty());
        assert!(steps[1].depends_on.is_empty());
        assert_eq!(steps[2].depends_on, vec![0, 1]);
        // 未知或非更早的编号被丢弃
        assert!(steps[3].depends_on.is_empty());
        assert_eq!(steps[4].depends_on, vec![3]);
    }

    #[test]
    fn test_parse_garbage_is_empty() {
        assert!(parse_plan("").is_empty());
        assert!(parse_plan("I cannot help with that.").is_empty());
        assert!(parse_plan("1. [tool: echo]").is_empty());
    }

    #[tokio::test]
    async fn test_plan_includes_recall_and_tools_in_prompt() {
        let embedder = Arc::new(HashingEmbedder::new(32));
        let store = Arc::new(MemoryStore::new(embedder, Arc::new(CosineIndex)));
        for name in ["successes", "errors"] {
            store
                .create_collection(CollectionSpec::new(name, 32, 10, None).unwrap())
                .unwrap();
        }
        store
            .insert(
                "errors",
                "backup database failed: disk full",
                RecordMetadata::new(RecordKind::Error).with_attribute("error_type", "logical_failure"),
            )
            .await
            .unwrap();

        let llm = Arc::new(ScriptedLlmClient::with_responses(["1. Check disk\n2. Backup database"]));
        let planner = Planner::new(llm.clone(), params()).with_memory(store, RecallTargets::default());
        let steps = planner.plan(&Task::new("backup database")).await.unwrap();

        assert_eq!(steps.len(), 2);
        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("## Task\nbackup database"));
        assert!(prompt.contains("Past errors to avoid"));
    }

    #[tokio::test]
    async fn test_generation_failure_is_planning_error() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_err(LlmError::Transport("connection reset".into()));
        let planner = Planner::new(llm, params());
        let err = planner.plan(&Task::new("anything")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Planning(_)));
        assert_eq!(err.kind(), ErrorKind::TransientCollaborator);
    }
}
