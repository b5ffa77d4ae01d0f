//! Hive - 任务编排命令行
//!
//! 用法：`hive [--config <path>] [--constraints <json>] "<task>"`
//!
//! 入口：加载配置、初始化日志、装配记忆库 / 工具注册表 / 工作流引擎，运行一个任务，
//! 以 JSON 输出结果，最后执行关闭清理（停止后台循环、写快照）。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use hive::config::{load_config, AppConfig};
use hive::core::{
    BackgroundTaskCleanup, MemoryStoreCleanup, ShutdownCoordinator, ShutdownManager,
};
use hive::llm::{
    create_embedder_from_config, EmbeddingProvider, HashingEmbedder, LlmClient, OpenAiClient,
    ScriptedLlmClient,
};
use hive::memory::{CosineIndex, MemoryStore};
use hive::tools::{
    EchoTool, HttpTransport, LocalTransport, SchemeTransport, ToolDispatcher, ToolRegistry,
};
use hive::workflow::{Planner, RunOptions, StepExecutor, Task, WorkflowEngine};

struct CliArgs {
    config: Option<PathBuf>,
    constraints: Option<serde_json::Value>,
    task: String,
}

impl CliArgs {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut config = None;
        let mut constraints = None;
        let mut words = Vec::new();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    config = Some(PathBuf::from(args.next().context("--config needs a path")?));
                }
                "--constraints" => {
                    let raw = args.next().context("--constraints needs a JSON value")?;
                    constraints =
                        Some(serde_json::from_str(&raw).context("--constraints is not valid JSON")?);
                }
                _ => words.push(arg),
            }
        }
        let task = words.join(" ");
        if task.trim().is_empty() {
            bail!("usage: hive [--config <path>] [--constraints <json>] \"<task>\"");
        }
        Ok(Self {
            config,
            constraints,
            task,
        })
    }
}

fn build_embedder(config: &AppConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    if config.embedding.provider == "hashing" {
        let dimension = config
            .embedding_dimension()
            .context("memory.collections must declare at least one collection")?;
        return Ok(Arc::new(HashingEmbedder::new(dimension)));
    }
    Ok(create_embedder_from_config(&config.embedding)?)
}

fn build_llm(config: &AppConfig, task: &str) -> anyhow::Result<Arc<dyn LlmClient>> {
    match config.llm.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiClient::new(
            config.llm.base_url.as_deref(),
            &config.llm.model,
            None,
        ))),
        // 离线模式：单步计划交给本地 echo 工具
        "mock" => Ok(Arc::new(ScriptedLlmClient::with_responses([format!(
            "1. {task} [tool: {}]",
            EchoTool::NAME
        )]))),
        other => bail!("unknown llm.provider `{other}` (expected openai or mock)"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let args = CliArgs::parse(std::env::args().skip(1))?;
    let config = load_config(args.config.as_deref()).context("Failed to load config")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let token = shutdown.token();

    // 记忆库：有快照路径时先恢复，再补齐配置中声明的集合
    let embedder = build_embedder(&config)?;
    let index = Arc::new(CosineIndex);
    let memory = match &config.memory.snapshot_path {
        Some(path) => MemoryStore::load_snapshot(path, embedder, index)
            .await
            .context("Failed to restore memory snapshot")?,
        None => MemoryStore::new(embedder, index),
    };
    for spec in config.collection_specs()? {
        memory.create_collection(spec)?;
    }
    for spec in memory.list_collections() {
        tracing::info!(
            collection = %spec.name,
            dimension = spec.dimension,
            max_items = spec.max_items,
            ttl_days = ?spec.ttl_days,
            records = memory.len(&spec.name).unwrap_or(0),
            "Memory collection ready"
        );
    }
    let memory = Arc::new(memory);

    // 工具：local:// 走进程内，其余走 HTTP
    let local = Arc::new(LocalTransport::new());
    local.register(EchoTool);
    let transport = Arc::new(SchemeTransport::new(HttpTransport::new(), local.clone()));
    let registry = Arc::new(ToolRegistry::new(transport, config.registry_policy()?));
    if let Some(echo) = local.descriptor(EchoTool::NAME) {
        registry.register(echo).await;
    }
    for descriptor in config.tool_descriptors() {
        registry.register(descriptor).await;
    }
    registry.probe_all().await;
    let dispatcher = Arc::new(ToolDispatcher::new(registry.clone(), config.dispatch_policy()?));

    let llm = build_llm(&config, &args.task)?;
    let params = config.generation_params()?;
    let recall = config.recall_targets();
    let planner = Planner::new(llm.clone(), params.clone())
        .with_memory(memory.clone(), recall.clone())
        .with_tools(registry.clone());
    let executor = StepExecutor::new(dispatcher, llm.clone(), params)
        .with_memory(memory.clone(), recall)
        .with_generation_retries(config.generation_retries());
    let engine = WorkflowEngine::new(planner, executor, memory.clone(), config.engine_config()?)?;

    let mut coordinator = ShutdownCoordinator::new(shutdown.clone()).with_timeout(Duration::from_secs(10));
    coordinator.register(BackgroundTaskCleanup::new(
        "ProbeLoop",
        registry.spawn_probe_loop(token.clone()),
    ));
    coordinator.register(BackgroundTaskCleanup::new(
        "MemorySweeper",
        memory.spawn_sweeper(config.sweep_interval(), token.clone()),
    ));
    coordinator.register(MemoryStoreCleanup::new(memory.clone()));

    let mut task = Task::new(args.task);
    if let Some(constraints) = args.constraints {
        task = task.with_constraints(constraints);
    }
    let result = engine
        .run_with(
            &task,
            RunOptions {
                cancel: Some(token.clone()),
                ..Default::default()
            },
        )
        .await;

    let (prompt_tokens, completion_tokens, total_tokens) = llm.token_usage();
    tracing::info!(
        run_id = %result.run_id,
        failed_steps = result.failure_count(),
        prompt_tokens,
        completion_tokens,
        total_tokens,
        "Run summary"
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to encode result")?
    );

    coordinator.run_cleanup().await;

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
