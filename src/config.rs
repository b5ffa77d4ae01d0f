//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__MODEL=gpt-4o`）。
//! 运行时策略（CollectionSpec / DispatchPolicy / RegistryPolicy / EngineConfig）都由校验过的配置派生。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::{require_timeout, ConfigError};
use crate::llm::GenerationParams;
use crate::memory::CollectionSpec;
use crate::tools::{BackoffPolicy, DispatchPolicy, RegistryPolicy, ToolDescriptor};
use crate::workflow::{EngineConfig, FailurePolicy, RecallTargets};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub memory: MemorySection,
    pub tools: ToolsSection,
    pub workflow: WorkflowSection,
}

/// [llm] 段：生成协作方
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai（任意 OpenAI 兼容服务）/ mock（离线脚本回复）
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    pub base_url: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// 生成步骤的总尝试次数
    #[serde(default = "default_llm_retries")]
    pub retries: u32,
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_llm_retries() -> u32 {
    2
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: None,
            model: default_llm_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            retries: default_llm_retries(),
        }
    }
}

/// [embedding] 段：嵌入协作方
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingSection {
    /// openai / ollama；hashing 为离线模式
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    pub base_url: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_timeout_secs() -> u64 {
    15
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            base_url: None,
            model: default_embedding_model(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

/// [[memory.collections]]
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionSection {
    pub name: String,
    pub dimension: usize,
    pub max_items: usize,
    pub ttl_days: Option<u32>,
}

/// [memory] 段：集合声明、快照与清扫
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    pub snapshot_path: Option<PathBuf>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 规划 / 生成时每个集合召回的条数
    #[serde(default = "default_search_k")]
    pub search_k: usize,
    #[serde(default = "default_success_collection")]
    pub success_collection: String,
    #[serde(default = "default_error_collection")]
    pub error_collection: String,
    #[serde(default = "default_collections")]
    pub collections: Vec<CollectionSection>,
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_search_k() -> usize {
    3
}

fn default_success_collection() -> String {
    "successes".to_string()
}

fn default_error_collection() -> String {
    "errors".to_string()
}

fn default_collections() -> Vec<CollectionSection> {
    vec![
        CollectionSection {
            name: default_success_collection(),
            dimension: 1536,
            max_items: 10_000,
            ttl_days: None,
        },
        CollectionSection {
            name: default_error_collection(),
            dimension: 1536,
            max_items: 5_000,
            ttl_days: Some(30),
        },
    ]
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            sweep_interval_secs: default_sweep_interval_secs(),
            search_k: default_search_k(),
            success_collection: default_success_collection(),
            error_collection: default_error_collection(),
            collections: default_collections(),
        }
    }
}

/// [[tools.endpoints]]
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSection {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// [tools] 段：调用超时、重试与健康探测
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_invoke_timeout_ms")]
    pub invoke_timeout_ms: u64,
    /// 总尝试次数（含首次）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default)]
    pub endpoints: Vec<EndpointSection>,
}

fn default_invoke_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_unhealthy_threshold() -> u32 {
    3
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            invoke_timeout_ms: default_invoke_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            unhealthy_threshold: default_unhealthy_threshold(),
            endpoints: Vec::new(),
        }
    }
}

/// [workflow] 段：失败策略与并发
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub max_failures: usize,
    /// 覆盖 llm.retries
    pub generation_retries: Option<u32>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_max_parallel() -> usize {
    4
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            max_failures: 0,
            generation_retries: None,
            parallel: false,
            max_parallel: default_max_parallel(),
        }
    }
}

impl AppConfig {
    /// 启动前校验，任何一项不合法都直接失败
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.generation_params()?;
        require_timeout(
            "embedding.timeout_secs",
            Duration::from_secs(self.embedding.timeout_secs),
        )?;
        require_timeout(
            "memory.sweep_interval_secs",
            Duration::from_secs(self.memory.sweep_interval_secs),
        )?;
        if self.llm.retries == 0 || self.workflow.generation_retries == Some(0) {
            return Err(ConfigError::invalid("llm.retries", "must be at least 1"));
        }

        let specs = self.collection_specs()?;
        let mut names = HashSet::new();
        for spec in &specs {
            if !names.insert(spec.name.as_str()) {
                return Err(ConfigError::invalid(
                    "memory.collections",
                    format!("duplicate collection `{}`", spec.name),
                ));
            }
        }
        for (field, name) in [
            ("memory.success_collection", &self.memory.success_collection),
            ("memory.error_collection", &self.memory.error_collection),
        ] {
            if !names.contains(name.as_str()) {
                return Err(ConfigError::invalid(
                    field,
                    format!("collection `{name}` is not declared"),
                ));
            }
        }
        if let Some(first) = specs.first() {
            if specs.iter().any(|s| s.dimension != first.dimension) {
                return Err(ConfigError::invalid(
                    "memory.collections",
                    "all collections share one embedder and must declare the same dimension",
                ));
            }
        }

        self.dispatch_policy()?;
        self.registry_policy()?;
        let mut endpoints = HashSet::new();
        for endpoint in &self.tools.endpoints {
            if !endpoints.insert(endpoint.name.as_str()) {
                return Err(ConfigError::invalid(
                    "tools.endpoints",
                    format!("duplicate tool `{}`", endpoint.name),
                ));
            }
        }
        self.engine_config()?;
        Ok(())
    }

    pub fn generation_params(&self) -> Result<GenerationParams, ConfigError> {
        GenerationParams::new(
            self.llm.temperature,
            self.llm.max_tokens,
            Duration::from_secs(self.llm.timeout_secs),
        )
    }

    pub fn generation_retries(&self) -> u32 {
        self.workflow.generation_retries.unwrap_or(self.llm.retries)
    }

    pub fn collection_specs(&self) -> Result<Vec<CollectionSpec>, ConfigError> {
        self.memory
            .collections
            .iter()
            .map(|c| CollectionSpec::new(c.name.clone(), c.dimension, c.max_items, c.ttl_days))
            .collect()
    }

    /// 所有集合共用的向量维度
    pub fn embedding_dimension(&self) -> Option<usize> {
        self.memory.collections.first().map(|c| c.dimension)
    }

    pub fn recall_targets(&self) -> RecallTargets {
        RecallTargets {
            success_collection: self.memory.success_collection.clone(),
            error_collection: self.memory.error_collection.clone(),
            k: self.memory.search_k,
        }
    }

    pub fn dispatch_policy(&self) -> Result<DispatchPolicy, ConfigError> {
        let backoff = BackoffPolicy::new(
            Duration::from_millis(self.tools.backoff_base_ms),
            Duration::from_millis(self.tools.backoff_max_ms),
        )?;
        DispatchPolicy::new(
            Duration::from_millis(self.tools.invoke_timeout_ms),
            self.tools.max_retries,
            backoff,
        )
    }

    pub fn registry_policy(&self) -> Result<RegistryPolicy, ConfigError> {
        RegistryPolicy::new(
            Duration::from_secs(self.tools.probe_interval_secs),
            Duration::from_millis(self.tools.probe_timeout_ms),
            self.tools.unhealthy_threshold,
        )
    }

    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let config = EngineConfig {
            failure_policy: self.workflow.failure_policy,
            max_failures: self.workflow.max_failures,
            parallel: self.workflow.parallel,
            max_parallel: self.workflow.max_parallel,
            success_collection: self.memory.success_collection.clone(),
            error_collection: self.memory.error_collection.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .endpoints
            .iter()
            .map(|e| ToolDescriptor::new(e.name.clone(), e.endpoint.clone(), e.capabilities.clone()))
            .collect()
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.memory.sweep_interval_secs)
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在，可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
///
/// 返回前执行 [`AppConfig::validate`]。
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let app: AppConfig = builder.build()?.try_deserialize()?;
    app.validate()?;
    Ok(app)
}
