//! Hive - Rust 任务编排内核
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）与运行时策略派生
//! - **core**: 错误分类、优雅关闭
//! - **llm**: 生成与嵌入协作方（OpenAI 兼容 / Ollama / Mock）
//! - **memory**: 向量记忆库（集合、TTL、容量淘汰、快照）
//! - **tools**: 工具注册表、健康探测、传输与带重试的调度器
//! - **workflow**: Planner、StepExecutor 与工作流引擎
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
pub mod workflow;

pub use workflow::{Task, WorkflowEngine, WorkflowResult};
