//! 工作流编排：规划 → 执行 → 校验 → 记录

pub mod context;
pub mod engine;
pub mod events;
pub mod executor;
pub mod graph;
pub mod planner;
pub mod types;

pub use context::{Recall, RecallTargets};
pub use engine::{EngineConfig, RunOptions, WorkflowEngine};
pub use events::{EventSink, WorkflowEvent};
pub use executor::StepExecutor;
pub use graph::StepGraph;
pub use planner::{parse_plan, Planner};
pub use types::*;
