//! 进程内工具
//!
//! 所有进程内工具实现 Tool trait（name / description / capabilities / execute），由 LocalTransport 按名服务；
//! 工具返回 Err 视为逻辑失败（工具已响应但无法满足请求），不会被重试。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{InvokeRequest, InvokeResponse, ToolDescriptor, ToolTransport, TransportError};

pub const LOCAL_SCHEME: &str = "local://";

/// 工具 trait：名称、描述、声明能力、异步执行（payload 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute(&self, payload: Value) -> Result<Value, String>;
}

/// 进程内传输：按名称存储 Arc<dyn Tool>；可把某个工具标记为不可达以模拟进程宕机
#[derive(Default)]
pub struct LocalTransport {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    unreachable: RwLock<HashSet<String>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// 为已注册工具生成可交给 ToolRegistry 的描述（endpoint 为 `local://name`）
    pub fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.get(name).map(|tool| {
            ToolDescriptor::new(
                tool.name(),
                format!("{LOCAL_SCHEME}{}", tool.name()),
                tool.capabilities(),
            )
        })
    }

    pub fn set_reachable(&self, name: &str, reachable: bool) {
        let mut unreachable = self.unreachable.write().unwrap_or_else(PoisonError::into_inner);
        if reachable {
            unreachable.remove(name);
        } else {
            unreachable.insert(name.to_string());
        }
    }

    fn lookup(&self, descriptor: &ToolDescriptor) -> Result<Arc<dyn Tool>, TransportError> {
        if self
            .unreachable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&descriptor.name)
        {
            return Err(TransportError::Connection(format!(
                "{} is unreachable",
                descriptor.endpoint
            )));
        }
        self.get(&descriptor.name).ok_or_else(|| {
            TransportError::Connection(format!("no local tool behind {}", descriptor.endpoint))
        })
    }
}

#[async_trait]
impl ToolTransport for LocalTransport {
    async fn invoke(
        &self,
        descriptor: &ToolDescriptor,
        request: &InvokeRequest,
        timeout: Duration,
    ) -> Result<InvokeResponse, TransportError> {
        let tool = self.lookup(descriptor)?;
        match tokio::time::timeout(timeout, tool.execute(request.payload.clone())).await {
            Ok(Ok(output)) => Ok(InvokeResponse::ok(request.correlation_id, output)),
            Ok(Err(e)) => {
                let message = if e.trim().is_empty() {
                    format!("{} reported failure", descriptor.name)
                } else {
                    e
                };
                Ok(InvokeResponse::failure(request.correlation_id, message))
            }
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn probe(&self, descriptor: &ToolDescriptor, _timeout: Duration) -> Result<(), TransportError> {
        self.lookup(descriptor).map(|_| ())
    }
}
