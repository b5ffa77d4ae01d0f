//! 工具层：跨进程工具协议、注册表（发现 + 健康探测）与调度（超时 + 重试）

pub mod descriptor;
pub mod dispatcher;
pub mod echo;
pub mod local;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use descriptor::{ToolDescriptor, ToolStats, ToolStatus};
pub use dispatcher::{BackoffPolicy, DispatchPolicy, InvokeOptions, ToolDispatcher, ToolResult};
pub use echo::EchoTool;
pub use local::{LocalTransport, Tool};
pub use protocol::{InvokeRequest, InvokeResponse, ProbeAck};
pub use registry::{AttemptOutcome, RegistryError, RegistryPolicy, ToolRegistry};
pub use transport::{HttpTransport, SchemeTransport, ToolTransport, TransportError};
