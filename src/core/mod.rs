//! 核心层：错误分类、优雅关闭

pub mod duration_ms;
pub mod error;
pub mod shutdown;

pub use error::{require_timeout, ConfigError, ErrorKind, StepError};
pub use shutdown::{
    BackgroundTaskCleanup, CleanupStatus, MemoryStoreCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
