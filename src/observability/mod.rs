//! 可观测性：tracing 订阅器初始化
//!
//! 默认 info，可通过 RUST_LOG 覆盖；工具调用的审计行以 `event = "tool_audit"` 输出，
//! 可用 `RUST_LOG=hive::tools::dispatcher=info` 单独过滤。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局订阅器；重复调用（如测试中）静默忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        tracing::info!("observability initialized twice");
    }
}
