//! 可观测性：tracing 订阅器初始化
//!
//! 默认 info，可通过 RUST_LOG 覆盖（如 `RUST_LOG=delve=debug`）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认过滤指令
pub const DEFAULT_FILTER: &str = "info";

/// 构建日志过滤器：RUST_LOG 优先，无效或缺失时回落到 info
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// 初始化全局订阅器；重复调用（如多个测试）时静默忽略
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(false))
        .try_init();
}
