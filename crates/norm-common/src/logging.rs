//! 日志初始化
//!
//! 编解码层本身只通过 `tracing` 宏发出事件，由应用决定是否安装订阅者。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 tracing 订阅者
///
/// 过滤规则取自 `RUST_LOG`，未设置时为 `info`。重复调用时保持第一次的订阅者。
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .try_init();
}
