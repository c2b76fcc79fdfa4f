//! 日志初始化
//!
//! 启动时先用默认过滤指令初始化，配置加载完成后再换成配置中的指令，
//! 这样加载配置期间的日志也能输出。`RUST_LOG` 优先于两者。
//! 日志写到 stderr，stdout 留给命令结果。

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// 全局 subscriber 的过滤器句柄
#[derive(Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    /// 过滤指令来自 `RUST_LOG`
    from_env: bool,
}

impl LogHandle {
    /// 换成配置中的过滤指令；`RUST_LOG` 已设置或指令非法时返回 `false`
    pub fn apply(&self, directives: &str) -> bool {
        if self.from_env {
            return false;
        }
        match EnvFilter::try_new(directives) {
            Ok(filter) => self.filter.reload(filter).is_ok(),
            Err(e) => {
                tracing::warn!("[Logging] 忽略非法的过滤指令 {:?}: {}", directives, e);
                false
            }
        }
    }
}

/// 初始化全局 tracing subscriber；已初始化时返回 `None`
pub fn init_tracing(default_filter: &str) -> Option<LogHandle> {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (
            EnvFilter::try_new(default_filter).unwrap_or_else(|_| EnvFilter::new("info")),
            false,
        ),
    };
    let (filter_layer, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .ok()?;
    Some(LogHandle {
        filter: handle,
        from_env,
    })
}
