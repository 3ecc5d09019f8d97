//! 统一日志系统初始化模块
//!
//! 由二进制入口调用一次，引擎内部只发出 `tracing` 事件，不持有任何全局日志句柄。

use crate::klcommon::{AppError, LoggingConfig, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// 日志文件名前缀，按天滚动
const LOG_FILE_PREFIX: &str = "kline_gateway.log";

/// 日志系统守卫，持有期间文件日志的后台写线程保持运行
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 根据配置的日志级别生成过滤指令，压低第三方库的噪音
pub fn filter_directive(log_level: &str) -> String {
    format!("{},rusqlite=warn,r2d2=warn", log_level.trim())
}

/// 初始化日志系统
///
/// `RUST_LOG` 存在时覆盖配置中的日志级别。控制台和文件两个输出层都是可选的。
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(&config.log_level)));

    let console_layer = config
        .enable_console_output
        .then(|| fmt::layer().with_target(true).with_thread_ids(true));

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_target(true).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // .with(None) 是无操作的
    Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
