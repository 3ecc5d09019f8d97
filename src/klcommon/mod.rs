// 导出共享模块
pub mod error;
pub mod config;
pub mod logging_setup;
pub mod log_targets;

// 重新导出常用类型，方便使用
pub use error::{Result, AppError};
pub use config::{
    GatewayConfig, KlineConfig, StorageBackend, StorageConfig, CsvStorageConfig,
    SqliteStorageConfig, FailureConfig, LoggingConfig, FeedConfig,
};
pub use logging_setup::{init_logging, LoggingGuard};
