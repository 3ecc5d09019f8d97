//! K线网关配置模块

use crate::klaggregate::KlinePeriod;
use crate::klcommon::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 系统配置常量
pub mod constants {
    /// 默认配置文件路径，可被 `CONFIG_PATH` 环境变量覆盖
    pub const DEFAULT_CONFIG_PATH: &str = "config/KlineGatewayConfig.toml";

    /// 默认写入队列大小
    pub const DEFAULT_QUEUE_SIZE: usize = 1000;

    /// 默认批量写入大小
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    /// 默认刷新间隔（毫秒）
    pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5000;

    /// 默认失败文件保留天数
    pub const DEFAULT_RETENTION_DAYS: u32 = 7;
}

use constants::*;

fn default_true() -> bool {
    true
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_stats_interval_secs() -> u64 {
    60
}

/// K线网关配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// K线合成配置
    #[serde(default)]
    pub kline: KlineConfig,

    /// K线存储配置
    #[serde(default)]
    pub storage: StorageConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Tick行情接入配置
    #[serde(default)]
    pub feed: FeedConfig,
}

/// K线合成配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineConfig {
    /// 是否启用K线合成
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 启用的周期，为空表示全部周期
    #[serde(default)]
    pub periods: Vec<String>,
}

/// 存储后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Csv,
    Sqlite,
}

/// K线存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 存储后端
    #[serde(default)]
    pub backend: StorageBackend,

    /// 合成器与写入任务之间的有界队列大小
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// 缓冲达到该数量时立即写入
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// 定时刷新间隔（毫秒）
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default)]
    pub csv: CsvStorageConfig,

    #[serde(default)]
    pub sqlite: SqliteStorageConfig,

    /// 失败数据落盘配置
    #[serde(default)]
    pub failure: FailureConfig,
}

/// CSV存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvStorageConfig {
    /// CSV根目录
    pub base_path: String,
}

/// SQLite存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteStorageConfig {
    /// 数据库文件路径
    pub database_path: String,

    /// 连接池大小
    pub pool_size: u32,

    /// 是否启用WAL模式
    #[serde(default = "default_true")]
    pub enable_wal: bool,
}

/// 失败数据处理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureConfig {
    /// 写入失败时是否落盘
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 失败文件目录
    pub failure_dir: String,

    /// 失败文件保留天数
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)，`RUST_LOG` 优先
    pub log_level: String,

    /// 是否启用控制台输出
    #[serde(default = "default_true")]
    pub enable_console_output: bool,

    /// 按天滚动的日志文件目录，不设置则不写文件
    #[serde(default)]
    pub log_dir: Option<String>,
}

/// Tick行情接入配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// 统计日志输出间隔（秒），0表示不输出
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl Default for KlineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            periods: KlinePeriod::ALL.iter().map(|p| p.key().to_string()).collect(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Csv,
            queue_size: DEFAULT_QUEUE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            csv: CsvStorageConfig::default(),
            sqlite: SqliteStorageConfig::default(),
            failure: FailureConfig::default(),
        }
    }
}

impl Default for CsvStorageConfig {
    fn default() -> Self {
        Self {
            base_path: "./data/klines".to_string(),
        }
    }
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            database_path: "./data/klines.db".to_string(),
            pool_size: 4,
            enable_wal: true,
        }
    }
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_dir: "./data/failures".to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_console_output: true,
            log_dir: Some("logs".to_string()),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl GatewayConfig {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::ConfigError(format!("序列化配置失败: {}", e)))?;

        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// 解析配置文件路径：命令行参数 > `CONFIG_PATH` 环境变量 > 默认路径
    pub fn resolve_path(cli_path: Option<&str>) -> String {
        cli_path
            .map(str::to_string)
            .or_else(|| std::env::var("CONFIG_PATH").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        // 未知周期在启动时直接失败
        self.enabled_periods()?;

        if self.storage.queue_size == 0 {
            return Err(AppError::ConfigError("写入队列大小必须大于0".to_string()));
        }

        if self.storage.batch_size == 0 {
            return Err(AppError::ConfigError("批量写入大小必须大于0".to_string()));
        }

        if self.storage.flush_interval_ms == 0 {
            return Err(AppError::ConfigError("刷新间隔必须大于0".to_string()));
        }

        if self.storage.sqlite.pool_size == 0 {
            return Err(AppError::ConfigError("数据库连接池大小必须大于0".to_string()));
        }

        if self.logging.log_level.trim().is_empty() {
            return Err(AppError::ConfigError("日志级别不能为空".to_string()));
        }

        Ok(())
    }

    /// 启用的K线周期，空列表表示全部周期
    pub fn enabled_periods(&self) -> Result<Vec<KlinePeriod>> {
        KlinePeriod::parse_list(&self.kline.periods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[kline]
enabled = true
periods = ["1m", "5m", "1d"]

[storage]
backend = "sqlite"
queue_size = 500
batch_size = 50
flush_interval_ms = 1000

[storage.sqlite]
database_path = "./data/test.db"
pool_size = 2
enable_wal = false

[storage.failure]
failure_dir = "./data/failed"

[logging]
log_level = "debug"
enable_console_output = false
"#;

    #[test]
    fn test_parse_sample_config() {
        let config: GatewayConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.storage.queue_size, 500);
        assert_eq!(config.storage.sqlite.pool_size, 2);
        assert!(!config.storage.sqlite.enable_wal);
        // 缺省的段落和字段使用默认值
        assert_eq!(config.storage.csv.base_path, "./data/klines");
        assert!(config.storage.failure.enabled);
        assert_eq!(config.storage.failure.retention_days, DEFAULT_RETENTION_DAYS);
        assert!(config.logging.log_dir.is_none());
        assert_eq!(config.feed.stats_interval_secs, 60);

        assert_eq!(
            config.enabled_periods().unwrap(),
            vec![KlinePeriod::Min1, KlinePeriod::Min5, KlinePeriod::Day1]
        );
    }

    #[test]
    fn test_unknown_period_rejected() {
        let mut config = GatewayConfig::default();
        config.kline.periods = vec!["1m".to_string(), "1h".to_string()];
        assert!(matches!(config.validate(), Err(AppError::InvalidPeriod(p)) if p == "1h"));
    }

    #[test]
    fn test_empty_periods_means_all() {
        let mut config = GatewayConfig::default();
        config.kline.periods.clear();
        assert_eq!(config.enabled_periods().unwrap(), KlinePeriod::ALL.to_vec());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = GatewayConfig::default();
        config.storage.batch_size = 0;
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));

        let mut config = GatewayConfig::default();
        config.storage.flush_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");

        let mut config = GatewayConfig::default();
        config.storage.backend = StorageBackend::Sqlite;
        config.kline.periods = vec!["15m".to_string()];
        config.save_to_file(&path).unwrap();

        let loaded = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(loaded.storage.backend, StorageBackend::Sqlite);
        assert_eq!(loaded.kline.periods, vec!["15m".to_string()]);
        assert_eq!(loaded.logging.log_dir.as_deref(), Some("logs"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = GatewayConfig::from_file("/nonexistent/KlineGatewayConfig.toml");
        assert!(matches!(result, Err(AppError::IoError(_))));
    }

    #[test]
    fn test_resolve_path_prefers_cli() {
        assert_eq!(GatewayConfig::resolve_path(Some("a.toml")), "a.toml");
    }
}
