use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    #[error("Malformed tick: {0}")]
    MalformedTick(String),

    #[error("Invalid tick: {0}")]
    InvalidTick(String),

    #[error("Sink error: {0}")]
    SinkError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Time parsing error: {0}")]
    TimeParseError(#[from] chrono::ParseError),
}

impl AppError {
    /// 获取错误类型的简洁摘要，用于日志聚合时的错误分类
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            // K线配置相关
            AppError::InvalidPeriod(_) => "kline_period_unknown",
            AppError::ConfigError(_) => "kline_gateway_configuration_invalid",

            // 行情数据相关
            AppError::MalformedTick(_) => "market_tick_malformed",
            AppError::InvalidTick(_) => "market_tick_invalid",
            AppError::JsonError(_) => "market_tick_parsing_failed",
            AppError::TimeParseError(_) => "market_tick_timestamp_invalid",

            // K线存储相关
            AppError::SinkError(_) => "kline_sink_rejected",
            AppError::ChannelError(_) => "kline_write_queue_unavailable",
            AppError::DatabaseError(_) => "kline_data_persistence_failed",
            AppError::SqliteError(_) => "kline_storage_operation_failed",
            AppError::CsvError(_) => "kline_csv_export_failed",
            AppError::IoError(_) => "kline_file_operation_failed",
        }
    }

    /// 检查错误是否为可重试类型
    ///
    /// 存储失败时据此决定是否把失败批次落盘等待重试
    pub fn is_retryable(&self) -> bool {
        match self {
            // 存储后端的临时性错误可重试
            AppError::IoError(_) | AppError::CsvError(_) | AppError::SqliteError(_) => true,
            AppError::DatabaseError(msg) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timeout") || msg.contains("连接")
            }
            AppError::ChannelError(_) | AppError::SinkError(_) => true,

            // 数据和配置本身的问题，重试没有意义
            AppError::InvalidPeriod(_)
            | AppError::MalformedTick(_)
            | AppError::InvalidTick(_)
            | AppError::ConfigError(_)
            | AppError::JsonError(_)
            | AppError::TimeParseError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
