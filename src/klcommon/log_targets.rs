//! 日志目标常量定义
//!
//! 统一管理各组件的日志 target 常量，便于按组件过滤日志。

/// K线合成器的日志目标
pub const KLINE_BUILDER: &str = "KlineBuilder";

/// 队列化K线存储的日志目标
pub const KLINE_SINK: &str = "QueuedKlineSink";

/// CSV K线存储后端的日志目标
pub const CSV_KLINE_WRITER: &str = "CsvKlineWriter";

/// SQLite K线存储后端的日志目标
pub const SQLITE_KLINE_WRITER: &str = "SqliteKlineWriter";

/// 失败数据处理器的日志目标
pub const FAILURE_HANDLER: &str = "FailureHandler";

/// Tick行情接入的日志目标
pub const TICK_FEED: &str = "TickFeed";

/// 网关应用主流程的日志目标
pub const KLINE_GATEWAY: &str = "KlineGateway";
