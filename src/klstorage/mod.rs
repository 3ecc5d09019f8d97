//! K线存储模块
//!
//! - `QueuedKlineSink`: 有界队列 + 后台批量写入任务，实现 `KlineSink`
//! - `CsvKlineWriter`: 按交易日/周期/合约分文件的CSV存储
//! - `SqliteKlineWriter`: SQLite时序表存储
//! - `FailureHandler`: 写入失败批次的本地落盘与重试

pub mod queued_sink;
pub mod csv_writer;
pub mod sqlite_writer;
pub mod failure_handler;

pub use queued_sink::{QueuedKlineSink, SinkOptions, SinkStats};
pub use csv_writer::CsvKlineWriter;
pub use sqlite_writer::SqliteKlineWriter;
pub use failure_handler::{FailureHandler, FailureStats, RetryReport};

use crate::klaggregate::KlineBarSnapshot;
use crate::klcommon::Result;

/// 失败文件中K线批次的数据类型标识
pub const KLINE_DATA_TYPE: &str = "kline";

/// 阻塞式K线写入后端
///
/// 由 `QueuedKlineSink` 在 `spawn_blocking` 线程中调用，实现可以直接做文件或数据库I/O。
pub trait KlineWriter: Send + Sync {
    /// 后端名称，用于日志和统计
    fn name(&self) -> &'static str;

    /// 写入一批K线，返回实际写入的条数
    fn write_batch(&self, bars: &[KlineBarSnapshot]) -> Result<usize>;
}
