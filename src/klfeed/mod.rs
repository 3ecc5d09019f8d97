//! Tick行情接入
//!
//! 从JSON-lines流（标准输入或文件）逐行读取Tick，在同一个任务里同步调用
//! `KlineBuilder::on_tick`，保持合成器的单写者模型。

use crate::klaggregate::{KlineBuilder, TickData};
use crate::klcommon::log_targets::TICK_FEED;
use crate::klcommon::Result;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 行情接入统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    /// 读取的非空行数
    pub lines_read: u64,
    /// 成功解析并交给合成器的Tick数
    pub ticks_parsed: u64,
    /// 无法解析的行数
    pub invalid_lines: u64,
}

/// 解析一行Tick，空行返回 `None`
pub fn parse_line(line: &str) -> Result<Option<TickData>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

/// JSON-lines Tick行情源
pub struct TickFeed {
    source: String,
}

impl TickFeed {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into() }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// 读取行情直到EOF或收到取消信号
    pub async fn run<R>(&self, reader: R, builder: &mut KlineBuilder, cancel: CancellationToken) -> Result<FeedStats>
    where
        R: AsyncBufRead + Unpin,
    {
        info!(
            target: TICK_FEED,
            event_name = "行情接入启动",
            source = %self.source,
            "开始读取Tick行情: {}",
            self.source
        );

        let mut stats = FeedStats::default();
        let mut reader = reader;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(target: TICK_FEED, event_name = "行情接入取消", source = %self.source, "收到取消信号，停止读取行情");
                    break;
                }
                read = reader.read_until(b'\n', &mut buf) => read?,
            };

            if read == 0 {
                info!(target: TICK_FEED, event_name = "行情读取结束", source = %self.source, "行情源已到达EOF");
                break;
            }

            // 非UTF-8的行按无效行计数，不中断行情
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(e) => {
                    stats.lines_read += 1;
                    stats.invalid_lines += 1;
                    warn!(
                        target: TICK_FEED,
                        event_name = "Tick编码无效",
                        error = %e,
                        "行情数据不是有效的UTF-8: {}",
                        e
                    );
                    continue;
                }
            };

            match parse_line(line) {
                Ok(Some(tick)) => {
                    stats.lines_read += 1;
                    stats.ticks_parsed += 1;
                    builder.on_tick(&tick);
                }
                Ok(None) => {}
                Err(e) => {
                    stats.lines_read += 1;
                    stats.invalid_lines += 1;
                    warn!(
                        target: TICK_FEED,
                        event_name = "Tick解析失败",
                        error_type = e.get_error_type_summary(),
                        error = %e,
                        "无法解析的行情数据: {}",
                        e
                    );
                }
            }
        }

        info!(
            target: TICK_FEED,
            event_name = "行情接入停止",
            lines_read = stats.lines_read,
            ticks_parsed = stats.ticks_parsed,
            invalid_lines = stats.invalid_lines,
            "行情接入停止: lines={}, ticks={}, invalid={}",
            stats.lines_read,
            stats.ticks_parsed,
            stats.invalid_lines
        );
        Ok(stats)
    }
}
