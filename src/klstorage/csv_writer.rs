//! CSV K线存储
//!
//! 文件布局 `{base}/{trading_day}/{period}/{instrument}.csv`，新文件写表头，已有文件追加。

use crate::klaggregate::KlineBarSnapshot;
use crate::klcommon::log_targets::CSV_KLINE_WRITER;
use crate::klcommon::Result;
use crate::klstorage::KlineWriter;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// CSV表头
pub const CSV_HEADER: [&str; 8] = [
    "Timestamp",
    "Open",
    "High",
    "Low",
    "Close",
    "Volume",
    "Turnover",
    "OpenInterest",
];

/// CSV K线写入器
#[derive(Debug, Clone)]
pub struct CsvKlineWriter {
    base_path: PathBuf,
}

impl CsvKlineWriter {
    /// 创建CSV写入器，根目录不存在时自动创建
    #[instrument(target = CSV_KLINE_WRITER, skip_all, fields(base_path = %base_path.as_ref().display()), err)]
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        info!(
            target: CSV_KLINE_WRITER,
            event_name = "CSV存储初始化",
            base_path = %base_path.display(),
            "CSV K线存储初始化完成: {}",
            base_path.display()
        );
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// K线对应的CSV文件路径
    pub fn file_path(&self, bar: &KlineBarSnapshot) -> PathBuf {
        self.base_path
            .join(&bar.trading_day)
            .join(bar.period.key())
            .join(format!("{}.csv", bar.instrument_id))
    }

    fn append_rows(&self, path: &Path, bars: &[&KlineBarSnapshot]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let is_new = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

        if is_new {
            writer.write_record(CSV_HEADER)?;
        }
        for bar in bars {
            writer.write_record(csv_row(bar))?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl KlineWriter for CsvKlineWriter {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn write_batch(&self, bars: &[KlineBarSnapshot]) -> Result<usize> {
        // 按文件分组，组内保持到达顺序
        let mut by_file: BTreeMap<PathBuf, Vec<&KlineBarSnapshot>> = BTreeMap::new();
        let mut skipped = 0;

        for bar in bars {
            if bar.trading_day.is_empty() || bar.instrument_id.is_empty() {
                skipped += 1;
                warn!(
                    target: CSV_KLINE_WRITER,
                    event_name = "K线缺少必要字段",
                    instrument = %bar.instrument_id,
                    trading_day = %bar.trading_day,
                    "跳过缺少交易日或合约代码的K线: instrument={:?}, trading_day={:?}",
                    bar.instrument_id,
                    bar.trading_day
                );
                continue;
            }
            by_file.entry(self.file_path(bar)).or_default().push(bar);
        }

        let mut written = 0;
        for (path, rows) in &by_file {
            self.append_rows(path, rows)?;
            written += rows.len();
        }

        debug!(
            target: CSV_KLINE_WRITER,
            event_name = "CSV批量写入完成",
            written = written,
            skipped = skipped,
            files = by_file.len(),
            "CSV写入完成: written={}, skipped={}, files={}",
            written,
            skipped,
            by_file.len()
        );
        Ok(written)
    }
}

/// K线开始时间，固定东八区偏移
pub fn format_timestamp(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3f+08:00").to_string()
}

fn format_float(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        String::new()
    }
}

fn csv_row(bar: &KlineBarSnapshot) -> [String; 8] {
    [
        format_timestamp(&bar.start_time),
        format_float(bar.open),
        format_float(bar.high),
        format_float(bar.low),
        format_float(bar.close),
        bar.volume.to_string(),
        format_float(bar.turnover),
        format_float(bar.open_interest),
    ]
}
