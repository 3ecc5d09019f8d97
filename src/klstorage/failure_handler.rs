//! 写入失败数据处理
//!
//! 存储后端写入失败的批次以JSON文件保存到本地目录，之后可以重新写入。
//! 文件名 `{data_type}_{YYYYmmdd_HHMMSS_micros}.json`。

use crate::klaggregate::KlineBarSnapshot;
use crate::klcommon::log_targets::FAILURE_HANDLER;
use crate::klcommon::{AppError, FailureConfig, Result};
use crate::klstorage::KlineWriter;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{error, info, instrument, warn};

/// 落盘的失败批次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedBatch {
    pub data_type: String,
    /// 首次失败时间（本地时间，RFC3339）
    pub failed_at: String,
    pub error: String,
    pub retry_count: u32,
    pub records: Vec<KlineBarSnapshot>,
}

/// 一次重试的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

/// 失败数据统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureStats {
    /// 待重试的文件数
    pub pending_files: usize,
    /// 待重试的K线总数
    pub pending_records: usize,
    /// 本进程保存的批次数
    pub saved_batches: u64,
}

/// 失败数据处理器
#[derive(Debug)]
pub struct FailureHandler {
    failure_dir: PathBuf,
    enabled: bool,
    saved_batches: AtomicU64,
}

impl FailureHandler {
    #[instrument(target = FAILURE_HANDLER, skip_all, fields(failure_dir = %config.failure_dir), err)]
    pub fn new(config: &FailureConfig) -> Result<Self> {
        let failure_dir = PathBuf::from(&config.failure_dir);
        if config.enabled {
            fs::create_dir_all(&failure_dir)?;
        }

        info!(
            target: FAILURE_HANDLER,
            event_name = "失败处理器初始化",
            enabled = config.enabled,
            failure_dir = %failure_dir.display(),
            "失败数据处理器初始化: enabled={}, dir={}",
            config.enabled,
            failure_dir.display()
        );

        Ok(Self {
            failure_dir,
            enabled: config.enabled,
            saved_batches: AtomicU64::new(0),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn failure_dir(&self) -> &Path {
        &self.failure_dir
    }

    /// 保存一个写入失败的批次，未启用时返回 `None`
    pub fn save_failed_batch(
        &self,
        data_type: &str,
        records: &[KlineBarSnapshot],
        cause: &AppError,
    ) -> Result<Option<PathBuf>> {
        if !self.enabled || records.is_empty() {
            return Ok(None);
        }

        let now = Local::now();
        let batch = FailedBatch {
            data_type: data_type.to_string(),
            failed_at: now.to_rfc3339(),
            error: cause.to_string(),
            retry_count: 0,
            records: records.to_vec(),
        };

        let stem = format!("{}_{}", data_type, now.format("%Y%m%d_%H%M%S_%6f"));
        let mut path = self.failure_dir.join(format!("{}.json", stem));
        let mut seq = 1;
        while path.exists() {
            path = self.failure_dir.join(format!("{}_{}.json", stem, seq));
            seq += 1;
        }

        write_batch_file(&path, &batch)?;
        self.saved_batches.fetch_add(1, Ordering::Relaxed);

        warn!(
            target: FAILURE_HANDLER,
            event_name = "失败批次已保存",
            data_type = data_type,
            count = records.len(),
            path = %path.display(),
            error_type = cause.get_error_type_summary(),
            "写入失败的 {} 条数据已保存: {}",
            records.len(),
            path.display()
        );
        Ok(Some(path))
    }

    /// 列出待重试文件，按文件名（即失败时间）排序
    pub fn pending_files(&self, data_type: Option<&str>) -> Result<Vec<PathBuf>> {
        if !self.failure_dir.exists() {
            return Ok(Vec::new());
        }

        let prefix = data_type.map(|t| format!("{}_", t));
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.failure_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let matches = match (&prefix, path.file_name().and_then(|n| n.to_str())) {
                (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
                (None, Some(_)) => true,
                (_, None) => false,
            };
            if matches {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// 读取一个失败批次文件
    pub fn load_batch(path: &Path) -> Result<FailedBatch> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// 重新写入某类型的所有失败批次
    ///
    /// 成功的文件被删除；失败的文件保留并累加重试次数，无法解析的文件保留不动。
    #[instrument(target = FAILURE_HANDLER, skip_all, fields(backend = writer.name(), data_type = data_type), err)]
    pub fn retry_failed_batches(&self, writer: &dyn KlineWriter, data_type: &str) -> Result<RetryReport> {
        let files = self.pending_files(Some(data_type))?;
        let mut report = RetryReport {
            total: files.len(),
            ..Default::default()
        };

        for path in files {
            let mut batch = match Self::load_batch(&path) {
                Ok(batch) => batch,
                Err(e) => {
                    report.failed += 1;
                    error!(
                        target: FAILURE_HANDLER,
                        event_name = "失败文件无法读取",
                        path = %path.display(),
                        error = %e,
                        "读取失败文件出错: {}, error={}",
                        path.display(),
                        e
                    );
                    continue;
                }
            };

            match writer.write_batch(&batch.records) {
                Ok(_) => {
                    fs::remove_file(&path)?;
                    report.success += 1;
                    info!(
                        target: FAILURE_HANDLER,
                        event_name = "失败批次重试成功",
                        path = %path.display(),
                        count = batch.records.len(),
                        "重试成功: {}, {} 条",
                        path.display(),
                        batch.records.len()
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    batch.retry_count += 1;
                    batch.error = e.to_string();
                    write_batch_file(&path, &batch)?;
                    warn!(
                        target: FAILURE_HANDLER,
                        event_name = "失败批次重试失败",
                        path = %path.display(),
                        retry_count = batch.retry_count,
                        error = %e,
                        "重试失败: {}, retry_count={}, error={}",
                        path.display(),
                        batch.retry_count,
                        e
                    );
                }
            }
        }

        info!(
            target: FAILURE_HANDLER,
            event_name = "失败数据重试完成",
            total = report.total,
            success = report.success,
            failed = report.failed,
            "重试完成: total={}, success={}, failed={}",
            report.total,
            report.success,
            report.failed
        );
        Ok(report)
    }

    /// 删除修改时间早于 `days` 天前的失败文件，返回删除数量
    pub fn clear_old_failures(&self, days: u32) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(u64::from(days) * 24 * 3600))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        for path in self.pending_files(None)? {
            let modified = fs::metadata(&path)?.modified()?;
            if modified < cutoff {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(
                target: FAILURE_HANDLER,
                event_name = "清理过期失败文件",
                removed = removed,
                days = days,
                "已清理 {} 个超过 {} 天的失败文件",
                removed,
                days
            );
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<FailureStats> {
        let files = self.pending_files(None)?;
        let mut pending_records = 0;
        for path in &files {
            if let Ok(batch) = Self::load_batch(path) {
                pending_records += batch.records.len();
            }
        }

        Ok(FailureStats {
            pending_files: files.len(),
            pending_records,
            saved_batches: self.saved_batches.load(Ordering::Relaxed),
        })
    }
}

fn write_batch_file(path: &Path, batch: &FailedBatch) -> Result<()> {
    let content = serde_json::to_string_pretty(batch)?;
    fs::write(path, content)?;
    Ok(())
}
