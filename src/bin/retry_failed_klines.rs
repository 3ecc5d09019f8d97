//! 失败K线重试工具
//!
//! 把 `FailureHandler` 落盘的失败批次重新写入配置的存储后端。

use anyhow::{Context, Result};
use clap::Parser;
use kline_gateway::klcommon::log_targets::KLINE_GATEWAY;
use kline_gateway::klcommon::{init_logging, GatewayConfig, StorageBackend};
use kline_gateway::klstorage::{CsvKlineWriter, FailureHandler, KlineWriter, SqliteKlineWriter, KLINE_DATA_TYPE};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay persisted failed K-line batches into storage.", long_about = None)]
struct Args {
    /// Path to the TOML config file (falls back to CONFIG_PATH, then config/KlineGatewayConfig.toml).
    #[arg(short, long)]
    config: Option<String>,

    /// Data type prefix of the failure files to replay.
    #[arg(long, default_value = KLINE_DATA_TYPE)]
    data_type: String,

    /// Also delete failure files older than this many days after retrying.
    #[arg(long)]
    clear_days: Option<u32>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = GatewayConfig::resolve_path(args.config.as_deref());
    let config = if Path::new(&config_path).exists() {
        GatewayConfig::from_file(&config_path).with_context(|| format!("加载配置文件失败: {}", config_path))?
    } else {
        GatewayConfig::default()
    };

    let _log_guard = init_logging(&config.logging).context("初始化日志系统失败")?;

    let handler = FailureHandler::new(&config.storage.failure).context("初始化失败数据处理器失败")?;
    let writer: Arc<dyn KlineWriter> = match config.storage.backend {
        StorageBackend::Csv => Arc::new(CsvKlineWriter::new(&config.storage.csv.base_path)?),
        StorageBackend::Sqlite => Arc::new(SqliteKlineWriter::new(&config.storage.sqlite)?),
    };

    let before = handler.stats()?;
    info!(
        target: KLINE_GATEWAY,
        event_name = "开始重试失败数据",
        pending_files = before.pending_files,
        pending_records = before.pending_records,
        backend = writer.name(),
        "待重试: {} 个文件, {} 条K线, 后端={}",
        before.pending_files,
        before.pending_records,
        writer.name()
    );

    let report = handler.retry_failed_batches(writer.as_ref(), &args.data_type)?;
    println!(
        "重试完成: total={}, success={}, failed={}",
        report.total, report.success, report.failed
    );

    if let Some(days) = args.clear_days {
        let removed = handler.clear_old_failures(days)?;
        println!("已清理 {} 个过期失败文件", removed);
    }

    Ok(())
}
