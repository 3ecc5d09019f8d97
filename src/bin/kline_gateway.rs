//! K线网关服务启动文件
//!
//! 从JSON-lines Tick流实时合成多周期K线并写入存储。
//! 关闭顺序：停止行情 -> 合成器刷新未完成K线 -> 存储端写出缓冲。

use anyhow::{Context, Result};
use clap::Parser;
use kline_gateway::klaggregate::{KlineBuilder, KlineSink, KlineStats};
use kline_gateway::klcommon::log_targets::KLINE_GATEWAY;
use kline_gateway::klcommon::{init_logging, GatewayConfig, StorageBackend, StorageConfig};
use kline_gateway::klfeed::{FeedStats, TickFeed};
use kline_gateway::klstorage::{
    CsvKlineWriter, FailureHandler, KlineWriter, QueuedKlineSink, SinkOptions, SqliteKlineWriter,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time K-line aggregation gateway.", long_about = None)]
struct Args {
    /// Path to the TOML config file (falls back to CONFIG_PATH, then config/KlineGatewayConfig.toml).
    #[arg(short, long)]
    config: Option<String>,

    /// JSON-lines tick file to replay; reads stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = GatewayConfig::resolve_path(args.config.as_deref());
    let (config, loaded_from_file) = if Path::new(&config_path).exists() {
        let config = GatewayConfig::from_file(&config_path)
            .with_context(|| format!("加载配置文件失败: {}", config_path))?;
        (config, true)
    } else {
        (GatewayConfig::default(), false)
    };

    let _log_guard = init_logging(&config.logging).context("初始化日志系统失败")?;

    if loaded_from_file {
        info!(target: KLINE_GATEWAY, event_name = "配置加载完成", path = %config_path, "配置加载完成: {}", config_path);
    } else {
        warn!(target: KLINE_GATEWAY, event_name = "使用默认配置", path = %config_path, "配置文件不存在，使用默认配置: {}", config_path);
    }

    if !config.kline.enabled {
        info!(target: KLINE_GATEWAY, event_name = "K线合成未启用", "K线合成未启用，退出");
        return Ok(());
    }

    let failure_handler = if config.storage.failure.enabled {
        let handler = FailureHandler::new(&config.storage.failure).context("初始化失败数据处理器失败")?;
        handler.clear_old_failures(config.storage.failure.retention_days)?;
        Some(Arc::new(handler))
    } else {
        None
    };

    let writer = open_writer(&config.storage)?;
    let sink = Arc::new(QueuedKlineSink::start(
        writer,
        SinkOptions::from_config(&config.storage),
        failure_handler,
    ));

    let mut builder = KlineBuilder::new(sink.clone(), &config.kline.periods).context("创建K线合成器失败")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());
    let stats_task = spawn_stats_reporter(
        builder.stats_handle(),
        sink.clone(),
        config.feed.stats_interval_secs,
        cancel.clone(),
    );

    // 行情出错也要走完关闭流程，未完成的K线和缓冲批次不能丢
    let feed_result = run_feed(args.input.as_deref(), &mut builder, cancel.clone()).await;

    cancel.cancel();
    let flushed = builder.close();
    let sink_result = sink.close().await;
    if let Some(task) = stats_task {
        let _ = task.await;
    }

    let feed_stats = feed_result?;
    sink_result.context("关闭K线存储失败")?;

    info!(
        target: KLINE_GATEWAY,
        event_name = "网关已关闭",
        ticks = feed_stats.ticks_parsed,
        invalid_lines = feed_stats.invalid_lines,
        flushed = flushed,
        builder_stats = ?builder.stats(),
        sink_stats = ?sink.stats(),
        "K线网关已关闭: ticks={}, flushed={}",
        feed_stats.ticks_parsed,
        flushed
    );
    Ok(())
}

/// 从文件或标准输入读取行情，直到EOF、取消或读取出错
async fn run_feed(input: Option<&Path>, builder: &mut KlineBuilder, cancel: CancellationToken) -> Result<FeedStats> {
    let result = match input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("打开行情文件失败: {}", path.display()))?;
            TickFeed::new(path.display().to_string())
                .run(BufReader::new(file), builder, cancel)
                .await
        }
        None => TickFeed::new("stdin").run(BufReader::new(tokio::io::stdin()), builder, cancel).await,
    };

    result.map_err(|e| {
        error!(
            target: KLINE_GATEWAY,
            event_name = "行情接入失败",
            error = %e,
            error_type = e.get_error_type_summary(),
            "行情读取出错，开始关闭: {}",
            e
        );
        anyhow::Error::new(e).context("读取行情失败")
    })
}

/// 按配置打开存储后端
fn open_writer(config: &StorageConfig) -> Result<Arc<dyn KlineWriter>> {
    let writer: Arc<dyn KlineWriter> = match config.backend {
        StorageBackend::Csv => Arc::new(CsvKlineWriter::new(&config.csv.base_path).context("初始化CSV存储失败")?),
        StorageBackend::Sqlite => Arc::new(SqliteKlineWriter::new(&config.sqlite).context("初始化SQLite存储失败")?),
    };
    Ok(writer)
}

/// Ctrl+C 触发取消
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    info!(target: KLINE_GATEWAY, event_name = "收到关闭信号", "收到Ctrl+C，开始优雅关闭...");
                    cancel.cancel();
                }
            }
            _ = cancel.cancelled() => {}
        }
    });
}

/// 定时输出合成器与存储端统计
fn spawn_stats_reporter(
    stats: Arc<KlineStats>,
    sink: Arc<QueuedKlineSink>,
    interval_secs: u64,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let builder_stats = stats.snapshot();
                    let sink_stats = sink.stats();
                    info!(
                        target: KLINE_GATEWAY,
                        event_name = "运行统计",
                        ticks_processed = builder_stats.ticks_processed,
                        bars_emitted = builder_stats.bars_emitted,
                        dropped_ticks = builder_stats.dropped_ticks,
                        timestamp_fallbacks = builder_stats.timestamp_fallbacks,
                        sink_failures = builder_stats.sink_failures,
                        active_instruments = builder_stats.active_instruments,
                        period_counts = ?builder_stats.period_counts,
                        write_count = sink_stats.write_count,
                        dropped_count = sink_stats.dropped_count,
                        queued = sink_stats.queued,
                        "运行统计: ticks={}, bars={}, instruments={}, written={}",
                        builder_stats.ticks_processed,
                        builder_stats.bars_emitted,
                        builder_stats.active_instruments,
                        sink_stats.write_count
                    );
                }
            }
        }
    }))
}
