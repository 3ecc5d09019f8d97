//! 队列化K线存储端
//!
//! `store` 只做 `try_send` 入队，后台任务按批次调用阻塞式写入后端。
//! 批次在数量达到 `batch_size`、定时器触发或关闭时写出；写入失败的批次交给 `FailureHandler`。
//! 合成器关闭刷新的K线在队列满时暂存到 `backlog`，`close` 时等待队列空位逐条送入，不会丢弃。

use crate::klaggregate::{KlineBarSnapshot, KlineSink};
use crate::klcommon::log_targets::KLINE_SINK;
use crate::klcommon::{AppError, Result, StorageConfig};
use crate::klstorage::{FailureHandler, KlineWriter, KLINE_DATA_TYPE};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// 队列参数
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub queue_size: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl SinkOptions {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            queue_size: config.queue_size.max(1),
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
        }
    }
}

/// 存储端统计快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    /// 成功写入的K线数
    pub write_count: u64,
    /// 写入失败的K线数
    pub error_count: u64,
    /// 入队失败被丢弃的K线数
    pub dropped_count: u64,
    /// 队列中尚未被写入任务取走的K线数
    pub queued: usize,
    pub running: bool,
    pub backend: String,
}

#[derive(Debug, Default)]
struct SinkCounters {
    write_count: AtomicU64,
    error_count: AtomicU64,
    dropped_count: AtomicU64,
    queued: AtomicUsize,
    running: AtomicBool,
}

enum WriterCommand {
    Store(KlineBarSnapshot),
    Shutdown(oneshot::Sender<()>),
}

/// 队列化K线存储端
pub struct QueuedKlineSink {
    sender: mpsc::Sender<WriterCommand>,
    counters: Arc<SinkCounters>,
    closed: AtomicBool,
    /// 关闭刷新时队列已满的K线
    backlog: StdMutex<Vec<KlineBarSnapshot>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    backend: &'static str,
}

impl QueuedKlineSink {
    /// 启动后台写入任务，必须在tokio运行时内调用
    pub fn start(writer: Arc<dyn KlineWriter>, options: SinkOptions, failure_handler: Option<Arc<FailureHandler>>) -> Self {
        let (sender, receiver) = mpsc::channel(options.queue_size);
        let counters = Arc::new(SinkCounters::default());
        counters.running.store(true, Ordering::SeqCst);
        let backend = writer.name();

        info!(
            target: KLINE_SINK,
            event_name = "存储任务启动",
            backend = backend,
            queue_size = options.queue_size,
            batch_size = options.batch_size,
            flush_interval_ms = options.flush_interval.as_millis() as u64,
            "K线存储任务启动: backend={}, queue_size={}, batch_size={}",
            backend,
            options.queue_size,
            options.batch_size
        );

        let task = WriterTask {
            receiver,
            writer,
            options,
            failure_handler,
            counters: counters.clone(),
        };
        let handle = tokio::spawn(task.run());

        Self {
            sender,
            counters,
            closed: AtomicBool::new(false),
            backlog: StdMutex::new(Vec::new()),
            handle: Mutex::new(Some(handle)),
            backend,
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            write_count: self.counters.write_count.load(Ordering::Relaxed),
            error_count: self.counters.error_count.load(Ordering::Relaxed),
            dropped_count: self.counters.dropped_count.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            running: self.counters.running.load(Ordering::Relaxed),
            backend: self.backend.to_string(),
        }
    }

    fn reject(&self, reason: &str, bar: &KlineBarSnapshot) -> AppError {
        self.counters.dropped_count.fetch_add(1, Ordering::Relaxed);
        warn!(
            target: KLINE_SINK,
            event_name = "K线入队失败",
            instrument = %bar.instrument_id,
            period = %bar.period,
            reason = reason,
            "K线入队失败: instrument={}, period={}, reason={}",
            bar.instrument_id,
            bar.period,
            reason
        );
        AppError::ChannelError(format!("{}: {} {}", reason, bar.instrument_id, bar.period))
    }

    fn take_backlog(&self) -> Vec<KlineBarSnapshot> {
        match self.backlog.lock() {
            Ok(mut backlog) => std::mem::take(&mut *backlog),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// 等待队列空位，把暂存的K线送进写入任务
    async fn drain_backlog(&self) {
        let backlog = self.take_backlog();
        if backlog.is_empty() {
            return;
        }

        let total = backlog.len();
        info!(
            target: KLINE_SINK,
            event_name = "写出暂存K线",
            count = total,
            "关闭前写出暂存的 {} 根K线",
            total
        );
        for bar in backlog {
            let sent = self.sender.send(WriterCommand::Store(bar)).await;
            if let Err(mpsc::error::SendError(WriterCommand::Store(bar))) = sent {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                self.reject("写入队列已关闭", &bar);
            }
        }
    }
}

#[async_trait]
impl KlineSink for QueuedKlineSink {
    fn store(&self, bar: KlineBarSnapshot) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.reject("存储端已关闭", &bar));
        }

        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        match self.sender.try_send(WriterCommand::Store(bar)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(WriterCommand::Store(bar))) => {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                Err(self.reject("写入队列已满", &bar))
            }
            Err(TrySendError::Closed(WriterCommand::Store(bar))) => {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                Err(self.reject("写入队列已关闭", &bar))
            }
            Err(_) => {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                Err(AppError::ChannelError("写入队列不可用".to_string()))
            }
        }
    }

    /// 队列满时暂存，`close` 时写出
    fn store_on_close(&self, bar: KlineBarSnapshot) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.reject("存储端已关闭", &bar));
        }

        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        match self.sender.try_send(WriterCommand::Store(bar)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(WriterCommand::Store(bar))) => {
                match self.backlog.lock() {
                    Ok(mut backlog) => backlog.push(bar),
                    Err(poisoned) => poisoned.into_inner().push(bar),
                }
                Ok(())
            }
            Err(TrySendError::Closed(WriterCommand::Store(bar))) => {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                Err(self.reject("写入队列已关闭", &bar))
            }
            Err(_) => {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                Err(AppError::ChannelError("写入队列不可用".to_string()))
            }
        }
    }

    /// 写出暂存和缓冲中的K线并等待后台任务退出，重复调用无副作用
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.drain_backlog().await;

        let (done_tx, done_rx) = oneshot::channel();
        if self.sender.send(WriterCommand::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }

        if let Some(handle) = self.handle.lock().await.take() {
            handle
                .await
                .map_err(|e| AppError::SinkError(format!("存储任务异常退出: {}", e)))?;
        }

        let stats = self.stats();
        info!(
            target: KLINE_SINK,
            event_name = "存储任务停止",
            backend = %stats.backend,
            write_count = stats.write_count,
            error_count = stats.error_count,
            dropped_count = stats.dropped_count,
            "K线存储已关闭: written={}, errors={}, dropped={}",
            stats.write_count,
            stats.error_count,
            stats.dropped_count
        );
        Ok(())
    }
}

/// 后台写入任务
struct WriterTask {
    receiver: mpsc::Receiver<WriterCommand>,
    writer: Arc<dyn KlineWriter>,
    options: SinkOptions,
    failure_handler: Option<Arc<FailureHandler>>,
    counters: Arc<SinkCounters>,
}

impl WriterTask {
    async fn run(mut self) {
        let mut batch: Vec<KlineBarSnapshot> = Vec::with_capacity(self.options.batch_size);
        let mut ticker = tokio::time::interval(self.options.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval 的第一次 tick 立即完成
        ticker.tick().await;

        loop {
            tokio::select! {
                command = self.receiver.recv() => match command {
                    Some(WriterCommand::Store(bar)) => {
                        self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                        batch.push(bar);
                        if batch.len() >= self.options.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    Some(WriterCommand::Shutdown(done)) => {
                        // 关闭前已入队的K线也要写出
                        self.receiver.close();
                        while let Ok(command) = self.receiver.try_recv() {
                            if let WriterCommand::Store(bar) = command {
                                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                                batch.push(bar);
                            }
                        }
                        self.flush(&mut batch).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.flush(&mut batch).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }

        self.counters.running.store(false, Ordering::SeqCst);
        debug!(target: KLINE_SINK, event_name = "存储任务退出", "K线写入任务退出");
    }

    async fn flush(&self, batch: &mut Vec<KlineBarSnapshot>) {
        if batch.is_empty() {
            return;
        }

        let bars = std::mem::replace(batch, Vec::with_capacity(self.options.batch_size));
        let count = bars.len();
        let writer = self.writer.clone();

        let result = tokio::task::spawn_blocking(move || {
            let result = writer.write_batch(&bars);
            (bars, result)
        })
        .await;

        match result {
            Ok((_, Ok(written))) => {
                self.counters.write_count.fetch_add(written as u64, Ordering::Relaxed);
                debug!(
                    target: KLINE_SINK,
                    event_name = "批量写入完成",
                    count = written,
                    "批量写入 {} 条K线",
                    written
                );
            }
            Ok((bars, Err(e))) => {
                self.counters.error_count.fetch_add(count as u64, Ordering::Relaxed);
                error!(
                    target: KLINE_SINK,
                    event_name = "批量写入失败",
                    count = count,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    retryable = e.is_retryable(),
                    "批量写入 {} 条K线失败: {}",
                    count,
                    e
                );
                self.persist_failure(&bars, &e);
            }
            Err(join_error) => {
                self.counters.error_count.fetch_add(count as u64, Ordering::Relaxed);
                error!(
                    target: KLINE_SINK,
                    event_name = "写入线程异常",
                    count = count,
                    error = %join_error,
                    "写入线程异常，{} 条K线丢失: {}",
                    count,
                    join_error
                );
            }
        }
    }

    fn persist_failure(&self, bars: &[KlineBarSnapshot], cause: &AppError) {
        let Some(handler) = &self.failure_handler else {
            return;
        };
        if !cause.is_retryable() {
            return;
        }
        if let Err(e) = handler.save_failed_batch(KLINE_DATA_TYPE, bars, cause) {
            error!(
                target: KLINE_SINK,
                event_name = "失败批次保存失败",
                count = bars.len(),
                error = %e,
                "保存失败批次出错，{} 条K线丢失: {}",
                bars.len(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klaggregate::KlinePeriod;
    use crate::klcommon::FailureConfig;
    use chrono::NaiveDate;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryWriter {
        batches: StdMutex<Vec<Vec<KlineBarSnapshot>>>,
        fail: bool,
    }

    impl KlineWriter for MemoryWriter {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn write_batch(&self, bars: &[KlineBarSnapshot]) -> Result<usize> {
            if self.fail {
                return Err(AppError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
            }
            self.batches.lock().unwrap().push(bars.to_vec());
            Ok(bars.len())
        }
    }

    impl MemoryWriter {
        fn total(&self) -> usize {
            self.batches.lock().unwrap().iter().map(Vec::len).sum()
        }
    }

    fn bar(minute: u32) -> KlineBarSnapshot {
        KlineBarSnapshot {
            instrument_id: "rb2505".to_string(),
            period: KlinePeriod::Min1,
            trading_day: "20251223".to_string(),
            start_time: NaiveDate::from_ymd_opt(2025, 12, 23).unwrap().and_hms_opt(9, minute, 0).unwrap(),
            end_time: None,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1,
            turnover: 1.0,
            open_interest: 1.0,
            tick_count: 1,
            is_finished: true,
        }
    }

    fn options(queue_size: usize, batch_size: usize, flush_ms: u64) -> SinkOptions {
        SinkOptions {
            queue_size,
            batch_size,
            flush_interval: Duration::from_millis(flush_ms),
        }
    }

    #[tokio::test]
    async fn test_close_flushes_buffered_bars() {
        let writer = Arc::new(MemoryWriter::default());
        let sink = QueuedKlineSink::start(writer.clone(), options(100, 50, 60_000), None);

        for minute in 0..7 {
            sink.store(bar(minute)).unwrap();
        }
        sink.close().await.unwrap();

        assert_eq!(writer.total(), 7);
        let stats = sink.stats();
        assert_eq!(stats.write_count, 7);
        assert_eq!(stats.queued, 0);
        assert!(!stats.running);
        assert_eq!(stats.backend, "memory");
    }

    #[tokio::test]
    async fn test_batch_size_triggers_write() {
        let writer = Arc::new(MemoryWriter::default());
        let sink = QueuedKlineSink::start(writer.clone(), options(100, 3, 60_000), None);

        for minute in 0..6 {
            sink.store(bar(minute)).unwrap();
        }

        for _ in 0..100 {
            if writer.total() == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sizes: Vec<usize> = writer.batches.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3]);

        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_interval_writes_partial_batch() {
        let writer = Arc::new(MemoryWriter::default());
        let sink = QueuedKlineSink::start(writer.clone(), options(100, 1000, 20), None);

        sink.store(bar(0)).unwrap();
        for _ in 0..100 {
            if writer.total() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(writer.total(), 1);

        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let writer = Arc::new(MemoryWriter::default());
        let sink = QueuedKlineSink::start(writer.clone(), options(1, 10, 60_000), None);

        // 单线程运行时下写入任务还没有机会消费队列
        sink.store(bar(0)).unwrap();
        let err = sink.store(bar(1)).unwrap_err();
        assert!(matches!(err, AppError::ChannelError(_)));
        assert_eq!(sink.stats().dropped_count, 1);

        sink.close().await.unwrap();
        assert_eq!(writer.total(), 1);
    }

    #[tokio::test]
    async fn test_close_flush_beyond_queue_capacity_is_lossless() {
        let writer = Arc::new(MemoryWriter::default());
        let sink = QueuedKlineSink::start(writer.clone(), options(4, 8, 60_000), None);

        // 单线程运行时下写入任务不会在这期间消费，超出容量的K线进入暂存
        for minute in 0..50 {
            sink.store_on_close(bar(minute)).unwrap();
        }
        assert_eq!(sink.stats().queued, 50);
        assert_eq!(sink.stats().dropped_count, 0);

        sink.close().await.unwrap();
        assert_eq!(writer.total(), 50);
        let stats = sink.stats();
        assert_eq!(stats.write_count, 50);
        assert_eq!(stats.dropped_count, 0);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_store_on_close_after_close_fails() {
        let writer = Arc::new(MemoryWriter::default());
        let sink = QueuedKlineSink::start(writer, options(4, 8, 60_000), None);
        sink.close().await.unwrap();

        assert!(matches!(sink.store_on_close(bar(0)), Err(AppError::ChannelError(_))));
        assert_eq!(sink.stats().dropped_count, 1);
    }

    #[tokio::test]
    async fn test_store_after_close_fails() {
        let writer = Arc::new(MemoryWriter::default());
        let sink = QueuedKlineSink::start(writer, options(10, 10, 60_000), None);
        sink.close().await.unwrap();
        sink.close().await.unwrap();

        assert!(matches!(sink.store(bar(0)), Err(AppError::ChannelError(_))));
    }

    #[tokio::test]
    async fn test_failed_batch_saved_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(
            FailureHandler::new(&FailureConfig {
                enabled: true,
                failure_dir: dir.path().to_string_lossy().to_string(),
                retention_days: 7,
            })
            .unwrap(),
        );
        let writer = Arc::new(MemoryWriter { fail: true, ..Default::default() });
        let sink = QueuedKlineSink::start(writer, options(10, 10, 60_000), Some(handler.clone()));

        sink.store(bar(0)).unwrap();
        sink.store(bar(1)).unwrap();
        sink.close().await.unwrap();

        assert_eq!(sink.stats().error_count, 2);
        let stats = handler.stats().unwrap();
        assert_eq!(stats.pending_files, 1);
        assert_eq!(stats.pending_records, 2);
    }
}
