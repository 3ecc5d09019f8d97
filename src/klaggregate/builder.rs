//! 实时K线合成器
//!
//! 为每个合约、每个启用的周期维护一根当前K线。每个Tick依次扇出到所有周期：
//! 窗口已过期则先结束旧K线并交给存储端，再在新窗口上开一根新K线，最后用Tick更新当前K线。
//!
//! 单写者模型：`on_tick` 和 `close` 需要 `&mut self`，多路行情必须由调用方串行化。
//! 统计计数器放在 `Arc<KlineStats>` 中，可以在其他任务里并发读取。

use crate::klaggregate::time_align::{align_start, parse_tick_time, should_finish};
use crate::klaggregate::{KlineBar, KlinePeriod, KlineSink, TickData};
use crate::klcommon::log_targets::KLINE_BUILDER;
use crate::klcommon::Result;
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// 本地时钟，时间戳回退和关闭刷新时使用
pub type Clock = Box<dyn Fn() -> NaiveDateTime + Send + Sync>;

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// 合成器运行计数器
#[derive(Debug)]
pub struct KlineStats {
    ticks_processed: AtomicU64,
    bars_emitted: AtomicU64,
    dropped_ticks: AtomicU64,
    timestamp_fallbacks: AtomicU64,
    sink_failures: AtomicU64,
    active_instruments: AtomicUsize,
    /// 与启用周期一一对应的活跃K线数
    period_active: Vec<(KlinePeriod, AtomicUsize)>,
}

impl KlineStats {
    fn new(periods: &[KlinePeriod]) -> Self {
        Self {
            ticks_processed: AtomicU64::new(0),
            bars_emitted: AtomicU64::new(0),
            dropped_ticks: AtomicU64::new(0),
            timestamp_fallbacks: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            active_instruments: AtomicUsize::new(0),
            period_active: periods.iter().map(|p| (*p, AtomicUsize::new(0))).collect(),
        }
    }

    /// 读取当前计数的快照
    pub fn snapshot(&self) -> KlineBuilderStats {
        let period_counts = self
            .period_active
            .iter()
            .map(|(period, count)| (*period, count.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();

        KlineBuilderStats {
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            bars_emitted: self.bars_emitted.load(Ordering::Relaxed),
            dropped_ticks: self.dropped_ticks.load(Ordering::Relaxed),
            timestamp_fallbacks: self.timestamp_fallbacks.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            active_instruments: self.active_instruments.load(Ordering::Relaxed),
            period_counts,
        }
    }

    fn period_opened(&self, slot: usize) {
        if let Some((_, count)) = self.period_active.get(slot) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn reset_active(&self) {
        self.active_instruments.store(0, Ordering::Relaxed);
        for (_, count) in &self.period_active {
            count.store(0, Ordering::Relaxed);
        }
    }
}

/// 合成器统计快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KlineBuilderStats {
    /// 已处理的Tick数（不含被丢弃的）
    pub ticks_processed: u64,
    /// 成功交给存储端的K线数
    pub bars_emitted: u64,
    /// 因缺少合约代码被丢弃的Tick数
    pub dropped_ticks: u64,
    /// 时间戳缺失或无法解析而使用本地时间的Tick数
    pub timestamp_fallbacks: u64,
    /// 存储端拒收的K线数
    pub sink_failures: u64,
    /// 当前有活跃K线的合约数
    pub active_instruments: usize,
    /// 各周期的活跃K线数，只包含大于0的周期
    pub period_counts: BTreeMap<KlinePeriod, usize>,
}

/// 实时K线合成器
pub struct KlineBuilder {
    sink: Arc<dyn KlineSink>,
    periods: Vec<KlinePeriod>,
    /// 合约 -> 按 `periods` 下标排列的当前K线
    bars: HashMap<String, Vec<Option<KlineBar>>>,
    stats: Arc<KlineStats>,
    clock: Clock,
}

impl KlineBuilder {
    /// 创建K线合成器
    ///
    /// `periods` 为空时启用全部周期；出现未知周期时返回 `InvalidPeriod`，不会跳过。
    #[instrument(target = KLINE_BUILDER, name = "new_kline_builder", skip_all, err)]
    pub fn new<S: AsRef<str>>(sink: Arc<dyn KlineSink>, periods: &[S]) -> Result<Self> {
        let periods = KlinePeriod::parse_list(periods)?;
        let keys: Vec<&str> = periods.iter().map(|p| p.key()).collect();

        info!(
            target: KLINE_BUILDER,
            event_name = "K线合成器初始化",
            periods = ?keys,
            "K线合成器初始化完成，启用周期: {:?}",
            keys
        );

        Ok(Self {
            sink,
            stats: Arc::new(KlineStats::new(&periods)),
            periods,
            bars: HashMap::new(),
            clock: Box::new(local_now),
        })
    }

    /// 替换本地时钟，主要用于测试和回放
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> NaiveDateTime + Send + Sync + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    /// 处理一个Tick
    ///
    /// 不会返回错误：缺少合约代码的Tick被丢弃，时间戳异常的Tick使用本地时间，
    /// 存储端失败只计数。
    pub fn on_tick(&mut self, tick: &TickData) {
        if !tick.has_instrument() {
            self.stats.dropped_ticks.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: KLINE_BUILDER,
                event_name = "Tick缺少合约代码",
                trading_day = %tick.trading_day,
                update_time = %tick.update_time,
                "丢弃缺少合约代码的Tick: trading_day={}, update_time={}",
                tick.trading_day,
                tick.update_time
            );
            return;
        }
        let instrument = tick.instrument_id.as_str();

        let tick_time = match parse_tick_time(tick) {
            Ok(t) => t,
            Err(e) => {
                self.stats.timestamp_fallbacks.fetch_add(1, Ordering::Relaxed);
                let now = (self.clock)();
                debug!(
                    target: KLINE_BUILDER,
                    event_name = "Tick时间戳回退",
                    instrument = %instrument,
                    error = %e,
                    error_type = e.get_error_type_summary(),
                    "Tick时间戳无效，使用本地时间: instrument={}, fallback={}",
                    instrument,
                    now
                );
                now
            }
        };

        self.stats.ticks_processed.fetch_add(1, Ordering::Relaxed);

        if !self.bars.contains_key(instrument) {
            self.bars.insert(instrument.to_string(), vec![None; self.periods.len()]);
            self.stats.active_instruments.fetch_add(1, Ordering::Relaxed);
        }
        let Some(slots) = self.bars.get_mut(instrument) else {
            return;
        };

        for (slot, period) in self.periods.iter().copied().enumerate() {
            let current = &mut slots[slot];

            let expired = matches!(current, Some(bar) if should_finish(bar.start_time, period, tick_time));
            if expired {
                if let Some(mut finished) = current.take() {
                    finished.finish(tick_time);
                    emit_bar(self.sink.as_ref(), &self.stats, &finished);
                }
            } else if current.is_none() {
                self.stats.period_opened(slot);
            }

            current
                .get_or_insert_with(|| KlineBar::new(instrument, period, align_start(tick_time, period)))
                .update(tick);
        }
    }

    /// 关闭合成器，把所有有数据的K线标记完成后交给存储端
    ///
    /// 结束时间取本地时钟，通过 `KlineSink::store_on_close` 交出，不受队列容量限制。
    /// 单根K线写入失败不影响其余K线。
    /// 完成后清空内部状态，返回成功交出的K线数。只应在停止喂Tick后调用一次。
    #[instrument(target = KLINE_BUILDER, name = "close_kline_builder", skip_all)]
    pub fn close(&mut self) -> usize {
        let end_time = (self.clock)();
        let mut flushed = 0;
        let mut attempted = 0;

        for (_, slots) in self.bars.drain() {
            for mut bar in slots.into_iter().flatten() {
                if bar.is_empty() {
                    continue;
                }
                attempted += 1;
                bar.finish(end_time);
                if emit_final_bar(self.sink.as_ref(), &self.stats, &bar) {
                    flushed += 1;
                }
            }
        }
        self.stats.reset_active();

        info!(
            target: KLINE_BUILDER,
            event_name = "K线合成器关闭",
            flushed = flushed,
            failed = attempted - flushed,
            "K线合成器已关闭，刷新K线: 成功={}, 失败={}",
            flushed,
            attempted - flushed
        );
        flushed
    }

    /// 查询某合约某周期的当前K线
    pub fn get_current_bar(&self, instrument_id: &str, period: KlinePeriod) -> Option<&KlineBar> {
        let slot = self.periods.iter().position(|p| *p == period)?;
        self.bars.get(instrument_id)?.get(slot)?.as_ref()
    }

    pub fn stats(&self) -> KlineBuilderStats {
        self.stats.snapshot()
    }

    /// 可跨任务共享的统计句柄
    pub fn stats_handle(&self) -> Arc<KlineStats> {
        self.stats.clone()
    }

    pub fn enabled_periods(&self) -> &[KlinePeriod] {
        &self.periods
    }
}

/// 把完成的K线交给存储端，返回是否成功
fn emit_bar(sink: &dyn KlineSink, stats: &KlineStats, bar: &KlineBar) -> bool {
    log_finished_bar(bar);
    record_store_result(stats, bar, sink.store(bar.snapshot()))
}

/// 关闭刷新时交出K线
fn emit_final_bar(sink: &dyn KlineSink, stats: &KlineStats, bar: &KlineBar) -> bool {
    log_finished_bar(bar);
    record_store_result(stats, bar, sink.store_on_close(bar.snapshot()))
}

fn log_finished_bar(bar: &KlineBar) {
    debug!(
        target: KLINE_BUILDER,
        event_name = "K线完成",
        is_high_freq = true,
        instrument = %bar.instrument_id,
        period = %bar.period,
        start_time = %bar.start_time,
        open = bar.open,
        high = bar.high,
        low = bar.low,
        close = bar.close,
        volume = bar.volume,
        tick_count = bar.tick_count,
        "K线完成: {}",
        bar
    );
}

fn record_store_result(stats: &KlineStats, bar: &KlineBar, result: Result<()>) -> bool {
    match result {
        Ok(()) => {
            stats.bars_emitted.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(e) => {
            stats.sink_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: KLINE_BUILDER,
                event_name = "K线存储失败",
                instrument = %bar.instrument_id,
                period = %bar.period,
                error = %e,
                error_type = e.get_error_type_summary(),
                "K线交给存储端失败: instrument={}, period={}, error={}",
                bar.instrument_id,
                bar.period,
                e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klaggregate::KlineBarSnapshot;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct VecSink {
        bars: Mutex<Vec<KlineBarSnapshot>>,
    }

    #[async_trait]
    impl KlineSink for VecSink {
        fn store(&self, bar: KlineBarSnapshot) -> Result<()> {
            self.bars.lock().unwrap().push(bar);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn tick(instrument: &str, time: &str, price: f64) -> TickData {
        TickData {
            instrument_id: instrument.to_string(),
            trading_day: "20251223".to_string(),
            update_time: time.to_string(),
            last_price: price,
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_period_fails_construction() {
        let sink = Arc::new(VecSink::default());
        let result = KlineBuilder::new(sink, &["1m", "7m"]);
        assert!(matches!(result, Err(crate::klcommon::AppError::InvalidPeriod(p)) if p == "7m"));
    }

    #[test]
    fn test_get_current_bar_for_disabled_period() {
        let sink = Arc::new(VecSink::default());
        let mut builder = KlineBuilder::new(sink, &["1m"]).unwrap();
        builder.on_tick(&tick("rb2505", "09:30:00", 3500.0));

        assert!(builder.get_current_bar("rb2505", KlinePeriod::Min1).is_some());
        assert!(builder.get_current_bar("rb2505", KlinePeriod::Min5).is_none());
        assert!(builder.get_current_bar("cu2505", KlinePeriod::Min1).is_none());
    }

    #[test]
    fn test_stats_track_instruments_and_periods() {
        let sink = Arc::new(VecSink::default());
        let mut builder = KlineBuilder::new(sink, &["1m", "5m"]).unwrap();
        let handle = builder.stats_handle();

        builder.on_tick(&tick("rb2505", "09:30:00", 3500.0));
        builder.on_tick(&tick("cu2505", "09:30:10", 72000.0));
        builder.on_tick(&tick("rb2505", "09:31:00", 3501.0));

        let stats = handle.snapshot();
        assert_eq!(stats.ticks_processed, 3);
        assert_eq!(stats.bars_emitted, 1);
        assert_eq!(stats.active_instruments, 2);
        assert_eq!(stats.period_counts.get(&KlinePeriod::Min1), Some(&2));
        assert_eq!(stats.period_counts.get(&KlinePeriod::Min5), Some(&2));
        assert!(!stats.period_counts.contains_key(&KlinePeriod::Day1));

        builder.close();
        let stats = builder.stats();
        assert_eq!(stats.active_instruments, 0);
        assert!(stats.period_counts.is_empty());
        assert_eq!(stats.bars_emitted, 5);
    }

    #[test]
    fn test_close_twice_flushes_nothing_second_time() {
        let sink = Arc::new(VecSink::default());
        let mut builder = KlineBuilder::new(sink.clone(), &["1m"]).unwrap();
        builder.on_tick(&tick("rb2505", "09:30:00", 3500.0));

        assert_eq!(builder.close(), 1);
        assert_eq!(builder.close(), 0);
        assert_eq!(sink.bars.lock().unwrap().len(), 1);
    }
}
