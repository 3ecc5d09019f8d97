//! K线数据结构

use crate::klaggregate::{KlinePeriod, TickData};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 非有限浮点数序列化为 `null`，反序列化时 `null` 还原为 NaN
mod nullable_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// 一根K线，表示一个合约在一个周期窗口内的OHLCV
///
/// 由 `KlineBuilder` 独占持有。成交量、成交额、持仓量保存的是上游推送的
/// 累计值（最后一次观察到的值），不是窗口内的增量。
#[derive(Debug, Clone, PartialEq)]
pub struct KlineBar {
    /// 合约代码
    pub instrument_id: String,
    /// K线周期
    pub period: KlinePeriod,

    /// K线开始时间（对齐后的窗口起点）
    pub start_time: NaiveDateTime,
    /// K线结束时间，仅在完成时设置
    pub end_time: Option<NaiveDateTime>,
    /// 交易日，取自第一个Tick
    pub trading_day: String,

    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,

    /// 累计成交量
    pub volume: i64,
    /// 累计成交额
    pub turnover: f64,
    /// 持仓量
    pub open_interest: f64,

    /// 合成进该K线的Tick数量
    pub tick_count: u64,
    /// 是否已完成
    pub is_finished: bool,
}

impl KlineBar {
    /// 创建一根空K线，`start_time` 由调用方负责对齐
    pub fn new(instrument_id: impl Into<String>, period: KlinePeriod, start_time: NaiveDateTime) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            period,
            start_time,
            end_time: None,
            trading_day: String::new(),
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0,
            turnover: 0.0,
            open_interest: 0.0,
            tick_count: 0,
            is_finished: false,
        }
    }

    /// 用一个Tick更新K线
    ///
    /// 价格不做校验，非有限值会原样进入K线字段。
    pub fn update(&mut self, tick: &TickData) {
        let price = tick.last_price;

        if self.tick_count == 0 {
            self.open = price;
            self.high = price;
            self.low = price;
            self.trading_day = tick.trading_day.clone();
        } else {
            self.high = self.high.max(price);
            self.low = self.low.min(price);
        }
        self.close = price;

        // 累计值，后写覆盖
        self.volume = tick.volume;
        self.turnover = tick.turnover;
        self.open_interest = tick.open_interest;

        self.tick_count += 1;
    }

    /// 标记K线完成
    pub fn finish(&mut self, end_time: NaiveDateTime) {
        self.is_finished = true;
        self.end_time = Some(end_time);
    }

    pub fn is_empty(&self) -> bool {
        self.tick_count == 0
    }

    /// 生成交给存储端的不可变快照
    pub fn snapshot(&self) -> KlineBarSnapshot {
        KlineBarSnapshot {
            instrument_id: self.instrument_id.clone(),
            period: self.period,
            trading_day: self.trading_day.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            turnover: self.turnover,
            open_interest: self.open_interest,
            tick_count: self.tick_count,
            is_finished: self.is_finished,
        }
    }
}

impl fmt::Display for KlineBar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KlineBar({}, {}, O:{}, H:{}, L:{}, C:{}, V:{}, ticks:{})",
            self.instrument_id, self.period, self.open, self.high, self.low, self.close, self.volume, self.tick_count
        )
    }
}

/// 已完成K线的快照，存储端和失败重试文件都使用这个格式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineBarSnapshot {
    pub instrument_id: String,
    pub period: KlinePeriod,
    pub trading_day: String,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    #[serde(with = "nullable_f64")]
    pub open: f64,
    #[serde(with = "nullable_f64")]
    pub high: f64,
    #[serde(with = "nullable_f64")]
    pub low: f64,
    #[serde(with = "nullable_f64")]
    pub close: f64,
    pub volume: i64,
    #[serde(with = "nullable_f64")]
    pub turnover: f64,
    #[serde(with = "nullable_f64")]
    pub open_interest: f64,
    pub tick_count: u64,
    pub is_finished: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 12, 23).unwrap().and_hms_opt(9, 30, 0).unwrap()
    }

    fn tick(price: f64, volume: i64, turnover: f64, open_interest: f64) -> TickData {
        TickData {
            instrument_id: "rb2505".to_string(),
            trading_day: "20251223".to_string(),
            last_price: price,
            volume,
            turnover,
            open_interest,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_bar_is_empty() {
        let bar = KlineBar::new("rb2505", KlinePeriod::Min1, start());
        assert_eq!(bar.instrument_id, "rb2505");
        assert_eq!(bar.period, KlinePeriod::Min1);
        assert_eq!(bar.tick_count, 0);
        assert!(bar.is_empty());
        assert!(!bar.is_finished);
        assert!(bar.end_time.is_none());
    }

    #[test]
    fn test_update_tracks_ohlc() {
        let mut bar = KlineBar::new("rb2505", KlinePeriod::Min1, start());

        bar.update(&tick(3500.0, 100, 350000.0, 1000.0));
        assert_eq!((bar.open, bar.high, bar.low, bar.close), (3500.0, 3500.0, 3500.0, 3500.0));
        assert_eq!(bar.trading_day, "20251223");
        assert_eq!(bar.tick_count, 1);

        bar.update(&tick(3510.0, 150, 526500.0, 1050.0));
        assert_eq!((bar.open, bar.high, bar.low, bar.close), (3500.0, 3510.0, 3500.0, 3510.0));
        assert_eq!(bar.tick_count, 2);

        bar.update(&tick(3490.0, 200, 698000.0, 1100.0));
        assert_eq!((bar.open, bar.high, bar.low, bar.close), (3500.0, 3510.0, 3490.0, 3490.0));
        assert_eq!(bar.tick_count, 3);
    }

    #[test]
    fn test_cumulative_fields_are_overwritten_not_summed() {
        let mut bar = KlineBar::new("rb2505", KlinePeriod::Min5, start());
        bar.update(&tick(3500.0, 100, 350000.0, 1000.0));
        bar.update(&tick(3501.0, 180, 630180.0, 990.0));

        assert_eq!(bar.volume, 180);
        assert_eq!(bar.turnover, 630180.0);
        assert_eq!(bar.open_interest, 990.0);
    }

    #[test]
    fn test_first_tick_sets_trading_day_only_once() {
        let mut bar = KlineBar::new("rb2505", KlinePeriod::Day1, start());
        bar.update(&tick(3500.0, 1, 1.0, 1.0));

        let mut next_day = tick(3505.0, 2, 2.0, 2.0);
        next_day.trading_day = "20251224".to_string();
        bar.update(&next_day);

        assert_eq!(bar.trading_day, "20251223");
    }

    #[test]
    fn test_zero_price_first_tick_still_opens() {
        // 以tick_count而不是open==0判断首个Tick
        let mut bar = KlineBar::new("rb2505", KlinePeriod::Min1, start());
        bar.update(&tick(0.0, 1, 0.0, 0.0));
        bar.update(&tick(5.0, 2, 10.0, 0.0));
        assert_eq!(bar.open, 0.0);
        assert_eq!(bar.low, 0.0);
        assert_eq!(bar.high, 5.0);
    }

    #[test]
    fn test_ohlc_invariant_holds_after_every_update() {
        let mut bar = KlineBar::new("rb2505", KlinePeriod::Min1, start());
        let prices = [3500.0, 3498.5, 3512.0, 3499.0, 3512.0, 3480.0, 3501.0];
        for (i, price) in prices.iter().enumerate() {
            bar.update(&tick(*price, i as i64, 0.0, 0.0));
            assert!(bar.low <= bar.open.min(bar.close));
            assert!(bar.high >= bar.open.max(bar.close));
        }
    }

    #[test]
    fn test_snapshot_after_finish() {
        let mut bar = KlineBar::new("rb2505", KlinePeriod::Min5, start());
        bar.update(&tick(3500.0, 1000, 1.0, 1.0));
        let end = start() + chrono::Duration::minutes(5);
        bar.finish(end);

        let snap = bar.snapshot();
        assert_eq!(snap.instrument_id, "rb2505");
        assert_eq!(snap.period, KlinePeriod::Min5);
        assert_eq!(snap.start_time, start());
        assert_eq!(snap.end_time, Some(end));
        assert_eq!(snap.volume, 1000);
        assert!(snap.is_finished);
    }
}
