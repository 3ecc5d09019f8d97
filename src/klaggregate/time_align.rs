//! K线时间对齐与换线判断
//!
//! 分钟K线按整点内分钟数对齐（墙钟对齐），保证不同合约的窗口边界一致；
//! 日K线以交易时段换日，而不是按经过的时长换日。

use crate::klaggregate::{KlinePeriod, TickData};
use crate::klcommon::{AppError, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

/// 日K线名义开盘时间（小时）
pub const DAY_SESSION_OPEN_HOUR: u32 = 9;

/// 日盘收盘时间（小时），之后到达的跨日Tick结束日K线
pub const DAY_SESSION_CLOSE_HOUR: u32 = 15;

/// 夜盘最晚结束时间（小时），之后到达的跨日Tick结束日K线
pub const NIGHT_SESSION_END_HOUR: u32 = 3;

/// 解析Tick时间戳：TradingDay + UpdateTime + UpdateMillisec
///
/// 夜盘Tick的 TradingDay 是下一个交易日，这里不做日期修正。
/// `UpdateMillisec` 超出 0-999 时视为时间戳无效。
pub fn parse_tick_time(tick: &TickData) -> Result<NaiveDateTime> {
    if tick.trading_day.is_empty() || tick.update_time.is_empty() {
        return Err(AppError::MalformedTick(format!(
            "缺少时间字段: TradingDay={:?}, UpdateTime={:?}",
            tick.trading_day, tick.update_time
        )));
    }

    let date = NaiveDate::parse_from_str(&tick.trading_day, "%Y%m%d")?;
    let time = NaiveTime::parse_from_str(&tick.update_time, "%H:%M:%S")?;

    if !(0..=999).contains(&tick.update_millisec) {
        return Err(AppError::MalformedTick(format!("UpdateMillisec超出范围: {}", tick.update_millisec)));
    }

    let dt = date.and_time(time);
    Duration::try_milliseconds(tick.update_millisec)
        .and_then(|millis| dt.checked_add_signed(millis))
        .ok_or_else(|| AppError::MalformedTick(format!("时间戳溢出: UpdateMillisec={}", tick.update_millisec)))
}

/// 计算时间点所在K线窗口的开始时间
pub fn align_start(dt: NaiveDateTime, period: KlinePeriod) -> NaiveDateTime {
    if period.is_daily() {
        return dt.date().and_hms_opt(DAY_SESSION_OPEN_HOUR, 0, 0).unwrap_or(dt);
    }

    let minutes = period.minutes();
    let minute = i64::from(dt.minute());
    let offset = Duration::minutes(minute % minutes)
        + Duration::seconds(i64::from(dt.second()))
        + Duration::nanoseconds(i64::from(dt.nanosecond()));
    dt - offset
}

/// 判断开始于 `start` 的K线在 `now` 时刻是否应该结束
pub fn should_finish(start: NaiveDateTime, period: KlinePeriod, now: NaiveDateTime) -> bool {
    if period.is_daily() {
        return should_finish_daily(start, now);
    }

    now - start >= Duration::minutes(period.minutes())
}

/// 日K线换日规则
///
/// 日期变化且到达日盘收盘后，或日期变化且已过夜盘结束时间，视为新交易时段开始。
/// 两个阈值都以日期变化为前提，保持与既有日线数据一致。
fn should_finish_daily(start: NaiveDateTime, now: NaiveDateTime) -> bool {
    let day_changed = start.date() != now.date();
    if !day_changed {
        return false;
    }

    // 第一个条件被第二个包含，两个阈值都保留，改动换日规则需要业务确认
    now.hour() >= DAY_SESSION_CLOSE_HOUR || now.hour() >= NIGHT_SESSION_END_HOUR
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 12, d).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    fn tick_at(trading_day: &str, update_time: &str, millis: i64) -> TickData {
        TickData {
            instrument_id: "rb2505".to_string(),
            trading_day: trading_day.to_string(),
            update_time: update_time.to_string(),
            update_millisec: millis,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_tick_time() {
        let parsed = parse_tick_time(&tick_at("20251223", "09:30:15", 0)).unwrap();
        assert_eq!(parsed, dt(23, 9, 30, 15));

        let parsed = parse_tick_time(&tick_at("20251223", "09:30:15", 500)).unwrap();
        assert_eq!(parsed, dt(23, 9, 30, 15) + Duration::milliseconds(500));
    }

    #[test]
    fn test_parse_tick_time_failures() {
        assert!(matches!(parse_tick_time(&tick_at("", "09:30:15", 0)), Err(AppError::MalformedTick(_))));
        assert!(matches!(parse_tick_time(&tick_at("20251223", "", 0)), Err(AppError::MalformedTick(_))));
        assert!(matches!(parse_tick_time(&tick_at("2025-12-23", "09:30:15", 0)), Err(AppError::TimeParseError(_))));
        assert!(matches!(parse_tick_time(&tick_at("20251223", "25:00:00", 0)), Err(AppError::TimeParseError(_))));
    }

    #[test]
    fn test_parse_tick_time_rejects_bad_millis() {
        for millis in [-1, 1000, i64::MAX, i64::MIN] {
            assert!(matches!(
                parse_tick_time(&tick_at("20251223", "09:30:15", millis)),
                Err(AppError::MalformedTick(_))
            ));
        }
        let parsed = parse_tick_time(&tick_at("20251223", "23:59:59", 999)).unwrap();
        assert_eq!(parsed, dt(23, 23, 59, 59) + Duration::milliseconds(999));
    }

    #[test]
    fn test_align_minute_periods() {
        let t = dt(23, 9, 37, 25) + Duration::milliseconds(750);

        assert_eq!(align_start(t, KlinePeriod::Min1), dt(23, 9, 37, 0));
        assert_eq!(align_start(t, KlinePeriod::Min3), dt(23, 9, 36, 0));
        assert_eq!(align_start(t, KlinePeriod::Min5), dt(23, 9, 35, 0));
        assert_eq!(align_start(t, KlinePeriod::Min10), dt(23, 9, 30, 0));
        assert_eq!(align_start(t, KlinePeriod::Min15), dt(23, 9, 30, 0));
        assert_eq!(align_start(t, KlinePeriod::Min30), dt(23, 9, 30, 0));
        assert_eq!(align_start(t, KlinePeriod::Min60), dt(23, 9, 0, 0));
    }

    #[test]
    fn test_align_is_idempotent_on_boundaries() {
        let boundary = dt(23, 21, 45, 0);
        assert_eq!(align_start(boundary, KlinePeriod::Min15), boundary);
        assert_eq!(align_start(boundary, KlinePeriod::Min5), boundary);
    }

    #[test]
    fn test_align_daily_to_session_open() {
        assert_eq!(align_start(dt(23, 9, 37, 25), KlinePeriod::Day1), dt(23, 9, 0, 0));
        // 夜盘时间同样对齐到当日9:00
        assert_eq!(align_start(dt(23, 21, 5, 0), KlinePeriod::Day1), dt(23, 9, 0, 0));
        assert_eq!(align_start(dt(23, 1, 5, 0), KlinePeriod::Day1), dt(23, 9, 0, 0));
    }

    #[test]
    fn test_should_finish_minute_bars() {
        let start = dt(23, 9, 30, 0);

        assert!(!should_finish(start, KlinePeriod::Min1, dt(23, 9, 30, 30)));
        assert!(!should_finish(start, KlinePeriod::Min1, dt(23, 9, 30, 59) + Duration::milliseconds(999)));
        assert!(should_finish(start, KlinePeriod::Min1, dt(23, 9, 31, 0)));

        assert!(!should_finish(start, KlinePeriod::Min5, dt(23, 9, 33, 0)));
        assert!(should_finish(start, KlinePeriod::Min5, dt(23, 9, 35, 0)));
        assert!(should_finish(start, KlinePeriod::Min5, dt(23, 11, 0, 0)));
    }

    #[test]
    fn test_should_finish_daily_requires_date_change() {
        let start = dt(23, 9, 0, 0);

        // 同一天内任何时间都不换日
        assert!(!should_finish(start, KlinePeriod::Day1, dt(23, 15, 0, 1)));
        assert!(!should_finish(start, KlinePeriod::Day1, dt(23, 23, 59, 59)));

        // 跨日但还在夜盘延续时段
        assert!(!should_finish(start, KlinePeriod::Day1, dt(24, 0, 30, 0)));
        assert!(!should_finish(start, KlinePeriod::Day1, dt(24, 2, 59, 59)));

        // 跨日且过了夜盘结束时间
        assert!(should_finish(start, KlinePeriod::Day1, dt(24, 3, 0, 0)));
        assert!(should_finish(start, KlinePeriod::Day1, dt(24, 9, 0, 0)));
        assert!(should_finish(start, KlinePeriod::Day1, dt(24, 15, 0, 0)));
    }
}
