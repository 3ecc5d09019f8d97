//! K线周期定义

use crate::klcommon::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// K线周期
///
/// 分钟周期按整点内的分钟数对齐；日线按交易时段换日，分钟数仅用于展示。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KlinePeriod {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "3m")]
    Min3,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "10m")]
    Min10,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "60m")]
    Min60,
    #[serde(rename = "1d")]
    Day1,
}

impl KlinePeriod {
    /// 所有支持的周期，按从短到长排列
    pub const ALL: [KlinePeriod; 8] = [
        KlinePeriod::Min1,
        KlinePeriod::Min3,
        KlinePeriod::Min5,
        KlinePeriod::Min10,
        KlinePeriod::Min15,
        KlinePeriod::Min30,
        KlinePeriod::Min60,
        KlinePeriod::Day1,
    ];

    /// 周期对应的分钟数，日线返回1440（24小时）
    pub fn minutes(&self) -> i64 {
        match self {
            KlinePeriod::Min1 => 1,
            KlinePeriod::Min3 => 3,
            KlinePeriod::Min5 => 5,
            KlinePeriod::Min10 => 10,
            KlinePeriod::Min15 => 15,
            KlinePeriod::Min30 => 30,
            KlinePeriod::Min60 => 60,
            KlinePeriod::Day1 => 1440,
        }
    }

    /// 周期的规范字符串，跨进程重启保持不变，用于存储命名
    pub fn key(&self) -> &'static str {
        match self {
            KlinePeriod::Min1 => "1m",
            KlinePeriod::Min3 => "3m",
            KlinePeriod::Min5 => "5m",
            KlinePeriod::Min10 => "10m",
            KlinePeriod::Min15 => "15m",
            KlinePeriod::Min30 => "30m",
            KlinePeriod::Min60 => "60m",
            KlinePeriod::Day1 => "1d",
        }
    }

    /// K线表名称，如 "kline_1m"
    pub fn measurement_name(&self) -> String {
        format!("kline_{}", self.key())
    }

    pub fn is_daily(&self) -> bool {
        matches!(self, KlinePeriod::Day1)
    }

    /// 从规范字符串解析周期，大小写敏感、完全匹配
    pub fn parse(key: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.key() == key)
            .ok_or_else(|| AppError::InvalidPeriod(key.to_string()))
    }

    /// 解析一组周期配置，遇到未知周期立即失败
    ///
    /// 空列表表示启用全部周期；重复的周期只保留第一次出现的位置。
    pub fn parse_list<S: AsRef<str>>(keys: &[S]) -> Result<Vec<KlinePeriod>> {
        if keys.is_empty() {
            return Ok(Self::ALL.to_vec());
        }

        let mut periods = Vec::with_capacity(keys.len());
        for key in keys {
            let period = Self::parse(key.as_ref())?;
            if !periods.contains(&period) {
                periods.push(period);
            }
        }
        Ok(periods)
    }
}

impl FromStr for KlinePeriod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for KlinePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
