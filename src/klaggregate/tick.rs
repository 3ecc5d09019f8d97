//! Tick行情数据结构
//!
//! 字段命名沿用上游柜台行情推送的原始字段名，只保留K线合成需要的部分，其余字段忽略。

use serde::{Deserialize, Deserializer, Serialize};

/// 上游对缺失字段可能推送 `null`，按缺失处理
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// 单条Tick行情
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickData {
    /// 合约代码，缺失时该Tick会被丢弃
    #[serde(rename = "InstrumentID", deserialize_with = "null_as_default")]
    pub instrument_id: String,
    /// 交易日，格式 YYYYMMDD
    #[serde(rename = "TradingDay", deserialize_with = "null_as_default")]
    pub trading_day: String,
    /// 最后修改时间，格式 HH:MM:SS
    #[serde(rename = "UpdateTime", deserialize_with = "null_as_default")]
    pub update_time: String,
    /// 最后修改毫秒 0-999
    #[serde(rename = "UpdateMillisec", deserialize_with = "null_as_default")]
    pub update_millisec: i64,
    /// 最新价
    #[serde(rename = "LastPrice")]
    pub last_price: f64,
    /// 累计成交量
    #[serde(rename = "Volume")]
    pub volume: i64,
    /// 累计成交额
    #[serde(rename = "Turnover")]
    pub turnover: f64,
    /// 持仓量
    #[serde(rename = "OpenInterest")]
    pub open_interest: f64,
}

impl TickData {
    /// 合约代码非空且不全是空白
    pub fn has_instrument(&self) -> bool {
        !self.instrument_id.trim().is_empty()
    }
}
