//! K线合成模块
//!
//! 从逐笔Tick实时合成多周期OHLCV K线，包含以下组件：
//!
//! - `KlinePeriod`: 支持的K线周期
//! - `TickData`: 合成所需的Tick字段
//! - `KlineBar`: 单根K线的累加器
//! - `time_align`: 窗口对齐与换线规则
//! - `KlineSink`: 已完成K线的存储端接口
//! - `KlineBuilder`: 按合约、按周期维护当前K线的状态机

pub mod period;
pub mod tick;
pub mod bar;
pub mod time_align;
pub mod sink;
pub mod builder;

// 重新导出核心类型
pub use period::KlinePeriod;
pub use tick::TickData;
pub use bar::{KlineBar, KlineBarSnapshot};
pub use sink::KlineSink;
pub use builder::{Clock, KlineBuilder, KlineBuilderStats, KlineStats};
