//! K线存储端接口

use crate::klaggregate::KlineBarSnapshot;
use crate::klcommon::Result;
use async_trait::async_trait;

/// 已完成K线的接收端
///
/// `store` 在Tick处理热路径上被同步调用，实现必须是入队即返回，不能阻塞等待I/O。
/// 批量写入、重试和失败落盘都是存储端自己的事情，`KlineBuilder` 只记录失败次数。
#[async_trait]
pub trait KlineSink: Send + Sync {
    /// 接收一根已完成的K线
    fn store(&self, bar: KlineBarSnapshot) -> Result<()>;

    /// `KlineBuilder::close` 刷新未完成K线时调用
    ///
    /// 同样不能阻塞，但不能因为队列已满而丢弃K线；有界队列的实现应暂存到 `close` 时写出。
    fn store_on_close(&self, bar: KlineBarSnapshot) -> Result<()> {
        self.store(bar)
    }

    /// 刷新内部缓冲并停止后台任务，在 `KlineBuilder::close` 之后调用
    async fn close(&self) -> Result<()>;
}
