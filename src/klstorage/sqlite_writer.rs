//! SQLite K线存储
//!
//! 所有周期共用一张 `klines` 表，主键 (instrument_id, period, start_time)，
//! 同一窗口重复写入时覆盖。每个批次在一个事务中提交。

use crate::klaggregate::{KlineBarSnapshot, KlinePeriod};
use crate::klcommon::log_targets::SQLITE_KLINE_WRITER;
use crate::klcommon::{AppError, Result, SqliteStorageConfig};
use crate::klstorage::KlineWriter;
use chrono::NaiveDateTime;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument};

/// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 时间列的存储格式，字典序与时间顺序一致
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

const CREATE_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS klines (
        instrument_id TEXT NOT NULL,
        period TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        trading_day TEXT NOT NULL,
        open REAL,
        high REAL,
        low REAL,
        close REAL,
        volume INTEGER NOT NULL,
        turnover REAL,
        open_interest REAL,
        tick_count INTEGER NOT NULL,
        is_finished INTEGER NOT NULL,
        PRIMARY KEY (instrument_id, period, start_time)
    ) WITHOUT ROWID;
    CREATE INDEX IF NOT EXISTS idx_klines_trading_day ON klines (trading_day, period);
";

const UPSERT_SQL: &str = "
    INSERT OR REPLACE INTO klines (
        instrument_id, period, start_time, end_time, trading_day,
        open, high, low, close, volume, turnover, open_interest, tick_count, is_finished
    )
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
";

/// SQLite K线写入器
pub struct SqliteKlineWriter {
    pool: DbPool,
    database_path: PathBuf,
}

/// 查询时从一行读出的原始数据
struct StoredRow {
    start_time: String,
    end_time: Option<String>,
    trading_day: String,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: i64,
    turnover: Option<f64>,
    open_interest: Option<f64>,
    tick_count: i64,
    is_finished: bool,
}

impl SqliteKlineWriter {
    /// 打开数据库并建表
    #[instrument(target = SQLITE_KLINE_WRITER, skip_all, fields(database_path = %config.database_path), err)]
    pub fn new(config: &SqliteStorageConfig) -> Result<Self> {
        let database_path = PathBuf::from(&config.database_path);

        if let Some(parent) = database_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let enable_wal = config.enable_wal;
        let manager = SqliteConnectionManager::file(&database_path).with_init(move |conn| {
            conn.execute_batch(
                "PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA temp_store = MEMORY;",
            )?;
            if enable_wal {
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            }
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .build(manager)
            .map_err(|e| {
                let pool_error = AppError::DatabaseError(format!("创建连接池失败: {}", e));
                error!(
                    target: SQLITE_KLINE_WRITER,
                    event_name = "连接池创建失败",
                    database_path = %database_path.display(),
                    error.summary = pool_error.get_error_type_summary(),
                    error.details = %pool_error
                );
                pool_error
            })?;

        let writer = Self { pool, database_path };
        writer.init_schema()?;

        info!(
            target: SQLITE_KLINE_WRITER,
            event_name = "SQLite存储初始化",
            database_path = %writer.database_path.display(),
            pool_size = config.pool_size,
            enable_wal = enable_wal,
            "SQLite K线存储初始化完成: {}",
            writer.database_path.display()
        );
        Ok(writer)
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    fn get_connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute_batch(CREATE_TABLE_SQL)?;
        Ok(())
    }

    /// 查询某合约某周期最新的K线，按开始时间倒序
    pub fn query_klines(&self, instrument_id: &str, period: KlinePeriod, limit: usize) -> Result<Vec<KlineBarSnapshot>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT start_time, end_time, trading_day, open, high, low, close,
                    volume, turnover, open_interest, tick_count, is_finished
             FROM klines
             WHERE instrument_id = ?1 AND period = ?2
             ORDER BY start_time DESC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![instrument_id, period.key(), limit as i64], |row| {
            Ok(StoredRow {
                start_time: row.get(0)?,
                end_time: row.get(1)?,
                trading_day: row.get(2)?,
                open: row.get(3)?,
                high: row.get(4)?,
                low: row.get(5)?,
                close: row.get(6)?,
                volume: row.get(7)?,
                turnover: row.get(8)?,
                open_interest: row.get(9)?,
                tick_count: row.get(10)?,
                is_finished: row.get(11)?,
            })
        })?;

        let mut bars = Vec::new();
        for row in rows {
            let row = row?;
            let end_time = match row.end_time.as_deref() {
                Some(s) => Some(NaiveDateTime::parse_from_str(s, TIME_FORMAT)?),
                None => None,
            };
            bars.push(KlineBarSnapshot {
                instrument_id: instrument_id.to_string(),
                period,
                trading_day: row.trading_day,
                start_time: NaiveDateTime::parse_from_str(&row.start_time, TIME_FORMAT)?,
                end_time,
                // 非有限值写入时被存为NULL
                open: row.open.unwrap_or(f64::NAN),
                high: row.high.unwrap_or(f64::NAN),
                low: row.low.unwrap_or(f64::NAN),
                close: row.close.unwrap_or(f64::NAN),
                volume: row.volume,
                turnover: row.turnover.unwrap_or(f64::NAN),
                open_interest: row.open_interest.unwrap_or(f64::NAN),
                tick_count: row.tick_count.max(0) as u64,
                is_finished: row.is_finished,
            });
        }
        Ok(bars)
    }

    /// 表中K线总数
    pub fn count(&self) -> Result<usize> {
        let conn = self.get_connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM klines", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

fn finite_or_null(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

impl KlineWriter for SqliteKlineWriter {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn write_batch(&self, bars: &[KlineBarSnapshot]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
            for bar in bars {
                stmt.execute(params![
                    bar.instrument_id,
                    bar.period.key(),
                    bar.start_time.format(TIME_FORMAT).to_string(),
                    bar.end_time.map(|t| t.format(TIME_FORMAT).to_string()),
                    bar.trading_day,
                    finite_or_null(bar.open),
                    finite_or_null(bar.high),
                    finite_or_null(bar.low),
                    finite_or_null(bar.close),
                    bar.volume,
                    finite_or_null(bar.turnover),
                    finite_or_null(bar.open_interest),
                    bar.tick_count as i64,
                    bar.is_finished,
                ])?;
            }
        }
        tx.commit()?;

        debug!(
            target: SQLITE_KLINE_WRITER,
            event_name = "SQLite批量写入完成",
            count = bars.len(),
            "SQLite写入完成: {} 条K线",
            bars.len()
        );
        Ok(bars.len())
    }
}
