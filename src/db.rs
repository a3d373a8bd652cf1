use crate::errors::{EngineError, EngineResult};
use crate::state::{
    AccountLedger, LedgerCredit, TradeKind, TradePatch, TradeRecord, TradeStatus, TradingSettings,
};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

pub type DbPool = Arc<Mutex<Connection>>;

const SCHEMA: &str = include_str!("../migrations/001_init.sql");

const TRADE_COLUMNS: &str = "id, user_id, kind, stake, status, created_at, matures_at, duration_secs, \
     settled_at, profit_loss, settings, entry_price, exit_price";

/// Stored maturity, or creation time plus duration for legacy rows.
/// NULL only for rows that carry neither.
const DUE_AT: &str = "COALESCE(matures_at, created_at + duration_secs * 1000)";

pub fn init_db(data_dir: &Path) -> EngineResult<DbPool> {
    std::fs::create_dir_all(data_dir).map_err(|e| EngineError::Database(format!("create dir: {e}")))?;
    let db_path = data_dir.join("timed_settle.db");
    let conn = Connection::open(&db_path)?;

    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("database initialized at {}", db_path.display());
    Ok(Arc::new(Mutex::new(conn)))
}

pub fn init_memory_db() -> EngineResult<DbPool> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// SQLite-backed store. Multi-row mutations run inside `BEGIN IMMEDIATE`
/// transactions so they stay atomic against other processes on the same file.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> EngineResult<T>) -> EngineResult<T> {
        // A panic under the lock drops any open transaction, which rolls back.
        let mut conn = self.db.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("recovering poisoned database lock");
            PoisonError::into_inner(poisoned)
        });
        f(&mut conn)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_trade(&self, id: &str) -> EngineResult<Option<TradeRecord>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {TRADE_COLUMNS} FROM trades WHERE id = ?1");
            let row = conn
                .query_row(&sql, params![id], TradeRow::from_row)
                .optional()?;
            row.map(TradeRow::into_record).transpose()
        })
    }

    async fn open_trade_with_debit(&self, record: &TradeRecord) -> EngineResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let already: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM ledger_entries WHERE trade_id = ?1 AND entry_kind = 'debit')",
                params![record.id],
                |row| row.get(0),
            )?;
            if already {
                return Ok(());
            }

            let mut account = load_account(&tx, &record.user_id)?;
            if account.balance < record.stake {
                return Err(EngineError::InsufficientBalance {
                    needed: record.stake,
                    available: account.balance,
                });
            }
            account.balance = checked(account.balance.checked_sub(record.stake), "debit")?;

            let now_ms = record.created_at.timestamp_millis();
            save_account(&tx, &account, now_ms)?;
            insert_ledger_entry(&tx, &record.id, "debit", &record.user_id, -record.stake, Decimal::ZERO, now_ms)?;
            insert_trade(&tx, record)?;
            tx.commit()?;
            Ok(())
        })
    }

    async fn transition_trade(
        &self,
        id: &str,
        expected: TradeStatus,
        patch: &TradePatch,
    ) -> EngineResult<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE trades SET status = ?1, profit_loss = ?2, settled_at = ?3, exit_price = COALESCE(?4, exit_price)
                 WHERE id = ?5 AND status = ?6",
                params![
                    patch.status.as_str(),
                    patch.profit_loss.to_string(),
                    patch.settled_at.timestamp_millis(),
                    patch.exit_price.map(|p| p.to_string()),
                    id,
                    expected.as_str(),
                ],
            )?;
            Ok(changed == 1)
        })
    }

    async fn apply_credit(&self, credit: &LedgerCredit) -> EngineResult<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let applied_ms = credit.applied_at.timestamp_millis();

            let inserted = insert_ledger_entry(
                &tx,
                &credit.trade_id,
                "credit",
                &credit.user_id,
                credit.balance_delta,
                credit.profit_delta,
                applied_ms,
            )?;
            if !inserted {
                return Ok(false);
            }

            let mut account = load_account(&tx, &credit.user_id)?;
            account.balance = checked(account.balance.checked_add(credit.balance_delta), "credit")?;
            account.profit = checked(account.profit.checked_add(credit.profit_delta), "credit profit")?;
            save_account(&tx, &account, applied_ms)?;
            tx.commit()?;
            Ok(true)
        })
    }

    async fn list_due_trades(
        &self,
        user_id: Option<&str>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<TradeRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {TRADE_COLUMNS} FROM trades
                 WHERE kind = 'timed' AND status = 'PENDING'
                   AND ({DUE_AT} <= ?1 OR (matures_at IS NULL AND duration_secs IS NULL))
                   AND (?2 IS NULL OR user_id = ?2)
                 ORDER BY {DUE_AT} IS NULL, {DUE_AT} LIMIT ?3"
            );
            query_trades(conn, &sql, params![now.timestamp_millis(), user_id, limit as i64])
        })
    }

    async fn list_uncredited_trades(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> EngineResult<Vec<TradeRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {TRADE_COLUMNS} FROM trades t
                 WHERE t.status IN ('PROFIT', 'LOSS', 'CLOSED')
                   AND (?1 IS NULL OR t.user_id = ?1)
                   AND NOT EXISTS (
                       SELECT 1 FROM ledger_entries l
                       WHERE l.trade_id = t.id AND l.entry_kind = 'credit'
                   )
                 ORDER BY t.settled_at LIMIT ?2"
            );
            query_trades(conn, &sql, params![user_id, limit as i64])
        })
    }

    async fn list_trades(&self, user_id: &str, limit: usize) -> EngineResult<Vec<TradeRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {TRADE_COLUMNS} FROM trades WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2"
            );
            query_trades(conn, &sql, params![user_id, limit as i64])
        })
    }

    async fn get_account(&self, user_id: &str) -> EngineResult<AccountLedger> {
        self.with_conn(|conn| load_account(conn, user_id))
    }

    async fn deposit(&self, user_id: &str, amount: Decimal) -> EngineResult<AccountLedger> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut account = load_account(&tx, user_id)?;
            account.balance = account.balance.checked_add(amount).ok_or_else(|| {
                EngineError::Validation(format!("deposit of {amount} would overflow the balance"))
            })?;
            save_account(&tx, &account, Utc::now().timestamp_millis())?;
            tx.commit()?;
            Ok(account)
        })
    }

    async fn try_consume_quota(&self, user_id: &str, day: NaiveDate, max: u32) -> EngineResult<bool> {
        if max == 0 {
            return Ok(false);
        }
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO quota_usage (user_id, day, attempts_used) VALUES (?1, ?2, 1)
                 ON CONFLICT (user_id, day) DO UPDATE SET attempts_used = attempts_used + 1
                 WHERE quota_usage.attempts_used < ?3",
                params![user_id, day.to_string(), max],
            )?;
            Ok(changed == 1)
        })
    }

    async fn quota_used(&self, user_id: &str, day: NaiveDate) -> EngineResult<u32> {
        self.with_conn(|conn| {
            let used = conn
                .query_row(
                    "SELECT attempts_used FROM quota_usage WHERE user_id = ?1 AND day = ?2",
                    params![user_id, day.to_string()],
                    |row| row.get::<_, u32>(0),
                )
                .optional()?;
            Ok(used.unwrap_or(0))
        })
    }

    async fn get_settings(&self, user_id: &str) -> EngineResult<Option<TradingSettings>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    "SELECT settings FROM trading_settings WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            raw.map(|s| serde_json::from_str(&s).map_err(EngineError::from))
                .transpose()
        })
    }

    async fn put_settings(&self, user_id: &str, settings: &TradingSettings) -> EngineResult<()> {
        let json = serde_json::to_string(settings)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO trading_settings (user_id, settings, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (user_id) DO UPDATE SET settings = excluded.settings, updated_at = excluded.updated_at",
                params![user_id, json, Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
    }
}

// ── Row helpers ──

fn query_trades(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> EngineResult<Vec<TradeRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, TradeRow::from_row)?;
    rows.map(|r| r.map_err(EngineError::from).and_then(TradeRow::into_record))
        .collect()
}

fn insert_trade(conn: &Connection, r: &TradeRecord) -> EngineResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO trades ({TRADE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            r.id,
            r.user_id,
            r.kind.as_str(),
            r.stake.to_string(),
            r.status.as_str(),
            r.created_at.timestamp_millis(),
            r.matures_at.map(|t| t.timestamp_millis()),
            r.duration_secs,
            r.settled_at.map(|t| t.timestamp_millis()),
            r.profit_loss.map(|p| p.to_string()),
            serde_json::to_string(&r.settings)?,
            r.entry_price.map(|p| p.to_string()),
            r.exit_price.map(|p| p.to_string()),
        ],
    )?;
    Ok(())
}

/// Returns false when the `(trade_id, entry_kind)` entry already exists.
fn insert_ledger_entry(
    conn: &Connection,
    trade_id: &str,
    entry_kind: &str,
    user_id: &str,
    balance_delta: Decimal,
    profit_delta: Decimal,
    applied_ms: i64,
) -> EngineResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO ledger_entries (trade_id, entry_kind, user_id, balance_delta, profit_delta, applied_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            trade_id,
            entry_kind,
            user_id,
            balance_delta.to_string(),
            profit_delta.to_string(),
            applied_ms,
        ],
    )?;
    Ok(inserted == 1)
}

fn load_account(conn: &Connection, user_id: &str) -> EngineResult<AccountLedger> {
    let row = conn
        .query_row(
            "SELECT balance, profit FROM accounts WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    match row {
        Some((balance, profit)) => Ok(AccountLedger {
            user_id: user_id.to_string(),
            balance: parse_decimal(&balance, "accounts.balance")?,
            profit: parse_decimal(&profit, "accounts.profit")?,
        }),
        None => Ok(AccountLedger::empty(user_id)),
    }
}

fn save_account(conn: &Connection, account: &AccountLedger, now_ms: i64) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO accounts (user_id, balance, profit, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (user_id) DO UPDATE SET balance = excluded.balance, profit = excluded.profit,
             updated_at = excluded.updated_at",
        params![
            account.user_id,
            account.balance.to_string(),
            account.profit.to_string(),
            now_ms,
        ],
    )?;
    Ok(())
}

fn checked(value: Option<Decimal>, what: &str) -> EngineResult<Decimal> {
    value.ok_or_else(|| EngineError::StateCorruption(format!("{what} overflows the account balance")))
}

fn parse_decimal(raw: &str, field: &str) -> EngineResult<Decimal> {
    Decimal::from_str(raw).map_err(|e| EngineError::StateCorruption(format!("{field} {raw:?}: {e}")))
}

fn parse_millis(ms: i64, field: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| EngineError::StateCorruption(format!("{field} out of range: {ms}")))
}

// ── Row types ──

struct TradeRow {
    id: String,
    user_id: String,
    kind: String,
    stake: String,
    status: String,
    created_at: i64,
    matures_at: Option<i64>,
    duration_secs: Option<i64>,
    settled_at: Option<i64>,
    profit_loss: Option<String>,
    settings: String,
    entry_price: Option<String>,
    exit_price: Option<String>,
}

impl TradeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            kind: row.get(2)?,
            stake: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            matures_at: row.get(6)?,
            duration_secs: row.get(7)?,
            settled_at: row.get(8)?,
            profit_loss: row.get(9)?,
            settings: row.get(10)?,
            entry_price: row.get(11)?,
            exit_price: row.get(12)?,
        })
    }

    fn into_record(self) -> EngineResult<TradeRecord> {
        let kind = TradeKind::parse(&self.kind)
            .ok_or_else(|| EngineError::StateCorruption(format!("trade {} kind {:?}", self.id, self.kind)))?;
        let status = TradeStatus::parse(&self.status)
            .ok_or_else(|| EngineError::StateCorruption(format!("trade {} status {:?}", self.id, self.status)))?;

        Ok(TradeRecord {
            kind,
            status,
            stake: parse_decimal(&self.stake, "trades.stake")?,
            created_at: parse_millis(self.created_at, "trades.created_at")?,
            matures_at: self.matures_at.map(|ms| parse_millis(ms, "trades.matures_at")).transpose()?,
            duration_secs: self.duration_secs,
            settled_at: self.settled_at.map(|ms| parse_millis(ms, "trades.settled_at")).transpose()?,
            profit_loss: self.profit_loss.as_deref().map(|p| parse_decimal(p, "trades.profit_loss")).transpose()?,
            settings: serde_json::from_str(&self.settings)?,
            entry_price: self.entry_price.as_deref().map(|p| parse_decimal(p, "trades.entry_price")).transpose()?,
            exit_price: self.exit_price.as_deref().map(|p| parse_decimal(p, "trades.exit_price")).transpose()?,
            id: self.id,
            user_id: self.user_id,
        })
    }
}
