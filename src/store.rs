use crate::errors::EngineResult;
use crate::state::{AccountLedger, LedgerCredit, TradePatch, TradeRecord, TradeStatus, TradingSettings};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

/// Durable keyed storage for trades, accounts, quota counters and settings.
///
/// Every mutating operation is atomic on its own. The engine relies on
/// three of them for correctness across processes:
/// - `transition_trade` is a compare-and-swap on the current status.
/// - `apply_credit` applies at most once per trade id.
/// - `try_consume_quota` is a single compare-and-increment.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get_trade(&self, id: &str) -> EngineResult<Option<TradeRecord>>;

    /// Debit the stake and insert the record in one transaction.
    /// Replaying the same record id is a no-op.
    /// Fails with `InsufficientBalance` without touching anything.
    async fn open_trade_with_debit(&self, record: &TradeRecord) -> EngineResult<()>;

    /// Apply `patch` only if the stored status still equals `expected`.
    async fn transition_trade(
        &self,
        id: &str,
        expected: TradeStatus,
        patch: &TradePatch,
    ) -> EngineResult<bool>;

    /// Returns false when a credit for this trade was already applied.
    async fn apply_credit(&self, credit: &LedgerCredit) -> EngineResult<bool>;

    /// PENDING timed trades whose stored or duration-derived maturity is at
    /// or before `now`, earliest first. Rows with neither come last so the
    /// caller can log and skip them without starving due trades.
    async fn list_due_trades(
        &self,
        user_id: Option<&str>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<TradeRecord>>;

    /// Terminal trades with no credit entry yet: the status transition
    /// committed but the credit after it never landed.
    async fn list_uncredited_trades(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> EngineResult<Vec<TradeRecord>>;

    async fn list_trades(&self, user_id: &str, limit: usize) -> EngineResult<Vec<TradeRecord>>;

    /// Missing accounts read as zero balance.
    async fn get_account(&self, user_id: &str) -> EngineResult<AccountLedger>;

    /// External funding flow.
    async fn deposit(&self, user_id: &str, amount: Decimal) -> EngineResult<AccountLedger>;

    /// Increment `(user_id, day)` only while it is below `max`.
    async fn try_consume_quota(&self, user_id: &str, day: NaiveDate, max: u32) -> EngineResult<bool>;

    async fn quota_used(&self, user_id: &str, day: NaiveDate) -> EngineResult<u32>;

    async fn get_settings(&self, user_id: &str) -> EngineResult<Option<TradingSettings>>;

    async fn put_settings(&self, user_id: &str, settings: &TradingSettings) -> EngineResult<()>;
}
