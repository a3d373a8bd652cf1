use crate::config::AppConfig;
use crate::engine::TradeEngine;
use chrono::{DateTime, NaiveDate, Utc};
use portable_atomic::{AtomicU64, Ordering};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast;

// ── Trade kinds and statuses ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    /// Matures at a fixed instant and is resolved by the settlement engine.
    Timed,
    /// Opened and closed on demand against a simulated price.
    Position,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timed => "timed",
            Self::Position => "position",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timed" => Some(Self::Timed),
            "position" => Some(Self::Position),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Pending,
    Profit,
    Loss,
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Profit => "PROFIT",
            Self::Loss => "LOSS",
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROFIT" => Some(Self::Profit),
            "LOSS" => Some(Self::Loss),
            "OPEN" => Some(Self::Open),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Profit | Self::Loss | Self::Closed)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Per-user outcome model configuration ──

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TradingSettings {
    /// Probability in [0, 1] that a timed trade settles as PROFIT.
    pub win_probability: f64,
    pub min_profit_pct: f64,
    pub max_profit_pct: f64,
    /// Floor of the loss draw. Losses are drawn from [min_loss_pct, max_loss_pct].
    #[serde(default)]
    pub min_loss_pct: f64,
    pub max_loss_pct: f64,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            win_probability: 0.5,
            min_profit_pct: 70.0,
            max_profit_pct: 90.0,
            min_loss_pct: 0.0,
            max_loss_pct: 100.0,
        }
    }
}

impl TradingSettings {
    pub fn validate(&self) -> Result<(), String> {
        let all = [
            self.win_probability,
            self.min_profit_pct,
            self.max_profit_pct,
            self.min_loss_pct,
            self.max_loss_pct,
        ];
        if all.iter().any(|v| !v.is_finite()) {
            return Err("settings must be finite numbers".into());
        }
        if !(0.0..=1.0).contains(&self.win_probability) {
            return Err(format!("win_probability {} outside [0, 1]", self.win_probability));
        }
        if self.min_profit_pct < 0.0 || self.min_profit_pct > self.max_profit_pct {
            return Err(format!(
                "profit range [{}, {}] invalid",
                self.min_profit_pct, self.max_profit_pct
            ));
        }
        // A loss can never take more than the stake.
        if self.min_loss_pct < 0.0 || self.min_loss_pct > self.max_loss_pct || self.max_loss_pct > 100.0 {
            return Err(format!(
                "loss range [{}, {}] invalid",
                self.min_loss_pct, self.max_loss_pct
            ));
        }
        Ok(())
    }
}

// ── Trade record ──

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TradeRecord {
    pub id: String,
    pub user_id: String,
    pub kind: TradeKind,
    pub stake: Decimal,
    pub status: TradeStatus,
    pub created_at: DateTime<Utc>,
    pub matures_at: Option<DateTime<Utc>>,
    /// Kept so maturity can be derived when `matures_at` is missing.
    pub duration_secs: Option<i64>,
    pub settled_at: Option<DateTime<Utc>>,
    pub profit_loss: Option<Decimal>,
    /// Settings snapshot taken at creation; the settlement draw uses these.
    pub settings: TradingSettings,
    pub entry_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,
}

impl TradeRecord {
    /// Stored maturity, or creation time plus duration for legacy rows.
    pub fn effective_maturity(&self) -> Option<DateTime<Utc>> {
        self.matures_at.or_else(|| {
            self.duration_secs
                .filter(|d| *d > 0)
                .and_then(chrono::TimeDelta::try_seconds)
                .and_then(|d| self.created_at.checked_add_signed(d))
        })
    }

    /// Terminal outcome, if the trade has one.
    pub fn outcome(&self) -> Option<TradeOutcome> {
        if !self.status.is_terminal() {
            return None;
        }
        Some(TradeOutcome {
            trade_id: self.id.clone(),
            status: self.status,
            profit_loss: self.profit_loss?,
            settled_at: self.settled_at?,
        })
    }
}

/// Fields written by the single PENDING→terminal (or OPEN→CLOSED) transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TradePatch {
    pub status: TradeStatus,
    pub profit_loss: Decimal,
    pub settled_at: DateTime<Utc>,
    pub exit_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TradeOutcome {
    pub trade_id: String,
    pub status: TradeStatus,
    pub profit_loss: Decimal,
    pub settled_at: DateTime<Utc>,
}

/// Result of `settle`. Both variants are successes.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "result", content = "outcome", rename_all = "snake_case")]
pub enum Settlement {
    Settled(TradeOutcome),
    AlreadySettled(TradeOutcome),
}

impl Settlement {
    pub fn outcome(&self) -> &TradeOutcome {
        match self {
            Self::Settled(o) | Self::AlreadySettled(o) => o,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Settled(_))
    }
}

// ── Account ledger ──

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AccountLedger {
    pub user_id: String,
    pub balance: Decimal,
    /// Cumulative positive outcomes only.
    pub profit: Decimal,
}

impl AccountLedger {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            balance: Decimal::ZERO,
            profit: Decimal::ZERO,
        }
    }
}

/// One ledger effect keyed by trade id. Applying the same key twice is a no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerCredit {
    pub trade_id: String,
    pub user_id: String,
    pub balance_delta: Decimal,
    pub profit_delta: Decimal,
    pub applied_at: DateTime<Utc>,
}

impl LedgerCredit {
    /// Stake is always returned; a loss shrinks it, a win adds on top.
    pub fn for_outcome(trade: &TradeRecord, outcome: &TradeOutcome) -> Self {
        Self {
            trade_id: trade.id.clone(),
            user_id: trade.user_id.clone(),
            balance_delta: trade.stake + outcome.profit_loss,
            profit_delta: outcome.profit_loss.max(Decimal::ZERO),
            applied_at: outcome.settled_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct QuotaRecord {
    pub user_id: String,
    pub date: NaiveDate,
    pub attempts_used: u32,
}

// ── Messages OUT of the engine (fire-and-forget, UI re-reads state) ──

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "trade_created")]
    TradeCreated {
        user_id: String,
        trade_id: String,
        matures_at: Option<String>,
    },

    #[serde(rename = "trade_settled")]
    TradeSettled {
        user_id: String,
        trade_id: String,
        status: TradeStatus,
        profit_loss: Decimal,
        timestamp: String,
    },

    #[serde(rename = "trades_changed")]
    TradesChanged { user_id: Option<String> },
}

// ── Performance Counters (lock-free) ──

pub struct PerfCounters {
    pub trades_created: AtomicU64,
    pub settlements_applied: AtomicU64,
    pub already_settled: AtomicU64,
    pub positions_closed: AtomicU64,
    pub quota_rejections: AtomicU64,
    pub sweeps_run: AtomicU64,
    pub sweeps_skipped: AtomicU64,
    pub ws_messages_sent: AtomicU64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            trades_created: AtomicU64::new(0),
            settlements_applied: AtomicU64::new(0),
            already_settled: AtomicU64::new(0),
            positions_closed: AtomicU64::new(0),
            quota_rejections: AtomicU64::new(0),
            sweeps_run: AtomicU64::new(0),
            sweeps_skipped: AtomicU64::new(0),
            ws_messages_sent: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

// ── Application shared state ──

pub struct AppState {
    pub config: AppConfig,
    pub engine: Arc<TradeEngine>,
    // Engine -> Dashboard: event stream (broadcast for WS clients)
    pub ws_tx: broadcast::Sender<WsMessage>,
}

impl AppState {
    pub fn new(config: AppConfig, engine: Arc<TradeEngine>, ws_tx: broadcast::Sender<WsMessage>) -> Arc<Self> {
        Arc::new(Self {
            config,
            engine,
            ws_tx,
        })
    }
}
