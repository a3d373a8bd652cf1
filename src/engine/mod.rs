pub mod clock;
pub mod positions;
pub mod scheduler;
pub mod settlement;

use crate::config::AppConfig;
use crate::errors::{EngineError, EngineResult};
use crate::execution::guard::UserGuard;
use crate::execution::retry::{RetryController, RetryPolicy};
use crate::models::outcome::UniformPctModel;
use crate::models::OutcomeModel;
use crate::risk::limits::{self, RiskCheck};
use crate::risk::quota::{QuotaLimit, QuotaTracker};
use crate::state::{
    AccountLedger, PerfCounters, QuotaRecord, TradeKind, TradeRecord, TradeStatus, TradingSettings,
    WsMessage,
};
use crate::store::Store;
use chrono::{DateTime, FixedOffset, Utc};
use clock::Clock;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Tunables the engine needs from `AppConfig`.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_daily_attempts: QuotaLimit,
    pub quota_offset: FixedOffset,
    pub min_duration_secs: i64,
    pub max_duration_secs: i64,
    pub default_settings: TradingSettings,
    pub sweep_batch_limit: usize,
    pub retry: RetryPolicy,
}

impl EngineOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_daily_attempts: cfg.max_daily_attempts,
            quota_offset: cfg.quota_offset,
            min_duration_secs: cfg.min_duration_secs,
            max_duration_secs: cfg.max_duration_secs,
            default_settings: cfg.default_settings,
            sweep_batch_limit: cfg.sweep_batch_limit,
            retry: RetryPolicy {
                max_retries: cfg.retry_max_attempts,
                base_delay: cfg.retry_base_delay,
                attempt_timeout: cfg.store_timeout,
            },
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QuotaStatus {
    pub limit: QuotaLimit,
    #[serde(flatten)]
    pub usage: QuotaRecord,
    pub resets_at: DateTime<Utc>,
}

/// Timed-trade engine: creation, settlement, sweeps and positions.
///
/// Every path that moves money goes through a store-level conditional
/// update keyed by trade id. The in-process guards only cut down on
/// redundant concurrent work.
pub struct TradeEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    model: Box<dyn OutcomeModel>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    quota: QuotaTracker,
    retry: RetryController,
    creation_guard: UserGuard,
    sweep_guard: UserGuard,
    notifier: broadcast::Sender<WsMessage>,
    counters: PerfCounters,
    options: EngineOptions,
}

impl TradeEngine {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
        notifier: broadcast::Sender<WsMessage>,
    ) -> Self {
        let quota = QuotaTracker::new(options.quota_offset, clock.now());
        Self {
            store,
            model: Box::new(UniformPctModel::new()),
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
            quota,
            retry: RetryController::new(options.retry),
            creation_guard: UserGuard::new(),
            sweep_guard: UserGuard::new(),
            notifier,
            counters: PerfCounters::new(),
            clock,
            options,
        }
    }

    /// Replace the random source (seeded generators make outcomes reproducible).
    pub fn with_rng(self, rng: impl RngCore + Send + 'static) -> Self {
        Self {
            rng: Mutex::new(Box::new(rng)),
            ..self
        }
    }

    pub fn with_model(self, model: impl OutcomeModel + 'static) -> Self {
        Self {
            model: Box::new(model),
            ..self
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn counters(&self) -> &PerfCounters {
        &self.counters
    }

    pub fn retries(&self) -> u64 {
        self.retry.retries()
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    /// Fire-and-forget. Nobody listening is fine; the UI re-reads state.
    pub(crate) fn notify(&self, msg: WsMessage) {
        PerfCounters::bump(&self.counters.ws_messages_sent);
        let _ = self.notifier.send(msg);
    }

    // ── Creation ──

    /// Validate, consume one quota attempt, then debit the stake and write
    /// the PENDING record atomically. Dropping the future before the debit
    /// commits leaves no trade and no debit behind.
    pub async fn create_timed_trade(
        &self,
        user_id: &str,
        stake: Decimal,
        duration_secs: i64,
        settings: Option<TradingSettings>,
    ) -> EngineResult<TradeRecord> {
        if let RiskCheck::Blocked(reason) = limits::check_timed_request(
            stake,
            duration_secs,
            self.options.min_duration_secs,
            self.options.max_duration_secs,
        ) {
            return Err(EngineError::Validation(reason.to_string()));
        }
        let settings = self.resolve_settings(user_id, settings).await?;

        let _in_flight = self.creation_guard.lock(user_id).await;
        let now = self.clock.now();

        let granted = self
            .retry
            .run("consume_quota", || {
                self.quota
                    .try_consume(self.store.as_ref(), user_id, self.options.max_daily_attempts, now)
            })
            .await?;
        if !granted {
            PerfCounters::bump(&self.counters.quota_rejections);
            return Err(EngineError::QuotaExceeded {
                resets_at: self.quota.window(now).resets_at,
            });
        }

        let matures_at = now + chrono::TimeDelta::seconds(duration_secs);
        let record = TradeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind: TradeKind::Timed,
            stake,
            status: TradeStatus::Pending,
            created_at: now,
            matures_at: Some(matures_at),
            duration_secs: Some(duration_secs),
            settled_at: None,
            profit_loss: None,
            settings,
            entry_price: None,
            exit_price: None,
        };

        self.retry
            .run("open_trade", || self.store.open_trade_with_debit(&record))
            .await?;

        PerfCounters::bump(&self.counters.trades_created);
        tracing::info!(
            trade_id = %record.id,
            user = user_id,
            stake = %stake,
            matures_at = %matures_at,
            "timed trade created"
        );
        self.notify(WsMessage::TradeCreated {
            user_id: user_id.to_string(),
            trade_id: record.id.clone(),
            matures_at: Some(matures_at.to_rfc3339()),
        });

        Ok(record)
    }

    async fn resolve_settings(
        &self,
        user_id: &str,
        settings: Option<TradingSettings>,
    ) -> EngineResult<TradingSettings> {
        let settings = match settings {
            Some(s) => s,
            None => self
                .retry
                .run("get_settings", || self.store.get_settings(user_id))
                .await?
                .unwrap_or(self.options.default_settings),
        };
        settings.validate().map_err(EngineError::Validation)?;
        Ok(settings)
    }

    // ── Reads and external flows ──

    pub async fn trade(&self, trade_id: &str) -> EngineResult<TradeRecord> {
        self.retry
            .run("get_trade", || self.store.get_trade(trade_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("trade {trade_id}")))
    }

    pub async fn trades(&self, user_id: &str, limit: usize) -> EngineResult<Vec<TradeRecord>> {
        self.retry
            .run("list_trades", || self.store.list_trades(user_id, limit))
            .await
    }

    pub async fn account(&self, user_id: &str) -> EngineResult<AccountLedger> {
        self.retry
            .run("get_account", || self.store.get_account(user_id))
            .await
    }

    /// Stand-in for the external deposit approval flow.
    pub async fn deposit(&self, user_id: &str, amount: Decimal) -> EngineResult<AccountLedger> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation("deposit must be positive".into()));
        }
        // Not retried: a lost acknowledgement would credit twice.
        let account = self.store.deposit(user_id, amount).await?;
        tracing::info!(user = user_id, amount = %amount, balance = %account.balance, "deposit applied");
        Ok(account)
    }

    pub async fn update_settings(&self, user_id: &str, settings: TradingSettings) -> EngineResult<()> {
        settings.validate().map_err(EngineError::Validation)?;
        self.retry
            .run("put_settings", || self.store.put_settings(user_id, &settings))
            .await
    }

    pub async fn quota_status(&self, user_id: &str) -> EngineResult<QuotaStatus> {
        let now = self.clock.now();
        let window = self.quota.window(now);
        let attempts_used = self
            .retry
            .run("quota_used", || self.quota.used(self.store.as_ref(), user_id, now))
            .await?;
        Ok(QuotaStatus {
            limit: self.options.max_daily_attempts,
            usage: QuotaRecord {
                user_id: user_id.to_string(),
                date: window.day,
                attempts_used,
            },
            resets_at: window.resets_at,
        })
    }
}
