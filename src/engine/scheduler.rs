use super::TradeEngine;
use crate::errors::{EngineError, EngineResult};
use crate::state::{PerfCounters, Settlement, TradeOutcome, TradeRecord, WsMessage};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Sweep key used when no user is given.
const GLOBAL_SWEEP_KEY: &str = "\u{0}all";

/// How many times a countdown re-checks a trade that is not quite due yet.
const COUNTDOWN_MAX_NUDGES: u32 = 8;
const COUNTDOWN_NUDGE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum SweepDisposition {
    Settled { outcome: TradeOutcome },
    AlreadySettled { outcome: TradeOutcome },
    /// Terminal trade whose missing ledger credit was applied by this sweep.
    CreditRecovered { outcome: TradeOutcome },
    NotYetDue { matures_at: DateTime<Utc> },
    /// Record can't be scheduled (no maturity and no duration).
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SweepEntry {
    pub trade_id: String,
    #[serde(flatten)]
    pub disposition: SweepDisposition,
}

impl TradeEngine {
    /// Discover PENDING timed trades due at `now` (for one user, or all) and
    /// settle each one. Terminal trades still missing their ledger credit are
    /// re-credited in the same pass. Holds no business logic of its own.
    ///
    /// `now` is a cutoff and never runs ahead of the engine clock, which is
    /// what `settle` checks maturity against.
    ///
    /// A global sweep and a sweep for one user never work on the same user
    /// at once inside this process; whichever comes second skips that work.
    /// One bad record never stops the rest of the batch.
    pub async fn sweep_due_trades(
        &self,
        user_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<SweepEntry>> {
        let key = user_id.unwrap_or(GLOBAL_SWEEP_KEY);
        let global_busy = user_id.is_some() && self.sweep_guard.is_held(GLOBAL_SWEEP_KEY);
        let in_flight = if global_busy {
            None
        } else {
            self.sweep_guard.try_lock(key)
        };
        let Some(_in_flight) = in_flight else {
            PerfCounters::bump(&self.counters.sweeps_skipped);
            tracing::debug!(user = ?user_id, "sweep already in flight, skipping");
            return Ok(Vec::new());
        };
        PerfCounters::bump(&self.counters.sweeps_run);

        let cutoff = now.min(self.clock.now());
        let limit = self.options.sweep_batch_limit;
        let unpaid = self
            .retry
            .run("list_uncredited_trades", || {
                self.store.list_uncredited_trades(user_id, limit)
            })
            .await?;
        let due = self
            .retry
            .run("list_due_trades", || {
                self.store.list_due_trades(user_id, cutoff, limit)
            })
            .await?;

        let mut entries = Vec::with_capacity(unpaid.len() + due.len());
        let work = unpaid
            .into_iter()
            .map(|t| (t, true))
            .chain(due.into_iter().map(|t| (t, false)));
        for (trade, needs_credit) in work {
            // A global sweep leaves users alone while their own sweep runs.
            let _user_slot = match user_id {
                Some(_) => None,
                None => match self.sweep_guard.try_lock(&trade.user_id) {
                    Some(slot) => Some(slot),
                    None => {
                        tracing::debug!(trade_id = %trade.id, user = %trade.user_id, "user sweep in flight, leaving trade to it");
                        continue;
                    }
                },
            };
            let disposition = if needs_credit {
                self.recover_credit(&trade).await
            } else {
                self.dispatch_due(&trade, cutoff).await
            };
            entries.push(SweepEntry {
                trade_id: trade.id,
                disposition,
            });
        }

        let changed = entries
            .iter()
            .filter(|e| {
                matches!(
                    e.disposition,
                    SweepDisposition::Settled { .. } | SweepDisposition::CreditRecovered { .. }
                )
            })
            .count();
        if changed > 0 {
            tracing::info!(user = ?user_id, changed, scanned = entries.len(), "sweep settled trades");
            self.notify(WsMessage::TradesChanged {
                user_id: user_id.map(str::to_string),
            });
        }
        Ok(entries)
    }

    async fn dispatch_due(&self, trade: &TradeRecord, cutoff: DateTime<Utc>) -> SweepDisposition {
        let Some(matures_at) = trade.effective_maturity() else {
            tracing::warn!(trade_id = %trade.id, user = %trade.user_id, "trade has no maturity and no duration, skipping");
            return SweepDisposition::Skipped {
                reason: "no maturity".into(),
            };
        };
        if matures_at > cutoff {
            return SweepDisposition::NotYetDue { matures_at };
        }
        match self.settle(&trade.id).await {
            Ok(Settlement::Settled(outcome)) => SweepDisposition::Settled { outcome },
            Ok(Settlement::AlreadySettled(outcome)) => SweepDisposition::AlreadySettled { outcome },
            Err(EngineError::NotYetDue { matures_at, .. }) => SweepDisposition::NotYetDue { matures_at },
            Err(e) => {
                tracing::warn!(trade_id = %trade.id, error = %e, "sweep could not settle trade");
                SweepDisposition::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn recover_credit(&self, trade: &TradeRecord) -> SweepDisposition {
        let Some(outcome) = trade.outcome() else {
            tracing::error!(trade_id = %trade.id, status = %trade.status, "terminal trade without a recorded outcome");
            return SweepDisposition::Failed {
                error: format!("trade {} has no recorded outcome", trade.id),
            };
        };
        match self
            .retry
            .run("recover_credit", || self.ensure_credit(trade, &outcome))
            .await
        {
            Ok(()) => {
                tracing::info!(trade_id = %trade.id, user = %trade.user_id, "recovered missing ledger credit");
                SweepDisposition::CreditRecovered { outcome }
            }
            Err(e) => {
                tracing::warn!(trade_id = %trade.id, error = %e, "sweep could not recover ledger credit");
                SweepDisposition::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

/// One-shot sweep on startup or session start. Trades that matured while
/// nobody was watching settle against their original maturity.
pub async fn catch_up(engine: &TradeEngine, user_id: Option<&str>) -> EngineResult<Vec<SweepEntry>> {
    let now = engine.clock().now();
    let entries = engine.sweep_due_trades(user_id, now).await?;
    tracing::info!(user = ?user_id, scanned = entries.len(), "catch-up sweep done");
    Ok(entries)
}

/// Local trigger for a single trade: sleep until maturity, then settle.
/// Losing a race against the poll loop is harmless.
pub fn spawn_countdown(
    engine: Arc<TradeEngine>,
    trade_id: String,
    matures_at: DateTime<Utc>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let wait = (matures_at - engine.clock().now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        for _ in 0..COUNTDOWN_MAX_NUDGES {
            match engine.settle(&trade_id).await {
                Ok(result) => {
                    tracing::debug!(trade_id = %trade_id, fresh = result.is_fresh(), "countdown fired");
                    return;
                }
                // Timer woke a hair before the clock crossed maturity.
                Err(EngineError::NotYetDue { .. }) => tokio::time::sleep(COUNTDOWN_NUDGE).await,
                Err(e) => {
                    tracing::warn!(trade_id = %trade_id, error = %e, "countdown settle failed, the next poll sweep picks it up");
                    return;
                }
            }
        }
    })
}

/// Fixed-interval sweep of every user until `shutdown` flips.
pub async fn run_poll_loop(
    engine: Arc<TradeEngine>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(interval_ms = every.as_millis() as u64, "expiration poll started");
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let now = engine.clock().now();
        match engine.sweep_due_trades(None, now).await {
            Ok(entries) => {
                let failed = entries
                    .iter()
                    .filter(|e| matches!(e.disposition, SweepDisposition::Failed { .. }))
                    .count();
                if failed > 0 {
                    tracing::warn!(failed, scanned = entries.len(), "poll sweep had failures");
                }
            }
            Err(e) => tracing::error!(error = %e, "poll sweep failed"),
        }
    }
    tracing::info!("expiration poll stopped");
}
