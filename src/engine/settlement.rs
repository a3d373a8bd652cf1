use super::TradeEngine;
use crate::errors::{EngineError, EngineResult};
use crate::models::DrawnOutcome;
use crate::state::{
    LedgerCredit, PerfCounters, Settlement, TradeKind, TradeOutcome, TradePatch, TradeRecord,
    TradeStatus, WsMessage,
};

impl TradeEngine {
    /// Resolve a matured timed trade exactly once.
    ///
    /// Every attempt re-reads the record, so a retry after a partial
    /// success lands on the already-settled path instead of repeating the
    /// mutation. Settled and AlreadySettled are both successes.
    pub async fn settle(&self, trade_id: &str) -> EngineResult<Settlement> {
        self.retry.run("settle", || self.settle_once(trade_id)).await
    }

    async fn settle_once(&self, trade_id: &str) -> EngineResult<Settlement> {
        let trade = self
            .store
            .get_trade(trade_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("trade {trade_id}")))?;

        if trade.kind != TradeKind::Timed {
            return Err(EngineError::Validation(format!(
                "trade {trade_id} is a {} trade and is closed explicitly",
                trade.kind.as_str()
            )));
        }

        if trade.status.is_terminal() {
            return self.already_settled(&trade).await;
        }

        let matures_at = trade
            .effective_maturity()
            .ok_or_else(|| EngineError::MissingMaturity(trade_id.to_string()))?;
        let now = self.clock.now();
        if now < matures_at {
            return Err(EngineError::NotYetDue {
                trade_id: trade_id.to_string(),
                matures_at,
            });
        }

        let drawn = self.draw(&trade)?;
        let status = if drawn.is_win {
            TradeStatus::Profit
        } else {
            TradeStatus::Loss
        };
        let patch = TradePatch {
            status,
            profit_loss: drawn.profit_loss,
            settled_at: now,
            exit_price: None,
        };

        if !self
            .store
            .transition_trade(trade_id, TradeStatus::Pending, &patch)
            .await?
        {
            // Lost the race: someone else's outcome is the outcome.
            let current = self
                .store
                .get_trade(trade_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("trade {trade_id}")))?;
            return self.already_settled(&current).await;
        }

        let outcome = TradeOutcome {
            trade_id: trade_id.to_string(),
            status,
            profit_loss: drawn.profit_loss,
            settled_at: now,
        };
        self.ensure_credit(&trade, &outcome).await?;

        PerfCounters::bump(&self.counters.settlements_applied);
        tracing::info!(
            trade_id,
            user = %trade.user_id,
            status = %status,
            pct = drawn.pct,
            profit_loss = %drawn.profit_loss,
            late_by_secs = (now - matures_at).num_seconds(),
            "trade settled"
        );
        self.notify(WsMessage::TradeSettled {
            user_id: trade.user_id.clone(),
            trade_id: trade_id.to_string(),
            status,
            profit_loss: drawn.profit_loss,
            timestamp: now.to_rfc3339(),
        });

        Ok(Settlement::Settled(outcome))
    }

    /// Stored outcome of a terminal trade. Re-drives the ledger credit, which
    /// is a no-op unless an earlier settlement failed between the status
    /// transition and the credit.
    async fn already_settled(&self, trade: &TradeRecord) -> EngineResult<Settlement> {
        let outcome = trade.outcome().ok_or_else(|| {
            EngineError::StateCorruption(format!(
                "trade {} is {} without a recorded outcome",
                trade.id, trade.status
            ))
        })?;
        self.ensure_credit(trade, &outcome).await?;
        PerfCounters::bump(&self.counters.already_settled);
        tracing::debug!(trade_id = %trade.id, status = %outcome.status, "already settled");
        Ok(Settlement::AlreadySettled(outcome))
    }

    /// Apply `stake + profit_loss` to the owner's ledger at most once per trade.
    pub(super) async fn ensure_credit(
        &self,
        trade: &TradeRecord,
        outcome: &TradeOutcome,
    ) -> EngineResult<()> {
        let credit = LedgerCredit::for_outcome(trade, outcome);
        if self.store.apply_credit(&credit).await? {
            tracing::debug!(
                trade_id = %trade.id,
                balance_delta = %credit.balance_delta,
                profit_delta = %credit.profit_delta,
                "ledger credit applied"
            );
        }
        Ok(())
    }

    fn draw(&self, trade: &TradeRecord) -> EngineResult<DrawnOutcome> {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.model.draw(trade.stake, &trade.settings, &mut **rng)
    }
}

#[cfg(test)]
mod tests {
    use super::super::harness::{fixed, harness, options};
    use crate::errors::EngineError;
    use crate::state::{Settlement, TradeStatus, TradingSettings};
    use crate::store::Store;
    use crate::testutil::{at, timed_trade};
    use portable_atomic::Ordering;
    use rust_decimal::prelude::ToPrimitive;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering::SeqCst;

    #[tokio::test]
    async fn test_fixed_win_credits_stake_plus_profit() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let trade = h
            .engine
            .create_timed_trade("u1", dec!(100), 60, Some(fixed(1.0, 5.0, 10.0)))
            .await
            .unwrap();
        let before = h.engine.account("u1").await.unwrap();

        h.clock.set(at(61));
        let result = h.engine.settle(&trade.id).await.unwrap();

        assert!(result.is_fresh());
        assert_eq!(result.outcome().status, TradeStatus::Profit);
        assert_eq!(result.outcome().profit_loss, dec!(5.00));
        assert_eq!(result.outcome().settled_at, at(61));
        let after = h.engine.account("u1").await.unwrap();
        assert_eq!(after.balance - before.balance, dec!(105.00));
        assert_eq!(after.profit - before.profit, dec!(5.00));
    }

    #[tokio::test]
    async fn test_fixed_loss_returns_reduced_stake() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let trade = h
            .engine
            .create_timed_trade("u1", dec!(100), 60, Some(fixed(0.0, 5.0, 10.0)))
            .await
            .unwrap();
        let before = h.engine.account("u1").await.unwrap();

        h.clock.set(at(61));
        let result = h.engine.settle(&trade.id).await.unwrap();

        assert_eq!(result.outcome().status, TradeStatus::Loss);
        assert_eq!(result.outcome().profit_loss, dec!(-10.00));
        let after = h.engine.account("u1").await.unwrap();
        assert_eq!(after.balance - before.balance, dec!(90.00));
        // Losses never count toward cumulative profit.
        assert_eq!(after.profit, before.profit);
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let trade = h.engine.create_timed_trade("u1", dec!(100), 60, None).await.unwrap();
        h.clock.set(at(120));

        let first = h.engine.settle(&trade.id).await.unwrap();
        let balance = h.engine.account("u1").await.unwrap().balance;

        for _ in 0..10 {
            let again = h.engine.settle(&trade.id).await.unwrap();
            assert!(matches!(again, Settlement::AlreadySettled(_)));
            assert_eq!(again.outcome(), first.outcome());
        }
        assert_eq!(h.engine.account("u1").await.unwrap().balance, balance);
        assert_eq!(h.engine.counters().settlements_applied.load(Ordering::Relaxed), 1);
        assert_eq!(h.engine.counters().already_settled.load(Ordering::Relaxed), 10);
    }

    #[tokio::test]
    async fn test_no_early_settlement() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let trade = h.engine.create_timed_trade("u1", dec!(100), 60, None).await.unwrap();
        let balance = h.engine.account("u1").await.unwrap().balance;

        h.clock.set(at(59));
        match h.engine.settle(&trade.id).await {
            Err(EngineError::NotYetDue { matures_at, .. }) => assert_eq!(matures_at, at(60)),
            other => panic!("expected NotYetDue, got {other:?}"),
        }
        let stored = h.engine.trade(&trade.id).await.unwrap();
        assert_eq!(stored.status, TradeStatus::Pending);
        assert_eq!(stored.settled_at, None);
        assert_eq!(h.engine.account("u1").await.unwrap().balance, balance);

        h.clock.advance(2);
        let result = h.engine.settle(&trade.id).await.unwrap();
        assert!(result.outcome().status.is_terminal());
    }

    #[tokio::test]
    async fn test_settle_exactly_at_maturity() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let trade = h.engine.create_timed_trade("u1", dec!(100), 60, None).await.unwrap();
        h.clock.set(at(60));
        assert!(h.engine.settle(&trade.id).await.unwrap().is_fresh());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_settles_credit_once() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let trade = h.engine.create_timed_trade("u1", dec!(100), 60, None).await.unwrap();
        let before = h.engine.account("u1").await.unwrap().balance;
        h.clock.set(at(60));

        let (a, b) = tokio::join!(
            tokio::spawn({
                let engine = h.engine.clone();
                let id = trade.id.clone();
                async move { engine.settle(&id).await }
            }),
            tokio::spawn({
                let engine = h.engine.clone();
                let id = trade.id.clone();
                async move { engine.settle(&id).await }
            }),
        );
        let a = a.unwrap().unwrap();
        let b = b.unwrap().unwrap();

        assert_eq!(a.outcome(), b.outcome());
        assert_eq!([a.is_fresh(), b.is_fresh()].iter().filter(|f| **f).count(), 1);
        let after = h.engine.account("u1").await.unwrap().balance;
        assert_eq!(after - before, dec!(100) + a.outcome().profit_loss);
    }

    #[tokio::test]
    async fn test_outcome_stays_within_configured_bounds() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(100000)).await.unwrap();
        let settings = TradingSettings {
            win_probability: 0.5,
            min_profit_pct: 70.0,
            max_profit_pct: 90.0,
            min_loss_pct: 0.0,
            max_loss_pct: 40.0,
        };

        let mut ids = Vec::new();
        for _ in 0..40 {
            let t = h
                .engine
                .create_timed_trade("u1", dec!(100), 60, Some(settings))
                .await
                .unwrap();
            ids.push(t.id);
        }
        h.clock.set(at(60));

        for id in ids {
            let o = h.engine.settle(&id).await.unwrap().outcome().clone();
            let pct = (o.profit_loss / dec!(100) * dec!(100)).to_f64().unwrap();
            match o.status {
                TradeStatus::Profit => assert!((70.0..=90.0).contains(&pct), "win pct {pct}"),
                TradeStatus::Loss => assert!((-40.0..=0.0).contains(&pct), "loss pct {pct}"),
                other => panic!("unexpected status {other}"),
            }
        }
    }

    #[tokio::test]
    async fn test_failed_credit_is_redriven_by_retry() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let trade = h
            .engine
            .create_timed_trade("u1", dec!(100), 60, Some(fixed(1.0, 5.0, 10.0)))
            .await
            .unwrap();
        h.clock.set(at(60));

        // Transition commits, then the credit fails once.
        h.store.fail_credit.store(1, SeqCst);
        let result = h.engine.settle(&trade.id).await.unwrap();

        // The retry saw a terminal record and finished the credit.
        assert!(matches!(result, Settlement::AlreadySettled(_)));
        assert_eq!(result.outcome().profit_loss, dec!(5.00));
        assert_eq!(h.engine.account("u1").await.unwrap().balance, dec!(1005.00));
        assert_eq!(h.engine.retries(), 1);
    }

    #[tokio::test]
    async fn test_credit_recovered_by_later_call_after_retries_exhaust() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let trade = h
            .engine
            .create_timed_trade("u1", dec!(100), 60, Some(fixed(1.0, 5.0, 10.0)))
            .await
            .unwrap();
        h.clock.set(at(60));

        h.store.fail_credit.store(10, SeqCst);
        let err = h.engine.settle(&trade.id).await.unwrap_err();
        assert!(matches!(err, EngineError::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(h.engine.trade(&trade.id).await.unwrap().status, TradeStatus::Profit);
        assert_eq!(h.engine.account("u1").await.unwrap().balance, dec!(900));

        h.store.fail_credit.store(0, SeqCst);
        h.engine.settle(&trade.id).await.unwrap();
        h.engine.settle(&trade.id).await.unwrap();
        assert_eq!(h.engine.account("u1").await.unwrap().balance, dec!(1005.00));
    }

    #[tokio::test]
    async fn test_transient_read_failure_is_retried() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let trade = h.engine.create_timed_trade("u1", dec!(100), 60, None).await.unwrap();
        h.clock.set(at(60));

        h.store.fail_get.store(2, SeqCst);
        assert!(h.engine.settle(&trade.id).await.unwrap().is_fresh());
        assert_eq!(h.engine.retries(), 2);
    }

    #[tokio::test]
    async fn test_unknown_trade_is_not_found_without_retry() {
        let h = harness(options());
        let err = h.engine.settle("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert_eq!(h.engine.retries(), 0);
    }

    #[tokio::test]
    async fn test_legacy_record_derives_maturity_from_duration() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let mut legacy = timed_trade("legacy", "u1", dec!(50), at(0), None);
        legacy.duration_secs = Some(30);
        h.store.open_trade_with_debit(&legacy).await.unwrap();

        h.clock.set(at(29));
        assert!(matches!(
            h.engine.settle("legacy").await,
            Err(EngineError::NotYetDue { .. })
        ));
        h.clock.set(at(30));
        assert!(h.engine.settle("legacy").await.unwrap().is_fresh());
    }

    #[tokio::test]
    async fn test_record_without_any_maturity_is_rejected() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let mut broken = timed_trade("broken", "u1", dec!(50), at(0), None);
        broken.duration_secs = None;
        h.store.open_trade_with_debit(&broken).await.unwrap();

        h.clock.set(at(3600));
        assert!(matches!(
            h.engine.settle("broken").await,
            Err(EngineError::MissingMaturity(_))
        ));
    }
}
