use super::TradeEngine;
use crate::errors::{EngineError, EngineResult};
use crate::models::outcome::round_cents;
use crate::risk::limits::{self, RiskCheck};
use crate::state::{
    PerfCounters, TradeKind, TradeOutcome, TradePatch, TradeRecord, TradeStatus, WsMessage,
};
use rust_decimal::Decimal;

/// Signed P/L of a closed position, rounded to cents and floored at `-stake`.
pub fn position_pnl(stake: Decimal, entry_price: Decimal, exit_price: Decimal) -> Decimal {
    let move_ratio = exit_price / entry_price - Decimal::ONE;
    round_cents((stake * move_ratio).max(-stake))
}

impl TradeEngine {
    /// Debit the stake and record an OPEN position at `entry_price`.
    /// Positions sit outside the daily creation quota.
    pub async fn open_position(
        &self,
        user_id: &str,
        stake: Decimal,
        entry_price: Decimal,
    ) -> EngineResult<TradeRecord> {
        if let RiskCheck::Blocked(reason) = limits::check_position_request(stake, entry_price) {
            return Err(EngineError::Validation(reason.to_string()));
        }

        let now = self.clock.now();
        let record = TradeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind: TradeKind::Position,
            stake,
            status: TradeStatus::Open,
            created_at: now,
            matures_at: None,
            duration_secs: None,
            settled_at: None,
            profit_loss: None,
            settings: self.options.default_settings,
            entry_price: Some(entry_price),
            exit_price: None,
        };
        self.retry
            .run("open_position", || self.store.open_trade_with_debit(&record))
            .await?;

        tracing::info!(trade_id = %record.id, user = user_id, stake = %stake, entry = %entry_price, "position opened");
        self.notify(WsMessage::TradesChanged {
            user_id: Some(user_id.to_string()),
        });
        Ok(record)
    }

    /// Close an OPEN position owned by `user_id`. Closing twice returns the
    /// first close's outcome.
    pub async fn close_position(
        &self,
        user_id: &str,
        trade_id: &str,
        exit_price: Decimal,
    ) -> EngineResult<TradeOutcome> {
        if exit_price <= Decimal::ZERO {
            return Err(EngineError::Validation("invalid price".into()));
        }
        self.retry
            .run("close_position", || {
                self.close_position_once(user_id, trade_id, exit_price)
            })
            .await
    }

    async fn close_position_once(
        &self,
        user_id: &str,
        trade_id: &str,
        exit_price: Decimal,
    ) -> EngineResult<TradeOutcome> {
        let trade = self.owned_position(user_id, trade_id).await?;

        if trade.status == TradeStatus::Open {
            let entry_price = trade
                .entry_price
                .filter(|p| *p > Decimal::ZERO)
                .ok_or_else(|| {
                    EngineError::StateCorruption(format!("position {trade_id} has no valid entry price"))
                })?;
            let now = self.clock.now();
            let profit_loss = position_pnl(trade.stake, entry_price, exit_price);
            let patch = TradePatch {
                status: TradeStatus::Closed,
                profit_loss,
                settled_at: now,
                exit_price: Some(exit_price),
            };

            if self
                .store
                .transition_trade(trade_id, TradeStatus::Open, &patch)
                .await?
            {
                let outcome = TradeOutcome {
                    trade_id: trade_id.to_string(),
                    status: TradeStatus::Closed,
                    profit_loss,
                    settled_at: now,
                };
                self.ensure_credit(&trade, &outcome).await?;
                PerfCounters::bump(&self.counters.positions_closed);
                tracing::info!(trade_id, user = user_id, exit = %exit_price, profit_loss = %profit_loss, "position closed");
                self.notify(WsMessage::TradeSettled {
                    user_id: user_id.to_string(),
                    trade_id: trade_id.to_string(),
                    status: TradeStatus::Closed,
                    profit_loss,
                    timestamp: now.to_rfc3339(),
                });
                return Ok(outcome);
            }
        }

        // Already closed, by us on an earlier attempt or by someone else.
        let current = self.owned_position(user_id, trade_id).await?;
        let outcome = current.outcome().ok_or_else(|| {
            EngineError::StateCorruption(format!("position {trade_id} is {} without an outcome", current.status))
        })?;
        self.ensure_credit(&current, &outcome).await?;
        Ok(outcome)
    }

    async fn owned_position(&self, user_id: &str, trade_id: &str) -> EngineResult<TradeRecord> {
        let trade = self
            .store
            .get_trade(trade_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("position {trade_id}")))?;
        if trade.user_id != user_id {
            return Err(EngineError::Permission(format!(
                "position {trade_id} belongs to another user"
            )));
        }
        if trade.kind != TradeKind::Position {
            return Err(EngineError::Validation(format!("trade {trade_id} is not a position")));
        }
        Ok(trade)
    }
}

#[cfg(test)]
mod tests {
    use super::super::harness::{harness, options};
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_pnl() {
        assert_eq!(position_pnl(dec!(100), dec!(50), dec!(55)), dec!(10.00));
        assert_eq!(position_pnl(dec!(100), dec!(50), dec!(45)), dec!(-10.00));
        assert_eq!(position_pnl(dec!(10), dec!(3), dec!(4)), dec!(3.33));
        // Can't lose more than the stake.
        assert_eq!(position_pnl(dec!(100), dec!(50), dec!(0.01)), dec!(-99.98));
        assert_eq!(position_pnl(dec!(100), dec!(50), dec!(50)), dec!(0.00));
    }

    #[tokio::test]
    async fn test_open_and_close_position() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();

        let pos = h.engine.open_position("u1", dec!(200), dec!(40)).await.unwrap();
        assert_eq!(pos.status, TradeStatus::Open);
        assert_eq!(h.engine.account("u1").await.unwrap().balance, dec!(800));

        let outcome = h.engine.close_position("u1", &pos.id, dec!(44)).await.unwrap();
        assert_eq!(outcome.status, TradeStatus::Closed);
        assert_eq!(outcome.profit_loss, dec!(20.00));

        let account = h.engine.account("u1").await.unwrap();
        assert_eq!(account.balance, dec!(1020.00));
        assert_eq!(account.profit, dec!(20.00));

        let stored = h.engine.trade(&pos.id).await.unwrap();
        assert_eq!(stored.exit_price, Some(dec!(44)));
    }

    #[tokio::test]
    async fn test_close_twice_returns_first_outcome() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let pos = h.engine.open_position("u1", dec!(100), dec!(10)).await.unwrap();

        let first = h.engine.close_position("u1", &pos.id, dec!(9)).await.unwrap();
        let second = h.engine.close_position("u1", &pos.id, dec!(20)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.engine.account("u1").await.unwrap().balance, dec!(990.00));
    }

    #[tokio::test]
    async fn test_close_requires_owner() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let pos = h.engine.open_position("u1", dec!(100), dec!(10)).await.unwrap();

        let err = h.engine.close_position("u2", &pos.id, dec!(11)).await.unwrap_err();
        assert!(matches!(err, EngineError::Permission(_)));
        assert_eq!(h.engine.trade(&pos.id).await.unwrap().status, TradeStatus::Open);
    }

    #[tokio::test]
    async fn test_timed_trades_cannot_be_closed_and_positions_cannot_be_settled() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        let timed = h.engine.create_timed_trade("u1", dec!(10), 60, None).await.unwrap();
        let pos = h.engine.open_position("u1", dec!(10), dec!(10)).await.unwrap();

        assert!(matches!(
            h.engine.close_position("u1", &timed.id, dec!(11)).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            h.engine.settle(&pos.id).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_open_position_validation() {
        let h = harness(options());
        h.engine.deposit("u1", dec!(1000)).await.unwrap();
        assert!(matches!(
            h.engine.open_position("u1", dec!(10), dec!(0)).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            h.engine.open_position("u1", dec!(5000), dec!(10)).await,
            Err(EngineError::InsufficientBalance { .. })
        ));
    }
}
