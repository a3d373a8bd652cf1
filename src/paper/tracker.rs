//! Per-user trade summary.
//! All functions are pure -- they take trade records and return computed values.

use crate::state::{TradeRecord, TradeStatus};
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TradeSummary {
    pub total_trades: usize,
    pub pending: usize,
    pub open_positions: usize,
    pub settled: usize,
    pub winning_trades: usize,
    /// Wins over settled trades, 0.0 when nothing has settled.
    pub win_rate: f64,
    pub total_staked: Decimal,
    /// Stake currently locked in PENDING or OPEN trades.
    pub exposure: Decimal,
    pub realized_pnl: Decimal,
    pub best_trade: Option<Decimal>,
    pub worst_trade: Option<Decimal>,
}

/// Compute the summary for one user's trades. Pure function.
pub fn compute_summary(trades: &[TradeRecord]) -> TradeSummary {
    let mut summary = TradeSummary {
        total_trades: trades.len(),
        pending: 0,
        open_positions: 0,
        settled: 0,
        winning_trades: 0,
        win_rate: 0.0,
        total_staked: Decimal::ZERO,
        exposure: Decimal::ZERO,
        realized_pnl: Decimal::ZERO,
        best_trade: None,
        worst_trade: None,
    };

    for t in trades {
        summary.total_staked += t.stake;
        match t.status {
            TradeStatus::Pending => {
                summary.pending += 1;
                summary.exposure += t.stake;
            }
            TradeStatus::Open => {
                summary.open_positions += 1;
                summary.exposure += t.stake;
            }
            TradeStatus::Profit | TradeStatus::Loss | TradeStatus::Closed => {
                let pnl = t.profit_loss.unwrap_or(Decimal::ZERO);
                summary.settled += 1;
                summary.realized_pnl += pnl;
                if pnl > Decimal::ZERO {
                    summary.winning_trades += 1;
                }
                summary.best_trade = Some(summary.best_trade.map_or(pnl, |b| b.max(pnl)));
                summary.worst_trade = Some(summary.worst_trade.map_or(pnl, |w| w.min(pnl)));
            }
        }
    }

    if summary.settled > 0 {
        summary.win_rate = summary.winning_trades as f64 / summary.settled as f64;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{at, timed_trade};
    use rust_decimal_macros::dec;

    fn settled(id: &str, stake: Decimal, pnl: Decimal) -> TradeRecord {
        let mut t = timed_trade(id, "u1", stake, at(0), Some(at(30)));
        t.status = if pnl > Decimal::ZERO {
            TradeStatus::Profit
        } else {
            TradeStatus::Loss
        };
        t.profit_loss = Some(pnl);
        t.settled_at = Some(at(30));
        t
    }

    #[test]
    fn test_empty_summary() {
        let s = compute_summary(&[]);
        assert_eq!(s.total_trades, 0);
        assert_eq!(s.win_rate, 0.0);
        assert_eq!(s.best_trade, None);
    }

    #[test]
    fn test_summary_mixes_pending_and_settled() {
        let trades = vec![
            settled("a", dec!(100), dec!(80.50)),
            settled("b", dec!(50), dec!(-20)),
            settled("c", dec!(10), dec!(7)),
            timed_trade("d", "u1", dec!(25), at(0), Some(at(60))),
        ];
        let s = compute_summary(&trades);

        assert_eq!(s.total_trades, 4);
        assert_eq!(s.pending, 1);
        assert_eq!(s.settled, 3);
        assert_eq!(s.winning_trades, 2);
        assert!((s.win_rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(s.total_staked, dec!(185));
        assert_eq!(s.exposure, dec!(25));
        assert_eq!(s.realized_pnl, dec!(67.50));
        assert_eq!(s.best_trade, Some(dec!(80.50)));
        assert_eq!(s.worst_trade, Some(dec!(-20)));
    }
}
