use super::{DrawnOutcome, OutcomeModel};
use crate::errors::{EngineError, EngineResult};
use crate::state::TradingSettings;
use rand::{Rng, RngCore};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Synthetic win/loss draw.
///
///   is_win = U(0,1) < win_probability
///   pct    = U(min_profit_pct, max_profit_pct)     on a win
///   pct    = -U(min_loss_pct, max_loss_pct)        on a loss
///   profit_loss = round(stake * pct / 100, 2)
///
/// A loss is floored at -stake.
pub struct UniformPctModel;

impl UniformPctModel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UniformPctModel {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeModel for UniformPctModel {
    fn name(&self) -> &'static str {
        "uniform-pct"
    }

    fn draw(
        &self,
        stake: Decimal,
        settings: &TradingSettings,
        rng: &mut dyn RngCore,
    ) -> EngineResult<DrawnOutcome> {
        let is_win = rng.gen::<f64>() < settings.win_probability;
        let pct = if is_win {
            uniform(rng, settings.min_profit_pct, settings.max_profit_pct)
        } else {
            -uniform(rng, settings.min_loss_pct, settings.max_loss_pct)
        };

        let pct_dec = Decimal::try_from(pct)
            .map_err(|e| EngineError::Validation(format!("outcome pct {pct}: {e}")))?;
        let profit_loss = round_cents((stake * pct_dec / dec!(100)).max(-stake));

        Ok(DrawnOutcome {
            is_win,
            pct,
            profit_loss,
        })
    }
}

#[inline]
fn uniform(rng: &mut dyn RngCore, lo: f64, hi: f64) -> f64 {
    if hi <= lo {
        return lo;
    }
    rng.gen_range(lo..=hi)
}

/// Half-away-from-zero to exactly two decimal places.
#[inline]
pub fn round_cents(amount: Decimal) -> Decimal {
    let mut cents = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    cents.rescale(2);
    cents
}
