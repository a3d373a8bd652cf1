pub mod outcome;

use crate::errors::EngineResult;
use crate::state::TradingSettings;
use rand::RngCore;
use rust_decimal::Decimal;

/// All outcome models implement this trait.
/// draw() must depend only on its inputs: the random source is injected
/// so settlements are reproducible under a seeded generator.
/// Send + Sync required for use across tokio tasks.
pub trait OutcomeModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decide win/loss and the signed profit for `stake`, rounded to cents.
    fn draw(
        &self,
        stake: Decimal,
        settings: &TradingSettings,
        rng: &mut dyn RngCore,
    ) -> EngineResult<DrawnOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawnOutcome {
    pub is_win: bool,
    /// Signed percentage of the stake actually drawn.
    pub pct: f64,
    pub profit_loss: Decimal,
}
