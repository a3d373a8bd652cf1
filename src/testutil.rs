use crate::state::{TradeKind, TradeRecord, TradeStatus, TradingSettings};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

/// Fixed base instant plus `secs`, so tests never read the wall clock.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap() + chrono::TimeDelta::seconds(secs)
}

pub fn timed_trade(
    id: &str,
    user_id: &str,
    stake: Decimal,
    created_at: DateTime<Utc>,
    matures_at: Option<DateTime<Utc>>,
) -> TradeRecord {
    TradeRecord {
        id: id.to_string(),
        user_id: user_id.to_string(),
        kind: TradeKind::Timed,
        stake,
        status: TradeStatus::Pending,
        created_at,
        matures_at,
        duration_secs: matures_at.map(|m| (m - created_at).num_seconds()),
        settled_at: None,
        profit_loss: None,
        settings: TradingSettings::default(),
        entry_price: None,
        exit_price: None,
    }
}
