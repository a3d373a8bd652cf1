use rust_decimal::Decimal;

/// Request check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskCheck {
    /// Request allowed
    Allowed,
    /// Blocked with reason
    Blocked(&'static str),
}

#[cfg(test)]
impl RiskCheck {
    fn is_allowed(&self) -> bool {
        matches!(self, RiskCheck::Allowed)
    }
}

/// Check a timed-trade request before any state is touched.
/// Pure function, no side effects.
#[inline]
pub fn check_timed_request(
    stake: Decimal,
    duration_secs: i64,
    min_duration_secs: i64,
    max_duration_secs: i64,
) -> RiskCheck {
    // 1. Stake must be positive
    if stake <= Decimal::ZERO {
        return RiskCheck::Blocked("stake must be positive");
    }

    // 2. Stake must be whole cents
    if stake.normalize().scale() > 2 {
        return RiskCheck::Blocked("stake has more than two decimal places");
    }

    // 3. Duration window
    if duration_secs < min_duration_secs {
        return RiskCheck::Blocked("duration below minimum");
    }
    if duration_secs > max_duration_secs {
        return RiskCheck::Blocked("duration above maximum");
    }

    RiskCheck::Allowed
}

/// Check a position open/close request.
#[inline]
pub fn check_position_request(stake: Decimal, price: Decimal) -> RiskCheck {
    if stake <= Decimal::ZERO {
        return RiskCheck::Blocked("stake must be positive");
    }
    if stake.normalize().scale() > 2 {
        return RiskCheck::Blocked("stake has more than two decimal places");
    }
    if price <= Decimal::ZERO {
        return RiskCheck::Blocked("invalid price");
    }
    RiskCheck::Allowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_normal_request_allowed() {
        assert!(check_timed_request(dec!(100), 60, 30, 3600).is_allowed());
        assert!(check_timed_request(dec!(0.01), 30, 30, 3600).is_allowed());
        assert!(check_timed_request(dec!(12.500), 30, 30, 3600).is_allowed());
    }

    #[test]
    fn test_bad_stake_blocks() {
        assert_eq!(
            check_timed_request(dec!(0), 60, 30, 3600),
            RiskCheck::Blocked("stake must be positive")
        );
        assert!(!check_timed_request(dec!(-5), 60, 30, 3600).is_allowed());
        assert!(!check_timed_request(dec!(1.005), 60, 30, 3600).is_allowed());
    }

    #[test]
    fn test_duration_window_blocks() {
        assert!(!check_timed_request(dec!(10), 0, 30, 3600).is_allowed());
        assert!(!check_timed_request(dec!(10), 29, 30, 3600).is_allowed());
        assert!(!check_timed_request(dec!(10), 3601, 30, 3600).is_allowed());
    }

    #[test]
    fn test_position_price_must_be_positive() {
        assert!(check_position_request(dec!(10), dec!(101.5)).is_allowed());
        assert!(!check_position_request(dec!(10), dec!(0)).is_allowed());
    }
}
