/*
[INPUT]:  Position snapshots and the liquidation-distance threshold
[OUTPUT]: RiskFlag marking positions too close to liquidation
[POS]:    Risk layer - signal-level risk trigger
[UPDATE]: When the risk trigger condition changes
*/

use rust_decimal::Decimal;

use usdm_closer_adapter::{Position, PositionSide};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskFlag {
    pub symbol: String,
    pub position_side: PositionSide,
    pub is_triggered: bool,
    pub dist_to_liq: Option<Decimal>,
    pub reason: Option<&'static str>,
}

/// Flags positions whose mark price is within the configured distance of
/// the liquidation price. Missing mark or liquidation data never triggers.
#[derive(Debug, Clone)]
pub struct RiskManager {
    pub liq_distance_threshold: Decimal,
}

impl RiskManager {
    pub fn new(liq_distance_threshold: Decimal) -> Self {
        Self {
            liq_distance_threshold,
        }
    }

    pub fn check_risk(&self, position: &Position, threshold: Option<Decimal>) -> RiskFlag {
        let threshold = threshold.unwrap_or(self.liq_distance_threshold);

        let Some(mark_price) = position.mark_price.filter(|p| *p > Decimal::ZERO) else {
            return RiskFlag {
                symbol: position.symbol.clone(),
                position_side: position.position_side,
                is_triggered: false,
                dist_to_liq: None,
                reason: Some("missing_mark_price"),
            };
        };
        let Some(liquidation_price) = position.liquidation_price.filter(|p| *p > Decimal::ZERO)
        else {
            return RiskFlag {
                symbol: position.symbol.clone(),
                position_side: position.position_side,
                is_triggered: false,
                dist_to_liq: None,
                reason: Some("missing_liquidation_price"),
            };
        };

        let dist_to_liq = (mark_price - liquidation_price).abs() / mark_price;
        let is_triggered = dist_to_liq <= threshold;

        RiskFlag {
            symbol: position.symbol.clone(),
            position_side: position.position_side,
            is_triggered,
            dist_to_liq: Some(dist_to_liq),
            reason: if is_triggered { Some("liq_distance_breach") } else { None },
        }
    }
}

/// `|mark − liq| / mark`, when both inputs are usable.
pub fn dist_to_liq(position: &Position) -> Option<Decimal> {
    let mark = position.mark_price.filter(|p| *p > Decimal::ZERO)?;
    let liq = position.liquidation_price.filter(|p| *p > Decimal::ZERO)?;
    Some((mark - liq).abs() / mark)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn position(mark: Option<&str>, liq: Option<&str>) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            position_side: PositionSide::Long,
            position_amt: dec("0.5"),
            entry_price: dec("100"),
            unrealized_pnl: Decimal::ZERO,
            leverage: 20,
            mark_price: mark.map(dec),
            liquidation_price: liq.map(dec),
        }
    }

    #[test]
    fn triggers_inside_threshold() {
        let manager = RiskManager::new(dec("0.015"));
        let flag = manager.check_risk(&position(Some("100"), Some("99")), None);
        assert!(flag.is_triggered);
        assert_eq!(flag.dist_to_liq, Some(dec("0.01")));
        assert_eq!(flag.reason, Some("liq_distance_breach"));
    }

    #[test]
    fn does_not_trigger_outside_threshold() {
        let manager = RiskManager::new(dec("0.015"));
        let flag = manager.check_risk(&position(Some("100"), Some("90")), None);
        assert!(!flag.is_triggered);
        assert_eq!(flag.dist_to_liq, Some(dec("0.1")));
    }

    #[test]
    fn missing_inputs_never_trigger() {
        let manager = RiskManager::new(dec("0.5"));
        let flag = manager.check_risk(&position(None, Some("99")), None);
        assert!(!flag.is_triggered);
        assert_eq!(flag.reason, Some("missing_mark_price"));

        let flag = manager.check_risk(&position(Some("100"), None), None);
        assert!(!flag.is_triggered);
        assert_eq!(flag.reason, Some("missing_liquidation_price"));
    }

    #[test]
    fn per_call_threshold_override_wins() {
        let manager = RiskManager::new(dec("0.001"));
        let flag = manager.check_risk(&position(Some("100"), Some("99")), Some(dec("0.05")));
        assert!(flag.is_triggered);
    }
}
