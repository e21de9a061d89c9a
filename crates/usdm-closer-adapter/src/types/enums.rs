/*
[INPUT]:  Wire-level enum strings from REST and WebSocket payloads
[OUTPUT]: Typed order/position enums with parse + render helpers
[POS]:    Type layer - shared enums
[UPDATE]: When the exchange adds order types or statuses we consume
*/

use serde::{Deserialize, Serialize};

/// Order side as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Hedge-mode position side. Every order carries one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    /// Single-letter code used in protective-stop client order ids.
    pub fn code(self) -> &'static str {
        match self {
            PositionSide::Long => "L",
            PositionSide::Short => "S",
        }
    }

    /// The order side that reduces this position.
    pub fn closing_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        }
    }

    pub fn both() -> [PositionSide; 2] {
        [PositionSide::Long, PositionSide::Short]
    }

    pub fn parse(value: &str) -> Option<PositionSide> {
        match value {
            "LONG" => Some(PositionSide::Long),
            "SHORT" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "STOP_MARKET")]
    StopMarket,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
        }
    }
}

/// Time in force. GTX is the exchange's post-only flavour of GTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Gtx,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Gtx => "GTX",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Tolerant parse covering both REST casings. Unknown statuses map to
    /// NEW, matching how unrecognised intermediate states are treated.
    pub fn parse(value: &str) -> OrderStatus {
        match value.to_ascii_uppercase().as_str() {
            "PARTIALLY_FILLED" | "PARTIAL_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" | "CLOSED" => OrderStatus::Filled,
            "CANCELED" | "CANCELLED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            _ => OrderStatus::New,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_covers_both_casings() {
        assert_eq!(OrderStatus::parse("filled"), OrderStatus::Filled);
        assert_eq!(OrderStatus::parse("CANCELLED"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::parse("partially_filled"), OrderStatus::PartiallyFilled);
        assert_eq!(OrderStatus::parse("weird"), OrderStatus::New);
    }

    #[test]
    fn closing_side_inverts_position_side() {
        assert_eq!(PositionSide::Long.closing_side(), Side::Sell);
        assert_eq!(PositionSide::Short.closing_side(), Side::Buy);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
