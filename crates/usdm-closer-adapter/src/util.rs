/*
[INPUT]:  Decimal values, instrument precision, symbols
[OUTPUT]: Tick/step rounded values, clocks, stream-symbol casing
[POS]:    Utility layer - shared numeric and time helpers
[UPDATE]: When rounding semantics or clock sources change
*/

use std::sync::OnceLock;
use std::time::Instant;

use rust_decimal::Decimal;

/// Largest multiple of `step` that is `<= value`. A non-positive step
/// returns the value unchanged.
pub fn round_down_to(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

/// Smallest multiple of `step` that is `>= value`. A non-positive step
/// returns the value unchanged.
pub fn round_up_to(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let down = (value / step).floor() * step;
    if down == value { value } else { down + step }
}

/// Wall-clock milliseconds. Used for event/log timestamps and for staleness
/// comparisons against exchange-provided event times.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

static MONO_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic milliseconds since process start. Used for TTLs, cooldowns,
/// throttles and sliding windows; never compared against wall-clock values.
pub fn mono_ms() -> i64 {
    let epoch = MONO_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as i64
}

/// Exchange symbol in stream casing: "BTCUSDT" -> "btcusdt".
pub fn stream_symbol(symbol: &str) -> String {
    symbol.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    #[test]
    fn round_down_floors_to_step() {
        assert_eq!(round_down_to(dec("8.0534"), dec("0.001")), dec("8.053"));
        assert_eq!(round_down_to(dec("8.053"), dec("0.001")), dec("8.053"));
        assert_eq!(round_down_to(dec("0.0015"), dec("0.1")), dec("0"));
    }

    #[test]
    fn round_up_ceils_to_step() {
        assert_eq!(round_up_to(dec("8.0531"), dec("0.001")), dec("8.054"));
        assert_eq!(round_up_to(dec("8.053"), dec("0.001")), dec("8.053"));
        assert_eq!(round_up_to(dec("0.0015"), dec("0.1")), dec("0.1"));
    }

    #[test]
    fn rounding_brackets_the_value() {
        let value = dec("123.4567");
        for step in ["0.001", "0.05", "0.5", "7"] {
            let step = dec(step);
            let down = round_down_to(value, step);
            let up = round_up_to(value, step);
            assert!(down <= value && value < down + step);
            assert!(up - step < value && value <= up);
        }
    }

    #[test]
    fn non_positive_step_is_identity() {
        assert_eq!(round_down_to(dec("1.23"), Decimal::ZERO), dec("1.23"));
        assert_eq!(round_up_to(dec("1.23"), dec("-1")), dec("1.23"));
    }

    #[test]
    fn mono_clock_is_non_decreasing() {
        let a = mono_ms();
        let b = mono_ms();
        assert!(b >= a);
    }

    #[test]
    fn stream_symbol_lowercases() {
        assert_eq!(stream_symbol("BTCUSDT"), "btcusdt");
    }
}
