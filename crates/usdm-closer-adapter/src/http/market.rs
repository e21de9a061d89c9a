/*
[INPUT]:  /fapi/v1/exchangeInfo payload
[OUTPUT]: Cached InstrumentRule per USDT perpetual
[POS]:    HTTP layer - instrument metadata
[UPDATE]: When filter precedence or perpetual selection changes
*/

use std::collections::HashMap;

use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{info, warn};

use crate::http::client::UsdmClient;
use crate::http::error::Result;
use crate::types::models::InstrumentRule;

#[derive(Debug, Deserialize)]
pub(crate) struct ExchangeInfoResponse {
    pub symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExchangeSymbol {
    pub symbol: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "contractType")]
    pub contract_type: String,
    #[serde(default, rename = "quoteAsset")]
    pub quote_asset: String,
    #[serde(default, rename = "pricePrecision")]
    pub price_precision: Option<u32>,
    #[serde(default, rename = "quantityPrecision")]
    pub quantity_precision: Option<u32>,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SymbolFilter {
    #[serde(rename = "filterType")]
    pub filter_type: String,
    #[serde(default, rename = "tickSize")]
    pub tick_size: Option<String>,
    #[serde(default, rename = "stepSize")]
    pub step_size: Option<String>,
    #[serde(default, rename = "minQty")]
    pub min_qty: Option<String>,
    #[serde(default)]
    pub notional: Option<String>,
}

impl UsdmClient {
    /// Reload instrument rules for every trading USDT perpetual and replace
    /// the cache. Returns the fresh map.
    pub async fn load_markets(&self) -> Result<HashMap<String, InstrumentRule>> {
        let info: ExchangeInfoResponse = self
            .signed_request(Method::GET, "/fapi/v1/exchangeInfo", &[])
            .await?;

        let mut rules = HashMap::new();
        for symbol in &info.symbols {
            if symbol.contract_type != "PERPETUAL" || symbol.quote_asset != "USDT" {
                continue;
            }
            if !symbol.status.is_empty() && symbol.status != "TRADING" {
                continue;
            }
            match extract_rules(symbol) {
                Ok(rule) => {
                    rules.insert(symbol.symbol.clone(), rule);
                }
                Err(err) => {
                    warn!(symbol = %symbol.symbol, error = %err, "failed to extract instrument rules");
                }
            }
        }

        info!(count = rules.len(), "loaded USDT perpetual instrument rules");
        *self.rules.write().expect("rules lock") = rules.clone();
        Ok(rules)
    }
}

/// Precision preference: explicit exchange filters first, then the reported
/// decimal precision, then conservative defaults.
pub(crate) fn extract_rules(symbol: &ExchangeSymbol) -> std::result::Result<InstrumentRule, String> {
    let mut tick_size = None;
    let mut step_size = None;
    let mut min_qty = None;
    let mut min_notional = None;

    for filter in &symbol.filters {
        match filter.filter_type.as_str() {
            "PRICE_FILTER" => {
                tick_size = parse_positive(filter.tick_size.as_deref());
            }
            "LOT_SIZE" => {
                step_size = parse_positive(filter.step_size.as_deref());
                min_qty = parse_positive(filter.min_qty.as_deref());
            }
            "MIN_NOTIONAL" => {
                min_notional = parse_positive(filter.notional.as_deref());
            }
            _ => {}
        }
    }

    let tick_size = tick_size
        .or_else(|| symbol.price_precision.map(precision_to_step))
        .unwrap_or_else(|| precision_to_step(2));
    let step_size = step_size
        .or_else(|| symbol.quantity_precision.map(precision_to_step))
        .unwrap_or_else(|| precision_to_step(3));
    let min_qty = min_qty.unwrap_or_else(|| "0.001".parse().expect("decimal literal"));
    let min_notional = min_notional.unwrap_or_else(|| "5".parse().expect("decimal literal"));

    if tick_size <= Decimal::ZERO || step_size <= Decimal::ZERO {
        return Err(format!(
            "non-positive precision for {}: tick={tick_size} step={step_size}",
            symbol.symbol
        ));
    }

    Ok(InstrumentRule {
        symbol: symbol.symbol.clone(),
        tick_size,
        step_size,
        min_qty,
        min_notional,
    })
}

fn parse_positive(value: Option<&str>) -> Option<Decimal> {
    value
        .and_then(|text| text.parse::<Decimal>().ok())
        .filter(|parsed| *parsed > Decimal::ZERO)
}

fn precision_to_step(precision: u32) -> Decimal {
    Decimal::new(1, precision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn symbol_with_filters() -> ExchangeSymbol {
        serde_json::from_value(serde_json::json!({
            "symbol": "BTCUSDT",
            "status": "TRADING",
            "contractType": "PERPETUAL",
            "quoteAsset": "USDT",
            "pricePrecision": 2,
            "quantityPrecision": 3,
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.10"},
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"},
                {"filterType": "MIN_NOTIONAL", "notional": "100"}
            ]
        }))
        .expect("exchange symbol")
    }

    #[test]
    fn filters_take_precedence() {
        let rule = extract_rules(&symbol_with_filters()).expect("rules");
        assert_eq!(rule.tick_size, dec("0.10"));
        assert_eq!(rule.step_size, dec("0.001"));
        assert_eq!(rule.min_qty, dec("0.001"));
        assert_eq!(rule.min_notional, dec("100"));
    }

    #[test]
    fn precision_fallback_when_filters_missing() {
        let symbol: ExchangeSymbol = serde_json::from_value(serde_json::json!({
            "symbol": "ETHUSDT",
            "contractType": "PERPETUAL",
            "quoteAsset": "USDT",
            "pricePrecision": 4,
            "quantityPrecision": 1,
            "filters": []
        }))
        .expect("exchange symbol");
        let rule = extract_rules(&symbol).expect("rules");
        assert_eq!(rule.tick_size, dec("0.0001"));
        assert_eq!(rule.step_size, dec("0.1"));
        assert_eq!(rule.min_notional, dec("5"));
    }

    #[test]
    fn defaults_when_nothing_reported() {
        let symbol: ExchangeSymbol = serde_json::from_value(serde_json::json!({
            "symbol": "XUSDT",
            "contractType": "PERPETUAL",
            "quoteAsset": "USDT",
            "filters": []
        }))
        .expect("exchange symbol");
        let rule = extract_rules(&symbol).expect("rules");
        assert_eq!(rule.tick_size, dec("0.01"));
        assert_eq!(rule.step_size, dec("0.001"));
        assert_eq!(rule.min_qty, dec("0.001"));
    }
}
