/*
[INPUT]:  /fapi/v2/positionRisk rows, listenKey endpoints
[OUTPUT]: Hedge-mode positions, leverage map, user-data session keys
[POS]:    HTTP layer - account endpoints
[UPDATE]: When position parsing or listenKey lifecycle changes
*/

use std::collections::HashMap;

use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::http::client::UsdmClient;
use crate::http::error::{AdapterError, Result};
use crate::types::enums::PositionSide;
use crate::types::models::Position;

#[derive(Debug, Deserialize)]
struct PositionRiskRow {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(default, rename = "entryPrice")]
    entry_price: Option<String>,
    #[serde(default, rename = "markPrice")]
    mark_price: Option<String>,
    #[serde(default, rename = "liquidationPrice")]
    liquidation_price: Option<String>,
    #[serde(default)]
    leverage: Option<String>,
    #[serde(default, rename = "unRealizedProfit")]
    unrealized_profit: Option<String>,
    #[serde(default, rename = "positionSide")]
    position_side: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    listen_key: String,
}

fn parse_decimal(value: Option<&str>) -> Decimal {
    value
        .and_then(|text| text.parse::<Decimal>().ok())
        .unwrap_or(Decimal::ZERO)
}

fn positive(value: Decimal) -> Option<Decimal> {
    if value > Decimal::ZERO { Some(value) } else { None }
}

impl UsdmClient {
    async fn fetch_position_risk(&self, symbol: Option<&str>) -> Result<Vec<PositionRiskRow>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(symbol) = symbol {
            params.push(("symbol", symbol.to_string()));
        }
        self.signed_request(Method::GET, "/fapi/v2/positionRisk", &params)
            .await
    }

    /// Current hedge-mode positions. Zero-amount rows are skipped; LONG and
    /// SHORT are reported independently. Missing mark/liquidation/leverage
    /// fields are tolerated.
    pub async fn fetch_positions(&self, symbol: Option<&str>) -> Result<Vec<Position>> {
        let rows = self.fetch_position_risk(symbol).await?;

        let mut positions = Vec::new();
        for row in rows {
            let amt = parse_decimal(Some(row.position_amt.as_str()));
            if amt == Decimal::ZERO {
                continue;
            }
            let Some(side) = row.position_side.as_deref().and_then(PositionSide::parse) else {
                continue;
            };
            let position_amt = match side {
                PositionSide::Long => amt.abs(),
                PositionSide::Short => -amt.abs(),
            };
            let leverage = row
                .leverage
                .as_deref()
                .and_then(|text| text.parse::<f64>().ok())
                .map(|value| value as u32)
                .filter(|value| *value > 0)
                .unwrap_or(1);

            positions.push(Position {
                symbol: row.symbol,
                position_side: side,
                position_amt,
                entry_price: parse_decimal(row.entry_price.as_deref()),
                unrealized_pnl: parse_decimal(row.unrealized_profit.as_deref()),
                leverage,
                mark_price: positive(parse_decimal(row.mark_price.as_deref())),
                liquidation_price: positive(parse_decimal(row.liquidation_price.as_deref())),
            });
        }

        debug!(count = positions.len(), "fetched open positions");
        Ok(positions)
    }

    /// Per-symbol leverage from positionRisk, used at startup to overwrite
    /// potentially stale cached leverage.
    pub async fn fetch_leverage_map(&self, symbols: &[String]) -> Result<HashMap<String, u32>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self.fetch_position_risk(None).await?;

        let mut map = HashMap::new();
        for row in rows {
            if !symbols.contains(&row.symbol) {
                continue;
            }
            let leverage = row
                .leverage
                .as_deref()
                .and_then(|text| text.parse::<f64>().ok())
                .map(|value| value as u32)
                .unwrap_or(0);
            if leverage > 0 {
                map.insert(row.symbol, leverage);
            }
        }
        Ok(map)
    }

    /// Obtain a fresh user-data session key.
    pub async fn start_user_data_stream(&self) -> Result<String> {
        let response: ListenKeyResponse = self
            .keyed_request(Method::POST, "/fapi/v1/listenKey")
            .await?;
        if response.listen_key.is_empty() {
            return Err(AdapterError::InvalidResponse("empty listenKey".to_string()));
        }
        Ok(response.listen_key)
    }

    /// Renew the active session key. The exchange expires keys after 60
    /// minutes; callers renew on a 30-minute cadence.
    pub async fn keepalive_user_data_stream(&self) -> Result<()> {
        let _: serde_json::Value = self.keyed_request(Method::PUT, "/fapi/v1/listenKey").await?;
        Ok(())
    }

    pub async fn close_user_data_stream(&self) -> Result<()> {
        let _: serde_json::Value = self
            .keyed_request(Method::DELETE, "/fapi/v1/listenKey")
            .await?;
        Ok(())
    }
}
