/*
[INPUT]:  REST configuration (base URLs, timeouts, credentials, proxy)
[OUTPUT]: Configured signed client ready for private API calls
[POS]:    HTTP layer - core client implementation
[UPDATE]: When adding connection options or changing signing behavior
*/

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use url::Url;

use crate::http::error::{AdapterError, Result};
use crate::types::models::InstrumentRule;
use crate::util::{now_ms, round_down_to, round_up_to};

const REST_BASE_URL: &str = "https://fapi.binance.com";
const REST_TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub recv_window_ms: i64,
    /// Overrides the exchange base URL; used by tests against a mock server.
    pub base_url: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            recv_window_ms: 5_000,
            base_url: None,
        }
    }
}

/// API credentials for signed requests.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        let api_secret = api_secret.into();
        if api_key.trim().is_empty() || api_secret.trim().is_empty() {
            return Err(AdapterError::Config("empty API credentials".to_string()));
        }
        Ok(Self { api_key, api_secret })
    }
}

/// REST client for the USD-M futures API, plus the instrument-rule cache
/// that backs the rounding helpers.
#[derive(Debug)]
pub struct UsdmClient {
    http: Client,
    base_url: Url,
    credentials: Credentials,
    recv_window_ms: i64,
    testnet: bool,
    pub(crate) rules: RwLock<HashMap<String, InstrumentRule>>,
}

impl UsdmClient {
    pub fn new(
        credentials: Credentials,
        testnet: bool,
        proxy: Option<&str>,
        config: ClientConfig,
    ) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout);

        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|err| AdapterError::Config(format!("invalid proxy {proxy_url}: {err}")))?;
            builder = builder.proxy(proxy);
        }

        let base = match &config.base_url {
            Some(explicit) => explicit.clone(),
            None if testnet => REST_TESTNET_URL.to_string(),
            None => REST_BASE_URL.to_string(),
        };

        Ok(Self {
            http: builder.build()?,
            base_url: Url::parse(&base)?,
            credentials,
            recv_window_ms: config.recv_window_ms,
            testnet,
            rules: RwLock::new(HashMap::new()),
        })
    }

    pub fn is_testnet(&self) -> bool {
        self.testnet
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn build_url(&self, path: &str, query: Option<&str>) -> Result<Url> {
        let mut url = self.base_url.join(path)?;
        url.set_query(query);
        Ok(url)
    }

    async fn execute<T: DeserializeOwned>(&self, method: Method, url: Url) -> Result<T> {
        let response = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", &self.credentials.api_key)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(parse_api_error(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|err| AdapterError::InvalidResponse(format!("{err}: {body}")))
    }

    /// Signed request: params + timestamp + recvWindow + HMAC signature.
    pub(crate) async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let mut query = String::new();
        for (key, value) in params {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(key);
            query.push('=');
            query.push_str(&urlencode(value));
        }
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "recvWindow={}&timestamp={}",
            self.recv_window_ms,
            now_ms()
        ));
        let signature = self.sign(&query);
        query.push_str(&format!("&signature={signature}"));

        let url = self.build_url(path, Some(&query))?;
        self.execute(method, url).await
    }

    /// API-key-only request (listenKey endpoints take no signature).
    pub(crate) async fn keyed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
    ) -> Result<T> {
        let url = self.build_url(path, None)?;
        self.execute(method, url).await
    }

    // --- cached-rule helpers -------------------------------------------------

    pub fn get_rules(&self, symbol: &str) -> Option<InstrumentRule> {
        self.rules.read().expect("rules lock").get(symbol).cloned()
    }

    /// Floor a price to the symbol's tick size. Unknown symbols pass through.
    pub fn round_price(&self, symbol: &str, price: Decimal) -> Decimal {
        match self.get_rules(symbol) {
            Some(rules) => round_down_to(price, rules.tick_size),
            None => price,
        }
    }

    /// Floor a quantity to the symbol's step size. Unknown symbols pass through.
    pub fn round_qty(&self, symbol: &str, qty: Decimal) -> Decimal {
        match self.get_rules(symbol) {
            Some(rules) => round_down_to(qty, rules.step_size),
            None => qty,
        }
    }

    /// Grow `qty` until `qty * price` reaches the symbol's minimum notional.
    /// Idempotent: a quantity that already satisfies the minimum is returned
    /// unchanged.
    pub fn ensure_min_notional(&self, symbol: &str, qty: Decimal, price: Decimal) -> Decimal {
        let Some(rules) = self.get_rules(symbol) else {
            return qty;
        };
        if price <= Decimal::ZERO || qty * price >= rules.min_notional {
            return qty;
        }
        let needed = rules.min_notional / price;
        let adjusted = round_up_to(needed, rules.step_size);
        if adjusted < rules.min_qty { rules.min_qty } else { adjusted }
    }

    /// True when the remaining amount can no longer be traded.
    pub fn is_position_complete(&self, symbol: &str, position_amt: Decimal) -> bool {
        let Some(rules) = self.get_rules(symbol) else {
            return position_amt.abs() == Decimal::ZERO;
        };
        let rounded = round_down_to(position_amt.abs(), rules.step_size);
        rounded == Decimal::ZERO || rounded < rules.min_qty
    }

    /// Step-floored tradable amount; zero when below the minimum quantity.
    pub fn get_tradable_qty(&self, symbol: &str, position_amt: Decimal) -> Decimal {
        let abs = position_amt.abs();
        let Some(rules) = self.get_rules(symbol) else {
            return abs;
        };
        let rounded = round_down_to(abs, rules.step_size);
        if rounded < rules.min_qty { Decimal::ZERO } else { rounded }
    }
}

fn urlencode(value: &str) -> String {
    // Query values here are symbols, ids and decimals; only a handful of
    // reserved characters can appear.
    value
        .replace('%', "%25")
        .replace('&', "%26")
        .replace('=', "%3D")
        .replace('+', "%2B")
        .replace(' ', "%20")
}

fn parse_api_error(status: StatusCode, body: &str) -> AdapterError {
    #[derive(serde::Deserialize)]
    struct ApiErrorBody {
        code: i64,
        msg: String,
    }

    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => AdapterError::api(parsed.code, parsed.msg),
        Err(_) => AdapterError::api(status.as_u16() as i64, body.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn client_with_rules() -> UsdmClient {
        let client = UsdmClient::new(
            Credentials::new("key", "secret").expect("credentials"),
            false,
            None,
            ClientConfig::default(),
        )
        .expect("client");
        client.rules.write().expect("rules lock").insert(
            "BTCUSDT".to_string(),
            InstrumentRule {
                symbol: "BTCUSDT".to_string(),
                tick_size: Decimal::from_str("0.1").unwrap(),
                step_size: Decimal::from_str("0.001").unwrap(),
                min_qty: Decimal::from_str("0.001").unwrap(),
                min_notional: Decimal::from_str("5").unwrap(),
            },
        );
        client
    }

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    #[test]
    fn empty_credentials_rejected() {
        assert!(Credentials::new("", "secret").is_err());
        assert!(Credentials::new("key", "  ").is_err());
    }

    #[test]
    fn signature_is_stable_hex() {
        let client = client_with_rules();
        let sig = client.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, client.sign("symbol=BTCUSDT&timestamp=1"));
    }

    #[test]
    fn ensure_min_notional_is_idempotent() {
        let client = client_with_rules();
        let first = client.ensure_min_notional("BTCUSDT", dec("0.001"), dec("100"));
        let second = client.ensure_min_notional("BTCUSDT", first, dec("100"));
        assert_eq!(first, second);
        assert!(first * dec("100") >= dec("5"));
    }

    #[test]
    fn min_notional_satisfied_passes_through() {
        let client = client_with_rules();
        assert_eq!(
            client.ensure_min_notional("BTCUSDT", dec("0.1"), dec("100")),
            dec("0.1")
        );
    }

    #[test]
    fn position_complete_boundaries() {
        let client = client_with_rules();
        assert!(!client.is_position_complete("BTCUSDT", dec("0.001")));
        assert!(client.is_position_complete("BTCUSDT", dec("0.0009")));
        assert!(client.is_position_complete("BTCUSDT", dec("0")));
    }

    #[test]
    fn tradable_qty_floors_and_gates() {
        let client = client_with_rules();
        assert_eq!(client.get_tradable_qty("BTCUSDT", dec("-0.0154")), dec("0.015"));
        assert_eq!(client.get_tradable_qty("BTCUSDT", dec("0.0009")), dec("0"));
    }

    #[test]
    fn api_error_body_is_parsed() {
        let err = parse_api_error(StatusCode::BAD_REQUEST, r#"{"code":-5022,"msg":"Post Only order will be rejected"}"#);
        assert_eq!(err.api_code(), Some(-5022));
    }
}
