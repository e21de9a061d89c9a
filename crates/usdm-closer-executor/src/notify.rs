/*
[INPUT]:  Fill/reconnect/risk events, bot token + chat id, rate-limit state
[OUTPUT]: Serialized Telegram delivery with retry_after handling
[POS]:    Notification layer - best-effort side channel
[UPDATE]: When message formats or delivery policy change
*/

use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use usdm_closer_adapter::util::mono_ms;

const SEND_MIN_INTERVAL_MS: i64 = 1_000;

#[derive(Debug, Default)]
struct SendState {
    next_send_ms: i64,
    cooldown_until_ms: i64,
}

/// Telegram notifier. Delivery is serialised, spaced at least one second
/// apart, retried a bounded number of times, and never allowed to block or
/// fail the trading path.
#[derive(Debug)]
pub struct TelegramNotifier {
    token: String,
    chat_id: String,
    pub enabled: bool,
    max_retries: u32,
    http: reqwest::Client,
    send_state: Mutex<SendState>,
}

#[derive(Debug, Clone)]
pub struct FillNotification {
    pub symbol: String,
    pub side: String,
    pub mode: String,
    pub qty: String,
    pub avg_price: String,
    pub reason: String,
    pub role: Option<String>,
    pub realized_pnl: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub position_before: String,
    pub position_after: String,
}

impl TelegramNotifier {
    pub fn new(
        token: String,
        chat_id: String,
        enabled: bool,
        max_retries: u32,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Self {
        let mut enabled = enabled;
        if enabled && (token.is_empty() || chat_id.is_empty()) {
            warn!("telegram enabled but token/chat_id empty; disabling notifications");
            enabled = false;
        }

        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy_url) = proxy
            && let Ok(proxy) = reqwest::Proxy::all(proxy_url)
        {
            builder = builder.proxy(proxy);
        }

        Self {
            token,
            chat_id,
            enabled,
            max_retries: max_retries.max(1),
            http: builder.build().unwrap_or_default(),
            send_state: Mutex::new(SendState::default()),
        }
    }

    pub async fn notify_fill(&self, fill: FillNotification) {
        self.send_message(&format_fill_text(&fill)).await;
    }

    pub async fn notify_open_alert(
        &self,
        symbol: &str,
        side: &str,
        position_before: &str,
        position_after: &str,
    ) {
        let text = format!(
            "⚠️ position increased\nsymbol: {symbol}\nside: {side}\nposition: {position_before} -> {position_after}"
        );
        self.send_message(&text).await;
    }

    pub async fn notify_reconnect(&self, stream_type: &str) {
        let text = format!("🔌 websocket reconnected\nstream: {stream_type}");
        self.send_message(&text).await;
    }

    pub async fn notify_risk_trigger(&self, symbol: &str, position_side: &str, dist_to_liq: &str) {
        let text = format!(
            "🚨 risk trigger\nsymbol: {symbol}\nside: {position_side}\ndist_to_liq: {dist_to_liq}"
        );
        self.send_message(&text).await;
    }

    async fn send_message(&self, text: &str) {
        if !self.enabled {
            return;
        }

        let mut state = self.send_state.lock().await;
        for attempt in 0..self.max_retries {
            let now = mono_ms();
            let wait_until = state.next_send_ms.max(state.cooldown_until_ms);
            if wait_until > now {
                tokio::time::sleep(Duration::from_millis((wait_until - now) as u64)).await;
            }

            state.next_send_ms = mono_ms() + SEND_MIN_INTERVAL_MS;
            match self.post_message(text).await {
                Ok(None) => {
                    debug!("telegram message delivered");
                    return;
                }
                Ok(Some(retry_after_s)) => {
                    state.cooldown_until_ms = mono_ms() + (retry_after_s * 1_000.0) as i64;
                    warn!(attempt, retry_after_s, "telegram rate limited");
                }
                Err(err) => {
                    warn!(attempt, error = %err, "telegram send failed");
                }
            }
        }
        warn!("telegram message dropped after retries");
    }

    /// Returns Ok(None) on success, Ok(Some(retry_after)) when throttled.
    async fn post_message(&self, text: &str) -> Result<Option<f64>, reqwest::Error> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
            }))
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(None);
        }
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        Ok(Some(extract_retry_after(&body).unwrap_or(1.0)))
    }
}

fn extract_retry_after(body: &serde_json::Value) -> Option<f64> {
    body.get("parameters")?
        .get("retry_after")
        .and_then(|v| v.as_f64())
}

fn format_fill_text(fill: &FillNotification) -> String {
    let mut text = format!(
        "✅ filled\nsymbol: {}\nside: {}\nmode: {}\nqty: {} @ {}\nreason: {}",
        fill.symbol, fill.side, fill.mode, fill.qty, fill.avg_price, fill.reason
    );
    if let Some(role) = &fill.role {
        text.push_str(&format!("\nrole: {role}"));
    }
    if let Some(pnl) = fill.realized_pnl {
        text.push_str(&format!("\npnl: {pnl}"));
    }
    if let Some(fee) = fill.fee {
        text.push_str(&format!("\nfee: {fee}"));
    }
    text.push_str(&format!(
        "\nposition: {} -> {}",
        fill.position_before, fill.position_after
    ));
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn fill_text_includes_optional_meta() {
        let fill = FillNotification {
            symbol: "BTCUSDT".to_string(),
            side: "LONG".to_string(),
            mode: "maker_only".to_string(),
            qty: "0.01".to_string(),
            avg_price: "100.5".to_string(),
            reason: "long_primary".to_string(),
            role: Some("maker".to_string()),
            realized_pnl: Some(Decimal::from_str("1.23").unwrap()),
            fee: Some(Decimal::from_str("0.01").unwrap()),
            position_before: "0.05".to_string(),
            position_after: "0.04".to_string(),
        };
        let text = format_fill_text(&fill);
        assert!(text.contains("role: maker"));
        assert!(text.contains("pnl: 1.23"));
        assert!(text.contains("position: 0.05 -> 0.04"));
    }

    #[test]
    fn fill_text_skips_missing_meta() {
        let fill = FillNotification {
            symbol: "BTCUSDT".to_string(),
            side: "SHORT".to_string(),
            mode: "aggressive_limit".to_string(),
            qty: "0.01".to_string(),
            avg_price: "100.5".to_string(),
            reason: "short_primary".to_string(),
            role: None,
            realized_pnl: None,
            fee: None,
            position_before: "0.01".to_string(),
            position_after: "0".to_string(),
        };
        let text = format_fill_text(&fill);
        assert!(!text.contains("role:"));
        assert!(!text.contains("pnl:"));
    }

    #[test]
    fn retry_after_is_extracted() {
        let body = serde_json::json!({"ok": false, "parameters": {"retry_after": 7}});
        assert_eq!(extract_retry_after(&body), Some(7.0));
        assert_eq!(extract_retry_after(&serde_json::json!({})), None);
    }

    #[test]
    fn empty_credentials_disable_notifier() {
        let notifier = TelegramNotifier::new(
            String::new(),
            "123".to_string(),
            true,
            3,
            None,
            Duration::from_secs(10),
        );
        assert!(!notifier.enabled);
    }
}
