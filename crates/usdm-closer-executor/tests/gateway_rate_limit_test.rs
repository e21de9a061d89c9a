/*
[INPUT]:  Gateway with tight soft limits and an unreachable exchange
[OUTPUT]: Sliding-window rejection + risk-bypass assertions
[POS]:    Integration tests - account-level rate limiting at the gateway
[UPDATE]: When limiter wiring or risk bypass changes
*/

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;

use usdm_closer_adapter::{
    ClientConfig, Credentials, OrderIntent, PositionSide, Side, TimeInForce, UsdmClient,
};
use usdm_closer_executor::app::{Gateway, RunIdentity};
use usdm_closer_executor::execution::OrderGateway;

fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).expect("valid decimal")
}

/// Client pointed at a closed local port: transport calls fail fast, so the
/// tests observe limiter behavior without a live exchange.
fn offline_gateway(max_orders: usize, max_cancels: usize) -> Gateway {
    let client = UsdmClient::new(
        Credentials::new("k", "s").expect("credentials"),
        false,
        None,
        ClientConfig {
            base_url: Some("http://127.0.0.1:9".to_string()),
            timeout: std::time::Duration::from_millis(500),
            connect_timeout: std::time::Duration::from_millis(500),
            ..ClientConfig::default()
        },
    )
    .expect("client");
    Gateway::new(Arc::new(client), RunIdentity::new(), max_orders, max_cancels)
}

fn intent(is_risk: bool) -> OrderIntent {
    let mut intent = OrderIntent::limit(
        "BTCUSDT",
        Side::Sell,
        PositionSide::Long,
        dec("0.01"),
        dec("100"),
        TimeInForce::Gtx,
    );
    intent.is_risk = is_risk;
    intent
}

#[tokio::test]
async fn third_cancel_in_window_is_rate_limited_and_risk_bypasses() {
    let gateway = offline_gateway(10, 2);

    // Two cancels consume the window; both fail on transport, not limiter.
    for _ in 0..2 {
        let result = gateway.cancel_order("BTCUSDT", "1", false).await;
        assert!(!result.success);
        assert_ne!(result.error_code.as_deref(), Some("rate_limited:cancel_order"));
    }

    // The third non-risk cancel is synthesized locally.
    let result = gateway.cancel_order("BTCUSDT", "2", false).await;
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("rate_limited:cancel_order"));

    // A risk cancel still reaches the transport layer.
    let result = gateway.cancel_order("BTCUSDT", "3", true).await;
    assert!(!result.success);
    assert_ne!(result.error_code.as_deref(), Some("rate_limited:cancel_order"));
}

#[tokio::test]
async fn placements_are_gated_and_risk_bypasses() {
    let gateway = offline_gateway(1, 10);

    let first = gateway.place_order(&intent(false)).await;
    assert_ne!(first.error_code.as_deref(), Some("rate_limited:place_order"));

    let second = gateway.place_order(&intent(false)).await;
    assert_eq!(second.error_code.as_deref(), Some("rate_limited:place_order"));

    // Protective stops and panic orders must always get through the gate.
    let risk = gateway.place_order(&intent(true)).await;
    assert_ne!(risk.error_code.as_deref(), Some("rate_limited:place_order"));
}

#[tokio::test]
async fn gateway_assigns_run_prefixed_client_order_ids() {
    let gateway = offline_gateway(5, 5);
    let prefix = gateway.identity().prefix.clone();

    // The transport fails, but the id assignment happens before the send;
    // verify the prefix contract through a pre-assigned id surviving.
    let mut preset = intent(false);
    preset.client_order_id = Some(format!("{prefix}custom"));
    let result = gateway.place_order(&preset).await;
    assert!(!result.success);
    assert!(prefix.starts_with("uc-"));
}
