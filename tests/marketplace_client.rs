//! REST client behavior against a mock trading API.

use rust_decimal_macros::dec;
use serde_json::json;
use std::time::Duration;
use tf2_arbitrage::config::MarketplaceConfig;
use tf2_arbitrage::market::{
    IdempotencyKey, ItemIdentity, Leg, LegOrder, MarketplaceClient, SourceId, TradingVenue,
    VenueError,
};
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> MarketplaceClient {
    MarketplaceClient::new(
        &MarketplaceConfig {
            base_url: format!("{}/", server.uri()),
            api_key: "test-key".into(),
            api_secret: "test-secret".into(),
        },
        Duration::from_secs(2),
    )
    .unwrap()
}

fn order(leg: Leg) -> LegOrder {
    LegOrder {
        key: IdempotencyKey::for_leg("a1", leg),
        leg,
        item: "5021;6".parse::<ItemIdentity>().unwrap(),
        source: SourceId::new("scrap.tf"),
        price: dec!(55.11),
    }
}

fn filled(order_id: &str, price: &str) -> serde_json::Value {
    json!({
        "order_id": order_id,
        "status": "filled",
        "source": "scrap.tf",
        "price": price,
        "filled_at": "2026-10-17T12:00:00Z"
    })
}

#[tokio::test]
async fn test_buy_fill_is_signed_and_keyed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/orders/buy"))
        .and(header("X-Api-Key", "test-key"))
        .and(header("Idempotency-Key", "a1-buy"))
        .and(header_exists("X-Signature"))
        .and(header_exists("X-Timestamp"))
        .and(body_partial_json(json!({"key": "a1-buy", "leg": "buy", "item": "5021;6"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(filled("o-1", "55.11")))
        .expect(1)
        .mount(&server)
        .await;

    let fill = client(&server).place_buy(&order(Leg::Buy)).await.unwrap();

    assert_eq!(fill.order_id, "o-1");
    assert_eq!(fill.price, dec!(55.11));
    assert_eq!(fill.key.as_str(), "a1-buy");
    assert_eq!(fill.source, SourceId::new("scrap.tf"));
}

#[tokio::test]
async fn test_sell_and_compensate_use_their_own_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/orders/sell"))
        .respond_with(ResponseTemplate::new(200).set_body_json(filled("o-2", "58")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/orders/compensate"))
        .and(header("Idempotency-Key", "a1-compensate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(filled("o-3", "55.11")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    assert_eq!(
        client.place_sell(&order(Leg::Sell)).await.unwrap().order_id,
        "o-2"
    );
    assert_eq!(
        client
            .compensate(&order(Leg::Compensate))
            .await
            .unwrap()
            .order_id,
        "o-3"
    );
}

#[tokio::test]
async fn test_rate_limit_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let err = client(&server).place_buy(&order(Leg::Buy)).await.unwrap_err();

    assert_eq!(err, VenueError::RateLimited);
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_server_error_is_transport() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = client(&server).place_sell(&order(Leg::Sell)).await.unwrap_err();

    assert!(matches!(err, VenueError::Transport(ref msg) if msg.contains("maintenance")));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_client_error_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("listing gone"))
        .mount(&server)
        .await;

    let err = client(&server).place_buy(&order(Leg::Buy)).await.unwrap_err();

    assert!(matches!(err, VenueError::Rejected(ref msg) if msg.contains("listing gone")));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_rejected_order_status_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "order_id": "o-4",
            "status": "rejected",
            "source": "scrap.tf",
            "price": "55.11",
            "reason": "insufficient metal"
        })))
        .mount(&server)
        .await;

    let err = client(&server).place_buy(&order(Leg::Buy)).await.unwrap_err();

    assert_eq!(err, VenueError::Rejected("insufficient metal".into()));
}

#[tokio::test]
async fn test_pending_order_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "order_id": "o-5",
            "status": "pending",
            "source": "scrap.tf",
            "price": "55.11"
        })))
        .mount(&server)
        .await;

    let err = client(&server).place_buy(&order(Leg::Buy)).await.unwrap_err();

    assert_eq!(err, VenueError::Timeout);
}

#[tokio::test]
async fn test_order_status_unknown_key_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/orders/a1-buy"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let status = client(&server)
        .order_status(&IdempotencyKey::for_leg("a1", Leg::Buy))
        .await
        .unwrap();

    assert!(status.is_none());
}

#[tokio::test]
async fn test_order_status_still_pending_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/orders/a1-buy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "order_id": "o-8",
            "status": "pending",
            "source": "scrap.tf",
            "price": "55.11"
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .order_status(&IdempotencyKey::for_leg("a1", Leg::Buy))
        .await
        .unwrap_err();

    assert_eq!(err, VenueError::Timeout);
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_order_status_cancelled_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/orders/a1-buy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "order_id": "o-9",
            "status": "cancelled",
            "source": "scrap.tf",
            "price": "55.11"
        })))
        .mount(&server)
        .await;

    let status = client(&server)
        .order_status(&IdempotencyKey::for_leg("a1", Leg::Buy))
        .await
        .unwrap();

    assert!(status.is_none());
}

#[tokio::test]
async fn test_order_status_returns_fill() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/orders/a1-sell"))
        .and(header("Idempotency-Key", "a1-sell"))
        .respond_with(ResponseTemplate::new(200).set_body_json(filled("o-6", "58")))
        .mount(&server)
        .await;

    let fill = client(&server)
        .order_status(&IdempotencyKey::for_leg("a1", Leg::Sell))
        .await
        .unwrap()
        .expect("filled order");

    assert_eq!(fill.order_id, "o-6");
    assert_eq!(fill.price, dec!(58));
    assert_eq!(fill.key.as_str(), "a1-sell");
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(filled("o-7", "55.11"))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let err = client(&server).place_buy(&order(Leg::Buy)).await.unwrap_err();

    assert_eq!(err, VenueError::Timeout);
}
