//! Key price refresh against a mock backpack.tf currency API.

use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tf2_arbitrage::config::CurrencyConfig;
use tf2_arbitrage::market::CurrencyClient;
use tf2_arbitrage::pricing::KeyPrice;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> CurrencyClient {
    CurrencyClient::new(
        &CurrencyConfig {
            refresh_url: server.uri(),
            api_key: "bptf-key".into(),
            ..CurrencyConfig::default()
        },
        Duration::from_secs(2),
    )
    .unwrap()
}

fn currencies(key_value: serde_json::Value) -> serde_json::Value {
    json!({
        "response": {
            "success": 1,
            "currencies": {
                "keys": {"price": {"value": key_value, "currency": "metal"}},
                "metal": {"price": {"value": 0.02, "currency": "usd"}}
            }
        }
    })
}

#[tokio::test]
async fn test_refresh_updates_key_price() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/IGetCurrencies/v1"))
        .and(query_param("key", "bptf-key"))
        .and(query_param("appid", "440"))
        .respond_with(ResponseTemplate::new(200).set_body_json(currencies(json!(62.55))))
        .expect(1)
        .mount(&server)
        .await;

    let key_price = KeyPrice::new(dec!(60));
    let price = client(&server).refresh(&key_price).await.unwrap();

    assert_eq!(price, dec!(62.55));
    assert_eq!(key_price.get(), dec!(62.55));
}

#[tokio::test]
async fn test_unsuccessful_response_keeps_last_price() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": {"success": 0, "message": "API key does not exist."}
        })))
        .mount(&server)
        .await;

    let key_price = KeyPrice::new(dec!(60));
    let err = client(&server).refresh(&key_price).await.unwrap_err();

    assert!(err.to_string().contains("API key does not exist"));
    assert_eq!(key_price.get(), dec!(60));
}

#[tokio::test]
async fn test_server_error_keeps_last_price() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let key_price = KeyPrice::new(dec!(60));
    assert!(client(&server).refresh(&key_price).await.is_err());
    assert_eq!(key_price.get(), dec!(60));
}

#[tokio::test]
async fn test_non_positive_key_price_is_refused() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(currencies(json!(0))))
        .mount(&server)
        .await;

    let key_price = KeyPrice::new(dec!(60));
    assert!(client(&server).refresh(&key_price).await.is_err());
    assert_eq!(key_price.get(), dec!(60));
}

#[tokio::test]
async fn test_spawned_refresh_applies_first_tick_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(currencies(json!(61.11))))
        .mount(&server)
        .await;

    let key_price = Arc::new(KeyPrice::new(dec!(60)));
    let handle = client(&server).spawn_refresh(key_price.clone(), Duration::from_secs(3600));

    tokio::time::timeout(Duration::from_secs(2), async {
        while key_price.get() != dec!(61.11) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("key price was not refreshed");
    handle.abort();
}
