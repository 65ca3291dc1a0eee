//! Marketplace trading REST client.

use super::traits::{TradingVenue, VenueError};
use super::types::*;
use crate::config::MarketplaceConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Order lifecycle as reported by the trading API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected,
    Cancelled,
}

/// Order record returned by both the placement and lookup endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub status: OrderStatus,
    pub source: SourceId,
    pub price: Decimal,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl OrderRecord {
    fn into_fill(self, key: &IdempotencyKey) -> Option<LegFill> {
        match (self.status, self.filled_at) {
            (OrderStatus::Filled, Some(filled_at)) => Some(LegFill {
                key: key.clone(),
                source: self.source,
                price: self.price,
                order_id: self.order_id,
                filled_at,
            }),
            _ => None,
        }
    }

    /// Lookup result; `None` only once the order can no longer fill.
    fn into_lookup(self, key: &IdempotencyKey) -> Result<Option<LegFill>, VenueError> {
        match self.status {
            OrderStatus::Filled => self
                .into_fill(key)
                .map(Some)
                .ok_or_else(|| VenueError::Transport("filled order without fill time".into())),
            OrderStatus::Pending => Err(VenueError::Timeout),
            OrderStatus::Rejected | OrderStatus::Cancelled => Ok(None),
        }
    }
}

/// Signed HTTP client for the marketplace trading API.
///
/// Requests carry `X-Api-Key`, a millisecond `X-Timestamp`, and an
/// `X-Signature` of hex HMAC-SHA256 over `timestamp + method + path + body`.
pub struct MarketplaceClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
}

impl MarketplaceClient {
    pub fn new(config: &MarketplaceConfig, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Generate HMAC-SHA256 signature for a request.
    fn sign(&self, payload: &str) -> Result<String, VenueError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| VenueError::Transport(format!("signing key: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        key: &IdempotencyKey,
        body: Option<String>,
    ) -> Result<reqwest::Response, VenueError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let body = body.unwrap_or_default();
        let signature = self.sign(&format!("{timestamp}{method}{path}{body}"))?;

        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("X-Api-Key", &self.api_key)
            .header("X-Timestamp", &timestamp)
            .header("X-Signature", signature)
            .header("Idempotency-Key", key.as_str());
        if !body.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                VenueError::Timeout
            } else {
                VenueError::Transport(e.to_string())
            }
        })
    }

    /// Map non-success responses onto venue errors.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, VenueError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!(%status, %body, "Trading API error response");

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => VenueError::RateLimited,
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => VenueError::Timeout,
            s if s.is_server_error() => VenueError::Transport(format!("{status}: {body}")),
            _ => VenueError::Rejected(format!("{status}: {body}")),
        })
    }

    async fn parse(response: reqwest::Response) -> Result<OrderRecord, VenueError> {
        response
            .json()
            .await
            .map_err(|e| VenueError::Transport(format!("invalid order response: {e}")))
    }

    #[instrument(
        skip(self, order),
        fields(key = %order.key, item = %order.item, source = %order.source)
    )]
    async fn submit(&self, order: &LegOrder) -> Result<LegFill, VenueError> {
        let path = format!("/v1/orders/{}", order.leg);
        let body = serde_json::to_string(order)
            .map_err(|e| VenueError::Rejected(format!("unencodable order: {e}")))?;

        debug!(price = %order.price, "Submitting order");
        let response = self.send(Method::POST, &path, &order.key, Some(body)).await?;
        let record = Self::parse(Self::check_status(response).await?).await?;

        match record.status {
            OrderStatus::Filled => record
                .into_fill(&order.key)
                .ok_or_else(|| VenueError::Transport("filled order without fill time".into())),
            // Still working; a retry with the same key returns the eventual result
            OrderStatus::Pending => Err(VenueError::Timeout),
            OrderStatus::Rejected | OrderStatus::Cancelled => Err(VenueError::Rejected(
                record.reason.unwrap_or_else(|| format!("order {:?}", record.status)),
            )),
        }
    }
}

#[async_trait]
impl TradingVenue for MarketplaceClient {
    async fn place_buy(&self, order: &LegOrder) -> Result<LegFill, VenueError> {
        self.submit(order).await
    }

    async fn place_sell(&self, order: &LegOrder) -> Result<LegFill, VenueError> {
        self.submit(order).await
    }

    async fn compensate(&self, order: &LegOrder) -> Result<LegFill, VenueError> {
        self.submit(order).await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn order_status(&self, key: &IdempotencyKey) -> Result<Option<LegFill>, VenueError> {
        let path = format!("/v1/orders/{}", urlencoding::encode(key.as_str()));
        let response = self.send(Method::GET, &path, key, None).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = Self::parse(Self::check_status(response).await?).await?;
        record.into_lookup(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MarketplaceClient {
        MarketplaceClient::new(
            &MarketplaceConfig {
                base_url: "https://api.example.test/".into(),
                api_key: "key".into(),
                api_secret: "secret".into(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let sig = client().sign("1700000000000GET/v1/orders/x").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, client().sign("1700000000000GET/v1/orders/x").unwrap());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        assert_eq!(client().base_url, "https://api.example.test");
    }

    fn record(status: &str) -> OrderRecord {
        serde_json::from_str(&format!(
            r#"{{"order_id":"o1","status":"{status}","source":"scrap.tf","price":"58"}}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_pending_record_is_not_a_fill() {
        let key = IdempotencyKey::for_leg("a", Leg::Buy);
        assert!(record("pending").into_fill(&key).is_none());
        assert_eq!(record("pending").into_lookup(&key), Err(VenueError::Timeout));
    }

    #[test]
    fn test_dead_orders_look_up_as_unfilled() {
        let key = IdempotencyKey::for_leg("a", Leg::Buy);
        assert_eq!(record("cancelled").into_lookup(&key), Ok(None));
        assert_eq!(record("rejected").into_lookup(&key), Ok(None));
        // Filled without a fill time cannot be trusted either way
        assert!(record("filled").into_lookup(&key).unwrap_err().is_transient());
    }
}
