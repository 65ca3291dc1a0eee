//! backpack.tf currency rates.
//!
//! Keys float against refined metal. The rate is fetched from
//! `IGetCurrencies` and pushed into the shared [`KeyPrice`] on an interval.

use crate::config::CurrencyConfig;
use crate::pricing::KeyPrice;
use anyhow::{Context, Result};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const TF2_APP_ID: &str = "440";

#[derive(Debug, Deserialize)]
struct CurrenciesEnvelope {
    response: CurrenciesResponse,
}

#[derive(Debug, Deserialize)]
struct CurrenciesResponse {
    success: u8,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    currencies: Option<Currencies>,
}

#[derive(Debug, Deserialize)]
struct Currencies {
    keys: CurrencyEntry,
}

#[derive(Debug, Deserialize)]
struct CurrencyEntry {
    price: CurrencyPrice,
}

#[derive(Debug, Deserialize)]
struct CurrencyPrice {
    value: Decimal,
    #[serde(default)]
    currency: Option<String>,
}

/// Client for the backpack.tf currency endpoint.
pub struct CurrencyClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl CurrencyClient {
    pub fn new(config: &CurrencyConfig, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.refresh_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    /// Fetch the current price of one key in refined metal.
    #[instrument(skip(self))]
    pub async fn fetch_key_price(&self) -> Result<Decimal> {
        let url = format!("{}/api/IGetCurrencies/v1", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("appid", TF2_APP_ID),
                ("raw", "1"),
            ])
            .send()
            .await
            .context("Currency request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Currency API error ({}): {}", status, body);
        }

        let envelope: CurrenciesEnvelope = response
            .json()
            .await
            .context("Invalid currency response")?;
        let response = envelope.response;
        anyhow::ensure!(
            response.success == 1,
            "Currency request refused: {}",
            response.message.unwrap_or_default()
        );

        let price = response
            .currencies
            .context("Currency response has no currencies")?
            .keys
            .price;
        if let Some(currency) = &price.currency {
            anyhow::ensure!(
                currency == "metal",
                "Key price quoted in {}, expected metal",
                currency
            );
        }
        anyhow::ensure!(price.value > Decimal::ZERO, "Key price must be positive");

        Ok(price.value)
    }

    /// Fetch the key price once and store it in `key_price`.
    pub async fn refresh(&self, key_price: &KeyPrice) -> Result<Decimal> {
        let price = self.fetch_key_price().await?;
        match key_price.set(price) {
            Some(previous) if previous != price => {
                info!("🔑 [CURRENCY] Key price {} → {} ref", previous, price);
            }
            _ => debug!(%price, "Key price unchanged"),
        }
        Ok(price)
    }

    /// Refresh `key_price` every `interval`, starting immediately.
    ///
    /// A failed refresh keeps the last known price.
    pub fn spawn_refresh(self, key_price: Arc<KeyPrice>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh(&key_price).await {
                    warn!(
                        error = %e,
                        current = %key_price.get(),
                        "Key price refresh failed, keeping last value"
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_currencies_response() {
        let raw = r#"{"response":{"success":1,"currencies":{
            "keys":{"price":{"value":61.33,"currency":"metal","value_raw":61.3322}},
            "metal":{"price":{"value":0.02,"currency":"usd"}}}}}"#;
        let envelope: CurrenciesEnvelope = serde_json::from_str(raw).unwrap();
        let price = envelope.response.currencies.unwrap().keys.price;
        assert_eq!(price.value, Decimal::new(6133, 2));
        assert_eq!(price.currency.as_deref(), Some("metal"));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let config = CurrencyConfig {
            refresh_url: "https://backpack.tf/".to_string(),
            ..CurrencyConfig::default()
        };
        let client = CurrencyClient::new(&config, Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url, "https://backpack.tf");
    }
}
