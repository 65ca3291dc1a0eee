//! Marketplace integrations and shared market types.
//!
//! - Item identities and SKU parsing
//! - Price feed websocket connections
//! - Signed REST client for placing orders
//! - Live key price from backpack.tf
//! - Paper venue for dry runs and tests

mod client;
mod currency;
mod paper;
mod resolver;
mod sku;
mod traits;
mod types;
mod websocket;

pub use client::{MarketplaceClient, OrderRecord, OrderStatus};
pub use currency::CurrencyClient;
pub use paper::PaperVenue;
pub use resolver::SkuResolver;
pub use sku::{quality, SkuError};
pub use traits::*;
pub use types::*;
pub use websocket::{parse_frame, FeedConnection};
