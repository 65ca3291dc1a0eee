//! Shared utilities.

pub mod currency;

pub use currency::{format_price, round_to_scrap, to_refined};
