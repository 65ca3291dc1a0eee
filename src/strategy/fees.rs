//! Marketplace fee schedule.

use crate::config::{FeeConfig, SourceFees};
use crate::market::SourceId;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Fees for each source, with a fallback for unlisted sources.
#[derive(Debug, Clone, Default)]
pub struct FeeSchedule {
    default: SourceFees,
    sources: HashMap<SourceId, SourceFees>,
}

impl FeeSchedule {
    pub fn new(default: SourceFees) -> Self {
        Self {
            default,
            sources: HashMap::new(),
        }
    }

    /// Override fees for one source.
    pub fn with_source(mut self, source: impl Into<SourceId>, fees: SourceFees) -> Self {
        self.sources.insert(source.into(), fees);
        self
    }

    pub fn for_source(&self, source: &SourceId) -> &SourceFees {
        self.sources.get(source).unwrap_or(&self.default)
    }

    /// Total fees for buying on `buy_source` and selling on `sell_source`.
    pub fn fees(
        &self,
        buy_source: &SourceId,
        sell_source: &SourceId,
        buy_price: Decimal,
        sell_price: Decimal,
    ) -> Decimal {
        let buy = self.for_source(buy_source);
        let sell = self.for_source(sell_source);
        buy.flat + buy.rate * buy_price + sell.flat + sell.rate * sell_price
    }
}

impl From<&FeeConfig> for FeeSchedule {
    fn from(config: &FeeConfig) -> Self {
        Self {
            default: config.default.clone(),
            sources: config
                .sources
                .iter()
                .map(|(name, fees)| (SourceId::new(name.as_str()), fees.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_flat_and_rate_fees() {
        let schedule = FeeSchedule::new(SourceFees {
            flat: dec!(1),
            rate: Decimal::ZERO,
        })
        .with_source(
            "marketplace.tf",
            SourceFees {
                flat: Decimal::ZERO,
                rate: dec!(0.10),
            },
        );

        // buy on default (1 flat), sell on marketplace.tf (10% of 130)
        let fees = schedule.fees(
            &SourceId::new("backpack.tf"),
            &SourceId::new("marketplace.tf"),
            dec!(100),
            dec!(130),
        );
        assert_eq!(fees, dec!(14));
    }

    #[test]
    fn test_from_config() {
        let mut config = FeeConfig::default();
        config.sources.insert(
            "scrap.tf".into(),
            SourceFees {
                flat: dec!(0.11),
                rate: Decimal::ZERO,
            },
        );
        let schedule = FeeSchedule::from(&config);
        assert_eq!(schedule.for_source(&SourceId::new("scrap.tf")).flat, dec!(0.11));
        assert_eq!(schedule.for_source(&SourceId::new("other")).flat, Decimal::ZERO);
    }
}
