//! Default item resolver backed by SKU parsing and a name alias table.

use super::sku::{quality, ItemIdentity};
use super::traits::{ItemResolver, ResolveError};
use super::types::RawItemRef;
use std::collections::HashMap;

/// Resolves SKU strings directly and item names through a configured
/// name → defindex table.
#[derive(Debug, Clone, Default)]
pub struct SkuResolver {
    aliases: HashMap<String, u32>,
}

impl SkuResolver {
    /// Create a resolver with the given name aliases.
    ///
    /// Names are matched case-insensitively.
    pub fn new(aliases: HashMap<String, u32>) -> Self {
        let aliases = aliases
            .into_iter()
            .map(|(name, defindex)| (name.trim().to_lowercase(), defindex))
            .collect();
        Self { aliases }
    }
}

impl ItemResolver for SkuResolver {
    fn resolve(&self, raw: &RawItemRef) -> Result<ItemIdentity, ResolveError> {
        match raw {
            RawItemRef::Sku(sku) => sku.parse().map_err(|e: super::sku::SkuError| {
                ResolveError::InvalidSku {
                    sku: sku.clone(),
                    reason: e.to_string(),
                }
            }),
            RawItemRef::Named {
                name,
                quality,
                craftable,
                killstreak,
                effect,
            } => {
                let defindex = self
                    .aliases
                    .get(&name.trim().to_lowercase())
                    .copied()
                    .ok_or_else(|| ResolveError::UnknownName(name.clone()))?;

                let mut item = ItemIdentity::new(defindex, quality.unwrap_or(quality::UNIQUE));
                if *craftable == Some(false) {
                    item = item.uncraftable();
                }
                if let Some(tier) = killstreak.filter(|t| *t > 0) {
                    item = item.with_killstreak(tier);
                }
                if let Some(effect) = effect {
                    item = item.with_effect(*effect);
                }
                Ok(item)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SkuResolver {
        let mut aliases = HashMap::new();
        aliases.insert("Mann Co. Supply Crate Key".to_string(), 5021);
        aliases.insert("Team Captain".to_string(), 378);
        SkuResolver::new(aliases)
    }

    #[test]
    fn test_resolve_sku() {
        let item = resolver()
            .resolve(&RawItemRef::Sku("5021;6".into()))
            .unwrap();
        assert_eq!(item, ItemIdentity::new(5021, quality::UNIQUE));
    }

    #[test]
    fn test_resolve_name_case_insensitive() {
        let raw = RawItemRef::Named {
            name: "team captain".into(),
            quality: Some(quality::UNUSUAL),
            craftable: None,
            killstreak: None,
            effect: Some(13),
        };
        let item = resolver().resolve(&raw).unwrap();
        assert_eq!(item.sku(), "378;5;u13");
    }

    #[test]
    fn test_unknown_name_is_unresolved() {
        let raw = RawItemRef::Named {
            name: "Nonexistent Hat".into(),
            quality: None,
            craftable: None,
            killstreak: None,
            effect: None,
        };
        assert_eq!(
            resolver().resolve(&raw),
            Err(ResolveError::UnknownName("Nonexistent Hat".into()))
        );
    }

    #[test]
    fn test_bad_sku_is_unresolved() {
        let err = resolver()
            .resolve(&RawItemRef::Sku("not-a-sku".into()))
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidSku { .. }));
    }
}
