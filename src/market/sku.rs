//! TF2 item identity and SKU string handling.
//!
//! A SKU encodes an item variant as `defindex;quality[;attribute...]`:
//! - `5021;6` - Mann Co. Supply Crate Key, Unique
//! - `30911;5;u13` - Unusual with effect 13 (Burning Flames)
//! - `200;11;kt-3;uncraftable` - Strange Professional Killstreak, uncraftable
//!
//! Attribute order in the canonical form is fixed, so two SKUs naming the
//! same variant always render to the same string.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Well-known quality ids.
pub mod quality {
    pub const NORMAL: u8 = 0;
    pub const GENUINE: u8 = 1;
    pub const VINTAGE: u8 = 3;
    pub const UNUSUAL: u8 = 5;
    pub const UNIQUE: u8 = 6;
    pub const COMMUNITY: u8 = 7;
    pub const SELF_MADE: u8 = 9;
    pub const STRANGE: u8 = 11;
    pub const HAUNTED: u8 = 13;
    pub const COLLECTORS: u8 = 14;
    pub const DECORATED: u8 = 15;
}

/// Errors produced while parsing a SKU string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkuError {
    #[error("empty SKU")]
    Empty,
    #[error("invalid defindex: {0}")]
    InvalidDefindex(String),
    #[error("invalid quality: {0}")]
    InvalidQuality(String),
    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),
}

/// Canonical identity of a tradable item variant.
///
/// Immutable once built; the `with_*` methods return a new value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemIdentity {
    defindex: u32,
    quality: u8,
    craftable: bool,
    australium: bool,
    festive: bool,
    /// Elevated strange (strange counter on a non-strange quality)
    strange: bool,
    killstreak: u8,
    effect: Option<u32>,
    wear: Option<u8>,
    paintkit: Option<u32>,
    paint: Option<u32>,
}

impl ItemIdentity {
    /// A craftable item with no extra attributes.
    pub fn new(defindex: u32, quality: u8) -> Self {
        Self {
            defindex,
            quality,
            craftable: true,
            australium: false,
            festive: false,
            strange: false,
            killstreak: 0,
            effect: None,
            wear: None,
            paintkit: None,
            paint: None,
        }
    }

    pub fn uncraftable(mut self) -> Self {
        self.craftable = false;
        self
    }

    pub fn with_australium(mut self) -> Self {
        self.australium = true;
        self
    }

    pub fn with_festive(mut self) -> Self {
        self.festive = true;
        self
    }

    pub fn with_elevated_strange(mut self) -> Self {
        self.strange = true;
        self
    }

    pub fn with_killstreak(mut self, tier: u8) -> Self {
        self.killstreak = tier;
        self
    }

    pub fn with_effect(mut self, effect: u32) -> Self {
        self.effect = Some(effect);
        self
    }

    pub fn with_wear(mut self, wear: u8) -> Self {
        self.wear = Some(wear);
        self
    }

    pub fn with_paintkit(mut self, paintkit: u32) -> Self {
        self.paintkit = Some(paintkit);
        self
    }

    pub fn with_paint(mut self, paint: u32) -> Self {
        self.paint = Some(paint);
        self
    }

    pub fn defindex(&self) -> u32 {
        self.defindex
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn is_craftable(&self) -> bool {
        self.craftable
    }

    pub fn killstreak(&self) -> u8 {
        self.killstreak
    }

    pub fn effect(&self) -> Option<u32> {
        self.effect
    }

    /// Canonical SKU string.
    pub fn sku(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ItemIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.defindex, self.quality)?;
        if let Some(effect) = self.effect {
            write!(f, ";u{effect}")?;
        }
        if self.australium {
            f.write_str(";australium")?;
        }
        if !self.craftable {
            f.write_str(";uncraftable")?;
        }
        if let Some(wear) = self.wear {
            write!(f, ";w{wear}")?;
        }
        if let Some(paintkit) = self.paintkit {
            write!(f, ";pk{paintkit}")?;
        }
        if self.strange {
            f.write_str(";strange")?;
        }
        if self.killstreak > 0 {
            write!(f, ";kt-{}", self.killstreak)?;
        }
        if self.festive {
            f.write_str(";festive")?;
        }
        if let Some(paint) = self.paint {
            write!(f, ";p{paint}")?;
        }
        Ok(())
    }
}

fn parse_num<T: FromStr>(value: &str, token: &str) -> Result<T, SkuError> {
    value
        .parse()
        .map_err(|_| SkuError::UnknownAttribute(token.to_string()))
}

impl FromStr for ItemIdentity {
    type Err = SkuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SkuError::Empty);
        }

        let mut parts = s.split(';');
        let defindex_str = parts.next().unwrap_or_default();
        let defindex = defindex_str
            .parse()
            .map_err(|_| SkuError::InvalidDefindex(defindex_str.to_string()))?;
        let quality_str = parts
            .next()
            .ok_or_else(|| SkuError::InvalidQuality(String::new()))?;
        let quality = quality_str
            .parse()
            .map_err(|_| SkuError::InvalidQuality(quality_str.to_string()))?;

        let mut item = ItemIdentity::new(defindex, quality);

        for token in parts {
            match token {
                "" => continue,
                "uncraftable" => item.craftable = false,
                "australium" => item.australium = true,
                "festive" => item.festive = true,
                "strange" => item.strange = true,
                t if t.starts_with("kt-") => item.killstreak = parse_num(&t[3..], t)?,
                t if t.starts_with("pk") => item.paintkit = Some(parse_num(&t[2..], t)?),
                t if t.starts_with('u') => item.effect = Some(parse_num(&t[1..], t)?),
                t if t.starts_with('w') => item.wear = Some(parse_num(&t[1..], t)?),
                t if t.starts_with('p') => item.paint = Some(parse_num(&t[1..], t)?),
                // Craft numbers and crate series do not change market identity
                t if t.starts_with('n') || t.starts_with('c') => continue,
                t => return Err(SkuError::UnknownAttribute(t.to_string())),
            }
        }

        Ok(item)
    }
}

impl TryFrom<String> for ItemIdentity {
    type Error = SkuError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ItemIdentity> for String {
    fn from(item: ItemIdentity) -> Self {
        item.to_string()
    }
}
