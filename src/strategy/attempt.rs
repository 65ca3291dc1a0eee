//! Execution attempt state machine.

use crate::market::{IdempotencyKey, Leg, LegFill, LegOrder, Opportunity, Side};
use crate::pricing::ConsumedQuote;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an execution attempt.
///
/// `Claimed -> BuyPending -> SellPending -> Settled`, with `Failed` reachable
/// from `Claimed`, `BuyPending` and `Compensating`, and
/// `SellPending -> Compensating` when the sell leg cannot complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Claimed,
    BuyPending,
    SellPending,
    Compensating,
    Settled,
    Failed,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Settled | AttemptState::Failed)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, next),
            (Claimed, BuyPending)
                | (Claimed, Failed)
                | (BuyPending, SellPending)
                | (BuyPending, Failed)
                | (SellPending, Settled)
                | (SellPending, Compensating)
                | (Compensating, Failed)
        )
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptState::Claimed => "claimed",
            AttemptState::BuyPending => "buy_pending",
            AttemptState::SellPending => "sell_pending",
            AttemptState::Compensating => "compensating",
            AttemptState::Settled => "settled",
            AttemptState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: AttemptState,
    pub to: AttemptState,
}

/// One attempt to capture an opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub id: String,
    pub opportunity: Opportunity,
    pub state: AttemptState,
    /// External calls made so far, retries included
    pub attempts: u32,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub buy_fill: Option<LegFill>,
    pub sell_fill: Option<LegFill>,
    pub compensation_fill: Option<LegFill>,
}

impl ExecutionAttempt {
    pub fn new(opportunity: Opportunity) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            opportunity,
            state: AttemptState::Claimed,
            attempts: 0,
            last_error: None,
            started_at: Utc::now(),
            completed_at: None,
            buy_fill: None,
            sell_fill: None,
            compensation_fill: None,
        }
    }

    /// Move to `next`, stamping completion time on terminal states.
    pub fn transition(&mut self, next: AttemptState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn key(&self, leg: Leg) -> IdempotencyKey {
        IdempotencyKey::for_leg(&self.id, leg)
    }

    /// Order for one leg of this attempt.
    ///
    /// Compensation relists the bought item on the buy source at the price paid.
    pub fn order(&self, leg: Leg) -> LegOrder {
        let opp = &self.opportunity;
        let (source, price) = match leg {
            Leg::Buy => (opp.buy_source.clone(), opp.buy_price),
            Leg::Sell => (opp.sell_source.clone(), opp.sell_price),
            Leg::Compensate => (
                opp.buy_source.clone(),
                self.buy_fill.as_ref().map_or(opp.buy_price, |f| f.price),
            ),
        };
        LegOrder {
            key: self.key(leg),
            leg,
            item: opp.item.clone(),
            source,
            price,
        }
    }

    /// Quotes this attempt consumed, for cache invalidation on settlement.
    pub fn consumed_quotes(&self) -> [ConsumedQuote; 2] {
        let opp = &self.opportunity;
        [
            ConsumedQuote {
                source: opp.buy_source.clone(),
                side: Side::Sell,
                sequence: opp.buy_quote_sequence,
            },
            ConsumedQuote {
                source: opp.sell_source.clone(),
                side: Side::Buy,
                sequence: opp.sell_quote_sequence,
            },
        ]
    }

    /// Profit realized from fills, if both legs filled.
    pub fn realized_profit(&self) -> Option<rust_decimal::Decimal> {
        let buy = self.buy_fill.as_ref()?;
        let sell = self.sell_fill.as_ref()?;
        Some(sell.price - buy.price - self.opportunity.fees)
    }
}
