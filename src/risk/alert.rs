//! Operator alerts.
//!
//! Conditions that need a human to look at them:
//! - A bought item that could neither be sold nor relisted
//! - Ledger write failures that halted execution
//! - Feed connections that dropped
//!
//! Alerts are emitted as JSON on the `operator_alert` log target.

use crate::market::{ItemIdentity, SourceId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

/// What the alert is about.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum AlertKind {
    /// Sell and compensation both failed; inventory left on hand
    CompensationFailure {
        attempt_id: String,
        item: ItemIdentity,
        buy_source: SourceId,
        buy_price: Decimal,
    },
    /// A ledger append failed and execution is halted
    LedgerFailure { attempt_id: Option<String> },
    /// A price feed dropped its connection
    FeedDisconnect { source: SourceId, reconnect_in_ms: u64 },
}

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// An alert for the operator.
#[derive(Debug, Clone, Serialize)]
pub struct OperatorAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub should_halt: bool,
    pub suggested_action: String,
}

impl OperatorAlert {
    fn new(
        kind: AlertKind,
        severity: AlertSeverity,
        message: String,
        should_halt: bool,
        suggested_action: &str,
    ) -> Self {
        Self {
            alert_id: format!("alert-{}", uuid::Uuid::new_v4().simple()),
            timestamp: Utc::now(),
            kind,
            severity,
            message,
            should_halt,
            suggested_action: suggested_action.to_string(),
        }
    }

    pub fn compensation_failure(
        attempt_id: &str,
        item: &ItemIdentity,
        buy_source: &SourceId,
        buy_price: Decimal,
        reason: &str,
    ) -> Self {
        Self::new(
            AlertKind::CompensationFailure {
                attempt_id: attempt_id.to_string(),
                item: item.clone(),
                buy_source: buy_source.clone(),
                buy_price,
            },
            AlertSeverity::Critical,
            format!(
                "Holding {item} bought on {buy_source} at {buy_price} ref; \
                 sell and relist failed: {reason}"
            ),
            false,
            "Relist or sell the item manually",
        )
    }

    pub fn ledger_failure(attempt_id: Option<&str>, reason: &str) -> Self {
        Self::new(
            AlertKind::LedgerFailure {
                attempt_id: attempt_id.map(str::to_string),
            },
            AlertSeverity::Critical,
            format!("Ledger append failed: {reason}"),
            true,
            "Check ledger storage, then resume execution",
        )
    }

    pub fn feed_disconnect(source: &SourceId, reconnect_in_ms: u64) -> Self {
        Self::new(
            AlertKind::FeedDisconnect {
                source: source.clone(),
                reconnect_in_ms,
            },
            AlertSeverity::Warning,
            format!("Price feed {source} disconnected"),
            false,
            "None if the feed reconnects",
        )
    }

    /// Emit alert as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "operator_alert", "OPERATOR_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "operator_alert", "OPERATOR_ALERT: {}", json),
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(target: "operator_alert", "OPERATOR_ALERT: {}", json)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_compensation_failure_is_critical() {
        let alert = OperatorAlert::compensation_failure(
            "a1",
            &ItemIdentity::new(5021, 6),
            &SourceId::new("scrap.tf"),
            dec!(60),
            "rejected",
        );
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert!(alert.alert_id.starts_with("alert-"));
        assert!(alert.message.contains("5021;6"));
    }

    #[test]
    fn test_alert_serializes_kind_tag() {
        let alert = OperatorAlert::ledger_failure(Some("a1"), "disk full");
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["kind"]["type"], "LedgerFailure");
        assert_eq!(json["kind"]["attempt_id"], "a1");
        assert_eq!(json["should_halt"], true);
    }
}
