//! Operator safety controls.
//!
//! - Structured operator alerts for conditions needing a human
//! - Process-wide halt switch for new execution attempts

mod alert;
mod halt;

pub use alert::{AlertKind, AlertSeverity, OperatorAlert};
pub use halt::HaltSwitch;
