//! Two-leg execution with write-ahead ledger and crash recovery.
//!
//! Every attempt claims its item, records each state in the ledger before
//! acting on it, and ends either settled or failed. A sell that cannot be
//! completed triggers a compensating relist of the bought item.

use super::attempt::{AttemptState, ExecutionAttempt, InvalidTransition};
use super::retry::RetryPolicy;
use crate::ledger::{Ledger, LedgerError};
use crate::market::{ItemIdentity, Leg, LegFill, Opportunity, SourceId, TradingVenue, VenueError};
use crate::pricing::PriceCache;
use crate::risk::{HaltSwitch, OperatorAlert};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, instrument, warn};

const REPORT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution halted: {0}")]
    Halted(String),

    #[error("ledger write failed: {0}")]
    Persistence(#[from] LedgerError),

    #[error("compensation failed for attempt {attempt_id} ({item}): {reason}")]
    CompensationFailure {
        attempt_id: String,
        item: ItemIdentity,
        reason: String,
    },

    #[error("attempt {attempt_id} cannot be cancelled: buy leg already committed")]
    CancelRejected { attempt_id: String },

    #[error("no attempt in flight for {0}")]
    NotInFlight(ItemIdentity),

    #[error("could not verify orders of attempt {attempt_id}: {reason}")]
    RecoveryIncomplete { attempt_id: String, reason: String },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

/// How an execution request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Settled {
        attempt_id: String,
        realized_profit: Decimal,
    },
    Failed {
        attempt_id: String,
        reason: String,
        /// The bought item was relisted
        compensated: bool,
    },
    Cancelled {
        attempt_id: String,
    },
    /// Another attempt holds the item; nothing was done
    AlreadyInFlight {
        attempt_id: String,
    },
}

/// Summary of a finished attempt, logged on the `execution_report` target.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub attempt_id: String,
    pub item: ItemIdentity,
    pub buy_source: SourceId,
    pub sell_source: SourceId,
    pub state: AttemptState,
    pub estimated_net_profit: Decimal,
    pub realized_profit: Option<Decimal>,
    pub compensated: bool,
    pub calls: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&ExecutionAttempt> for ExecutionReport {
    fn from(attempt: &ExecutionAttempt) -> Self {
        Self {
            attempt_id: attempt.id.clone(),
            item: attempt.opportunity.item.clone(),
            buy_source: attempt.opportunity.buy_source.clone(),
            sell_source: attempt.opportunity.sell_source.clone(),
            state: attempt.state,
            estimated_net_profit: attempt.opportunity.estimated_net_profit,
            realized_profit: attempt.realized_profit(),
            compensated: attempt.compensation_fill.is_some(),
            calls: attempt.attempts,
            error: attempt.last_error.clone(),
            started_at: attempt.started_at,
            completed_at: attempt.completed_at,
        }
    }
}

#[derive(Debug, Default)]
struct ControlState {
    cancel_requested: bool,
    buy_filled: bool,
    /// Owning task exited without reaching a terminal state
    orphaned: bool,
}

/// Shared handle between a running attempt and `cancel`.
#[derive(Debug, Default)]
struct AttemptControl {
    state: Mutex<ControlState>,
    wake: Notify,
}

impl AttemptControl {
    /// Request cancellation; refused once the buy has filled.
    fn request_cancel(&self) -> bool {
        let mut state = self.state.lock();
        if state.buy_filled || state.orphaned {
            return false;
        }
        state.cancel_requested = true;
        drop(state);
        self.wake.notify_one();
        true
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancel_requested
    }

    fn mark_buy_filled(&self) {
        let mut state = self.state.lock();
        if state.cancel_requested {
            warn!("Cancellation arrived while buy was in flight; buy filled, continuing");
            state.cancel_requested = false;
        }
        state.buy_filled = true;
    }

    fn mark_orphaned(&self) {
        self.state.lock().orphaned = true;
    }

    fn is_orphaned(&self) -> bool {
        self.state.lock().orphaned
    }
}

struct InFlight {
    attempt_id: String,
    control: Arc<AttemptControl>,
}

enum LegFailure {
    Cancelled,
    Venue(VenueError),
}

impl LegFailure {
    fn describe(&self) -> String {
        match self {
            LegFailure::Cancelled => "cancelled".to_string(),
            LegFailure::Venue(e) => e.to_string(),
        }
    }
}

/// Executes opportunities as buy-then-sell with compensation.
///
/// At most one attempt per item is in flight. Every transition is appended
/// to the ledger before the next external call, and a ledger failure halts
/// new attempts until [`resume`](Self::resume).
pub struct ExecutionCoordinator {
    venue: Arc<dyn TradingVenue>,
    ledger: Arc<Ledger>,
    cache: Arc<PriceCache>,
    policy: RetryPolicy,
    halt: HaltSwitch,
    in_flight: DashMap<ItemIdentity, InFlight>,
    reports: broadcast::Sender<ExecutionReport>,
}

impl ExecutionCoordinator {
    pub fn new(
        venue: Arc<dyn TradingVenue>,
        ledger: Arc<Ledger>,
        cache: Arc<PriceCache>,
        policy: RetryPolicy,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            venue,
            ledger,
            cache,
            policy,
            halt: HaltSwitch::new(),
            in_flight: DashMap::new(),
            reports,
        }
    }

    /// Receive a report for every attempt that finishes.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<ExecutionReport> {
        self.reports.subscribe()
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }

    pub fn is_in_flight(&self, item: &ItemIdentity) -> bool {
        self.in_flight.contains_key(item)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Attempt to capture an opportunity.
    #[instrument(skip(self, opportunity), fields(item = %opportunity.item))]
    pub async fn try_execute(
        &self,
        opportunity: Opportunity,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        if self.halt.is_halted() {
            return Err(ExecutionError::Halted(self.halt.reason().unwrap_or_default()));
        }

        let mut attempt = ExecutionAttempt::new(opportunity);
        let item = attempt.opportunity.item.clone();
        let control = Arc::new(AttemptControl::default());

        match self.in_flight.entry(item.clone()) {
            Entry::Occupied(existing) => {
                debug!(%item, attempt_id = %existing.get().attempt_id, "Item already in flight");
                return Ok(ExecutionOutcome::AlreadyInFlight {
                    attempt_id: existing.get().attempt_id.clone(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(InFlight {
                    attempt_id: attempt.id.clone(),
                    control: control.clone(),
                });
            }
        }

        info!(
            attempt_id = %attempt.id,
            buy_source = %attempt.opportunity.buy_source,
            sell_source = %attempt.opportunity.sell_source,
            buy_price = %attempt.opportunity.buy_price,
            sell_price = %attempt.opportunity.sell_price,
            expected_profit = %attempt.opportunity.estimated_net_profit,
            "Attempt claimed"
        );

        let result = match self.persist(&attempt) {
            Ok(()) => self.drive(&mut attempt, &control).await,
            Err(e) => Err(e),
        };

        match &result {
            // An external call may have executed; the item stays locked until recovery
            Err(ExecutionError::Persistence(_) | ExecutionError::RecoveryIncomplete { .. })
                if attempt.attempts > 0 =>
            {
                control.mark_orphaned();
            }
            _ => self.release(&item, &attempt.id),
        }

        result
    }

    /// Cancel the in-flight attempt for `item`.
    ///
    /// Honored at the next point before the buy is submitted or between buy
    /// retries. A buy call already on the wire runs to completion, and if it
    /// fills the attempt proceeds to sell. Rejected once the buy has filled.
    pub fn cancel(&self, item: &ItemIdentity) -> Result<(), ExecutionError> {
        let entry = self
            .in_flight
            .get(item)
            .ok_or_else(|| ExecutionError::NotInFlight(item.clone()))?;

        if !entry.control.request_cancel() {
            return Err(ExecutionError::CancelRejected {
                attempt_id: entry.attempt_id.clone(),
            });
        }

        info!(%item, attempt_id = %entry.attempt_id, "Cancellation requested");
        Ok(())
    }

    /// Verify the ledger, lift the halt, and finish attempts left behind.
    #[instrument(skip(self))]
    pub async fn resume(&self) -> Result<Vec<ExecutionOutcome>, ExecutionError> {
        self.ledger.health_check()?;
        self.halt.clear();
        self.recover().await
    }

    /// Complete or compensate every non-terminal attempt in the ledger.
    ///
    /// Legs are looked up by idempotency key rather than re-issued, so a buy
    /// is never placed twice. No item remains locked afterwards unless an
    /// attempt could not be verified, in which case execution is halted.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<ExecutionOutcome>, ExecutionError> {
        let pending: Vec<ExecutionAttempt> = self
            .ledger
            .latest_attempts()?
            .into_iter()
            .filter(|a| !a.state.is_terminal())
            .collect();

        if !pending.is_empty() {
            info!(count = pending.len(), "Recovering unfinished attempts");
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for mut attempt in pending {
            let item = attempt.opportunity.item.clone();

            let live = self
                .in_flight
                .get(&item)
                .is_some_and(|f| !f.control.is_orphaned());
            if live {
                debug!(%item, attempt_id = %attempt.id, "Attempt still running, skipping");
                continue;
            }

            // Recovered attempts are not cancellable
            let control = Arc::new(AttemptControl::default());
            control.mark_buy_filled();
            self.in_flight.insert(
                item.clone(),
                InFlight {
                    attempt_id: attempt.id.clone(),
                    control: control.clone(),
                },
            );

            info!(attempt_id = %attempt.id, %item, state = %attempt.state, "Recovering attempt");
            match self.resume_attempt(&mut attempt).await {
                Ok(outcome) => {
                    self.release(&item, &attempt.id);
                    outcomes.push(outcome);
                }
                Err(ExecutionError::CompensationFailure { reason, .. }) => {
                    self.release(&item, &attempt.id);
                    outcomes.push(ExecutionOutcome::Failed {
                        attempt_id: attempt.id.clone(),
                        reason,
                        compensated: false,
                    });
                }
                Err(e) => {
                    control.mark_orphaned();
                    return Err(e);
                }
            }
        }

        self.in_flight.retain(|_, f| !f.control.is_orphaned());
        Ok(outcomes)
    }

    async fn resume_attempt(
        &self,
        attempt: &mut ExecutionAttempt,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        match attempt.state {
            AttemptState::Claimed => {
                self.finish_failed(attempt, "interrupted before buy was placed".into())
            }
            AttemptState::BuyPending => match self.lookup(attempt, Leg::Buy).await? {
                Some(fill) => {
                    info!(
                        attempt_id = %attempt.id,
                        order_id = %fill.order_id,
                        "Buy had filled before restart"
                    );
                    attempt.buy_fill = Some(fill);
                    self.begin_sell(attempt).await
                }
                None => self.finish_failed(attempt, "buy not filled before restart".into()),
            },
            AttemptState::SellPending => match self.lookup(attempt, Leg::Sell).await? {
                Some(fill) => {
                    attempt.sell_fill = Some(fill);
                    self.settle(attempt)
                }
                None => self.run_sell(attempt).await,
            },
            AttemptState::Compensating => match self.lookup(attempt, Leg::Compensate).await? {
                Some(fill) => {
                    attempt.compensation_fill = Some(fill);
                    let reason = attempt
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "sell leg failed".into());
                    self.finish_failed(attempt, reason)
                }
                None => self.run_compensation(attempt).await,
            },
            AttemptState::Settled | AttemptState::Failed => Ok(Self::outcome_of(attempt)),
        }
    }

    async fn drive(
        &self,
        attempt: &mut ExecutionAttempt,
        control: &AttemptControl,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        if control.is_cancelled() {
            return self.finish_cancelled(attempt);
        }

        attempt.transition(AttemptState::BuyPending)?;
        self.persist(attempt)?;

        let calls_before = attempt.attempts;
        let fill = match self.place(attempt, Leg::Buy, Some(control)).await {
            Ok(fill) => fill,
            Err(LegFailure::Venue(e)) if !e.is_transient() => {
                warn!(attempt_id = %attempt.id, error = %e, "Buy rejected, no position taken");
                return self.finish_failed(attempt, format!("buy failed: {e}"));
            }
            Err(LegFailure::Cancelled) if attempt.attempts == calls_before => {
                return self.finish_cancelled(attempt);
            }
            // An unanswered buy call may still have executed
            Err(failure) => match self.lookup(attempt, Leg::Buy).await? {
                Some(fill) => {
                    warn!(
                        attempt_id = %attempt.id,
                        order_id = %fill.order_id,
                        error = %failure.describe(),
                        "Buy call failed but the order filled"
                    );
                    fill
                }
                None => {
                    return match failure {
                        LegFailure::Cancelled => self.finish_cancelled(attempt),
                        LegFailure::Venue(e) => {
                            warn!(
                                attempt_id = %attempt.id,
                                error = %e,
                                "Buy failed, no position taken"
                            );
                            self.finish_failed(attempt, format!("buy failed: {e}"))
                        }
                    };
                }
            },
        };

        control.mark_buy_filled();
        info!(
            attempt_id = %attempt.id,
            order_id = %fill.order_id,
            price = %fill.price,
            "Buy filled"
        );
        attempt.buy_fill = Some(fill);
        self.begin_sell(attempt).await
    }

    async fn begin_sell(
        &self,
        attempt: &mut ExecutionAttempt,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        attempt.transition(AttemptState::SellPending)?;
        self.persist(attempt)?;
        self.run_sell(attempt).await
    }

    async fn run_sell(
        &self,
        attempt: &mut ExecutionAttempt,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        match self.place(attempt, Leg::Sell, None).await {
            Ok(fill) => {
                info!(
                    attempt_id = %attempt.id,
                    order_id = %fill.order_id,
                    price = %fill.price,
                    "Sell filled"
                );
                attempt.sell_fill = Some(fill);
                self.settle(attempt)
            }
            Err(failure) => {
                let reason = failure.describe();
                warn!(attempt_id = %attempt.id, error = %reason, "Sell failed, compensating");
                attempt.last_error = Some(format!("sell failed: {reason}"));
                attempt.transition(AttemptState::Compensating)?;
                self.persist(attempt)?;
                self.run_compensation(attempt).await
            }
        }
    }

    async fn run_compensation(
        &self,
        attempt: &mut ExecutionAttempt,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let sell_error = attempt
            .last_error
            .clone()
            .unwrap_or_else(|| "sell failed".into());

        match self.place(attempt, Leg::Compensate, None).await {
            Ok(fill) => {
                info!(
                    attempt_id = %attempt.id,
                    order_id = %fill.order_id,
                    price = %fill.price,
                    "Compensation filled, item relisted"
                );
                attempt.compensation_fill = Some(fill);
                self.finish_failed(attempt, sell_error)
            }
            Err(failure) => {
                let reason = failure.describe();
                error!(attempt_id = %attempt.id, error = %reason, "Compensation failed");

                let opp = &attempt.opportunity;
                OperatorAlert::compensation_failure(
                    &attempt.id,
                    &opp.item,
                    &opp.buy_source,
                    opp.buy_price,
                    &reason,
                )
                .emit();

                self.finish_failed(
                    attempt,
                    format!("{sell_error}; compensation failed: {reason}"),
                )?;
                Err(ExecutionError::CompensationFailure {
                    attempt_id: attempt.id.clone(),
                    item: attempt.opportunity.item.clone(),
                    reason,
                })
            }
        }
    }

    fn settle(&self, attempt: &mut ExecutionAttempt) -> Result<ExecutionOutcome, ExecutionError> {
        attempt.transition(AttemptState::Settled)?;
        self.persist(attempt)?;
        self.cache
            .invalidate(&attempt.opportunity.item, &attempt.consumed_quotes());
        self.report(attempt);
        Ok(Self::outcome_of(attempt))
    }

    fn finish_failed(
        &self,
        attempt: &mut ExecutionAttempt,
        reason: String,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        attempt.last_error = Some(reason);
        attempt.transition(AttemptState::Failed)?;
        self.persist(attempt)?;
        self.report(attempt);
        Ok(Self::outcome_of(attempt))
    }

    fn finish_cancelled(
        &self,
        attempt: &mut ExecutionAttempt,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        self.finish_failed(attempt, "cancelled".into())?;
        Ok(ExecutionOutcome::Cancelled {
            attempt_id: attempt.id.clone(),
        })
    }

    fn outcome_of(attempt: &ExecutionAttempt) -> ExecutionOutcome {
        match attempt.state {
            AttemptState::Settled => ExecutionOutcome::Settled {
                attempt_id: attempt.id.clone(),
                realized_profit: attempt.realized_profit().unwrap_or_default(),
            },
            _ => ExecutionOutcome::Failed {
                attempt_id: attempt.id.clone(),
                reason: attempt.last_error.clone().unwrap_or_default(),
                compensated: attempt.compensation_fill.is_some(),
            },
        }
    }

    /// Append the attempt's current state; halts execution on failure.
    fn persist(&self, attempt: &ExecutionAttempt) -> Result<(), ExecutionError> {
        self.ledger.record(attempt).map(|_| ()).map_err(|e| {
            OperatorAlert::ledger_failure(Some(&attempt.id), &e.to_string()).emit();
            self.halt.trip(format!("ledger append failed: {e}"));
            ExecutionError::Persistence(e)
        })
    }

    fn release(&self, item: &ItemIdentity, attempt_id: &str) {
        self.in_flight.remove_if(item, |_, f| f.attempt_id == attempt_id);
    }

    fn report(&self, attempt: &ExecutionAttempt) {
        let report = ExecutionReport::from(attempt);
        let json = serde_json::to_string(&report).unwrap_or_default();
        info!(target: "execution_report", "EXECUTION_REPORT: {}", json);
        // No subscribers is fine
        let _ = self.reports.send(report);
    }

    async fn place(
        &self,
        attempt: &mut ExecutionAttempt,
        leg: Leg,
        control: Option<&AttemptControl>,
    ) -> Result<LegFill, LegFailure> {
        let order = attempt.order(leg);
        let venue = self.venue.as_ref();
        let op = || match leg {
            Leg::Buy => venue.place_buy(&order),
            Leg::Sell => venue.place_sell(&order),
            Leg::Compensate => venue.compensate(&order),
        };
        self.with_retry(&attempt.id, leg, &mut attempt.attempts, control, op)
            .await
    }

    /// Look up a leg by idempotency key. Halts execution if the venue cannot answer.
    async fn lookup(
        &self,
        attempt: &mut ExecutionAttempt,
        leg: Leg,
    ) -> Result<Option<LegFill>, ExecutionError> {
        let key = attempt.key(leg);
        let venue = self.venue.as_ref();
        let result = self
            .with_retry(&attempt.id, leg, &mut attempt.attempts, None, || {
                venue.order_status(&key)
            })
            .await;

        result.map_err(|failure| {
            let reason = failure.describe();
            self.halt
                .trip(format!("could not verify {key}: {reason}"));
            ExecutionError::RecoveryIncomplete {
                attempt_id: attempt.id.clone(),
                reason,
            }
        })
    }

    /// Run `op` under the call timeout, retrying transient failures with backoff.
    async fn with_retry<T, F, Fut>(
        &self,
        attempt_id: &str,
        leg: Leg,
        calls: &mut u32,
        control: Option<&AttemptControl>,
        mut op: F,
    ) -> Result<T, LegFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VenueError>>,
    {
        let mut last_error = VenueError::Timeout;

        for n in 1..=self.policy.max_attempts {
            if control.is_some_and(AttemptControl::is_cancelled) {
                return Err(LegFailure::Cancelled);
            }

            *calls += 1;
            let result = tokio::time::timeout(self.policy.call_timeout, op())
                .await
                .unwrap_or(Err(VenueError::Timeout));

            match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(LegFailure::Venue(e)),
                Err(e) => {
                    debug!(
                        %attempt_id,
                        %leg,
                        try_number = n,
                        max_attempts = self.policy.max_attempts,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    last_error = e;
                }
            }

            if n < self.policy.max_attempts {
                let delay = self.policy.backoff(n);
                match control {
                    Some(control) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = control.wake.notified() => {}
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
        }

        Err(LegFailure::Venue(last_error))
    }
}
