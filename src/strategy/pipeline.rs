//! Feed-to-execution pipeline.
//!
//! - One ingestion task per source: normalize, then upsert into the cache
//! - One detection task driven by cache change notifications
//! - Each candidate opportunity dispatched on its own task

use super::coordinator::{ExecutionCoordinator, ExecutionError, ExecutionOutcome};
use super::detector::OpportunityDetector;
use crate::market::{ItemIdentity, Opportunity, RawPriceUpdate, SourceId};
use crate::pricing::{FeedNormalizer, PriceCache, UpsertOutcome};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub quotes_applied: AtomicU64,
    pub quotes_stale: AtomicU64,
    pub quotes_dropped: AtomicU64,
    pub opportunities: AtomicU64,
    pub skipped_busy: AtomicU64,
    pub reevaluations: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub quotes_applied: u64,
    pub quotes_stale: u64,
    pub quotes_dropped: u64,
    pub opportunities: u64,
    pub skipped_busy: u64,
    pub reevaluations: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            quotes_applied: self.quotes_applied.load(Ordering::Relaxed),
            quotes_stale: self.quotes_stale.load(Ordering::Relaxed),
            quotes_dropped: self.quotes_dropped.load(Ordering::Relaxed),
            opportunities: self.opportunities.load(Ordering::Relaxed),
            skipped_busy: self.skipped_busy.load(Ordering::Relaxed),
            reevaluations: self.reevaluations.load(Ordering::Relaxed),
        }
    }
}

/// Item under evaluation, mapped to whether a change arrived meanwhile.
type Evaluating = Arc<DashMap<ItemIdentity, bool>>;

/// Marks an item as under evaluation until dropped.
///
/// A change that finds the item busy marks it dirty. The guard then queues
/// the item for another evaluation when it drops.
struct EvaluationGuard {
    item: ItemIdentity,
    evaluating: Evaluating,
    rerun: mpsc::UnboundedSender<ItemIdentity>,
}

impl EvaluationGuard {
    fn acquire(
        evaluating: &Evaluating,
        rerun: &mpsc::UnboundedSender<ItemIdentity>,
        item: &ItemIdentity,
    ) -> Option<Self> {
        match evaluating.entry(item.clone()) {
            Entry::Occupied(mut busy) => {
                busy.insert(true);
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(false);
                Some(Self {
                    item: item.clone(),
                    evaluating: evaluating.clone(),
                    rerun: rerun.clone(),
                })
            }
        }
    }
}

impl Drop for EvaluationGuard {
    fn drop(&mut self) {
        if let Some((item, true)) = self.evaluating.remove(&self.item) {
            // Receiver gone means detection has stopped
            let _ = self.rerun.send(item);
        }
    }
}

/// State shared by the detection loop and the executions it spawns.
struct Detection {
    detector: Arc<OpportunityDetector>,
    coordinator: Arc<ExecutionCoordinator>,
    evaluating: Evaluating,
    rerun: mpsc::UnboundedSender<ItemIdentity>,
    stats: Arc<PipelineStats>,
}

impl Detection {
    fn evaluate(&self, item: &ItemIdentity) {
        if self.coordinator.is_halted() {
            return;
        }
        let Some(guard) = EvaluationGuard::acquire(&self.evaluating, &self.rerun, item) else {
            self.stats.skipped_busy.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if self.coordinator.is_in_flight(item) {
            self.stats.skipped_busy.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(opportunity) = self.detector.evaluate(item) else {
            return;
        };
        self.stats.opportunities.fetch_add(1, Ordering::Relaxed);

        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            dispatch(&coordinator, opportunity).await;
            drop(guard);
        });
    }
}

/// Wires feeds through the cache and detector into the coordinator.
pub struct ArbitragePipeline {
    normalizer: Arc<FeedNormalizer>,
    cache: Arc<PriceCache>,
    detector: Arc<OpportunityDetector>,
    coordinator: Arc<ExecutionCoordinator>,
    /// Items being evaluated or whose candidate is being executed
    evaluating: Evaluating,
    stats: Arc<PipelineStats>,
    shutdown: watch::Sender<bool>,
}

impl ArbitragePipeline {
    pub fn new(
        normalizer: Arc<FeedNormalizer>,
        cache: Arc<PriceCache>,
        detector: Arc<OpportunityDetector>,
        coordinator: Arc<ExecutionCoordinator>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            normalizer,
            cache,
            detector,
            coordinator,
            evaluating: Arc::new(DashMap::new()),
            stats: Arc::new(PipelineStats::default()),
            shutdown,
        }
    }

    pub fn stats(&self) -> PipelineSnapshot {
        self.stats.snapshot()
    }

    /// Stop ingestion and detection tasks. In-flight executions run to completion.
    ///
    /// Dropping the pipeline has the same effect.
    pub fn shutdown(&self) {
        info!("Pipeline shutting down");
        self.shutdown.send_replace(true);
    }

    /// Spawn the ingestion task for one source.
    ///
    /// The task ends when `updates` closes or on shutdown.
    pub fn spawn_ingestion(
        &self,
        source: SourceId,
        mut updates: mpsc::Receiver<RawPriceUpdate>,
    ) -> JoinHandle<()> {
        let normalizer = self.normalizer.clone();
        let cache = self.cache.clone();
        let stats = self.stats.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            info!(%source, "Ingestion started");
            loop {
                let raw = tokio::select! {
                    raw = updates.recv() => match raw {
                        Some(raw) => raw,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                };

                let quote = match normalizer.normalize(&raw) {
                    Ok(quote) => quote,
                    Err(e) => {
                        warn!(%source, error = %e, "Dropping quote");
                        stats.quotes_dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };

                match cache.upsert(quote) {
                    UpsertOutcome::Applied { .. } => {
                        stats.quotes_applied.fetch_add(1, Ordering::Relaxed);
                    }
                    UpsertOutcome::Stale { .. } => {
                        stats.quotes_stale.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            info!(%source, "Ingestion stopped");
        })
    }

    /// Spawn the detection task.
    ///
    /// Evaluates an item each time its best bid or ask changes. A change that
    /// arrives while the item is being evaluated or executed is remembered,
    /// and the item is evaluated again once that execution returns. If the
    /// task falls behind the change stream, every cached item is evaluated.
    pub fn spawn_detection(&self) -> JoinHandle<()> {
        let mut changes = self.cache.subscribe_all();
        let cache = self.cache.clone();
        let (rerun, mut reruns) = mpsc::unbounded_channel();
        let detection = Detection {
            detector: self.detector.clone(),
            coordinator: self.coordinator.clone(),
            evaluating: self.evaluating.clone(),
            rerun,
            stats: self.stats.clone(),
        };
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            info!("Detection started");
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(change) => detection.evaluate(&change.item),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            let items = cache.items();
                            warn!(
                                missed,
                                items = items.len(),
                                "Detection lagged, re-evaluating all items"
                            );
                            for item in &items {
                                detection.evaluate(item);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    Some(item) = reruns.recv() => {
                        debug!(%item, "Re-evaluating after execution");
                        detection.stats.reevaluations.fetch_add(1, Ordering::Relaxed);
                        detection.evaluate(&item);
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Detection stopped");
        })
    }
}

async fn dispatch(coordinator: &ExecutionCoordinator, opportunity: Opportunity) {
    let item = opportunity.item.clone();
    match coordinator.try_execute(opportunity).await {
        Ok(ExecutionOutcome::Settled {
            attempt_id,
            realized_profit,
        }) => {
            info!(%item, %attempt_id, %realized_profit, "💰 Arbitrage settled");
        }
        Ok(outcome) => debug!(%item, ?outcome, "Execution finished"),
        Err(ExecutionError::Halted(reason)) => {
            warn!(%item, %reason, "Execution halted, opportunity skipped");
        }
        Err(e) => error!(%item, error = %e, "Execution failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectionConfig, SourceFees};
    use crate::ledger::{Ledger, MemoryLedgerStore};
    use crate::market::{Leg, PaperVenue, RawItemRef, RawPrice, SkuResolver, VenueError};
    use crate::pricing::KeyPrice;
    use crate::strategy::{AttemptState, FeeSchedule, RetryPolicy};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Fixture {
        venue: PaperVenue,
        cache: Arc<PriceCache>,
        coordinator: Arc<ExecutionCoordinator>,
        pipeline: ArbitragePipeline,
    }

    fn fixture() -> Fixture {
        fixture_with(PaperVenue::new())
    }

    fn fixture_with(venue: PaperVenue) -> Fixture {
        let cache = Arc::new(PriceCache::new());
        let ledger = Arc::new(Ledger::open(Arc::new(MemoryLedgerStore::new())).unwrap());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::new(venue.clone()),
            ledger,
            cache.clone(),
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                call_timeout: Duration::from_millis(200),
            },
        ));
        let normalizer = Arc::new(FeedNormalizer::new(
            Arc::new(SkuResolver::new(HashMap::new())),
            Arc::new(KeyPrice::new(dec!(60))),
        ));
        let detector = Arc::new(OpportunityDetector::new(
            cache.clone(),
            FeeSchedule::new(SourceFees {
                flat: dec!(0.5),
                rate: Decimal::ZERO,
            }),
            DetectionConfig {
                min_net_profit: dec!(1),
                staleness_secs: 60,
            },
        ));
        let pipeline =
            ArbitragePipeline::new(normalizer, cache.clone(), detector, coordinator.clone());
        Fixture {
            venue,
            cache,
            coordinator,
            pipeline,
        }
    }

    fn update(source: &str, side: &str, price: Decimal, sequence: u64) -> RawPriceUpdate {
        RawPriceUpdate {
            source: Some(source.to_string()),
            item: Some(RawItemRef::Sku("5021;6".into())),
            side: Some(side.to_string()),
            price: Some(RawPrice::Metal(price)),
            timestamp: Some(Utc::now().timestamp_millis()),
            sequence: Some(sequence),
        }
    }

    #[tokio::test]
    async fn test_feed_updates_flow_through_to_settlement() {
        let f = fixture();
        let mut reports = f.coordinator.subscribe_reports();
        let detection = f.pipeline.spawn_detection();

        let (scrap_tx, scrap_rx) = mpsc::channel(16);
        let (bptf_tx, bptf_rx) = mpsc::channel(16);
        f.pipeline.spawn_ingestion(SourceId::new("scrap.tf"), scrap_rx);
        f.pipeline.spawn_ingestion(SourceId::new("backpack.tf"), bptf_rx);

        scrap_tx.send(update("scrap.tf", "sell", dec!(55), 1)).await.unwrap();
        bptf_tx.send(update("backpack.tf", "buy", dec!(58), 1)).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(2), reports.recv())
            .await
            .expect("no report before timeout")
            .unwrap();
        assert_eq!(report.state, AttemptState::Settled);
        assert_eq!(report.buy_source, SourceId::new("scrap.tf"));
        assert_eq!(report.sell_source, SourceId::new("backpack.tf"));
        assert_eq!(report.realized_profit, Some(dec!(2)));

        // Consumed quotes are gone, so there is nothing left to detect
        let item: ItemIdentity = "5021;6".parse().unwrap();
        assert!(f.cache.best_ask(&item).is_none());
        assert!(f.cache.best_bid(&item).is_none());
        assert_eq!(f.venue.realized_profit().await, dec!(3));

        f.pipeline.shutdown();
        tokio::time::timeout(Duration::from_secs(1), detection)
            .await
            .expect("detection did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_updates_are_dropped_and_counted() {
        let f = fixture();
        let (tx, rx) = mpsc::channel(16);
        let ingestion = f.pipeline.spawn_ingestion(SourceId::new("scrap.tf"), rx);

        let mut missing_price = update("scrap.tf", "sell", dec!(55), 1);
        missing_price.price = None;
        tx.send(missing_price).await.unwrap();
        tx.send(update("scrap.tf", "sell", dec!(55), 2)).await.unwrap();
        tx.send(update("scrap.tf", "sell", dec!(54), 2)).await.unwrap();
        drop(tx);

        ingestion.await.unwrap();
        let stats = f.pipeline.stats();
        assert_eq!(stats.quotes_dropped, 1);
        assert_eq!(stats.quotes_applied, 1);
        assert_eq!(stats.quotes_stale, 1);
    }

    #[tokio::test]
    async fn test_no_dispatch_without_spread() {
        let f = fixture();
        let detection = f.pipeline.spawn_detection();
        let (tx, rx) = mpsc::channel(16);
        let ingestion = f.pipeline.spawn_ingestion(SourceId::new("scrap.tf"), rx);

        tx.send(update("scrap.tf", "sell", dec!(55), 1)).await.unwrap();
        tx.send(update("backpack.tf", "buy", dec!(55.5), 1)).await.unwrap();
        drop(tx);
        ingestion.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(f.pipeline.stats().opportunities, 0);
        assert_eq!(f.coordinator.in_flight_count(), 0);
        f.pipeline.shutdown();
        detection.await.unwrap();
    }

    #[tokio::test]
    async fn test_change_during_execution_is_evaluated_afterwards() {
        let venue = PaperVenue::new().with_latency(Duration::from_millis(100));
        venue
            .fail_next(Leg::Buy, VenueError::Rejected("listing gone".into()))
            .await;
        let f = fixture_with(venue);
        let mut reports = f.coordinator.subscribe_reports();
        let detection = f.pipeline.spawn_detection();

        let (tx, rx) = mpsc::channel(16);
        f.pipeline.spawn_ingestion(SourceId::new("scrap.tf"), rx);
        tx.send(update("scrap.tf", "sell", dec!(55), 1)).await.unwrap();
        tx.send(update("backpack.tf", "buy", dec!(58), 1)).await.unwrap();

        // Better ask lands while the first buy is still on the wire
        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(update("scrap.tf", "sell", dec!(54), 2)).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), reports.recv())
            .await
            .expect("no first report")
            .unwrap();
        assert_eq!(first.state, AttemptState::Failed);

        let second = tokio::time::timeout(Duration::from_secs(2), reports.recv())
            .await
            .expect("change was not re-evaluated")
            .unwrap();
        assert_eq!(second.state, AttemptState::Settled);
        assert_eq!(second.realized_profit, Some(dec!(3)));

        let stats = f.pipeline.stats();
        assert_eq!(stats.opportunities, 2);
        assert!(stats.reevaluations >= 1);
        f.pipeline.shutdown();
        detection.await.unwrap();
    }

    #[test]
    fn test_evaluation_guard_is_exclusive_per_item() {
        let evaluating: Evaluating = Arc::new(DashMap::new());
        let (rerun, mut reruns) = mpsc::unbounded_channel();
        let item: ItemIdentity = "5021;6".parse().unwrap();
        let other: ItemIdentity = "5002;6".parse().unwrap();

        let guard = EvaluationGuard::acquire(&evaluating, &rerun, &item).unwrap();
        let other_guard = EvaluationGuard::acquire(&evaluating, &rerun, &other).unwrap();
        drop(other_guard);
        assert!(reruns.try_recv().is_err());

        assert!(EvaluationGuard::acquire(&evaluating, &rerun, &item).is_none());
        drop(guard);
        assert_eq!(reruns.try_recv().unwrap(), item);
        assert!(EvaluationGuard::acquire(&evaluating, &rerun, &item).is_some());
    }
}
