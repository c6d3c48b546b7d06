use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use rentscan_core::{BuildingRecord, BuildingStats, ClassifiedListing, RunProgress, RunState, RunStatus};
use rentscan_storage::StopSignal;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::fetch::{BuildingFetcher, BuildingOutcome, BuildingResult};

/// Where run progress goes: the status file and recovery checkpoints in production.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn publish(&self, status: RunStatus);
    async fn checkpoint(&self, listings: &[ClassifiedListing]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub workers: usize,
    pub checkpoint_interval: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            checkpoint_interval: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolReport {
    pub listings: Vec<ClassifiedListing>,
    pub stats: BuildingStats,
    pub processed: usize,
    pub total: usize,
    /// Buildings never started because the run was stopped.
    pub cancelled: usize,
    pub stopped: bool,
    /// Buildings as resolved by their fetch, for the side cache.
    pub buildings: Vec<BuildingRecord>,
}

/// Running aggregate. Owned by the consuming loop, so each completion is folded in by
/// exactly one `&mut` call and no reader can observe a half-applied update.
#[derive(Debug, Default)]
struct Tally {
    processed: usize,
    stats: BuildingStats,
    listings: Vec<ClassifiedListing>,
    buildings: Vec<BuildingRecord>,
}

impl Tally {
    fn record(&mut self, joined: Result<BuildingOutcome, JoinError>) {
        self.processed += 1;
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "building task aborted");
                self.stats.errors += 1;
                return;
            }
        };
        let slug = outcome.building.slug.clone();
        match outcome.result {
            BuildingResult::Listings(listings) => {
                debug!(%slug, listings = listings.len(), "building collected");
                self.stats.success += 1;
                self.stats.total_listings += listings.len();
                self.listings.extend(listings);
            }
            BuildingResult::Empty => {
                debug!(%slug, "building has no rental history");
                self.stats.empty += 1;
            }
            BuildingResult::Failed(reason) => {
                warn!(%slug, %reason, "building failed");
                self.stats.errors += 1;
            }
        }
        self.buildings.push(outcome.building);
    }

    fn status(&self, total: usize) -> RunStatus {
        let s = self.stats;
        RunStatus::new(RunState::Running)
            .with_progress(RunProgress::buildings(self.processed, total, s))
            .with_message(format!(
                "Processing buildings: {}/{total} (ok {}, empty {}, errors {})",
                self.processed, s.success, s.empty, s.errors
            ))
    }
}

/// Fixed-size worker pool over the building registry. At most `workers` fetches are in
/// flight; the rest wait in a queue and are simply dropped on stop.
pub struct Coordinator {
    fetcher: Arc<dyn BuildingFetcher>,
    reporter: Arc<dyn ProgressReporter>,
    stop: StopSignal,
    config: PoolConfig,
}

impl Coordinator {
    pub fn new(
        fetcher: Arc<dyn BuildingFetcher>,
        reporter: Arc<dyn ProgressReporter>,
        stop: StopSignal,
        config: PoolConfig,
    ) -> Self {
        Self {
            fetcher,
            reporter,
            stop,
            config,
        }
    }

    fn fill(&self, running: &mut JoinSet<BuildingOutcome>, pending: &mut VecDeque<BuildingRecord>) {
        while running.len() < self.config.workers.max(1) {
            let Some(building) = pending.pop_front() else {
                break;
            };
            let fetcher = self.fetcher.clone();
            running.spawn(async move { fetcher.fetch_building(building).await });
        }
    }

    pub async fn run(&self, buildings: Vec<BuildingRecord>) -> PoolReport {
        let total = buildings.len();
        let interval = self.config.checkpoint_interval.max(1);
        let mut pending: VecDeque<BuildingRecord> = buildings.into();
        let mut running = JoinSet::new();
        let mut tally = Tally::default();
        let mut stopped = false;

        info!(total, workers = self.config.workers, "processing buildings");
        self.reporter.publish(tally.status(total)).await;
        self.fill(&mut running, &mut pending);

        while let Some(joined) = running.join_next().await {
            tally.record(joined);
            self.reporter.publish(tally.status(total)).await;

            if tally.processed % interval == 0 {
                info!(processed = tally.processed, listings = tally.listings.len(), "checkpoint");
                self.reporter.checkpoint(&tally.listings).await;
            }

            if self.stop.poll().await {
                info!(
                    processed = tally.processed,
                    in_flight = running.len(),
                    queued = pending.len(),
                    "stop requested, cancelling remaining buildings"
                );
                self.reporter.checkpoint(&tally.listings).await;
                running.detach_all();
                stopped = true;
                break;
            }

            self.fill(&mut running, &mut pending);
        }

        PoolReport {
            cancelled: pending.len(),
            listings: tally.listings,
            stats: tally.stats,
            processed: tally.processed,
            total,
            stopped,
            buildings: tally.buildings,
        }
    }
}
