//! Collection pipeline: discovery, pooled fetch and classification, dedup, price refresh, persistence.

pub mod classify;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod discovery;
pub mod fetch;
pub mod filters;
pub mod refresh;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Local;
use rentscan_adapters::{ChallengeResolver, SessionProvider};
use rentscan_core::{BuildingStats, ClassifiedListing, RunState, RunStatus};
use rentscan_storage::{BuildingInfoCache, GraphqlTransport, HttpClient, SnapshotStore, StatusReporter, StopSignal};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::classify::ClassificationRules;
use crate::config::CollectorConfig;
use crate::coordinator::{Coordinator, PoolConfig, PoolReport, ProgressReporter};
use crate::discovery::{BuildingCrawler, DiscoveryEnd};
use crate::fetch::FetchEngine;
use crate::filters::ListingFilter;
use crate::refresh::PriceRefresher;

pub const CRATE_NAME: &str = "rentscan-collect";

/// Production reporter: status goes to the status file, checkpoints to the backup snapshot.
pub struct FileProgress {
    status: StatusReporter,
    snapshots: SnapshotStore,
    area: String,
}

impl FileProgress {
    pub fn new(status: StatusReporter, snapshots: SnapshotStore, area: impl Into<String>) -> Self {
        Self {
            status,
            snapshots,
            area: area.into(),
        }
    }
}

#[async_trait]
impl ProgressReporter for FileProgress {
    async fn publish(&self, status: RunStatus) {
        self.status.publish(&status).await;
    }

    /// Skipped while nothing has been collected, since the backup also replaces the latest pointer.
    async fn checkpoint(&self, listings: &[ClassifiedListing]) {
        if listings.is_empty() {
            debug!("no listings yet, skipping progress backup");
            return;
        }
        if let Err(err) = self.snapshots.write_backup(listings, &self.area).await {
            warn!(error = %format!("{err:#}"), "could not write progress backup");
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectRequest {
    pub area: String,
    pub filter: ListingFilter,
}

#[derive(Debug, Clone)]
pub struct CollectSummary {
    pub area: String,
    pub buildings_discovered: usize,
    pub discovery_end: DiscoveryEnd,
    pub buildings_processed: usize,
    pub buildings_cancelled: usize,
    pub stats: BuildingStats,
    /// Listings gathered before dedup.
    pub listings_collected: usize,
    pub listings_written: usize,
    pub prices_updated: usize,
    pub stopped: bool,
    pub snapshot: Option<PathBuf>,
}

pub struct Collector {
    config: CollectorConfig,
    session: Arc<dyn SessionProvider>,
    transport: Arc<dyn GraphqlTransport>,
    resolver: Arc<dyn ChallengeResolver>,
    stop: StopSignal,
    rules: ClassificationRules,
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        session: Arc<dyn SessionProvider>,
        transport: Arc<dyn GraphqlTransport>,
        resolver: Arc<dyn ChallengeResolver>,
        stop: StopSignal,
    ) -> Result<Self> {
        let rules = ClassificationRules::from_workspace_root(&config.workspace_root)
            .context("loading classification rules")?;
        Ok(Self {
            config,
            session,
            transport,
            resolver,
            stop,
            rules,
        })
    }

    /// One cookie-carrying HTTP client serves both directory pages and GraphQL.
    pub fn from_config(config: CollectorConfig, resolver: Arc<dyn ChallengeResolver>, stop: StopSignal) -> Result<Self> {
        let http = Arc::new(HttpClient::new(config.http_client_config())?);
        Self::new(config, http.clone(), http, resolver, stop)
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn status_reporter(&self) -> StatusReporter {
        StatusReporter::new(&self.config.status_file)
    }

    fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(&self.config.output_dir, &self.config.excluded_status)
    }

    /// Runs one collection. Failures are also published as an `error` status.
    pub async fn run(&self, request: &CollectRequest) -> Result<CollectSummary> {
        match self.collect(request).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                self.status_reporter()
                    .publish(&RunStatus::new(RunState::Error).with_message(format!("{err:#}")))
                    .await;
                Err(err)
            }
        }
    }

    async fn clear_stale_stop_signal(&self) {
        match fs::remove_file(self.stop.path()).await {
            Ok(()) => info!(path = %self.stop.path().display(), "removed stale stop signal"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(error = %err, "could not remove stale stop signal"),
        }
    }

    async fn collect(&self, request: &CollectRequest) -> Result<CollectSummary> {
        let area = request.area.trim();
        if area.is_empty() {
            bail!("an area name is required");
        }
        self.clear_stale_stop_signal().await;

        let snapshots = self.snapshot_store();
        let progress = Arc::new(FileProgress::new(self.status_reporter(), snapshots.clone(), area));
        progress
            .publish(RunStatus::new(RunState::Starting).with_message(format!("Collecting rentals in {area}")))
            .await;

        let mut cache = BuildingInfoCache::load(&self.config.building_cache).await;
        info!(cached = cache.len(), "building cache loaded");

        let crawler = BuildingCrawler::new(
            self.session.clone(),
            self.resolver.clone(),
            progress.clone(),
            self.stop.clone(),
            &self.config.site_url,
        );
        let discovery = crawler.crawl(area).await;
        let discovered = discovery.registry.len();
        if discovered == 0 && !self.stop.is_requested() {
            bail!("no buildings discovered for {area} (discovery ended: {:?})", discovery.end);
        }

        let mut buildings = discovery.registry.into_records();
        for building in &mut buildings {
            cache.hydrate(building);
        }

        let pool = if self.stop.is_requested() {
            PoolReport {
                total: buildings.len(),
                cancelled: buildings.len(),
                stopped: true,
                ..Default::default()
            }
        } else {
            let fetcher = Arc::new(FetchEngine::new(self.transport.clone(), &self.rules, area));
            let coordinator = Coordinator::new(
                fetcher,
                progress.clone(),
                self.stop.clone(),
                PoolConfig {
                    workers: self.config.workers,
                    checkpoint_interval: self.config.checkpoint_interval,
                },
            );
            coordinator.run(buildings).await
        };
        for building in &pool.buildings {
            cache.remember(building);
        }

        let collected = pool.listings.len();
        let mut listings = dedup::deduplicate(pool.listings);
        info!(collected, unique = listings.len(), "deduplicated listings");

        let mut prices_updated = 0;
        if !self.stop.is_requested() {
            let refresher = PriceRefresher::new(self.transport.clone(), self.rules.stabilization.clone());
            let refreshed = refresher.refresh(&mut listings, &self.stop, &*progress).await;
            info!(
                candidates = refreshed.candidates,
                updated = refreshed.updated,
                interrupted = refreshed.interrupted,
                "price refresh finished"
            );
            prices_updated = refreshed.updated;
        }

        let listings = request.filter.apply(listings, Local::now().date_naive());
        let stopped = self.stop.is_requested();
        let listings_written = listings
            .iter()
            .filter(|l| !l.has_status(&self.config.excluded_status))
            .count();

        let snapshot = if stopped && listings.is_empty() {
            None
        } else {
            match snapshots.write_snapshot(&listings, area).await {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "could not write snapshot");
                    None
                }
            }
        };
        if let Err(err) = cache.save().await {
            warn!(error = %format!("{err:#}"), "could not save building cache");
        }

        let (state, message) = if stopped {
            (RunState::Stopped, format!("Stopped early: saved {listings_written} listings"))
        } else {
            (
                RunState::Completed,
                format!("Collected {listings_written} listings from {} buildings", pool.processed),
            )
        };
        progress.publish(RunStatus::new(state).with_message(message)).await;

        Ok(CollectSummary {
            area: area.to_string(),
            buildings_discovered: discovered,
            discovery_end: discovery.end,
            buildings_processed: pool.processed,
            buildings_cancelled: pool.cancelled,
            stats: pool.stats,
            listings_collected: collected,
            listings_written,
            prices_updated,
            stopped,
            snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rentscan_adapters::{directory_url, AdapterError, ChallengeOutcome};
    use rentscan_storage::{load_snapshot, read_status, GraphqlRequest, TransportError, TransportResponse};
    use serde_json::{json, Value};
    use std::path::Path;
    use std::time::Duration;

    const SITE: &str = "https://listings.test";

    struct OnePageDirectory;

    #[async_trait]
    impl SessionProvider for OnePageDirectory {
        async fn load_page(&self, url: &str) -> Result<String, AdapterError> {
            if url == directory_url(SITE, "soho", 1) {
                Ok(r#"<html><body>
                    <div class="item building"><a href="/building/12-main">12 Main Street</a></div>
                </body></html>"#
                    .to_string())
            } else {
                Err(AdapterError::Session {
                    url: url.to_string(),
                    message: "not found".into(),
                })
            }
        }
    }

    struct NoChallenges;

    #[async_trait]
    impl ChallengeResolver for NoChallenges {
        async fn resolve(&self, _url: &str) -> ChallengeOutcome {
            ChallengeOutcome::Abandoned
        }
    }

    struct ListingApi;

    #[async_trait]
    impl GraphqlTransport for ListingApi {
        async fn post(&self, request: &GraphqlRequest, _: Duration) -> Result<TransportResponse, TransportError> {
            let q = request.query.as_str();
            let body: Value = if q.contains("buildingBySlug(") {
                json!({"data": {"buildingBySlug": {
                    "id": "4451",
                    "address": {"street": "12 Main St", "city": "New York", "state": "NY", "zipCode": "10012"}
                }}})
            } else if q.contains("rentalsHistoryByBuildingId(") {
                json!({"data": {"rentalsHistoryByBuildingId": [
                    {"id": "r1", "displayUnit": "4B", "status": "RENTED", "price": 2500, "offMarketAt": "2022-01-01"},
                    {"id": "r2", "displayUnit": "4-b", "status": "AVAILABLE", "price": 3000,
                     "bedroomCount": 1, "availableAt": "2023-06-01"},
                    {"id": "r3", "displayUnit": "5C", "status": "DELISTED", "price": 4100}
                ]}})
            } else if q.contains("getAgentsForRentalExpress(") {
                json!({"data": {"getAgentsForRentalExpress": []}})
            } else if q.contains("listing(id") {
                json!({"data": {"listing": {"id": "r2", "price": 2800, "lastPrice": 3000}}})
            } else {
                return Err(TransportError::Other("unexpected query".into()));
            };
            Ok(TransportResponse {
                status: 200,
                body: serde_json::to_vec(&body).unwrap(),
            })
        }
    }

    fn config(dir: &Path) -> CollectorConfig {
        CollectorConfig {
            output_dir: dir.to_path_buf(),
            status_file: dir.join("status.json"),
            stop_signal_file: dir.join("stop.txt"),
            building_cache: dir.join("building_info.json"),
            site_url: SITE.to_string(),
            workspace_root: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn collector(config: CollectorConfig, session: Arc<dyn SessionProvider>) -> Collector {
        let stop = StopSignal::new(&config.stop_signal_file);
        Collector::new(config, session, Arc::new(ListingApi), Arc::new(NoChallenges), stop).unwrap()
    }

    fn soho() -> CollectRequest {
        CollectRequest {
            area: "SoHo".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn full_run_writes_deduplicated_refreshed_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(config(dir.path()), Arc::new(OnePageDirectory));
        let summary = collector.run(&soho()).await.unwrap();

        assert_eq!(summary.buildings_discovered, 1);
        assert_eq!(summary.stats.success, 1);
        assert_eq!(summary.listings_collected, 3);
        assert_eq!(summary.listings_written, 1);
        assert_eq!(summary.prices_updated, 1);
        assert!(!summary.stopped);
        assert!(summary.snapshot.as_deref().is_some_and(Path::exists));

        let latest = load_snapshot(dir.path().join("rentals_latest.json")).await.unwrap();
        assert_eq!(latest.metadata.total_listings, 1);
        assert_eq!(latest.metadata.area, "SoHo");
        let survivor = &latest.listings[0];
        assert_eq!(survivor.id.as_deref(), Some("r2"));
        assert_eq!(survivor.price, 2800.0);
        assert_eq!(survivor.building_address, "12 Main St, New York, NY, 10012");

        let status = read_status(dir.path().join("status.json")).await.unwrap().unwrap();
        assert_eq!(status.status, RunState::Completed);

        let cache = BuildingInfoCache::load(dir.path().join("building_info.json")).await;
        assert_eq!(
            cache.get("12-main").and_then(|c| c.internal_id.as_deref()),
            Some("4451")
        );
    }

    #[tokio::test]
    async fn stop_during_discovery_skips_processing() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(config(dir.path()), Arc::new(OnePageDirectory));
        collector.stop.request();
        let summary = collector.run(&soho()).await.unwrap();

        assert!(summary.stopped);
        assert_eq!(summary.discovery_end, DiscoveryEnd::Stopped);
        assert_eq!(summary.buildings_processed, 0);
        assert!(summary.snapshot.is_none());
        let status = read_status(dir.path().join("status.json")).await.unwrap().unwrap();
        assert_eq!(status.status, RunState::Stopped);
    }

    /// Empty history for every building; asks for a stop as soon as history is queried.
    struct StopDuringHistory {
        sentinel: PathBuf,
    }

    #[async_trait]
    impl GraphqlTransport for StopDuringHistory {
        async fn post(&self, request: &GraphqlRequest, _: Duration) -> Result<TransportResponse, TransportError> {
            let body = if request.query.contains("buildingBySlug(") {
                json!({"data": {"buildingBySlug": {"id": "4451"}}})
            } else {
                std::fs::write(&self.sentinel, "stop").unwrap();
                json!({"data": {"rentalsHistoryByBuildingId": null}})
            };
            Ok(TransportResponse {
                status: 200,
                body: serde_json::to_vec(&body).unwrap(),
            })
        }
    }

    #[tokio::test]
    async fn stop_before_any_listing_keeps_previous_latest() {
        let dir = tempfile::tempdir().unwrap();
        let config = CollectorConfig {
            checkpoint_interval: 1,
            ..config(dir.path())
        };
        let transport = Arc::new(StopDuringHistory {
            sentinel: config.stop_signal_file.clone(),
        });
        let stop = StopSignal::new(&config.stop_signal_file);
        let collector =
            Collector::new(config, Arc::new(OnePageDirectory), transport, Arc::new(NoChallenges), stop).unwrap();

        let previous = ClassifiedListing::from_raw(
            &rentscan_core::RawRentalRecord {
                id: Some("old-1".into()),
                ..Default::default()
            },
            &rentscan_core::BuildingRecord::discovered("9-elm", None, "9 Elm St"),
            "soho",
        );
        collector.snapshot_store().write_snapshot(&[previous], "SoHo").await.unwrap();

        let summary = collector.run(&soho()).await.unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.stats.empty, 1);
        assert!(summary.snapshot.is_none());

        let latest = load_snapshot(dir.path().join("rentals_latest.json")).await.unwrap();
        assert_eq!(latest.metadata.total_listings, 1);
        assert_ne!(latest.metadata.is_backup, Some(true));
        assert_eq!(latest.listings[0].id.as_deref(), Some("old-1"));
        assert!(!dir.path().join("rentals_backup.json").exists());
    }

    #[tokio::test]
    async fn empty_discovery_is_an_error_and_is_published() {
        struct EmptyDirectory;

        #[async_trait]
        impl SessionProvider for EmptyDirectory {
            async fn load_page(&self, _url: &str) -> Result<String, AdapterError> {
                Ok("<html><body><p>No buildings</p></body></html>".to_string())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let collector = collector(config(dir.path()), Arc::new(EmptyDirectory));
        assert!(collector.run(&soho()).await.is_err());
        let status = read_status(dir.path().join("status.json")).await.unwrap().unwrap();
        assert_eq!(status.status, RunState::Error);
    }
}
