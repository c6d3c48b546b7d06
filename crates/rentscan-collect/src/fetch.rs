use std::sync::Arc;

use async_trait::async_trait;
use rentscan_adapters::{decode_building, decode_history, BUILDING_BY_SLUG, HISTORY_FALLBACK_CHAIN};
use rentscan_core::{BuildingRecord, ClassifiedListing, RawRentalRecord};
use rentscan_storage::{execute_query, GraphqlTransport};
use tracing::{debug, info_span, warn, Instrument};

use crate::classify::{apply_ownership, ClassificationRules, OwnershipClassifier, StabilizationRules};

#[derive(Debug, Clone, PartialEq)]
pub enum BuildingResult {
    Listings(Vec<ClassifiedListing>),
    /// The building exists but has no rental history.
    Empty,
    Failed(String),
}

/// Result of one building task, carrying the building as resolved during the fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildingOutcome {
    pub building: BuildingRecord,
    pub result: BuildingResult,
}

impl BuildingOutcome {
    pub fn failed(building: BuildingRecord, reason: impl Into<String>) -> Self {
        Self {
            building,
            result: BuildingResult::Failed(reason.into()),
        }
    }
}

/// Fetch-and-classify for one building. Never fails: problems become [`BuildingResult::Failed`].
#[async_trait]
pub trait BuildingFetcher: Send + Sync {
    async fn fetch_building(&self, building: BuildingRecord) -> BuildingOutcome;
}

pub struct FetchEngine {
    transport: Arc<dyn GraphqlTransport>,
    ownership: OwnershipClassifier,
    stabilization: StabilizationRules,
    source_area: String,
}

impl FetchEngine {
    pub fn new(
        transport: Arc<dyn GraphqlTransport>,
        rules: &ClassificationRules,
        source_area: impl Into<String>,
    ) -> Self {
        Self {
            ownership: OwnershipClassifier::new(rules.ownership.clone(), transport.clone()),
            stabilization: rules.stabilization.clone(),
            transport,
            source_area: source_area.into(),
        }
    }

    /// Fills `internal_id`, address and geo from the slug lookup unless already known.
    async fn resolve(&self, building: &mut BuildingRecord) -> Result<(), String> {
        if building.internal_id.is_some() {
            return Ok(());
        }
        let request = BUILDING_BY_SLUG.request(&building.slug);
        let data = execute_query(
            self.transport.as_ref(),
            BUILDING_BY_SLUG.name,
            &request,
            &BUILDING_BY_SLUG.policy(),
        )
        .await
        .map_err(|e| format!("building lookup failed: {e}"))?;
        let resolved = decode_building(&data, &building.slug)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "no building found for slug".to_string())?;
        building.internal_id = Some(resolved.internal_id);
        building.display_address = resolved.display_address;
        if resolved.geo.is_some() {
            building.geo = resolved.geo;
        }
        Ok(())
    }

    /// First history shape to answer wins; an explicit empty list is an answer.
    async fn history(&self, internal_id: &str) -> Option<Vec<RawRentalRecord>> {
        for descriptor in HISTORY_FALLBACK_CHAIN {
            let request = descriptor.request(internal_id);
            let data = match execute_query(
                self.transport.as_ref(),
                descriptor.name,
                &request,
                &descriptor.policy(),
            )
            .await
            {
                Ok(data) => data,
                Err(err) => {
                    debug!(query = descriptor.name, error = %err, "history query failed, falling through");
                    continue;
                }
            };
            match decode_history(&data, descriptor) {
                Ok(batch) => {
                    if batch.skipped > 0 {
                        warn!(query = descriptor.name, skipped = batch.skipped, "skipped undecodable rental records");
                    }
                    return Some(batch.records);
                }
                Err(err) => {
                    debug!(query = descriptor.name, error = %err, "history payload unreadable, falling through");
                }
            }
        }
        None
    }

    async fn classify(&self, raw: &RawRentalRecord, building: &BuildingRecord) -> ClassifiedListing {
        let mut listing = ClassifiedListing::from_raw(raw, building, &self.source_area);
        let ownership = self.ownership.classify(raw).await;
        apply_ownership(&mut listing, ownership);
        let assessment = self.stabilization.assess(&listing);
        listing.apply_stabilization(assessment);
        listing
    }

    async fn run(&self, mut building: BuildingRecord) -> BuildingOutcome {
        if let Err(reason) = self.resolve(&mut building).await {
            return BuildingOutcome::failed(building, reason);
        }
        let internal_id = building.internal_id.clone().unwrap_or_default();
        let Some(records) = self.history(&internal_id).await else {
            return BuildingOutcome::failed(building, "all history queries failed");
        };
        if records.is_empty() {
            return BuildingOutcome {
                building,
                result: BuildingResult::Empty,
            };
        }

        let mut listings = Vec::with_capacity(records.len());
        for raw in &records {
            listings.push(self.classify(raw, &building).await);
        }
        BuildingOutcome {
            building,
            result: BuildingResult::Listings(listings),
        }
    }
}

#[async_trait]
impl BuildingFetcher for FetchEngine {
    async fn fetch_building(&self, building: BuildingRecord) -> BuildingOutcome {
        let span = info_span!("building_fetch", slug = %building.slug);
        self.run(building).instrument(span).await
    }
}
