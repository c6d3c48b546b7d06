use std::sync::Arc;

use rentscan_adapters::{decode_price, PriceUpdate, LISTING_PRICE};
use rentscan_core::{ClassifiedListing, RunPhase, RunProgress, RunState, RunStatus};
use rentscan_storage::{execute_query, GraphqlTransport, StopSignal};
use tracing::{debug, info};

use crate::classify::StabilizationRules;
use crate::coordinator::ProgressReporter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub candidates: usize,
    pub updated: usize,
    pub interrupted: bool,
}

/// Re-reads the current price of still-active listings after dedup.
pub struct PriceRefresher {
    transport: Arc<dyn GraphqlTransport>,
    stabilization: StabilizationRules,
}

impl PriceRefresher {
    pub fn new(transport: Arc<dyn GraphqlTransport>, stabilization: StabilizationRules) -> Self {
        Self {
            transport,
            stabilization,
        }
    }

    async fn current_price(&self, id: &str) -> Option<PriceUpdate> {
        let request = LISTING_PRICE.request(id);
        let data = match execute_query(self.transport.as_ref(), LISTING_PRICE.name, &request, &LISTING_PRICE.policy()).await
        {
            Ok(data) => data,
            Err(err) => {
                debug!(listing = id, error = %err, "price lookup failed");
                return None;
            }
        };
        match decode_price(&data) {
            Ok(update) => update,
            Err(err) => {
                debug!(listing = id, error = %err, "price payload unreadable");
                None
            }
        }
    }

    /// Sequential; checks `stop` before every lookup. Failed lookups leave the listing as is.
    pub async fn refresh(
        &self,
        listings: &mut [ClassifiedListing],
        stop: &StopSignal,
        reporter: &dyn ProgressReporter,
    ) -> RefreshSummary {
        let targets: Vec<usize> = listings
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_active() && l.id.as_deref().is_some_and(|id| !id.is_empty()))
            .map(|(i, _)| i)
            .collect();
        let mut summary = RefreshSummary {
            candidates: targets.len(),
            ..Default::default()
        };
        if targets.is_empty() {
            return summary;
        }
        info!(candidates = targets.len(), "refreshing prices of active listings");

        for (done, index) in targets.into_iter().enumerate() {
            if stop.poll().await {
                summary.interrupted = true;
                break;
            }
            let listing = &mut listings[index];
            let id = listing.id.clone().unwrap_or_default();
            if let Some(update) = self.current_price(&id).await {
                if let Some(price) = update.price {
                    listing.price = price;
                    listing.last_price = update.last_price;
                    listing.price_history = update.price_history.unwrap_or_default();
                    let assessment = self.stabilization.assess(listing);
                    listing.apply_stabilization(assessment);
                    summary.updated += 1;
                }
            }
            reporter
                .publish(
                    RunStatus::new(RunState::Running)
                        .with_progress(RunProgress::listings(done + 1, summary.candidates, RunPhase::RefreshingPrices))
                        .with_message(format!("Refreshing prices: {}/{}", done + 1, summary.candidates)),
                )
                .await;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::RecordingReporter;
    use async_trait::async_trait;
    use rentscan_core::{BuildingRecord, RawRentalRecord, StabilizationConfidence};
    use rentscan_storage::{GraphqlRequest, TransportError, TransportResponse};
    use serde_json::json;
    use std::time::Duration;

    struct PriceApi;

    #[async_trait]
    impl GraphqlTransport for PriceApi {
        async fn post(&self, request: &GraphqlRequest, _: Duration) -> Result<TransportResponse, TransportError> {
            let id = request.variables["id"].as_str().unwrap_or_default();
            let body = match id {
                "cheap" => json!({"data": {"listing": {"id": id, "price": 2300, "lastPrice": 2600,
                    "priceHistory": [{"price": 2600, "timestamp": "2024-05-01"}]}}}),
                "gone" => json!({"data": {"listing": null}}),
                _ => return Err(TransportError::Connect("refused".into())),
            };
            Ok(TransportResponse {
                status: 200,
                body: serde_json::to_vec(&body).unwrap(),
            })
        }
    }

    fn listing(id: &str, status: &str, price: f64) -> ClassifiedListing {
        let raw = RawRentalRecord {
            id: Some(id.into()),
            status: Some(status.into()),
            price: Some(price),
            bedroom_count: Some(0),
            ..Default::default()
        };
        ClassifiedListing::from_raw(&raw, &BuildingRecord::discovered("b", None, "B"), "soho")
    }

    #[tokio::test]
    async fn only_active_listings_are_refreshed() {
        let refresher = PriceRefresher::new(Arc::new(PriceApi), StabilizationRules::default());
        let mut listings = vec![
            listing("cheap", "AVAILABLE", 2900.0),
            listing("gone", "ON_MARKET", 3100.0),
            listing("cheap", "RENTED", 2900.0),
            listing("broken", "AVAILABLE", 3200.0),
        ];
        let dir = tempfile::tempdir().unwrap();
        let stop = StopSignal::new(dir.path().join("stop"));
        let reporter = RecordingReporter::default();

        let summary = refresher.refresh(&mut listings, &stop, &reporter).await;
        assert_eq!(summary, RefreshSummary { candidates: 3, updated: 1, interrupted: false });
        assert_eq!(listings[0].price, 2300.0);
        assert_eq!(listings[0].last_price, Some(2600.0));
        assert_eq!(listings[0].price_history.len(), 1);
        assert_eq!(listings[0].stabilization_confidence, StabilizationConfidence::Medium);
        assert_eq!(listings[1].price, 3100.0);
        assert_eq!(listings[2].price, 2900.0);
        assert_eq!(listings[3].price, 3200.0);
        assert_eq!(reporter.statuses().len(), 3);
    }

    #[tokio::test]
    async fn stop_flag_interrupts_refresh() {
        let refresher = PriceRefresher::new(Arc::new(PriceApi), StabilizationRules::default());
        let mut listings = vec![listing("cheap", "AVAILABLE", 2900.0)];
        let dir = tempfile::tempdir().unwrap();
        let stop = StopSignal::new(dir.path().join("stop"));
        stop.request();
        let summary = refresher
            .refresh(&mut listings, &stop, &RecordingReporter::default())
            .await;
        assert!(summary.interrupted);
        assert_eq!(listings[0].price, 2900.0);
    }
}
