//! Core domain model for rentscan: buildings, rental records, classified listings and run status.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "rentscan-core";

/// Statuses the listing site uses for units currently on the market.
pub const ACTIVE_STATUSES: &[&str] = &["AVAILABLE", "ON_MARKET"];

/// Statuses for units that recently left the market.
pub const INACTIVE_STATUSES: &[&str] = &["OFF_MARKET", "RENTED", "NO_LONGER_AVAILABLE"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// One building discovered in the target area. `internal_id` and `geo` are filled
/// after the first successful lookup against the listing API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingRecord {
    pub slug: String,
    pub internal_id: Option<String>,
    pub display_address: String,
    pub href: Option<String>,
    pub geo: Option<GeoPoint>,
    pub year_built: Option<i32>,
}

impl BuildingRecord {
    pub fn discovered(slug: impl Into<String>, href: Option<String>, address: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            internal_id: None,
            display_address: address.into(),
            href,
            geo: None,
            year_built: None,
        }
    }
}

/// Insertion-ordered set of buildings keyed by slug. A slug seen once is never re-added.
#[derive(Debug, Clone, Default)]
pub struct BuildingRegistry {
    order: Vec<String>,
    records: HashMap<String, BuildingRecord>,
}

impl BuildingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the slug was already registered.
    pub fn insert(&mut self, record: BuildingRecord) -> bool {
        if self.records.contains_key(&record.slug) {
            return false;
        }
        self.order.push(record.slug.clone());
        self.records.insert(record.slug.clone(), record);
        true
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.records.contains_key(slug)
    }

    pub fn get(&self, slug: &str) -> Option<&BuildingRecord> {
        self.records.get(slug)
    }

    pub fn get_mut(&mut self, slug: &str) -> Option<&mut BuildingRecord> {
        self.records.get_mut(slug)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn slugs(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &BuildingRecord> {
        self.order.iter().filter_map(|slug| self.records.get(slug))
    }

    pub fn into_records(mut self) -> Vec<BuildingRecord> {
        self.order
            .iter()
            .filter_map(|slug| self.records.remove(slug))
            .collect()
    }
}

/// GraphQL ids normally arrive as strings; legacy ids are sometimes bare integers.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Int(i64),
    Float(f64),
}

fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<IdRepr>::deserialize(deserializer)?.map(|repr| match repr {
        IdRepr::Text(text) => text,
        IdRepr::Int(n) => n.to_string(),
        IdRepr::Float(n) => n.to_string(),
    }))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyRef {
    #[serde(deserialize_with = "lenient_id")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UnitRef {
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentContact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnerContact {
    pub name: Option<String>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceHistoryEntry {
    pub price: Option<f64>,
    pub timestamp: Option<String>,
}

/// One tenancy record as returned by the rental-history API. Every field is optional
/// so missing values are defaulted once, when the record becomes a [`ClassifiedListing`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawRentalRecord {
    #[serde(deserialize_with = "lenient_id")]
    pub id: Option<String>,
    pub legacy: Option<LegacyRef>,
    pub street: Option<String>,
    pub display_unit: Option<String>,
    pub unit: Option<UnitRef>,
    #[serde(deserialize_with = "lenient_id")]
    pub building_id: Option<String>,
    pub available_at: Option<String>,
    pub on_market_at: Option<String>,
    pub off_market_at: Option<String>,
    pub bedroom_count: Option<u32>,
    pub full_bathroom_count: Option<u32>,
    pub half_bathroom_count: Option<u32>,
    pub living_area_size: Option<f64>,
    pub price: Option<f64>,
    pub last_price: Option<f64>,
    pub price_history: Option<Vec<PriceHistoryEntry>>,
    pub no_fee: Option<bool>,
    pub is_no_fee: Option<bool>,
    pub interesting_price_delta: Option<f64>,
    pub net_effective_rent: Option<f64>,
    pub lease_term_months: Option<u32>,
    pub months_free: Option<f64>,
    pub media_asset_count: Option<u32>,
    pub status: Option<String>,
    pub furnished: Option<bool>,
    pub slug: Option<String>,
    pub area_name: Option<String>,
    pub url_path: Option<String>,
    pub is_rent_stabilized: Option<bool>,
    pub laundry_in_building: Option<bool>,
    pub private_outdoor_space: Option<bool>,
    pub pet_friendly: Option<bool>,
    pub agent: Option<AgentContact>,
    pub owner_contact_info: Option<OwnerContact>,
}

impl RawRentalRecord {
    /// Unit label from `displayUnit`, falling back to the nested unit object.
    pub fn unit_label(&self) -> String {
        self.display_unit
            .clone()
            .or_else(|| self.unit.as_ref().and_then(|u| u.display_name.clone()))
            .unwrap_or_else(|| "N/A".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    #[default]
    None,
    AgentName,
    OwnerContact,
    PatternAnalysis,
    AgentApiExplicit,
    AgentApiCorporate,
    AgentApiPersonalMatch,
    AgentApiPersonalNoMatch,
    AgentApiInsufficient,
    AgentApiNoAgents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternIndicator {
    PersonalEmailDomain,
    SimplePersonalName,
    EmailMatchesName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StabilizationConfidence {
    #[default]
    None,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OwnershipVerdict {
    pub is_owner: bool,
    pub method: DetectionMethod,
    pub confidence: u8,
    pub indicators: Vec<PatternIndicator>,
}

impl OwnershipVerdict {
    pub fn owner(method: DetectionMethod, confidence: u8) -> Self {
        Self {
            is_owner: true,
            method,
            confidence: confidence.min(100),
            indicators: Vec::new(),
        }
    }

    pub fn not_owner(method: DetectionMethod) -> Self {
        Self {
            is_owner: false,
            method,
            confidence: 0,
            indicators: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StabilizationAssessment {
    pub likely_stabilized: bool,
    pub confidence: StabilizationConfidence,
    pub evidence: String,
}

/// Canonical listing written to snapshots. Field names follow the JSON contract the
/// dashboard already reads, so the raw API names stay camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedListing {
    pub id: Option<String>,
    pub building_slug: String,
    pub building_id: Option<String>,
    pub building_address: String,
    pub price: f64,
    #[serde(rename = "bedroomCount")]
    pub bedroom_count: u32,
    #[serde(rename = "fullBathroomCount")]
    pub full_bathroom_count: u32,
    #[serde(rename = "halfBathroomCount")]
    pub half_bathroom_count: u32,
    #[serde(rename = "displayUnit")]
    pub display_unit: String,
    pub sqft: Option<f64>,
    #[serde(rename = "offMarketAt")]
    pub off_market_at: Option<String>,
    #[serde(rename = "onMarketAt")]
    pub on_market_at: Option<String>,
    #[serde(rename = "availableAt")]
    pub available_at: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "isNoFee")]
    pub is_no_fee: bool,
    #[serde(rename = "lastPrice")]
    pub last_price: Option<f64>,
    #[serde(rename = "priceHistory", default)]
    pub price_history: Vec<PriceHistoryEntry>,
    #[serde(rename = "isRentStabilized")]
    pub is_rent_stabilized: bool,
    #[serde(rename = "laundryInBuilding")]
    pub laundry_in_building: bool,
    #[serde(rename = "privateOutdoorSpace")]
    pub private_outdoor_space: bool,
    #[serde(rename = "petFriendly")]
    pub pet_friendly: bool,
    pub furnished: bool,
    pub source_area: String,
    pub building_year_built: Option<i32>,
    #[serde(rename = "urlPath")]
    pub url_path: Option<String>,
    #[serde(rename = "agentName", skip_serializing_if = "Option::is_none", default)]
    pub agent_name: Option<String>,
    #[serde(rename = "agentEmail", skip_serializing_if = "Option::is_none", default)]
    pub agent_email: Option<String>,
    #[serde(rename = "agentPhone", skip_serializing_if = "Option::is_none", default)]
    pub agent_phone: Option<String>,
    #[serde(rename = "ownerName", skip_serializing_if = "Option::is_none", default)]
    pub owner_name: Option<String>,
    #[serde(rename = "ownerPhone", skip_serializing_if = "Option::is_none", default)]
    pub owner_phone: Option<String>,
    pub is_owner: bool,
    pub owner_detection_method: DetectionMethod,
    pub owner_detection_confidence: u8,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub owner_pattern_indicators: Vec<PatternIndicator>,
    pub has_owner_agent_info: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub likely_stabilized: bool,
    pub stabilization_confidence: StabilizationConfidence,
    pub stabilization_evidence: String,
}

impl ClassifiedListing {
    /// Maps a raw record into the stable field set. Classification fields start at
    /// their "unknown" defaults and are filled by [`ClassifiedListing::apply_ownership`]
    /// and [`ClassifiedListing::apply_stabilization`].
    pub fn from_raw(raw: &RawRentalRecord, building: &BuildingRecord, source_area: &str) -> Self {
        let agent = raw.agent.as_ref();
        let owner = raw.owner_contact_info.as_ref();
        Self {
            id: raw.id.clone(),
            building_slug: building.slug.clone(),
            building_id: building.internal_id.clone(),
            building_address: building.display_address.clone(),
            price: raw.price.unwrap_or(0.0),
            bedroom_count: raw.bedroom_count.unwrap_or(0),
            full_bathroom_count: raw.full_bathroom_count.unwrap_or(0),
            half_bathroom_count: raw.half_bathroom_count.unwrap_or(0),
            display_unit: raw.unit_label(),
            sqft: raw.living_area_size,
            off_market_at: raw.off_market_at.clone(),
            on_market_at: raw.on_market_at.clone(),
            available_at: raw.available_at.clone(),
            status: raw.status.clone(),
            is_no_fee: raw.is_no_fee.or(raw.no_fee).unwrap_or(false),
            last_price: raw.last_price,
            price_history: raw.price_history.clone().unwrap_or_default(),
            is_rent_stabilized: raw.is_rent_stabilized.unwrap_or(false),
            laundry_in_building: raw.laundry_in_building.unwrap_or(false),
            private_outdoor_space: raw.private_outdoor_space.unwrap_or(false),
            pet_friendly: raw.pet_friendly.unwrap_or(false),
            furnished: raw.furnished.unwrap_or(false),
            source_area: source_area.to_string(),
            building_year_built: building.year_built,
            url_path: raw.url_path.clone(),
            agent_name: agent.and_then(|a| a.name.clone()),
            agent_email: agent.and_then(|a| a.email.clone()),
            agent_phone: agent.and_then(|a| a.phone_number.clone()),
            owner_name: owner.and_then(|o| o.name.clone()),
            owner_phone: owner.and_then(|o| o.phone_number.clone()),
            is_owner: false,
            owner_detection_method: DetectionMethod::None,
            owner_detection_confidence: 0,
            owner_pattern_indicators: Vec::new(),
            has_owner_agent_info: agent.is_some() || owner.is_some(),
            latitude: building.geo.map(|g| g.latitude),
            longitude: building.geo.map(|g| g.longitude),
            likely_stabilized: false,
            stabilization_confidence: StabilizationConfidence::None,
            stabilization_evidence: String::new(),
        }
    }

    pub fn apply_ownership(&mut self, verdict: OwnershipVerdict) {
        self.is_owner = verdict.is_owner;
        self.owner_detection_method = verdict.method;
        self.owner_detection_confidence = verdict.confidence;
        self.owner_pattern_indicators = verdict.indicators;
    }

    pub fn apply_stabilization(&mut self, assessment: StabilizationAssessment) {
        self.likely_stabilized = assessment.likely_stabilized;
        self.stabilization_confidence = assessment.confidence;
        self.stabilization_evidence = assessment.evidence;
    }

    pub fn status_upper(&self) -> String {
        self.status
            .as_deref()
            .map(|s| s.trim().to_ascii_uppercase())
            .unwrap_or_default()
    }

    pub fn has_status(&self, status: &str) -> bool {
        self.status_upper() == status.trim().to_ascii_uppercase()
    }

    pub fn is_active(&self) -> bool {
        let status = self.status_upper();
        ACTIVE_STATUSES.contains(&status.as_str())
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(&self.building_slug, &self.display_unit)
    }
}

/// Uppercases and strips whitespace, hyphens and underscores: `3-a`, `3_A` and `3 a` all become `3A`.
pub fn normalize_unit(unit: &str) -> String {
    unit.chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .flat_map(char::to_uppercase)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub building_slug: String,
    pub unit: String,
}

impl DedupKey {
    pub fn new(building_slug: &str, unit_label: &str) -> Self {
        Self {
            building_slug: building_slug.to_string(),
            unit: normalize_unit(unit_label),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    ScrapingBuildings,
    CompletedDiscovery,
    ProcessingBuildings,
    RefreshingPrices,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCounter {
    pub current: usize,
    pub total: usize,
    pub phase: RunPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildingStats {
    pub success: usize,
    pub empty: usize,
    pub errors: usize,
    pub total_listings: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunProgress {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pages: Option<PhaseCounter>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub buildings: Option<PhaseCounter>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub listings: Option<PhaseCounter>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stats: Option<BuildingStats>,
}

impl RunProgress {
    pub fn pages(current: usize, total: usize, phase: RunPhase) -> Self {
        Self {
            pages: Some(PhaseCounter { current, total, phase }),
            ..Default::default()
        }
    }

    pub fn buildings(current: usize, total: usize, stats: BuildingStats) -> Self {
        Self {
            buildings: Some(PhaseCounter {
                current,
                total,
                phase: RunPhase::ProcessingBuildings,
            }),
            stats: Some(stats),
            ..Default::default()
        }
    }

    pub fn listings(current: usize, total: usize, phase: RunPhase) -> Self {
        Self {
            listings: Some(PhaseCounter { current, total, phase }),
            ..Default::default()
        }
    }
}

/// Process-wide run status as published to the status file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub status: RunState,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub progress: Option<RunProgress>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl RunStatus {
    pub fn new(status: RunState) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            progress: None,
            message: None,
        }
    }

    pub fn with_progress(mut self, progress: RunProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub timestamp: DateTime<Utc>,
    pub total_listings: usize,
    pub collection_method: String,
    pub area: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_backup: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub listings: Vec<ClassifiedListing>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn building() -> BuildingRecord {
        BuildingRecord {
            slug: "123-main".into(),
            internal_id: Some("987".into()),
            display_address: "123 Main St, New York, NY".into(),
            href: None,
            geo: Some(GeoPoint {
                latitude: 40.7,
                longitude: -73.9,
            }),
            year_built: Some(1931),
        }
    }

    #[test]
    fn unit_normalization_collapses_separators_and_case() {
        let keys: Vec<_> = ["3A", "3a", "3-A", "3_A", " 3 a "]
            .iter()
            .map(|u| DedupKey::new("123-main", u))
            .collect();
        assert!(keys.iter().all(|k| k == &keys[0]));
        assert_eq!(keys[0].unit, "3A");
    }

    #[test]
    fn registry_rejects_repeated_slugs_and_keeps_order() {
        let mut registry = BuildingRegistry::new();
        assert!(registry.insert(BuildingRecord::discovered("b", None, "B")));
        assert!(registry.insert(BuildingRecord::discovered("a", None, "A")));
        assert!(!registry.insert(BuildingRecord::discovered("b", None, "other")));
        assert_eq!(registry.slugs(), &["b".to_string(), "a".to_string()]);
        assert_eq!(registry.get("b").unwrap().display_address, "B");
    }

    #[test]
    fn raw_record_defaults_missing_fields() {
        let raw: RawRentalRecord =
            serde_json::from_str(r#"{"id":"42","legacy":{"id":1776},"status":"RENTED","unit":{"displayName":"4B"}}"#).unwrap();
        assert_eq!(raw.legacy.as_ref().and_then(|l| l.id.as_deref()), Some("1776"));
        let listing = ClassifiedListing::from_raw(&raw, &building(), "west village");
        assert_eq!(listing.price, 0.0);
        assert_eq!(listing.bedroom_count, 0);
        assert_eq!(listing.display_unit, "4B");
        assert!(!listing.is_no_fee);
        assert!(!listing.is_owner);
        assert_eq!(listing.owner_detection_method, DetectionMethod::None);
        assert_eq!(listing.stabilization_confidence, StabilizationConfidence::None);
        assert_eq!(listing.latitude, Some(40.7));
        assert_eq!(listing.building_year_built, Some(1931));
        assert!(!listing.has_owner_agent_info);
    }

    #[test]
    fn classification_fields_are_always_serialized() {
        let listing = ClassifiedListing::from_raw(&RawRentalRecord::default(), &building(), "soho");
        let value = serde_json::to_value(&listing).unwrap();
        assert_eq!(value["is_owner"], false);
        assert_eq!(value["owner_detection_method"], "none");
        assert_eq!(value["stabilization_confidence"], "none");
        assert_eq!(value["likely_stabilized"], false);
        assert_eq!(value["displayUnit"], "N/A");
    }

    #[test]
    fn status_helpers_are_case_insensitive() {
        let raw = RawRentalRecord {
            status: Some("available".into()),
            ..Default::default()
        };
        let listing = ClassifiedListing::from_raw(&raw, &building(), "soho");
        assert!(listing.is_active());
        assert!(listing.has_status("AVAILABLE"));
        assert!(!listing.has_status("DELISTED"));
    }

    #[test]
    fn run_status_serializes_phase_progress() {
        let status = RunStatus::new(RunState::Running)
            .with_progress(RunProgress::pages(2, 9, RunPhase::ScrapingBuildings))
            .with_message("page 2/9");
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "running");
        assert_eq!(value["progress"]["pages"]["phase"], "scraping_buildings");
        assert_eq!(value["progress"]["pages"]["total"], 9);
        assert!(value["progress"].get("buildings").is_none());
    }
}
