//! Listing-site knowledge: directory page parsing, challenge detection, the GraphQL
//! query catalog with payload decoding, and the session seam used by discovery.

use std::time::Duration;

use async_trait::async_trait;
use rentscan_core::{AgentContact, GeoPoint, PriceHistoryEntry, RawRentalRecord};
use rentscan_storage::{FetchError, GraphqlRequest, HttpClient, QueryPolicy};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "rentscan-adapters";

/// Text the anti-bot interstitial renders in place of the requested page.
pub const CHALLENGE_MARKER: &str = "Press & Hold to confirm";

const PAGINATION_SELECTORS: &[&str] = &[
    ".pagination li:nth-last-child(2) a",
    ".pagination .page-numbers:not(.next):not(.prev):last-of-type",
    ".pagination a[href*='page=']:last-of-type",
];
const CARD_SELECTOR: &str =
    ".item.building, [class*='building-card'], [class*='property-card'], [class*='BuildingCard']";
const BUILDING_LINK_SELECTOR: &str = "a[href*='/building/']";
const ADDRESS_SELECTORS: &[&str] = &["h3", ".address", ".title", "[class*='address']", "[class*='Address']"];
const NAV_INDICATORS: &[&str] = &["nav", "menu", "header", "listitem", "list_list"];
const BUILDING_INDICATORS: &[&str] = &["item", "building", "property", "card", "photo", "details"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("session request for {url} failed: {message}")]
    Session { url: String, message: String },
    #[error("could not decode {what}: {message}")]
    Decode { what: &'static str, message: String },
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn collapse_whitespace<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn element_text(element: &ElementRef<'_>) -> String {
    collapse_whitespace(element.text())
}

fn class_of(element: Option<ElementRef<'_>>) -> String {
    element
        .and_then(|e| e.value().attr("class"))
        .unwrap_or_default()
        .to_lowercase()
}

fn parent_element<'a>(element: &ElementRef<'a>) -> Option<ElementRef<'a>> {
    element.parent().and_then(ElementRef::wrap)
}

/// `Upper East Side` -> `upper-east-side`, `Fort Greene & Clinton Hill` -> `fort-greene-and-clinton-hill`.
pub fn area_slug(area: &str) -> String {
    area.trim()
        .to_lowercase()
        .replace(' ', "-")
        .replace('&', "and")
}

pub fn directory_url(site_url: &str, area_slug: &str, page: usize) -> String {
    let base = format!("{}/buildings/{area_slug}", site_url.trim_end_matches('/'));
    if page > 1 {
        format!("{base}?page={page}")
    } else {
        base
    }
}

pub fn detect_challenge(html: &str) -> bool {
    html.contains(CHALLENGE_MARKER)
}

fn page_param(href: &str) -> Option<usize> {
    let (_, rest) = href.split_once("page=")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Last directory page number from the pagination markup; `1` when no strategy matches.
pub fn parse_total_pages(html: &str) -> Result<usize, AdapterError> {
    let document = Html::parse_document(html);
    for css in PAGINATION_SELECTORS {
        let sel = selector(css)?;
        let Some(last) = document.select(&sel).last() else {
            continue;
        };
        let text = element_text(&last);
        if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(total) = text.parse::<usize>() {
                return Ok(total.max(1));
            }
        }
        if let Some(total) = last.value().attr("href").and_then(page_param) {
            return Ok(total.max(1));
        }
    }
    Ok(1)
}

/// One building link found on a directory page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildingLink {
    pub slug: String,
    pub href: String,
    pub address: String,
}

/// Path segment after `/building/`, with any query or fragment removed.
pub fn slug_from_href(href: &str) -> Option<String> {
    let (_, rest) = href.split_once("/building/")?;
    let slug = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .trim();
    (!slug.is_empty()).then(|| slug.to_string())
}

fn link_address(link: &ElementRef<'_>, slug: &str) -> Result<String, AdapterError> {
    let text = element_text(link);
    if text.chars().count() > 3 {
        return Ok(text);
    }
    if let Some(parent) = parent_element(link) {
        for css in ADDRESS_SELECTORS {
            let sel = selector(css)?;
            if let Some(found) = parent.select(&sel).next() {
                let text = element_text(&found);
                if text.chars().count() > 3 {
                    return Ok(text);
                }
            }
        }
    }
    Ok(format!("Building {slug}"))
}

/// Keeps a link unless its parent or grandparent class looks like site navigation
/// without also looking like building content.
fn passes_context_filter(link: &ElementRef<'_>) -> bool {
    let Some(parent) = parent_element(link) else {
        return true;
    };
    let parent_class = class_of(Some(parent));
    let grandparent_class = class_of(parent_element(&parent));
    let mentions = |indicators: &[&str]| {
        indicators
            .iter()
            .any(|i| parent_class.contains(i) || grandparent_class.contains(i))
    };
    !mentions(NAV_INDICATORS) || mentions(BUILDING_INDICATORS)
}

/// Candidate building links on one directory page, in document order. Links inside
/// building cards are preferred; without cards every building link is screened by its
/// ancestor context. Repeated slugs are left for the registry to drop.
pub fn extract_building_links(html: &str) -> Result<Vec<BuildingLink>, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = selector(CARD_SELECTOR)?;
    let link_sel = selector(BUILDING_LINK_SELECTOR)?;

    let mut links: Vec<ElementRef<'_>> = document
        .select(&card_sel)
        .flat_map(|card| card.select(&link_sel))
        .collect();
    if links.is_empty() {
        links = document
            .select(&link_sel)
            .filter(passes_context_filter)
            .collect();
        debug!(count = links.len(), "no building cards; used context filter");
    }

    let mut out = Vec::with_capacity(links.len());
    for link in links {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Some(slug) = slug_from_href(href) else {
            continue;
        };
        let address = link_address(&link, &slug)?;
        out.push(BuildingLink {
            slug,
            href: href.to_string(),
            address,
        });
    }
    Ok(out)
}

/// Authenticated browsing context for directory pages.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn load_page(&self, url: &str) -> Result<String, AdapterError>;

    /// Re-requests a page after a challenge was solved.
    async fn reload_page(&self, url: &str) -> Result<String, AdapterError> {
        self.load_page(url).await
    }
}

#[async_trait]
impl SessionProvider for HttpClient {
    async fn load_page(&self, url: &str) -> Result<String, AdapterError> {
        self.get_text(url)
            .await
            .map_err(|e: FetchError| AdapterError::Session {
                url: url.to_string(),
                message: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Resolved,
    Abandoned,
}

/// Human-assisted recovery from an anti-bot challenge.
#[async_trait]
pub trait ChallengeResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> ChallengeOutcome;
}

/// One GraphQL query shape with its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryDescriptor {
    pub name: &'static str,
    pub document: &'static str,
    pub root_field: &'static str,
    pub variable: &'static str,
    pub attempts: usize,
    pub timeout: Duration,
}

impl QueryDescriptor {
    pub fn policy(&self) -> QueryPolicy {
        QueryPolicy::new(self.attempts, self.timeout)
    }

    pub fn request(&self, value: &str) -> GraphqlRequest {
        let mut variables = serde_json::Map::new();
        variables.insert(self.variable.to_string(), json!(value));
        GraphqlRequest {
            query: self.document.to_string(),
            variables: JsonValue::Object(variables),
        }
    }
}

pub const BUILDING_BY_SLUG: QueryDescriptor = QueryDescriptor {
    name: "building_by_slug",
    document: "query GetBuilding($slug: String!) {
  buildingBySlug(slug: $slug) {
    id
    name
    geoCenter { latitude longitude }
    address { street city state zipCode }
  }
}",
    root_field: "buildingBySlug",
    variable: "slug",
    attempts: 1,
    timeout: Duration::from_secs(5),
};

pub const HISTORY_REDUCED: QueryDescriptor = QueryDescriptor {
    name: "history_reduced",
    document: "query GetRentalsHistoryByBuildingId($buildingId: ID!) {
  rentalsHistoryByBuildingId(id: $buildingId) {
    id
    legacy { id }
    street
    displayUnit
    buildingId
    availableAt
    offMarketAt
    bedroomCount
    fullBathroomCount
    halfBathroomCount
    livingAreaSize
    price
    urlPath
    status
    slug
    areaName
  }
}",
    root_field: "rentalsHistoryByBuildingId",
    variable: "buildingId",
    attempts: 2,
    timeout: Duration::from_secs(15),
};

pub const HISTORY_FULL: QueryDescriptor = QueryDescriptor {
    name: "history_full",
    document: "query GetRentalsHistoryByBuildingId($buildingId: ID!) {
  rentalsHistoryByBuildingId(id: $buildingId) {
    id
    legacy { id }
    street
    displayUnit
    buildingId
    availableAt
    offMarketAt
    bedroomCount
    fullBathroomCount
    halfBathroomCount
    livingAreaSize
    noFee
    price
    interestingPriceDelta
    netEffectiveRent
    leaseTermMonths
    monthsFree
    mediaAssetCount
    status
    furnished
    slug
    areaName
    urlPath
  }
}",
    root_field: "rentalsHistoryByBuildingId",
    variable: "buildingId",
    attempts: 2,
    timeout: Duration::from_secs(15),
};

/// History shapes in the order they are tried.
pub const HISTORY_FALLBACK_CHAIN: &[QueryDescriptor] = &[HISTORY_REDUCED, HISTORY_FULL];

pub const AGENTS_FOR_RENTAL: QueryDescriptor = QueryDescriptor {
    name: "agents_for_rental",
    document: "query GetAgentsForRental($id: ID!) {
  getAgentsForRentalExpress(id: $id) {
    id
    name
    email
  }
}",
    root_field: "getAgentsForRentalExpress",
    variable: "id",
    attempts: 1,
    timeout: Duration::from_secs(10),
};

pub const LISTING_PRICE: QueryDescriptor = QueryDescriptor {
    name: "listing_price",
    document: "query GetListingPrice($id: ID!) {
  listing(id: $id) {
    id
    price
    lastPrice
    priceHistory { price timestamp }
  }
}",
    root_field: "listing",
    variable: "id",
    attempts: 1,
    timeout: Duration::from_secs(10),
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GeoPayload {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AddressPayload {
    street: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BuildingPayload {
    id: Option<JsonValue>,
    name: Option<String>,
    geo_center: Option<GeoPayload>,
    address: Option<AddressPayload>,
}

/// Building identity returned by the slug lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBuilding {
    pub internal_id: String,
    pub display_address: String,
    pub geo: Option<GeoPoint>,
}

/// `123-main-st` -> `123 Main St`.
pub fn humanize_slug(slug: &str) -> String {
    slug.split(['-', ' '])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn id_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn root<'a>(data: &'a JsonValue, descriptor: &QueryDescriptor) -> &'a JsonValue {
    data.get(descriptor.root_field).unwrap_or(&JsonValue::Null)
}

/// `Ok(None)` when the site knows no building for the slug.
pub fn decode_building(data: &JsonValue, slug: &str) -> Result<Option<ResolvedBuilding>, AdapterError> {
    let node = root(data, &BUILDING_BY_SLUG);
    if node.is_null() {
        return Ok(None);
    }
    let payload: BuildingPayload =
        serde_json::from_value(node.clone()).map_err(|e| AdapterError::Decode {
            what: "buildingBySlug",
            message: e.to_string(),
        })?;
    let Some(internal_id) = payload.id.as_ref().and_then(id_text) else {
        return Ok(None);
    };

    let parts: Vec<String> = payload
        .address
        .map(|a| {
            [a.street, a.city, a.state, a.zip_code]
                .into_iter()
                .filter_map(non_empty)
                .collect()
        })
        .unwrap_or_default();
    let display_address = if parts.is_empty() {
        non_empty(payload.name).unwrap_or_else(|| humanize_slug(slug))
    } else {
        parts.join(", ")
    };
    let geo = payload.geo_center.and_then(|g| match (g.latitude, g.longitude) {
        (Some(latitude), Some(longitude)) => Some(GeoPoint { latitude, longitude }),
        _ => None,
    });

    Ok(Some(ResolvedBuilding {
        internal_id,
        display_address,
        geo,
    }))
}

/// Decoded history list. Records that fail to decode are counted, not fatal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryBatch {
    pub records: Vec<RawRentalRecord>,
    pub skipped: usize,
}

/// A `null` history is a valid empty result.
pub fn decode_history(data: &JsonValue, descriptor: &QueryDescriptor) -> Result<HistoryBatch, AdapterError> {
    let node = root(data, descriptor);
    let items = match node {
        JsonValue::Null => return Ok(HistoryBatch::default()),
        JsonValue::Array(items) => items,
        other => {
            return Err(AdapterError::Decode {
                what: "rental history",
                message: format!("expected a list, got {other}"),
            })
        }
    };
    let mut batch = HistoryBatch::default();
    for item in items {
        match serde_json::from_value::<RawRentalRecord>(item.clone()) {
            Ok(record) => batch.records.push(record),
            Err(err) => {
                debug!(error = %err, "skipping undecodable rental record");
                batch.skipped += 1;
            }
        }
    }
    Ok(batch)
}

/// Agents attached to one rental; `null` reads as no agents.
pub fn decode_agents(data: &JsonValue) -> Result<Vec<AgentContact>, AdapterError> {
    let node = root(data, &AGENTS_FOR_RENTAL);
    if node.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(node.clone()).map_err(|e| AdapterError::Decode {
        what: "getAgentsForRentalExpress",
        message: e.to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PriceUpdate {
    pub price: Option<f64>,
    pub last_price: Option<f64>,
    pub price_history: Option<Vec<PriceHistoryEntry>>,
}

pub fn decode_price(data: &JsonValue) -> Result<Option<PriceUpdate>, AdapterError> {
    let node = root(data, &LISTING_PRICE);
    if node.is_null() {
        return Ok(None);
    }
    serde_json::from_value(node.clone())
        .map(Some)
        .map_err(|e| AdapterError::Decode {
            what: "listing",
            message: e.to_string(),
        })
}
