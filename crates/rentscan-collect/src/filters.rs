//! Optional user filters applied to the canonical listing set before the final write.

use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{Datelike, NaiveDate};
use rentscan_core::ClassifiedListing;

/// Statuses whose time on market ends at `offMarketAt` rather than today.
const CLOSED_STATUSES: &[&str] = &[
    "NO_LONGER_AVAILABLE",
    "RENTED",
    "DELISTED",
    "IN_CONTRACT",
    "TEMPORARILY_OFF_MARKET",
    "PAUSED",
];

fn parse_date(value: Option<&str>) -> Option<NaiveDate> {
    value
        .filter(|s| !s.is_empty())
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BedroomFilter {
    #[default]
    All,
    Studio,
    Exactly(u32),
    ThreePlus,
}

impl FromStr for BedroomFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "all" => Ok(Self::All),
            v if v.eq_ignore_ascii_case("studio") => Ok(Self::Studio),
            "3+" => Ok(Self::ThreePlus),
            v => match v.parse() {
                Ok(n) => Ok(Self::Exactly(n)),
                Err(_) => bail!("unknown bedroom filter `{v}` (expected all, Studio, N or 3+)"),
            },
        }
    }
}

/// `all`, `true` or `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Toggle {
    #[default]
    All,
    Yes,
    No,
}

impl Toggle {
    fn admits(self, value: bool) -> bool {
        match self {
            Toggle::All => true,
            Toggle::Yes => value,
            Toggle::No => !value,
        }
    }
}

impl FromStr for Toggle {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(Self::All),
            "true" | "yes" => Ok(Self::Yes),
            "false" | "no" => Ok(Self::No),
            other => bail!("unknown filter value `{other}` (expected all, true or false)"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LaundryFilter {
    #[default]
    All,
    InBuilding,
    /// Accepted but not enforceable: the history payload carries no in-unit flag.
    InUnit,
}

impl FromStr for LaundryFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(Self::All),
            "in building" | "in-building" => Ok(Self::InBuilding),
            "in unit" | "in-unit" => Ok(Self::InUnit),
            other => bail!("unknown laundry filter `{other}`"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DaysOnMarket {
    #[default]
    All,
    UnderWeek,
    WeekToMonth,
    OverMonth,
}

impl DaysOnMarket {
    fn admits(self, days: i64) -> bool {
        match self {
            DaysOnMarket::All => true,
            DaysOnMarket::UnderWeek => days < 7,
            DaysOnMarket::WeekToMonth => (7..=30).contains(&days),
            DaysOnMarket::OverMonth => days > 30,
        }
    }
}

impl FromStr for DaysOnMarket {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "all" => Ok(Self::All),
            "0-7" => Ok(Self::UnderWeek),
            "7-30" => Ok(Self::WeekToMonth),
            "30+" => Ok(Self::OverMonth),
            other => bail!("unknown days-on-market filter `{other}` (expected 0-7, 7-30 or 30+)"),
        }
    }
}

/// Days between listing and either `offMarketAt` (closed statuses) or `today`.
/// `None` when the start date is missing or unparsable.
pub fn days_on_market(listing: &ClassifiedListing, today: NaiveDate) -> Option<i64> {
    let start = listing.on_market_at.as_deref().filter(|s| !s.is_empty()).or(listing.available_at.as_deref());
    let start = parse_date(start)?;
    let status = listing.status_upper();
    let off_raw = listing.off_market_at.as_deref().filter(|s| !s.is_empty());
    let closed = CLOSED_STATUSES.contains(&status.as_str()) || (status.is_empty() && off_raw.is_some());
    if !closed {
        return Some((today - start).num_days().max(0));
    }
    let days = parse_date(off_raw)
        .filter(|end| *end >= start)
        .map(|end| (end - start).num_days())
        .unwrap_or(0);
    Some(days)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingFilter {
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub bedrooms: BedroomFilter,
    pub by_owner: Toggle,
    pub laundry: LaundryFilter,
    pub pets: Toggle,
    pub outdoor: Toggle,
    pub days_on_market: DaysOnMarket,
    pub off_market_month_start: Option<u32>,
    pub off_market_month_end: Option<u32>,
}

impl ListingFilter {
    pub fn is_noop(&self) -> bool {
        self == &Self::default()
    }

    pub fn matches(&self, listing: &ClassifiedListing, today: NaiveDate) -> bool {
        let price = listing.price;
        if self.min_price.is_some_and(|min| price < min) || self.max_price.is_some_and(|max| price > max) {
            return false;
        }

        let bedrooms = listing.bedroom_count;
        let bedrooms_ok = match self.bedrooms {
            BedroomFilter::All => true,
            BedroomFilter::Studio => bedrooms == 0,
            BedroomFilter::Exactly(n) => bedrooms == n,
            BedroomFilter::ThreePlus => bedrooms >= 3,
        };
        if !bedrooms_ok {
            return false;
        }

        if !self.by_owner.admits(listing.is_owner)
            || !self.pets.admits(listing.pet_friendly)
            || !self.outdoor.admits(listing.private_outdoor_space)
        {
            return false;
        }
        if self.laundry == LaundryFilter::InBuilding && !listing.laundry_in_building {
            return false;
        }

        if self.days_on_market != DaysOnMarket::All {
            if let Some(days) = days_on_market(listing, today) {
                if !self.days_on_market.admits(days) {
                    return false;
                }
            }
        }

        if let Some(off) = parse_date(listing.off_market_at.as_deref()) {
            let month = off.month();
            if self.off_market_month_start.is_some_and(|start| month < start)
                || self.off_market_month_end.is_some_and(|end| month > end)
            {
                return false;
            }
        }
        true
    }

    pub fn apply(&self, listings: Vec<ClassifiedListing>, today: NaiveDate) -> Vec<ClassifiedListing> {
        if self.is_noop() {
            return listings;
        }
        listings.into_iter().filter(|l| self.matches(l, today)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rentscan_core::{BuildingRecord, RawRentalRecord};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
    }

    fn listing(raw: RawRentalRecord) -> ClassifiedListing {
        ClassifiedListing::from_raw(&raw, &BuildingRecord::discovered("b", None, "B"), "soho")
    }

    #[test]
    fn filter_values_parse() {
        assert_eq!("Studio".parse::<BedroomFilter>().unwrap(), BedroomFilter::Studio);
        assert_eq!("2".parse::<BedroomFilter>().unwrap(), BedroomFilter::Exactly(2));
        assert_eq!("3+".parse::<BedroomFilter>().unwrap(), BedroomFilter::ThreePlus);
        assert!("lots".parse::<BedroomFilter>().is_err());
        assert_eq!("In Building".parse::<LaundryFilter>().unwrap(), LaundryFilter::InBuilding);
        assert_eq!("false".parse::<Toggle>().unwrap(), Toggle::No);
        assert_eq!("7-30".parse::<DaysOnMarket>().unwrap(), DaysOnMarket::WeekToMonth);
    }

    #[test]
    fn days_on_market_ends_at_off_market_for_closed_listings() {
        let rented = listing(RawRentalRecord {
            status: Some("RENTED".into()),
            available_at: Some("2024-01-01".into()),
            off_market_at: Some("2024-01-21".into()),
            ..Default::default()
        });
        assert_eq!(days_on_market(&rented, today()), Some(20));

        let inverted = listing(RawRentalRecord {
            status: Some("RENTED".into()),
            on_market_at: Some("2024-02-01".into()),
            off_market_at: Some("2024-01-01".into()),
            ..Default::default()
        });
        assert_eq!(days_on_market(&inverted, today()), Some(0));

        let open = listing(RawRentalRecord {
            status: Some("AVAILABLE".into()),
            on_market_at: Some("2024-06-25".into()),
            ..Default::default()
        });
        assert_eq!(days_on_market(&open, today()), Some(5));

        let undated = listing(RawRentalRecord::default());
        assert_eq!(days_on_market(&undated, today()), None);
    }

    #[test]
    fn combined_filters() {
        let filter = ListingFilter {
            min_price: Some(2000.0),
            max_price: Some(4000.0),
            bedrooms: BedroomFilter::Exactly(1),
            days_on_market: DaysOnMarket::UnderWeek,
            off_market_month_start: Some(3),
            off_market_month_end: Some(8),
            ..Default::default()
        };
        let base = RawRentalRecord {
            price: Some(3000.0),
            bedroom_count: Some(1),
            status: Some("AVAILABLE".into()),
            on_market_at: Some("2024-06-27".into()),
            ..Default::default()
        };
        assert!(filter.matches(&listing(base.clone()), today()));
        assert!(!filter.matches(&listing(RawRentalRecord { price: Some(4500.0), ..base.clone() }), today()));
        assert!(!filter.matches(&listing(RawRentalRecord { bedroom_count: Some(2), ..base.clone() }), today()));
        assert!(!filter.matches(
            &listing(RawRentalRecord { on_market_at: Some("2024-05-01".into()), ..base.clone() }),
            today()
        ));
        assert!(filter.matches(
            &listing(RawRentalRecord { on_market_at: Some("whenever".into()), ..base.clone() }),
            today()
        ));
        assert!(!filter.matches(
            &listing(RawRentalRecord {
                status: Some("RENTED".into()),
                on_market_at: Some("2024-10-01".into()),
                off_market_at: Some("2024-10-03".into()),
                ..base.clone()
            }),
            today()
        ));
    }

    #[test]
    fn toggles_and_laundry() {
        let filter = ListingFilter {
            by_owner: Toggle::Yes,
            laundry: LaundryFilter::InBuilding,
            pets: Toggle::No,
            ..Default::default()
        };
        let mut candidate = listing(RawRentalRecord {
            laundry_in_building: Some(true),
            ..Default::default()
        });
        assert!(!filter.matches(&candidate, today()));
        candidate.is_owner = true;
        assert!(filter.matches(&candidate, today()));
        candidate.pet_friendly = true;
        assert!(!filter.matches(&candidate, today()));

        let everything = vec![candidate.clone(), listing(RawRentalRecord::default())];
        assert_eq!(ListingFilter::default().apply(everything, today()).len(), 2);
    }
}
