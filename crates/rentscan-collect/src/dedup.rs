//! One canonical listing per `(building_slug, normalized_unit)`.

use std::collections::HashMap;

use chrono::NaiveDate;
use rentscan_core::{ClassifiedListing, DedupKey, ACTIVE_STATUSES, INACTIVE_STATUSES};

pub fn status_priority(listing: &ClassifiedListing) -> u32 {
    let status = listing.status_upper();
    if ACTIVE_STATUSES.contains(&status.as_str()) {
        1000
    } else if INACTIVE_STATUSES.contains(&status.as_str()) {
        500
    } else {
        100
    }
}

/// `onMarketAt`, else `availableAt`, else `offMarketAt`. `None` sorts below every date,
/// which is also where unparsable dates land.
pub fn relevance_date(listing: &ClassifiedListing) -> Option<NaiveDate> {
    [&listing.on_market_at, &listing.available_at, &listing.off_market_at]
        .into_iter()
        .flatten()
        .find(|s| !s.is_empty())
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

/// Higher priority wins outright; a tie goes to the strictly later relevance date.
pub fn supersedes(candidate: &ClassifiedListing, current: &ClassifiedListing) -> bool {
    let (new_priority, old_priority) = (status_priority(candidate), status_priority(current));
    if new_priority != old_priority {
        return new_priority > old_priority;
    }
    relevance_date(candidate) > relevance_date(current)
}

/// Streaming fold over the accumulated listings. Survivors keep the position of the
/// first listing seen for their key.
pub fn deduplicate(listings: impl IntoIterator<Item = ClassifiedListing>) -> Vec<ClassifiedListing> {
    let mut slots: HashMap<DedupKey, usize> = HashMap::new();
    let mut winners: Vec<ClassifiedListing> = Vec::new();
    for listing in listings {
        match slots.get(&listing.dedup_key()) {
            Some(&slot) => {
                if supersedes(&listing, &winners[slot]) {
                    winners[slot] = listing;
                }
            }
            None => {
                slots.insert(listing.dedup_key(), winners.len());
                winners.push(listing);
            }
        }
    }
    winners
}

#[cfg(test)]
mod tests {
    use super::*;
    use rentscan_core::{BuildingRecord, RawRentalRecord};

    fn listing(slug: &str, unit: &str, status: &str, on: Option<&str>, off: Option<&str>) -> ClassifiedListing {
        let raw = RawRentalRecord {
            id: Some(format!("{slug}/{unit}/{status}")),
            display_unit: Some(unit.into()),
            status: Some(status.into()),
            on_market_at: on.map(str::to_string),
            off_market_at: off.map(str::to_string),
            ..Default::default()
        };
        ClassifiedListing::from_raw(&raw, &BuildingRecord::discovered(slug, None, slug), "soho")
    }

    #[test]
    fn active_record_beats_rented_record() {
        let rented = listing("123-main", "4B", "RENTED", None, Some("2023-01-01"));
        let available = listing("123-main", "4B", "AVAILABLE", Some("2023-06-01"), None);
        let out = deduplicate(vec![rented, available.clone()]);
        assert_eq!(out, vec![available]);
    }

    #[test]
    fn tie_goes_to_later_date_and_bad_dates_lose() {
        let older = listing("a", "1", "RENTED", None, Some("2022-03-01"));
        let newer = listing("a", "1", "OFF_MARKET", None, Some("2023-03-01"));
        let garbage = listing("a", "1", "RENTED", Some("soon"), None);
        assert_eq!(deduplicate(vec![older.clone(), newer.clone(), garbage.clone()]), vec![newer.clone()]);
        assert_eq!(deduplicate(vec![garbage, older.clone()]), vec![older.clone()]);

        let same_day = listing("a", "1", "NO_LONGER_AVAILABLE", None, Some("2022-03-01"));
        assert_eq!(deduplicate(vec![older.clone(), same_day]), vec![older]);
    }

    #[test]
    fn unit_spellings_collapse_and_distinct_buildings_do_not() {
        let out = deduplicate(vec![
            listing("a", "3A", "RENTED", None, Some("2021-01-01")),
            listing("a", "3-a", "RENTED", None, Some("2022-01-01")),
            listing("a", "3_A", "PAUSED", None, Some("2024-01-01")),
            listing("b", "3A", "RENTED", None, None),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].display_unit, "3-a");
        assert_eq!(out[1].building_slug, "b");
    }

    #[test]
    fn survivor_dominates_every_discarded_candidate_and_fold_is_idempotent() {
        let input = vec![
            listing("a", "1", "DELISTED", Some("2024-05-01"), None),
            listing("a", "1", "RENTED", None, Some("2020-01-01")),
            listing("a", "1", "ON_MARKET", Some("2023-02-01"), None),
            listing("a", "1", "available", Some("2023-09-01"), None),
            listing("a", "1", "RENTED", None, Some("2024-01-01")),
            listing("b", "2", "", None, None),
        ];
        let once = deduplicate(input.clone());
        assert_eq!(deduplicate(once.clone()), once);

        let survivor = &once[0];
        assert_eq!(survivor.status.as_deref(), Some("available"));
        for candidate in input.iter().filter(|l| l.dedup_key() == survivor.dedup_key()) {
            let (s, c) = (status_priority(survivor), status_priority(candidate));
            assert!(s >= c);
            if s == c {
                assert!(relevance_date(survivor) >= relevance_date(candidate));
            }
        }
    }
}
