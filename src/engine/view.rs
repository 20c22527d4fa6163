use chrono::NaiveTime;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use super::consolidate::ConsolidatedMatch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionGroup {
    pub region_id: String,
    pub region_name: String,
    pub matches: Vec<ConsolidatedMatch>,
}

/// Matches grouped by region, regions in the order they were first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupedView {
    pub regions: Vec<RegionGroup>,
}

impl GroupedView {
    pub fn match_count(&self) -> usize {
        self.regions.iter().map(|g| g.matches.len()).sum()
    }

    pub fn region(&self, region_id: &str) -> Option<&RegionGroup> {
        self.regions.iter().find(|g| g.region_id == region_id)
    }
}

/// Group `matches` by region and order each group by status, then throw-in
/// time, then fixture id. Region order is the order of first appearance,
/// which for an aggregation is the repository's enumeration order.
pub fn organize(matches: &[ConsolidatedMatch]) -> GroupedView {
    let mut groups: Vec<RegionGroup> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for m in matches {
        let slot = *index.entry(m.region_id.as_str()).or_insert_with(|| {
            groups.push(RegionGroup {
                region_id: m.region_id.clone(),
                region_name: m.region_name.clone(),
                matches: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].matches.push(m.clone());
    }

    for group in &mut groups {
        group.matches.sort_by(compare_matches);
    }
    GroupedView { regions: groups }
}

/// Order a fixture list by calendar date, then throw-in time, then fixture id.
pub fn sort_by_date(matches: &mut [ConsolidatedMatch]) {
    matches.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| compare_times(&a.time, &b.time))
            .then_with(|| a.fixture_id.cmp(&b.fixture_id))
    });
}

fn compare_matches(a: &ConsolidatedMatch, b: &ConsolidatedMatch) -> Ordering {
    a.status
        .rank()
        .cmp(&b.status.rank())
        .then_with(|| compare_times(&a.time, &b.time))
        .then_with(|| a.fixture_id.cmp(&b.fixture_id))
}

/// Valid times ascending; anything that is not a clock time ("TBA", "FT")
/// after all of them.
fn compare_times(a: &str, b: &str) -> Ordering {
    match (normalize_time(a), normalize_time(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// "7:30", "19:30", "19.30" and "19:30:00" all normalise to "HH:MM".
pub fn normalize_time(raw: &str) -> Option<String> {
    let raw = raw.trim().replace('.', ":");
    ["%H:%M", "%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(&raw, fmt).ok())
        .map(|t| t.format("%H:%M").to_string())
}
