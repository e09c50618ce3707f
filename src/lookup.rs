use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::EraPolicy;
use crate::records::{AwardRecord, RankingEntry, VenueRecord};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingPoint {
    pub as_of: NaiveDate,
    pub rank: f64,
}

/// Result of picking a ranking entry for a date.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RankLookup {
    /// Latest entry dated on or before the date.
    AsOf(f64),
    /// Every entry postdates the date; the earliest one was used.
    Earliest(f64),
    NoHistory,
}

impl RankLookup {
    pub fn value(self) -> Option<f64> {
        match self {
            Self::AsOf(v) | Self::Earliest(v) => Some(v),
            Self::NoHistory => None,
        }
    }
}

/// Ranking history per team, sorted by date. Entries sharing a date keep input order
/// and the last of them wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingTable {
    by_team: BTreeMap<String, Vec<RatingPoint>>,
}

impl RatingTable {
    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a RankingEntry>,
    {
        let mut by_team: BTreeMap<String, Vec<RatingPoint>> = BTreeMap::new();
        for e in entries {
            by_team.entry(e.team_id.clone()).or_default().push(RatingPoint {
                as_of: e.as_of,
                rank: e.rank,
            });
        }
        for points in by_team.values_mut() {
            points.sort_by_key(|p| p.as_of);
        }
        Self { by_team }
    }

    pub fn rank_at(&self, team_id: &str, date: NaiveDate) -> RankLookup {
        let Some(points) = self.by_team.get(team_id).filter(|p| !p.is_empty()) else {
            return RankLookup::NoHistory;
        };
        let idx = points.partition_point(|p| p.as_of <= date);
        if idx == 0 {
            RankLookup::Earliest(points[0].rank)
        } else {
            RankLookup::AsOf(points[idx - 1].rank)
        }
    }

    pub fn latest(&self, team_id: &str) -> Option<f64> {
        self.by_team.get(team_id)?.last().map(|p| p.rank)
    }

    pub fn rank_for_era(&self, team_id: &str, year: i32, policy: EraPolicy) -> Option<f64> {
        match policy {
            EraPolicy::Snapshot => {
                let end = NaiveDate::from_ymd_opt(year, 12, 31)?;
                self.rank_at(team_id, end).value()
            }
            EraPolicy::Interpolated => {
                let points = self.by_team.get(team_id).filter(|p| !p.is_empty())?;
                let target = NaiveDate::from_ymd_opt(year, 7, 1)?;
                let idx = points.partition_point(|p| p.as_of <= target);
                if idx == 0 {
                    return Some(points[0].rank);
                }
                if idx == points.len() {
                    return points.last().map(|p| p.rank);
                }
                let prev = points[idx - 1];
                let next = points[idx];
                let span = (next.as_of - prev.as_of).num_days() as f64;
                let offset = (target - prev.as_of).num_days() as f64;
                let t = if span > 0.0 { offset / span } else { 0.0 };
                Some(prev.rank + t * (next.rank - prev.rank))
            }
        }
    }
}

/// Award years per team, sorted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwardTable {
    by_team: BTreeMap<String, Vec<i32>>,
}

impl AwardTable {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a AwardRecord>,
    {
        let mut by_team: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        for r in records {
            by_team.entry(r.team_id.clone()).or_default().push(r.year);
        }
        for years in by_team.values_mut() {
            years.sort_unstable();
        }
        Self { by_team }
    }

    /// Awards won strictly before `year`.
    pub fn count_before(&self, team_id: &str, year: i32) -> u32 {
        self.by_team
            .get(team_id)
            .map(|ys| ys.partition_point(|y| *y < year) as u32)
            .unwrap_or(0)
    }

    pub fn count_through(&self, team_id: &str, year: i32) -> u32 {
        self.by_team
            .get(team_id)
            .map(|ys| ys.partition_point(|y| *y <= year) as u32)
            .unwrap_or(0)
    }

    pub fn total(&self, team_id: &str) -> u32 {
        self.by_team.get(team_id).map(|ys| ys.len() as u32).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VenueTable {
    by_id: BTreeMap<String, VenueRecord>,
}

impl VenueTable {
    /// First record per id wins.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = VenueRecord>,
    {
        let mut by_id = BTreeMap::new();
        for v in records {
            by_id.entry(v.id.clone()).or_insert(v);
        }
        Self { by_id }
    }

    pub fn get(&self, venue_id: &str) -> Option<&VenueRecord> {
        self.by_id.get(venue_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
    }

    fn entry(team: &str, as_of: NaiveDate, rank: f64) -> RankingEntry {
        RankingEntry {
            team_id: team.to_string(),
            as_of,
            rank,
        }
    }

    #[test]
    fn rank_at_prefers_latest_entry_not_after_date() {
        let entries = vec![
            entry("ARG", d(2010, 1, 1), 7.0),
            entry("ARG", d(2006, 1, 1), 9.0),
            entry("ARG", d(2014, 1, 1), 3.0),
        ];
        let table = RatingTable::from_entries(&entries);
        assert_eq!(table.rank_at("ARG", d(2010, 6, 11)), RankLookup::AsOf(7.0));
        assert_eq!(table.rank_at("ARG", d(2010, 1, 1)), RankLookup::AsOf(7.0));
        assert_eq!(table.rank_at("ARG", d(2002, 6, 1)), RankLookup::Earliest(9.0));
        assert_eq!(table.rank_at("GER", d(2010, 6, 11)), RankLookup::NoHistory);
        assert_eq!(table.latest("ARG"), Some(3.0));
    }

    #[test]
    fn era_policies_differ_between_entries() {
        let entries = vec![entry("FRA", d(1998, 1, 1), 20.0), entry("FRA", d(2000, 1, 1), 2.0)];
        let table = RatingTable::from_entries(&entries);

        assert_eq!(table.rank_for_era("FRA", 1998, EraPolicy::Snapshot), Some(20.0));
        let mid = table
            .rank_for_era("FRA", 1998, EraPolicy::Interpolated)
            .expect("interpolated");
        assert!(mid < 20.0 && mid > 2.0);
        assert_eq!(table.rank_for_era("FRA", 2010, EraPolicy::Interpolated), Some(2.0));
        assert_eq!(table.rank_for_era("FRA", 1990, EraPolicy::Interpolated), Some(20.0));
    }

    #[test]
    fn award_counts_respect_year_bounds() {
        let records = vec![
            AwardRecord {
                team_id: "ITA".into(),
                year: 1982,
                award: None,
            },
            AwardRecord {
                team_id: "ITA".into(),
                year: 2006,
                award: None,
            },
        ];
        let table = AwardTable::from_records(&records);
        assert_eq!(table.count_before("ITA", 2006), 1);
        assert_eq!(table.count_through("ITA", 2006), 2);
        assert_eq!(table.total("ITA"), 2);
        assert_eq!(table.total("ESP"), 0);
    }
}
