//! Joins the raw source tables into one canonical row per historical match.
//!
//! Fusion is pure and deterministic: rows and warnings come out in input iteration
//! order (reference tables first, then matches). Row-level problems never abort the
//! run; they either drop the row or attach a warning to it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::FeatureConfig;
use crate::lookup::{AwardTable, RankLookup, RatingTable, VenueTable};
use crate::records::{
    AwardRecord, OutcomeLabel, RankingEntry, RawMatch, RawRanking, RawTeam, RawVenue,
    RecordIssue, SourceTables, TeamRecord, VenueRecord, normalize_key, parse_date,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RankValue {
    Ranked(f64),
    /// The team has no ranking history at all.
    Unranked,
}

impl RankValue {
    pub fn value_or(self, neutral: f64) -> f64 {
        match self {
            Self::Ranked(v) => v,
            Self::Unranked => neutral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureSource {
    Weather,
    Venue,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMatchRow {
    /// Position of the match in the source sequence.
    pub source_index: usize,
    pub match_id: Option<String>,
    pub edition: String,
    pub date: NaiveDate,
    pub home: TeamRecord,
    pub away: TeamRecord,
    pub venue_id: Option<String>,
    pub city: Option<String>,
    pub temperature_c: f64,
    pub temperature_source: TemperatureSource,
    pub home_rank: RankValue,
    pub away_rank: RankValue,
    pub home_awards: u32,
    pub away_awards: u32,
    pub stage: Option<String>,
    pub score: Option<(i32, i32)>,
    pub outcome: OutcomeLabel,
}

impl CanonicalMatchRow {
    /// Rank positions are "lower is better", so a positive value favours the home side.
    pub fn ranking_diff(&self, neutral_rank: f64) -> f64 {
        self.away_rank.value_or(neutral_rank) - self.home_rank.value_or(neutral_rank)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Team,
    Venue,
    Ranking,
    Weather,
    Award,
    Match,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FusionWarningKind {
    InvalidRecord { field: String, problem: String },
    DuplicateTeam { team_id: String },
    DuplicateMatch { first_index: usize },
    UnknownVenue { venue_id: String },
    NoRankingHistory { team_id: String },
    RankingAfterMatch { team_id: String },
    LabelScoreMismatch { label: OutcomeLabel, home: i32, away: i32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionWarning {
    pub source: SourceKind,
    pub index: usize,
    #[serde(flatten)]
    pub kind: FusionWarningKind,
}

impl fmt::Display for FusionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} #{}: ", self.source, self.index)?;
        match &self.kind {
            FusionWarningKind::InvalidRecord { field, problem } => {
                write!(f, "skipped, {field} {problem}")
            }
            FusionWarningKind::DuplicateTeam { team_id } => {
                write!(f, "duplicate team id {team_id}, keeping the first")
            }
            FusionWarningKind::DuplicateMatch { first_index } => {
                write!(f, "duplicate of match #{first_index}, keeping the first")
            }
            FusionWarningKind::UnknownVenue { venue_id } => {
                write!(f, "venue {venue_id} not found, default temperature used")
            }
            FusionWarningKind::NoRankingHistory { team_id } => {
                write!(f, "team {team_id} has no ranking history, neutral rank used")
            }
            FusionWarningKind::RankingAfterMatch { team_id } => {
                write!(f, "team {team_id} only ranked after this match, earliest entry used")
            }
            FusionWarningKind::LabelScoreMismatch { label, home, away } => {
                write!(f, "label {label} disagrees with score {home}-{away}, label kept")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    MissingField { field: String },
    InvalidField { field: String, problem: String },
    InvalidOutcome { raw: String },
    UnknownTeam { team_id: String },
    SameTeam { team_id: String },
    GenderMismatch,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing required field {field}"),
            Self::InvalidField { field, problem } => write!(f, "invalid {field}: {problem}"),
            Self::InvalidOutcome { raw } => write!(f, "unrecognised outcome label `{raw}`"),
            Self::UnknownTeam { team_id } => write!(f, "team {team_id} not in team table"),
            Self::SameTeam { team_id } => write!(f, "team {team_id} listed on both sides"),
            Self::GenderMismatch => write!(f, "teams belong to different gender categories"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedRow {
    pub index: usize,
    pub match_id: Option<String>,
    pub reason: DropReason,
}

/// Fused rows plus the cleaned reference tables the feature builder needs later.
#[derive(Debug, Clone, Default)]
pub struct FusionOutput {
    pub rows: Vec<CanonicalMatchRow>,
    pub warnings: Vec<FusionWarning>,
    pub dropped: Vec<DroppedRow>,
    pub teams: BTreeMap<String, TeamRecord>,
    pub ratings: RatingTable,
    pub awards: AwardTable,
    pub venues: VenueTable,
}

/// Fusion over the four core tables with default settings.
pub fn fuse(
    matches: &[RawMatch],
    teams: &[RawTeam],
    venues: &[RawVenue],
    rankings: &[RawRanking],
) -> FusionOutput {
    let tables = SourceTables {
        teams: teams.to_vec(),
        matches: matches.to_vec(),
        venues: venues.to_vec(),
        rankings: rankings.to_vec(),
        weather: Vec::new(),
        awards: Vec::new(),
    };
    fuse_sources(&tables, &FeatureConfig::default())
}

pub fn fuse_sources(sources: &SourceTables, cfg: &FeatureConfig) -> FusionOutput {
    let mut warnings = Vec::new();

    let mut teams: BTreeMap<String, TeamRecord> = BTreeMap::new();
    for (idx, raw) in sources.teams.iter().enumerate() {
        match raw.validate() {
            Ok(team) => {
                if teams.contains_key(&team.id) {
                    warnings.push(FusionWarning {
                        source: SourceKind::Team,
                        index: idx,
                        kind: FusionWarningKind::DuplicateTeam { team_id: team.id },
                    });
                } else {
                    teams.insert(team.id.clone(), team);
                }
            }
            Err(issue) => warnings.push(invalid(SourceKind::Team, idx, issue)),
        }
    }

    let venue_records: Vec<VenueRecord> =
        collect_valid(&sources.venues, SourceKind::Venue, &mut warnings, RawVenue::validate);
    let venues = VenueTable::from_records(venue_records);

    let ranking_entries: Vec<RankingEntry> = collect_valid(
        &sources.rankings,
        SourceKind::Ranking,
        &mut warnings,
        RawRanking::validate,
    );
    let ratings = RatingTable::from_entries(&ranking_entries);

    let mut weather: HashMap<(String, i32), f64> = HashMap::new();
    for (idx, raw) in sources.weather.iter().enumerate() {
        match raw.validate() {
            Ok(w) => {
                weather.entry((normalize_key(&w.city), w.year)).or_insert(w.avg_temp_c);
            }
            Err(issue) => warnings.push(invalid(SourceKind::Weather, idx, issue)),
        }
    }

    let award_records: Vec<AwardRecord> =
        collect_valid(&sources.awards, SourceKind::Award, &mut warnings, |raw| {
            raw.validate()
        });
    let awards = AwardTable::from_records(&award_records);

    let mut rows = Vec::with_capacity(sources.matches.len());
    let mut dropped = Vec::new();
    let mut seen: HashMap<(String, NaiveDate, String, String), usize> = HashMap::new();

    for (idx, raw) in sources.matches.iter().enumerate() {
        let validated = match validate_match(raw, &teams) {
            Ok(v) => v,
            Err(reason) => {
                warn!(index = idx, match_id = ?raw.match_id, %reason, "dropping match row");
                dropped.push(DroppedRow {
                    index: idx,
                    match_id: raw.match_id.clone(),
                    reason,
                });
                continue;
            }
        };

        let (low, high) = ordered_pair(&validated.home.id, &validated.away.id);
        let key = (validated.edition.clone(), validated.date, low, high);
        if let Some(first_index) = seen.get(&key) {
            warnings.push(FusionWarning {
                source: SourceKind::Match,
                index: idx,
                kind: FusionWarningKind::DuplicateMatch {
                    first_index: *first_index,
                },
            });
            continue;
        }
        seen.insert(key, idx);

        let venue_id = raw
            .venue_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let venue = venue_id.as_deref().and_then(|id| venues.get(id));
        if let (Some(id), None) = (venue_id.as_deref(), venue) {
            warnings.push(FusionWarning {
                source: SourceKind::Match,
                index: idx,
                kind: FusionWarningKind::UnknownVenue {
                    venue_id: id.to_string(),
                },
            });
        }
        let city = venue.and_then(|v| v.city.clone());
        let year = validated.date.year();
        let reading = city
            .as_deref()
            .and_then(|c| weather.get(&(normalize_key(c), year)).copied());
        let (temperature_c, temperature_source) =
            match (reading, venue.and_then(|v| v.avg_temp_c)) {
                (Some(t), _) => (t, TemperatureSource::Weather),
                (None, Some(t)) => (t, TemperatureSource::Venue),
                (None, None) => (cfg.default_temperature_c, TemperatureSource::Default),
            };

        let home_rank = resolve_rank(&ratings, &validated.home.id, validated.date, idx, &mut warnings);
        let away_rank = resolve_rank(&ratings, &validated.away.id, validated.date, idx, &mut warnings);

        let score = raw.home_score.zip(raw.away_score);
        if let Some((h, a)) = score
            && OutcomeLabel::from_score(h, a) != validated.outcome
        {
            warnings.push(FusionWarning {
                source: SourceKind::Match,
                index: idx,
                kind: FusionWarningKind::LabelScoreMismatch {
                    label: validated.outcome,
                    home: h,
                    away: a,
                },
            });
        }

        rows.push(CanonicalMatchRow {
            source_index: idx,
            match_id: raw.match_id.clone(),
            home_awards: awards.count_before(&validated.home.id, year),
            away_awards: awards.count_before(&validated.away.id, year),
            edition: validated.edition,
            date: validated.date,
            home: validated.home,
            away: validated.away,
            venue_id,
            city,
            temperature_c,
            temperature_source,
            home_rank,
            away_rank,
            stage: raw
                .stage
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            score,
            outcome: validated.outcome,
        });
    }

    for w in warnings.iter().filter(|w| w.source == SourceKind::Match) {
        debug!(warning = %w, "fusion warning");
    }
    if !warnings.is_empty() || !dropped.is_empty() {
        warn!(
            rows = rows.len(),
            warnings = warnings.len(),
            dropped = dropped.len(),
            "fusion finished with degraded input"
        );
    }

    FusionOutput {
        rows,
        warnings,
        dropped,
        teams,
        ratings,
        awards,
        venues,
    }
}

struct ValidatedMatch {
    edition: String,
    date: NaiveDate,
    home: TeamRecord,
    away: TeamRecord,
    outcome: OutcomeLabel,
}

fn validate_match(
    raw: &RawMatch,
    teams: &BTreeMap<String, TeamRecord>,
) -> Result<ValidatedMatch, DropReason> {
    let outcome_raw = required(&raw.outcome, "outcome")?;
    let outcome = OutcomeLabel::parse(&outcome_raw)
        .ok_or(DropReason::InvalidOutcome { raw: outcome_raw })?;

    let edition = required(&raw.edition, "edition")?;
    let date_raw = required(&raw.date, "date")?;
    let date = parse_date(&date_raw).ok_or_else(|| DropReason::InvalidField {
        field: "date".to_string(),
        problem: format!("unparseable `{date_raw}`"),
    })?;

    let home_id = required(&raw.home_team_id, "home_team_id")?;
    let away_id = required(&raw.away_team_id, "away_team_id")?;
    if home_id == away_id {
        return Err(DropReason::SameTeam { team_id: home_id });
    }
    let home = teams
        .get(&home_id)
        .cloned()
        .ok_or(DropReason::UnknownTeam { team_id: home_id })?;
    let away = teams
        .get(&away_id)
        .cloned()
        .ok_or(DropReason::UnknownTeam { team_id: away_id })?;
    if let (Some(a), Some(b)) = (home.gender, away.gender)
        && a != b
    {
        return Err(DropReason::GenderMismatch);
    }

    Ok(ValidatedMatch {
        edition,
        date,
        home,
        away,
        outcome,
    })
}

fn resolve_rank(
    ratings: &RatingTable,
    team_id: &str,
    date: NaiveDate,
    idx: usize,
    warnings: &mut Vec<FusionWarning>,
) -> RankValue {
    match ratings.rank_at(team_id, date) {
        RankLookup::AsOf(v) => RankValue::Ranked(v),
        RankLookup::Earliest(v) => {
            warnings.push(FusionWarning {
                source: SourceKind::Match,
                index: idx,
                kind: FusionWarningKind::RankingAfterMatch {
                    team_id: team_id.to_string(),
                },
            });
            RankValue::Ranked(v)
        }
        RankLookup::NoHistory => {
            warnings.push(FusionWarning {
                source: SourceKind::Match,
                index: idx,
                kind: FusionWarningKind::NoRankingHistory {
                    team_id: team_id.to_string(),
                },
            });
            RankValue::Unranked
        }
    }
}

fn collect_valid<R, T, F>(
    raws: &[R],
    source: SourceKind,
    warnings: &mut Vec<FusionWarning>,
    validate: F,
) -> Vec<T>
where
    F: Fn(&R) -> Result<T, RecordIssue>,
{
    let mut out = Vec::with_capacity(raws.len());
    for (idx, raw) in raws.iter().enumerate() {
        match validate(raw) {
            Ok(v) => out.push(v),
            Err(issue) => warnings.push(invalid(source, idx, issue)),
        }
    }
    out
}

fn invalid(source: SourceKind, index: usize, issue: RecordIssue) -> FusionWarning {
    FusionWarning {
        source,
        index,
        kind: FusionWarningKind::InvalidRecord {
            field: issue.field.to_string(),
            problem: issue.problem,
        },
    }
}

fn required(value: &Option<String>, field: &str) -> Result<String, DropReason> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DropReason::MissingField {
            field: field.to_string(),
        })
}

fn ordered_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Distinct team ids that appear in fused rows, in first-seen order.
pub fn participating_teams(rows: &[CanonicalMatchRow]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        for id in [&row.home.id, &row.away.id] {
            if seen.insert(id.clone()) {
                out.push(id.clone());
            }
        }
    }
    out
}
