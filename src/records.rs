//! Source record shapes.
//!
//! `Raw*` types mirror whatever the source loader hands over: every field is optional
//! and several column spellings are accepted. Fusion validates them into the typed
//! reference records below and rejects or warns on anything missing.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Men,
    Women,
}

impl Gender {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "m" | "men" | "male" | "mens" | "men's" => Some(Self::Men),
            "w" | "f" | "women" | "female" | "womens" | "women's" => Some(Self::Women),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Confederation {
    AFC,
    CAF,
    CONCACAF,
    CONMEBOL,
    UEFA,
    OFC,
}

impl Confederation {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "AFC" => Some(Self::AFC),
            "CAF" => Some(Self::CAF),
            "CONCACAF" => Some(Self::CONCACAF),
            "CONMEBOL" => Some(Self::CONMEBOL),
            "UEFA" => Some(Self::UEFA),
            "OFC" => Some(Self::OFC),
            _ => None,
        }
    }
}

/// Outcome from the point of view of the home side (team A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeLabel {
    HomeWin,
    Draw,
    AwayWin,
}

impl OutcomeLabel {
    pub const ALL: [OutcomeLabel; 3] = [Self::HomeWin, Self::Draw, Self::AwayWin];

    pub fn parse(raw: &str) -> Option<Self> {
        let norm = raw.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        match norm.as_str() {
            "home win" | "home team win" | "h" | "win" | "1" => Some(Self::HomeWin),
            "away win" | "away team win" | "a" | "loss" | "2" => Some(Self::AwayWin),
            "draw" | "d" | "tie" | "x" => Some(Self::Draw),
            _ => None,
        }
    }

    pub fn from_score(home: i32, away: i32) -> Self {
        if home > away {
            Self::HomeWin
        } else if home < away {
            Self::AwayWin
        } else {
            Self::Draw
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::HomeWin => 0,
            Self::Draw => 1,
            Self::AwayWin => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::HomeWin => "home_win",
            Self::Draw => "draw",
            Self::AwayWin => "away_win",
        }
    }
}

impl fmt::Display for OutcomeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawTeam {
    #[serde(alias = "team_id")]
    pub id: Option<String>,
    #[serde(alias = "team_name")]
    pub name: Option<String>,
    #[serde(alias = "confederation_code")]
    pub confederation: Option<String>,
    #[serde(alias = "type", alias = "team_type")]
    pub gender: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMatch {
    pub match_id: Option<String>,
    #[serde(alias = "tournament_name", alias = "tournament")]
    pub edition: Option<String>,
    #[serde(alias = "match_date")]
    pub date: Option<String>,
    pub home_team_id: Option<String>,
    pub away_team_id: Option<String>,
    #[serde(alias = "stadium_id")]
    pub venue_id: Option<String>,
    #[serde(alias = "home_team_score")]
    pub home_score: Option<i32>,
    #[serde(alias = "away_team_score")]
    pub away_score: Option<i32>,
    #[serde(alias = "result")]
    pub outcome: Option<String>,
    #[serde(alias = "stage_name")]
    pub stage: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawVenue {
    #[serde(alias = "stadium_id")]
    pub venue_id: Option<String>,
    #[serde(alias = "city_name")]
    pub city: Option<String>,
    #[serde(alias = "avg_temp")]
    pub avg_temp_c: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRanking {
    pub team_id: Option<String>,
    #[serde(alias = "rank_date", alias = "as_of")]
    pub date: Option<String>,
    #[serde(alias = "rating")]
    pub rank: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawWeather {
    #[serde(alias = "city_name")]
    pub city: Option<String>,
    pub year: Option<i32>,
    #[serde(alias = "avg_temp")]
    pub avg_temp_c: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawAward {
    pub team_id: Option<String>,
    pub year: Option<i32>,
    #[serde(alias = "award_name")]
    pub award: Option<String>,
}

/// Everything one training run reads from the source loader.
#[derive(Debug, Clone, Default)]
pub struct SourceTables {
    pub teams: Vec<RawTeam>,
    pub matches: Vec<RawMatch>,
    pub venues: Vec<RawVenue>,
    pub rankings: Vec<RawRanking>,
    pub weather: Vec<RawWeather>,
    pub awards: Vec<RawAward>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamRecord {
    pub id: String,
    pub name: String,
    pub confederation: Option<Confederation>,
    pub gender: Option<Gender>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub team_id: String,
    pub as_of: NaiveDate,
    pub rank: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueRecord {
    pub id: String,
    pub city: Option<String>,
    pub avg_temp_c: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub city: String,
    pub year: i32,
    pub avg_temp_c: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwardRecord {
    pub team_id: String,
    pub year: i32,
    pub award: Option<String>,
}

/// Why a raw record failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIssue {
    pub field: &'static str,
    pub problem: String,
}

impl RecordIssue {
    fn missing(field: &'static str) -> Self {
        Self {
            field,
            problem: "missing".to_string(),
        }
    }

    fn invalid(field: &'static str, problem: impl Into<String>) -> Self {
        Self {
            field,
            problem: problem.into(),
        }
    }
}

impl fmt::Display for RecordIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.problem)
    }
}

impl RawTeam {
    pub fn validate(&self) -> Result<TeamRecord, RecordIssue> {
        let id = required_text(&self.id, "id")?;
        let name = non_empty(&self.name).unwrap_or_else(|| id.clone());
        Ok(TeamRecord {
            id,
            name,
            confederation: self.confederation.as_deref().and_then(Confederation::parse),
            gender: self.gender.as_deref().and_then(Gender::parse),
        })
    }
}

impl RawVenue {
    pub fn validate(&self) -> Result<VenueRecord, RecordIssue> {
        let id = required_text(&self.venue_id, "venue_id")?;
        let avg_temp_c = match self.avg_temp_c {
            Some(t) if !t.is_finite() => {
                return Err(RecordIssue::invalid("avg_temp_c", "not a finite number"));
            }
            other => other,
        };
        Ok(VenueRecord {
            id,
            city: non_empty(&self.city),
            avg_temp_c,
        })
    }
}

impl RawRanking {
    pub fn validate(&self) -> Result<RankingEntry, RecordIssue> {
        let team_id = required_text(&self.team_id, "team_id")?;
        let raw_date = self.date.as_deref().ok_or(RecordIssue::missing("date"))?;
        let as_of = parse_date(raw_date)
            .ok_or_else(|| RecordIssue::invalid("date", format!("unparseable `{raw_date}`")))?;
        let rank = self.rank.ok_or(RecordIssue::missing("rank"))?;
        if !rank.is_finite() || rank <= 0.0 {
            return Err(RecordIssue::invalid("rank", format!("{rank} is not positive")));
        }
        Ok(RankingEntry {
            team_id,
            as_of,
            rank,
        })
    }
}

impl RawWeather {
    pub fn validate(&self) -> Result<WeatherReading, RecordIssue> {
        let city = required_text(&self.city, "city")?;
        let year = self.year.ok_or(RecordIssue::missing("year"))?;
        let avg_temp_c = self
            .avg_temp_c
            .filter(|t| t.is_finite())
            .ok_or(RecordIssue::missing("avg_temp_c"))?;
        Ok(WeatherReading {
            city,
            year,
            avg_temp_c,
        })
    }
}

impl RawAward {
    pub fn validate(&self) -> Result<AwardRecord, RecordIssue> {
        Ok(AwardRecord {
            team_id: required_text(&self.team_id, "team_id")?,
            year: self.year.ok_or(RecordIssue::missing("year"))?,
            award: non_empty(&self.award),
        })
    }
}

/// Accepts `YYYY-MM-DD` and anything that starts with it (timestamps).
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let head = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Decade bucket used as the era category, e.g. `1986-06-29` -> `1980s`.
pub fn era_label(year: i32) -> String {
    format!("{}s", year.div_euclid(10) * 10)
}

pub fn date_era(date: NaiveDate) -> String {
    era_label(date.year())
}

pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

fn required_text(value: &Option<String>, field: &'static str) -> Result<String, RecordIssue> {
    non_empty(value).ok_or(RecordIssue::missing(field))
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
