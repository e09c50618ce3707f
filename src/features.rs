//! Feature Builder: the one transform shared by training and inference.
//!
//! Every path goes `MatchContext -> FeatureBuilder::encode -> FeatureVector`. Training
//! rows get their context from `context_for_row`; the inference service assembles one
//! from the request. The encoders and lookup tables are frozen by `fit` and travel
//! inside the artifact.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::FeatureConfig;
use crate::error::{ForecastError, Result};
use crate::fusion::{CanonicalMatchRow, FusionOutput, participating_teams};
use crate::lookup::{AwardTable, RatingTable, VenueTable};
use crate::records::{OutcomeLabel, TeamRecord, date_era, normalize_key};
use crate::trainer::CancelToken;

pub const SCHEMA_VERSION: u32 = 1;

/// Features that flip sign when the two teams swap sides.
pub const ANTI_FIELDS: [&str; 3] = ["ranking_diff", "h2h_edge", "award_diff"];
/// Features that are unchanged by a swap.
pub const SYM_FIELDS: [&str; 7] = [
    "temperature_c",
    "temp_band_cold",
    "temp_band_mild",
    "temp_band_hot",
    "ranking_gap",
    "h2h_draw_rate",
    "h2h_meetings_log",
];
pub const CATEGORY_FIELDS: [&str; 5] = ["team_a", "team_b", "venue", "era", "stage"];

pub const ANTI_DIM: usize = ANTI_FIELDS.len();
pub const SYM_DIM: usize = SYM_FIELDS.len();

/// Reserved slot for categories never seen during fitting.
pub const UNKNOWN_INDEX: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Antisymmetric,
    Symmetric,
    Category,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

/// Ordered field list of a `FeatureVector`, with a fingerprint that changes whenever
/// the order, names or kinds change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fields: Vec<FieldSpec>,
    pub fingerprint: String,
}

impl FeatureSchema {
    pub fn current() -> Self {
        let fields: Vec<FieldSpec> = ANTI_FIELDS
            .iter()
            .map(|n| (n, FieldKind::Antisymmetric))
            .chain(SYM_FIELDS.iter().map(|n| (n, FieldKind::Symmetric)))
            .chain(CATEGORY_FIELDS.iter().map(|n| (n, FieldKind::Category)))
            .map(|(name, kind)| FieldSpec {
                name: name.to_string(),
                kind,
            })
            .collect();
        Self::from_fields(SCHEMA_VERSION, fields)
    }

    pub fn from_fields(version: u32, fields: Vec<FieldSpec>) -> Self {
        let fingerprint = fingerprint(version, &fields);
        Self {
            version,
            fields,
            fingerprint,
        }
    }

    /// Fails unless `found` describes exactly this schema.
    pub fn check(&self, found: &FeatureSchema) -> Result<()> {
        if found.version != self.version {
            return Err(ForecastError::SchemaMismatch {
                expected: format!("schema v{}", self.version),
                found: format!("schema v{}", found.version),
                detail: "feature schema version changed".to_string(),
            });
        }
        let recomputed = fingerprint(found.version, &found.fields);
        if recomputed != found.fingerprint {
            return Err(ForecastError::SchemaMismatch {
                expected: found.fingerprint.clone(),
                found: recomputed,
                detail: "stored fingerprint does not match stored field list".to_string(),
            });
        }
        if found.fingerprint != self.fingerprint {
            let first_diff = self
                .fields
                .iter()
                .zip(&found.fields)
                .position(|(a, b)| a != b)
                .unwrap_or(self.fields.len().min(found.fields.len()));
            return Err(ForecastError::SchemaMismatch {
                expected: self.fingerprint.clone(),
                found: found.fingerprint.clone(),
                detail: format!(
                    "field lists diverge at position {first_diff} ({} vs {} fields)",
                    self.fields.len(),
                    found.fields.len()
                ),
            });
        }
        Ok(())
    }
}

fn fingerprint(version: u32, fields: &[FieldSpec]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("v{version}").as_bytes());
    for f in fields {
        hasher.update(format!("|{}:{:?}", f.name, f.kind).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// How raw values are turned into encoder keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Identifiers: trimmed, otherwise matched as written.
    #[default]
    Exact,
    /// Free-text labels: trimmed and lowercased.
    CaseFolded,
}

impl KeyPolicy {
    pub fn key(self, raw: &str) -> String {
        match self {
            Self::Exact => raw.trim().to_string(),
            Self::CaseFolded => normalize_key(raw),
        }
    }
}

/// Frozen category -> index table. Index 0 is the unknown slot, known categories take
/// `1..=len` in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    policy: KeyPolicy,
    categories: Vec<String>,
}

impl CategoryEncoder {
    pub fn fit<I, S>(policy: KeyPolicy, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut categories: Vec<String> = values
            .into_iter()
            .map(|v| policy.key(v.as_ref()))
            .filter(|v| !v.is_empty())
            .collect();
        categories.sort();
        categories.dedup();
        Self { policy, categories }
    }

    pub fn encode(&self, raw: &str) -> usize {
        self.categories
            .binary_search(&self.policy.key(raw))
            .map(|i| i + 1)
            .unwrap_or(UNKNOWN_INDEX)
    }

    pub fn encode_opt(&self, raw: Option<&str>) -> usize {
        raw.map(|r| self.encode(r)).unwrap_or(UNKNOWN_INDEX)
    }

    pub fn is_known(&self, raw: &str) -> bool {
        self.encode(raw) != UNKNOWN_INDEX
    }

    /// Number of parameter slots, the unknown slot included.
    pub fn slots(&self) -> usize {
        self.categories.len() + 1
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    pub fn is_well_formed(&self) -> bool {
        self.categories.windows(2).all(|w| w[0] < w[1])
            && self
                .categories
                .iter()
                .all(|c| !c.is_empty() && *c == self.policy.key(c))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureEncoders {
    pub teams: CategoryEncoder,
    pub venues: CategoryEncoder,
    pub eras: CategoryEncoder,
    pub stages: CategoryEncoder,
}

impl FeatureEncoders {
    pub fn is_well_formed(&self) -> bool {
        self.teams.policy() == KeyPolicy::Exact
            && self.venues.policy() == KeyPolicy::Exact
            && self.eras.policy() == KeyPolicy::CaseFolded
            && self.stages.policy() == KeyPolicy::CaseFolded
            && self.teams.is_well_formed()
            && self.venues.is_well_formed()
            && self.eras.is_well_formed()
            && self.stages.is_well_formed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureBand {
    Cold,
    Mild,
    Hot,
}

impl TemperatureBand {
    pub fn classify(temperature_c: f64, cfg: &FeatureConfig) -> Self {
        if temperature_c < cfg.cold_below_c {
            Self::Cold
        } else if temperature_c > cfg.hot_above_c {
            Self::Hot
        } else {
            Self::Mild
        }
    }

    fn one_hot(self) -> [f64; 3] {
        match self {
            Self::Cold => [1.0, 0.0, 0.0],
            Self::Mild => [0.0, 1.0, 0.0],
            Self::Hot => [0.0, 0.0, 1.0],
        }
    }
}

/// Prior meetings between two teams, counted from team A's point of view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadToHeadSummary {
    pub meetings: u32,
    pub a_wins: u32,
    pub b_wins: u32,
    pub draws: u32,
}

impl HeadToHeadSummary {
    pub fn swapped(self) -> Self {
        Self {
            meetings: self.meetings,
            a_wins: self.b_wins,
            b_wins: self.a_wins,
            draws: self.draws,
        }
    }

    pub fn a_win_rate(&self) -> f64 {
        ratio(self.a_wins, self.meetings)
    }

    pub fn draw_rate(&self) -> f64 {
        ratio(self.draws, self.meetings)
    }

    /// Share of meetings won by A minus share won by B.
    pub fn edge(&self) -> f64 {
        ratio(self.a_wins, self.meetings) - ratio(self.b_wins, self.meetings)
    }
}

fn ratio(num: u32, den: u32) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PairResult {
    LowWin,
    HighWin,
    Draw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Meeting {
    date: NaiveDate,
    result: PairResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PairHistory {
    low: String,
    high: String,
    meetings: Vec<Meeting>,
}

/// Match history per unordered team pair, each sorted by date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadToHeadIndex {
    pairs: Vec<PairHistory>,
}

impl HeadToHeadIndex {
    pub fn from_rows(rows: &[CanonicalMatchRow]) -> Self {
        let mut by_pair: BTreeMap<(String, String), Vec<Meeting>> = BTreeMap::new();
        for row in rows {
            let home_is_low = row.home.id <= row.away.id;
            let (low, high) = if home_is_low {
                (&row.home.id, &row.away.id)
            } else {
                (&row.away.id, &row.home.id)
            };
            let result = match (row.outcome, home_is_low) {
                (OutcomeLabel::Draw, _) => PairResult::Draw,
                (OutcomeLabel::HomeWin, true) | (OutcomeLabel::AwayWin, false) => {
                    PairResult::LowWin
                }
                (OutcomeLabel::HomeWin, false) | (OutcomeLabel::AwayWin, true) => {
                    PairResult::HighWin
                }
            };
            by_pair
                .entry((low.clone(), high.clone()))
                .or_default()
                .push(Meeting {
                    date: row.date,
                    result,
                });
        }
        let pairs = by_pair
            .into_iter()
            .map(|((low, high), mut meetings)| {
                meetings.sort_by_key(|m| m.date);
                PairHistory {
                    low,
                    high,
                    meetings,
                }
            })
            .collect();
        Self { pairs }
    }

    /// Meetings between `a` and `b`, restricted to dates strictly before `before`
    /// when given.
    pub fn query(&self, a: &str, b: &str, before: Option<NaiveDate>) -> HeadToHeadSummary {
        let a_is_low = a <= b;
        let (low, high) = if a_is_low { (a, b) } else { (b, a) };
        let Ok(pos) = self
            .pairs
            .binary_search_by(|p| (p.low.as_str(), p.high.as_str()).cmp(&(low, high)))
        else {
            return HeadToHeadSummary::default();
        };
        let meetings = &self.pairs[pos].meetings;
        let end = match before {
            Some(date) => meetings.partition_point(|m| m.date < date),
            None => meetings.len(),
        };

        let mut summary = HeadToHeadSummary::default();
        for m in &meetings[..end] {
            summary.meetings += 1;
            match m.result {
                PairResult::Draw => summary.draws += 1,
                PairResult::LowWin => summary.a_wins += 1,
                PairResult::HighWin => summary.b_wins += 1,
            }
        }
        if a_is_low { summary } else { summary.swapped() }
    }

    pub fn is_well_formed(&self) -> bool {
        self.pairs
            .windows(2)
            .all(|w| (&w[0].low, &w[0].high) < (&w[1].low, &w[1].high))
    }
}

/// Resolved, not yet encoded inputs for one matchup. Teams set to `None` take the
/// unknown slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchContext {
    pub team_a: Option<String>,
    pub team_b: Option<String>,
    pub rank_a: f64,
    pub rank_b: f64,
    pub awards_a: u32,
    pub awards_b: u32,
    pub head_to_head: HeadToHeadSummary,
    pub temperature_c: f64,
    pub venue_id: Option<String>,
    pub era: String,
    pub stage: String,
}

impl MatchContext {
    pub fn swapped(&self) -> Self {
        Self {
            team_a: self.team_b.clone(),
            team_b: self.team_a.clone(),
            rank_a: self.rank_b,
            rank_b: self.rank_a,
            awards_a: self.awards_b,
            awards_b: self.awards_a,
            head_to_head: self.head_to_head.swapped(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub anti: [f64; ANTI_DIM],
    pub sym: [f64; SYM_DIM],
    pub team_a: usize,
    pub team_b: usize,
    pub venue: usize,
    pub era: usize,
    pub stage: usize,
}

impl FeatureVector {
    pub fn swapped(&self) -> Self {
        Self {
            anti: self.anti.map(|v| -v),
            sym: self.sym,
            team_a: self.team_b,
            team_b: self.team_a,
            venue: self.venue,
            era: self.era,
            stage: self.stage,
        }
    }
}

/// Fitted encoders plus the reference tables needed to build features for any
/// matchup. Immutable after `fit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBuilder {
    config: FeatureConfig,
    encoders: FeatureEncoders,
    teams: BTreeMap<String, TeamRecord>,
    ratings: RatingTable,
    awards: AwardTable,
    venues: VenueTable,
    head_to_head: HeadToHeadIndex,
    /// Latest match date seen in training.
    reference_date: NaiveDate,
}

impl FeatureBuilder {
    pub fn fit(fusion: &FusionOutput, config: FeatureConfig) -> Result<Self> {
        let reference_date = fusion
            .rows
            .iter()
            .map(|r| r.date)
            .max()
            .ok_or_else(|| ForecastError::training_data("no fused rows to fit encoders on"))?;

        let encoders = FeatureEncoders {
            teams: CategoryEncoder::fit(KeyPolicy::Exact, participating_teams(&fusion.rows)),
            venues: CategoryEncoder::fit(
                KeyPolicy::Exact,
                fusion.rows.iter().filter_map(|r| r.venue_id.as_deref()),
            ),
            eras: CategoryEncoder::fit(
                KeyPolicy::CaseFolded,
                fusion.rows.iter().map(|r| date_era(r.date)),
            ),
            stages: CategoryEncoder::fit(
                KeyPolicy::CaseFolded,
                fusion
                    .rows
                    .iter()
                    .map(|r| r.stage.as_deref().unwrap_or(&config.default_stage)),
            ),
        };

        Ok(Self {
            encoders,
            teams: fusion.teams.clone(),
            ratings: fusion.ratings.clone(),
            awards: fusion.awards.clone(),
            venues: fusion.venues.clone(),
            head_to_head: HeadToHeadIndex::from_rows(&fusion.rows),
            reference_date,
            config,
        })
    }

    /// Context of a historical match. Head-to-head only counts meetings dated
    /// strictly before the match.
    pub fn context_for_row(&self, row: &CanonicalMatchRow) -> MatchContext {
        let neutral = self.config.neutral_rank;
        MatchContext {
            team_a: Some(row.home.id.clone()),
            team_b: Some(row.away.id.clone()),
            rank_a: row.home_rank.value_or(neutral),
            rank_b: row.away_rank.value_or(neutral),
            awards_a: row.home_awards,
            awards_b: row.away_awards,
            head_to_head: self
                .head_to_head
                .query(&row.home.id, &row.away.id, Some(row.date)),
            temperature_c: row.temperature_c,
            venue_id: row.venue_id.clone(),
            era: date_era(row.date),
            stage: row
                .stage
                .clone()
                .unwrap_or_else(|| self.config.default_stage.clone()),
        }
    }

    pub fn encode(&self, ctx: &MatchContext) -> FeatureVector {
        let h2h = &ctx.head_to_head;
        let ranking_diff = ctx.rank_b - ctx.rank_a;
        let band = TemperatureBand::classify(ctx.temperature_c, &self.config).one_hot();
        FeatureVector {
            anti: [
                ranking_diff,
                h2h.edge(),
                ctx.awards_a as f64 - ctx.awards_b as f64,
            ],
            sym: [
                ctx.temperature_c,
                band[0],
                band[1],
                band[2],
                ranking_diff.abs(),
                h2h.draw_rate(),
                (h2h.meetings as f64).ln_1p(),
            ],
            team_a: ctx
                .team_a
                .as_deref()
                .map_or(UNKNOWN_INDEX, |t| self.encoders.teams.encode(t)),
            team_b: ctx
                .team_b
                .as_deref()
                .map_or(UNKNOWN_INDEX, |t| self.encoders.teams.encode(t)),
            venue: self.encoders.venues.encode_opt(ctx.venue_id.as_deref()),
            era: self.encoders.eras.encode(&ctx.era),
            stage: self.encoders.stages.encode(&ctx.stage),
        }
    }

    pub fn build_row(&self, row: &CanonicalMatchRow) -> FeatureVector {
        self.encode(&self.context_for_row(row))
    }

    /// Feature vectors for all rows, in row order.
    pub fn build_training_matrix(
        &self,
        rows: &[CanonicalMatchRow],
        cancel: &CancelToken,
    ) -> Result<Vec<FeatureVector>> {
        let chunks: Vec<Vec<FeatureVector>> = rows
            .par_chunks(256)
            .map(|chunk| {
                if cancel.is_cancelled() {
                    return Err(ForecastError::Cancelled);
                }
                Ok(chunk.iter().map(|row| self.build_row(row)).collect())
            })
            .collect::<Result<_>>()?;
        Ok(chunks.into_iter().flatten().collect())
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn encoders(&self) -> &FeatureEncoders {
        &self.encoders
    }

    pub fn team(&self, id: &str) -> Option<&TeamRecord> {
        self.teams.get(id)
    }

    pub fn ratings(&self) -> &RatingTable {
        &self.ratings
    }

    pub fn awards(&self) -> &AwardTable {
        &self.awards
    }

    pub fn venues(&self) -> &VenueTable {
        &self.venues
    }

    pub fn head_to_head(&self) -> &HeadToHeadIndex {
        &self.head_to_head
    }

    pub fn reference_date(&self) -> NaiveDate {
        self.reference_date
    }
}
