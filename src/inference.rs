//! Inference Service.
//!
//! The loaded artifact sits behind a single `RwLock<Option<Arc<_>>>`. A request clones
//! the `Arc` once at the start and runs entirely against that snapshot, so a swap
//! never affects requests already in flight.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::{ArtifactHandle, ArtifactStore, ModelArtifact};
use crate::calibration::{Prob3, argmax};
use crate::error::{ForecastError, Result};
use crate::features::MatchContext;
use crate::records::{OutcomeLabel, date_era, era_label, normalize_key};

const MIN_ERA_YEAR: i32 = 1850;
const MAX_ERA_YEAR: i32 = 2100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    /// `ID` or era-tagged `ID@YEAR`.
    pub team_a: String,
    pub team_b: String,
    #[serde(default)]
    pub venue_id: Option<String>,
    #[serde(default, alias = "temperature")]
    pub temperature_c: Option<f64>,
    #[serde(default)]
    pub stage: Option<String>,
}

impl PredictionRequest {
    pub fn new(team_a: impl Into<String>, team_b: impl Into<String>) -> Self {
        Self {
            team_a: team_a.into(),
            team_b: team_b.into(),
            ..Self::default()
        }
    }

    pub fn with_venue(mut self, venue_id: impl Into<String>) -> Self {
        self.venue_id = Some(venue_id.into());
        self
    }

    pub fn with_temperature(mut self, temperature_c: f64) -> Self {
        self.temperature_c = Some(temperature_c);
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Same matchup with the sides exchanged.
    pub fn swapped(&self) -> Self {
        Self {
            team_a: self.team_b.clone(),
            team_b: self.team_a.clone(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamRef {
    pub id: String,
    pub era_year: Option<i32>,
}

impl TeamRef {
    pub fn parse(raw: &str, field: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let (id, year) = match trimmed.split_once('@') {
            Some((id, year)) => (id.trim(), Some(year.trim())),
            None => (trimmed, None),
        };
        if id.is_empty() {
            return Err(ForecastError::invalid_input(field, "team id is empty"));
        }
        let era_year = match year {
            None => None,
            Some(y) => {
                let year: i32 = y.parse().map_err(|_| {
                    ForecastError::invalid_input(field, format!("era year `{y}` is not a number"))
                })?;
                if !(MIN_ERA_YEAR..=MAX_ERA_YEAR).contains(&year) {
                    return Err(ForecastError::invalid_input(
                        field,
                        format!("era year {year} outside {MIN_ERA_YEAR}..={MAX_ERA_YEAR}"),
                    ));
                }
                Some(year)
            }
        };
        Ok(Self {
            id: id.to_string(),
            era_year,
        })
    }
}

impl fmt::Display for TeamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.era_year {
            Some(y) => write!(f, "{}@{y}", self.id),
            None => f.write_str(&self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    TeamA,
    TeamB,
}

/// A request input that could not be used as given and was replaced by a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputFallback {
    UnknownTeam { side: Side, team_id: String },
    UnrankedTeam { side: Side, team_id: String, neutral_rank: f64 },
    UnknownVenue { venue_id: String },
    VenueOmitted,
    DefaultTemperature { temperature_c: f64 },
    UnknownStage { stage: String },
    UnknownEra { era: String },
}

impl fmt::Display for InputFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTeam { team_id, .. } => {
                write!(f, "team {team_id} was not seen in training, treated as unknown")
            }
            Self::UnrankedTeam {
                team_id,
                neutral_rank,
                ..
            } => write!(f, "team {team_id} has no ranking, neutral rank {neutral_rank} used"),
            Self::UnknownVenue { venue_id } => {
                write!(f, "venue {venue_id} is not known, treated as unknown")
            }
            Self::VenueOmitted => f.write_str("no venue given"),
            Self::DefaultTemperature { temperature_c } => {
                write!(f, "temperature not available, default {temperature_c}C used")
            }
            Self::UnknownStage { stage } => {
                write!(f, "stage `{stage}` was not seen in training, treated as unknown")
            }
            Self::UnknownEra { era } => {
                write!(f, "era {era} was not seen in training, treated as unknown")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeProbabilities {
    pub home_win: f64,
    pub draw: f64,
    pub away_win: f64,
}

impl From<Prob3> for OutcomeProbabilities {
    fn from(p: Prob3) -> Self {
        Self {
            home_win: p.home,
            draw: p.draw,
            away_win: p.away,
        }
    }
}

impl OutcomeProbabilities {
    pub fn sum(&self) -> f64 {
        self.home_win + self.draw + self.away_win
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureOrigin {
    Request,
    Venue,
    Default,
}

/// Values the prediction actually ran with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInputs {
    pub team_a: String,
    pub team_b: String,
    pub rank_a: f64,
    pub rank_b: f64,
    pub temperature_c: f64,
    pub temperature_origin: TemperatureOrigin,
    pub era: String,
    pub stage: String,
    pub prior_meetings: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub outcome: OutcomeLabel,
    pub probabilities: OutcomeProbabilities,
    /// Probability of `outcome`.
    pub confidence: f64,
    pub caveat: Option<String>,
    pub fallbacks: Vec<InputFallback>,
    pub resolved: ResolvedInputs,
    pub model_version: String,
}

/// Validates `request`, builds its features with the artifact's own transform and
/// scores them.
pub fn predict(request: &PredictionRequest, artifact: &ModelArtifact) -> Result<PredictionResponse> {
    let features = &artifact.features;
    let cfg = features.config();

    let a = TeamRef::parse(&request.team_a, "team_a")?;
    let b = TeamRef::parse(&request.team_b, "team_b")?;
    if a == b {
        return Err(ForecastError::invalid_input(
            "team_b",
            format!("{b} is the same team as team_a"),
        ));
    }
    if let Some(t) = request.temperature_c
        && (!t.is_finite() || t < cfg.min_temperature_c || t > cfg.max_temperature_c)
    {
        return Err(ForecastError::invalid_input(
            "temperature",
            format!(
                "{t} is outside the physical range {}..={} C",
                cfg.min_temperature_c, cfg.max_temperature_c
            ),
        ));
    }
    let team_a = features.team(&a.id);
    let team_b = features.team(&b.id);
    if let (Some(ta), Some(tb)) = (team_a, team_b)
        && let (Some(ga), Some(gb)) = (ta.gender, tb.gender)
        && ga != gb
    {
        return Err(ForecastError::invalid_input(
            "team_b",
            format!("{} and {} belong to different gender categories", ta.id, tb.id),
        ));
    }

    // a team listed in the reference data but absent from training has no slot
    let known_a = team_a.is_some() && features.encoders().teams.is_known(&a.id);
    let known_b = team_b.is_some() && features.encoders().teams.is_known(&b.id);

    let mut fallbacks = Vec::new();
    let side_a = resolve_side(artifact, &a, known_a, Side::TeamA, &mut fallbacks);
    let side_b = resolve_side(artifact, &b, known_b, Side::TeamB, &mut fallbacks);

    let venue_id = request
        .venue_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let venue = venue_id.and_then(|id| features.venues().get(id));
    match (venue_id, venue) {
        (None, _) => fallbacks.push(InputFallback::VenueOmitted),
        (Some(id), None) => fallbacks.push(InputFallback::UnknownVenue {
            venue_id: id.to_string(),
        }),
        (Some(id), Some(_)) if !features.encoders().venues.is_known(id) => {
            fallbacks.push(InputFallback::UnknownVenue {
                venue_id: id.to_string(),
            })
        }
        _ => {}
    }

    let (temperature_c, temperature_origin) =
        match (request.temperature_c, venue.and_then(|v| v.avg_temp_c)) {
            (Some(t), _) => (t, TemperatureOrigin::Request),
            (None, Some(t)) => (t, TemperatureOrigin::Venue),
            (None, None) => {
                fallbacks.push(InputFallback::DefaultTemperature {
                    temperature_c: cfg.default_temperature_c,
                });
                (cfg.default_temperature_c, TemperatureOrigin::Default)
            }
        };

    let latest_year = a.era_year.max(b.era_year);
    let era = match latest_year {
        Some(y) => era_label(y),
        None => date_era(features.reference_date()),
    };
    if !features.encoders().eras.is_known(&era) {
        fallbacks.push(InputFallback::UnknownEra { era: era.clone() });
    }
    let before = latest_year.and_then(|y| NaiveDate::from_ymd_opt(y + 1, 1, 1));
    let head_to_head = features.head_to_head().query(&a.id, &b.id, before);

    let stage = request
        .stage
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(normalize_key)
        .unwrap_or_else(|| normalize_key(&cfg.default_stage));
    if !features.encoders().stages.is_known(&stage) {
        fallbacks.push(InputFallback::UnknownStage {
            stage: stage.clone(),
        });
    }

    let ctx = MatchContext {
        team_a: known_a.then(|| a.id.clone()),
        team_b: known_b.then(|| b.id.clone()),
        rank_a: side_a.rank,
        rank_b: side_b.rank,
        awards_a: side_a.awards,
        awards_b: side_b.awards,
        head_to_head,
        temperature_c,
        venue_id: venue_id.map(str::to_string),
        era: era.clone(),
        stage: stage.clone(),
    };
    let vector = features.encode(&ctx);
    let probs = artifact.params.probabilities(&vector);
    let outcome = argmax(probs);

    let caveat = if fallbacks.is_empty() {
        None
    } else {
        Some(
            fallbacks
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    };
    debug!(
        team_a = %a,
        team_b = %b,
        fallbacks = fallbacks.len(),
        outcome = %outcome,
        "prediction served"
    );

    Ok(PredictionResponse {
        outcome,
        probabilities: probs.into(),
        confidence: probs.get(outcome),
        caveat,
        fallbacks,
        resolved: ResolvedInputs {
            team_a: a.to_string(),
            team_b: b.to_string(),
            rank_a: side_a.rank,
            rank_b: side_b.rank,
            temperature_c,
            temperature_origin,
            era,
            stage,
            prior_meetings: head_to_head.meetings,
        },
        model_version: artifact.version_id().to_string(),
    })
}

struct SideInputs {
    rank: f64,
    awards: u32,
}

fn resolve_side(
    artifact: &ModelArtifact,
    team: &TeamRef,
    known: bool,
    side: Side,
    fallbacks: &mut Vec<InputFallback>,
) -> SideInputs {
    let features = &artifact.features;
    let cfg = features.config();
    if !known {
        fallbacks.push(InputFallback::UnknownTeam {
            side,
            team_id: team.id.clone(),
        });
    }

    let rank = match team.era_year {
        Some(year) => features.ratings().rank_for_era(&team.id, year, cfg.era_policy),
        None => features.ratings().latest(&team.id),
    };
    let rank = match rank {
        Some(r) => r,
        None => {
            if known {
                fallbacks.push(InputFallback::UnrankedTeam {
                    side,
                    team_id: team.id.clone(),
                    neutral_rank: cfg.neutral_rank,
                });
            }
            cfg.neutral_rank
        }
    };
    let awards = match team.era_year {
        Some(year) => features.awards().count_through(&team.id, year),
        None => features.awards().total(&team.id),
    };
    SideInputs { rank, awards }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Ready { version_id: String },
}

/// Shared inference front. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct InferenceService {
    current: RwLock<Option<Arc<ModelArtifact>>>,
}

impl InferenceService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(artifact: ModelArtifact) -> Result<Self> {
        let service = Self::new();
        service.install(artifact)?;
        Ok(service)
    }

    /// Validates and swaps in `artifact`. Returns the version it replaced.
    pub fn install(&self, artifact: ModelArtifact) -> Result<Option<String>> {
        artifact.validate()?;
        let next = Arc::new(artifact);
        let version = next.version_id().to_string();
        let previous = self.current.write().replace(next);
        let previous_version = previous.map(|p| p.version_id().to_string());
        info!(version = %version, previous = ?previous_version, "model artifact installed");
        Ok(previous_version)
    }

    pub fn load_from<S>(&self, store: &S, handle: &ArtifactHandle) -> Result<Option<String>>
    where
        S: ArtifactStore + ?Sized,
    {
        let artifact = store.load(handle)?;
        self.install(artifact)
    }

    /// Artifact current at call time.
    pub fn snapshot(&self) -> Result<Arc<ModelArtifact>> {
        self.current.read().clone().ok_or(ForecastError::NotReady)
    }

    pub fn state(&self) -> ServiceState {
        match self.current.read().as_ref() {
            Some(a) => ServiceState::Ready {
                version_id: a.version_id().to_string(),
            },
            None => ServiceState::Uninitialized,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn predict(&self, request: &PredictionRequest) -> Result<PredictionResponse> {
        let artifact = self.snapshot()?;
        predict(request, &artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_ref_parses_era_tags() {
        assert_eq!(
            TeamRef::parse(" BRA@1970 ", "team_a").expect("tagged"),
            TeamRef {
                id: "BRA".into(),
                era_year: Some(1970)
            }
        );
        assert_eq!(
            TeamRef::parse("GER", "team_a").expect("plain").era_year,
            None
        );
        let err = TeamRef::parse("BRA@19x0", "team_b").unwrap_err();
        assert_eq!(err.field(), Some("team_b"));
        assert!(TeamRef::parse("@1970", "team_a").is_err());
        assert!(TeamRef::parse("BRA@3000", "team_a").is_err());
    }

    #[test]
    fn uninitialized_service_reports_not_ready() {
        let service = InferenceService::new();
        assert_eq!(service.state(), ServiceState::Uninitialized);
        let err = service
            .predict(&PredictionRequest::new("BRA", "ARG"))
            .unwrap_err();
        assert!(matches!(err, ForecastError::NotReady));
    }

    #[test]
    fn swapped_request_exchanges_only_teams() {
        let req = PredictionRequest::new("BRA", "ARG")
            .with_venue("S-1")
            .with_temperature(18.0);
        let sw = req.swapped();
        assert_eq!(sw.team_a, "ARG");
        assert_eq!(sw.team_b, "BRA");
        assert_eq!(sw.venue_id, req.venue_id);
        assert_eq!(sw.temperature_c, req.temperature_c);
    }
}
