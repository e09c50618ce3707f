use std::env;

use serde::{Deserialize, Serialize};

/// How an era-tagged team (`BRA@1970`) resolves its ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EraPolicy {
    /// Latest entry dated on or before 31 Dec of the era year.
    #[default]
    Snapshot,
    /// Linear interpolation at 1 Jul of the era year between the bracketing entries.
    Interpolated,
}

impl EraPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "snapshot" => Some(Self::Snapshot),
            "interpolated" | "interpolate" => Some(Self::Interpolated),
            _ => None,
        }
    }
}

/// Feature transform settings. Persisted in the artifact so inference reproduces
/// exactly what training did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub neutral_rank: f64,
    pub cold_below_c: f64,
    pub hot_above_c: f64,
    pub default_temperature_c: f64,
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    pub era_policy: EraPolicy,
    pub default_stage: String,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            neutral_rank: 50.0,
            cold_below_c: 12.0,
            hot_above_c: 26.0,
            default_temperature_c: 22.0,
            min_temperature_c: -60.0,
            max_temperature_c: 60.0,
            era_policy: EraPolicy::Snapshot,
            default_stage: "group stage".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Fraction of rows that go to the training partition.
    pub train_ratio: f64,
    pub seed: u64,
    pub min_rows: usize,
    pub l2: f64,
    pub max_iters: usize,
    pub learning_rate: f64,
    pub calibrate: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_ratio: 0.8,
            seed: 42,
            min_rows: 50,
            l2: 0.01,
            max_iters: 1500,
            learning_rate: 0.5,
            calibrate: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub features: FeatureConfig,
    pub train: TrainConfig,
}

impl PipelineConfig {
    /// Defaults, then `.env`, then `WC26_*` environment overrides.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        cfg.apply_env(|key| env::var(key).ok());
        cfg
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parsed(&lookup, "WC26_SEED") {
            self.train.seed = v;
        }
        if let Some(v) = parsed::<f64, _>(&lookup, "WC26_TRAIN_RATIO") {
            self.train.train_ratio = v;
        }
        if let Some(v) = parsed(&lookup, "WC26_MIN_ROWS") {
            self.train.min_rows = v;
        }
        if let Some(v) = parsed(&lookup, "WC26_L2") {
            self.train.l2 = v;
        }
        if let Some(v) = parsed(&lookup, "WC26_MAX_ITERS") {
            self.train.max_iters = v;
        }
        if let Some(v) = parsed(&lookup, "WC26_DEFAULT_TEMP") {
            self.features.default_temperature_c = v;
        }
        if let Some(policy) = lookup("WC26_ERA_POLICY").and_then(|raw| EraPolicy::parse(&raw)) {
            self.features.era_policy = policy;
        }
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)?.trim().parse::<T>().ok()
}
